// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use log::debug;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

/// Read exactly `length` bytes at an absolute image offset.
/// A short read is never returned as partial data, it fails with `TruncatedRead`
pub(crate) fn read_exact_at<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    length: usize,
) -> Result<Vec<u8>, FvdeError> {
    // Bound the allocation by the image size before trusting a length read from disk
    let image_size = reader.seek(SeekFrom::End(0))?;
    if offset
        .checked_add(length as u64)
        .is_none_or(|end| end > image_size)
    {
        debug!("[macos-fvde] Read of {length} bytes at offset {offset} is past the image end {image_size}");
        return Err(FvdeError::TruncatedRead { offset, length });
    }
    reader.seek(SeekFrom::Start(offset))?;

    let mut buffer = vec![0; length];
    match reader.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            debug!("[macos-fvde] Short read of {length} bytes at offset {offset}");
            Err(FvdeError::TruncatedRead { offset, length })
        }
        Err(err) => Err(FvdeError::Io(err)),
    }
}
