// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use crate::image::read_exact_at;
use log::debug;
use std::io::{Read, Seek};

/// Offset of the metadata wrapping key inside the CoreStorage volume header
pub const VOLUME_KEY_OFFSET: u64 = 176;
pub const VOLUME_KEY_SIZE: usize = 16;

/// Read the 16 byte key used to encrypt `EncryptedRoot.plist.wipekey`.
///
/// The header signature is not checked. Only call this for partitions already identified as
/// CoreStorage by their partition type GUID
pub fn read_volume_key<R: Read + Seek + ?Sized>(
    reader: &mut R,
    partition_offset: u64,
) -> Result<[u8; VOLUME_KEY_SIZE], FvdeError> {
    let key_offset = partition_offset
        .checked_add(VOLUME_KEY_OFFSET)
        .ok_or_else(|| FvdeError::Format(format!("Invalid partition offset {partition_offset}")))?;
    debug!("[macos-fvde] Reading CoreStorage volume key at offset {key_offset}");

    let data = read_exact_at(reader, key_offset, VOLUME_KEY_SIZE)?;
    let mut key = [0; VOLUME_KEY_SIZE];
    key.copy_from_slice(&data);
    Ok(key)
}
