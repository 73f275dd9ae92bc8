// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};
use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32};

/// Keybag entry tag holding the key material needed for the hash
pub const KEYBAG_TAG_KEY: u16 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct KeybagEntry {
    pub uuid: [u8; 16],
    pub tag: u16,
    pub keylen: u16,
    /// Must be zero
    pub padding: u32,
}

impl KeybagEntry {
    /// Parse the fixed 24 byte entry header. Key data follows it
    pub fn parse_header(input: &[u8]) -> nom::IResult<&[u8], KeybagEntry> {
        let (input, uuid) = take(size_of::<u128>())(input)?;
        let (input, tag) = le_u16(input)?;
        let (input, keylen) = le_u16(input)?;
        let (input, padding) = le_u32(input)?;

        let mut uuid_bytes = [0; 16];
        uuid_bytes.copy_from_slice(uuid);
        Ok((
            input,
            KeybagEntry {
                uuid: uuid_bytes,
                tag,
                keylen,
                padding,
            },
        ))
    }
}

/// Scan `blob` for keybag entries starting with `uuid` and return the key data of the first one
/// tagged [`KEYBAG_TAG_KEY`]. Entries with other tags are skipped
pub fn find_entry(uuid: &[u8; 16], blob: &[u8]) -> Result<Option<Vec<u8>>, FvdeError> {
    let occurrences = blob
        .windows(uuid.len())
        .enumerate()
        .filter(|(_, window)| *window == uuid.as_slice())
        .map(|(offset, _)| offset);

    for offset in occurrences {
        let tag = match blob
            .get(offset + uuid.len()..offset + uuid.len() + size_of::<u16>())
            .map(LittleEndian::read_u16)
        {
            Some(tag) => tag,
            None => {
                // A uuid match too close to the end of the blob to hold a tag
                debug!("[macos-fvde] Ignoring keybag uuid match at offset {offset} without a tag");
                continue;
            }
        };
        if tag != KEYBAG_TAG_KEY {
            continue;
        }

        let (key_input, entry) = match KeybagEntry::parse_header(&blob[offset..]) {
            Ok(results) => results,
            Err(err) => {
                error!("[macos-fvde] Keybag entry at offset {offset} is truncated: {err:?}");
                return Err(FvdeError::Corruption(format!(
                    "Keybag entry at offset {offset} ends before its padding"
                )));
            }
        };

        if entry.padding != 0 {
            error!(
                "[macos-fvde] Keybag entry at offset {offset} has non-zero padding {:#x}",
                entry.padding
            );
            return Err(FvdeError::Corruption(format!(
                "Keybag entry at offset {offset} has non-zero padding"
            )));
        }

        let key_data = key_input
            .get(..usize::from(entry.keylen))
            .ok_or_else(|| {
                FvdeError::Corruption(format!(
                    "Keybag entry at offset {offset} claims {} bytes of key data past the end of the keybag",
                    entry.keylen
                ))
            })?;
        return Ok(Some(key_data.to_vec()));
    }

    Ok(None)
}
