// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use serde::{Serialize, Serializer};
use std::fmt;

/// A GUID as stored on disk. The first three fields are little-endian, the last eight bytes are
/// stored as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Guid([u8; 16]);

/// CoreStorage logical volume group partition type ("Stor")
pub const CORE_STORAGE_TYPE: Guid =
    Guid::from_fields(0x5374_6F72, 0x6167, 0x11AA, [0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC]);
/// Apple boot (Recovery HD) partition type ("Boot")
pub const APPLE_BOOT_TYPE: Guid =
    Guid::from_fields(0x426F_6F74, 0x0000, 0x11AA, [0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC]);

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    /// Build a GUID from its textual fields, laying them out the way they are stored on disk
    pub const fn from_fields(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        let a = data1.to_le_bytes();
        let b = data2.to_le_bytes();
        let c = data3.to_le_bytes();
        Guid([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], data4[0], data4[1], data4[2],
            data4[3], data4[4], data4[5], data4[6], data4[7],
        ])
    }

    /// Parse the canonical `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` form
    pub fn parse(text: &str) -> Result<Self, FvdeError> {
        let invalid = || FvdeError::Format(format!("Invalid GUID string: {text}"));

        let parts: Vec<&str> = text.split('-').collect();
        let expected_lengths = [8, 4, 4, 4, 12];
        if parts.len() != expected_lengths.len()
            || parts
                .iter()
                .zip(expected_lengths)
                .any(|(part, len)| part.len() != len)
        {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(parts[0], 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(parts[2], 16).map_err(|_| invalid())?;

        let tail = hex::decode(format!("{}{}", parts[3], parts[4])).map_err(|_| invalid())?;
        let mut data4 = [0; 8];
        data4.copy_from_slice(&tail);

        Ok(Guid::from_fields(data1, data2, data3, data4))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{}-{}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            hex::encode_upper(&b[8..10]),
            hex::encode_upper(&b[10..16])
        )
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
