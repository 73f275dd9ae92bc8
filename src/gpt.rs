// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::{FvdeError, nom_format};
use crate::guid::Guid;
use crate::image::read_exact_at;
use log::{debug, info};
use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u64};
use serde::Serialize;
use std::io::{Read, Seek};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const PARTITION_ENTRY_SIZE: usize = 0x80;
/// Size of a standard GPT partition entry array
const MAX_PARTITION_ENTRIES: usize = 128;
/// The partition entry array starts at LBA 2
const ENTRY_ARRAY_LBA: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub partition_guid: Guid,
    pub start_lba: u64,
    /// Byte offset of the partition in the image (`start_lba` * sector size)
    pub offset: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionTable {
    /// 512 or 4096, depending on where the GPT header was found
    pub sector_size: u64,
    /// Entries in partition table order
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Parse the GUID partition table of a disk image
    pub fn parse<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<PartitionTable, FvdeError> {
        let sector_size = PartitionTable::detect_sector_size(reader)?;
        debug!("[macos-fvde] GPT sector size: {sector_size}");

        let mut entries = Vec::new();
        let mut entry_offset = ENTRY_ARRAY_LBA * sector_size;
        for _ in 0..MAX_PARTITION_ENTRIES {
            let raw_entry = read_exact_at(reader, entry_offset, PARTITION_ENTRY_SIZE)?;
            // An all zero entry terminates the table
            if raw_entry.iter().all(|byte| *byte == 0) {
                break;
            }

            let (_, entry) = PartitionTable::parse_entry(&raw_entry, sector_size)
                .map_err(|err| nom_format("Failed to parse GPT partition entry", err))?;
            if entry.start_lba.checked_mul(sector_size).is_none() {
                return Err(FvdeError::Format(format!(
                    "Partition start LBA {} overflows the image address space",
                    entry.start_lba
                )));
            }

            entries.push(entry);
            entry_offset += PARTITION_ENTRY_SIZE as u64;
        }

        info!(
            "[macos-fvde] Found {} partition entries in the partition table",
            entries.len()
        );
        Ok(PartitionTable {
            sector_size,
            entries,
        })
    }

    /// The GPT header lives in sector 1, so its signature position reveals the sector size
    fn detect_sector_size<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<u64, FvdeError> {
        for sector_size in [0x200, 0x1000] {
            let signature = read_exact_at(reader, sector_size, GPT_SIGNATURE.len())?;
            if signature == GPT_SIGNATURE {
                return Ok(sector_size);
            }
        }
        Err(FvdeError::Format(String::from(
            "GPT signature not found at 512 or 4096 byte sector offsets",
        )))
    }

    fn parse_entry(input: &[u8], sector_size: u64) -> nom::IResult<&[u8], PartitionEntry> {
        const NAME_SIZE: usize = 72;

        let (input, type_guid) = take(size_of::<u128>())(input)?;
        let (input, partition_guid) = take(size_of::<u128>())(input)?;
        let (input, start_lba) = le_u64(input)?;
        let (input, _end_lba) = le_u64(input)?;
        let (input, _attributes) = le_u64(input)?;
        let (input, name_data) = take(NAME_SIZE)(input)?;

        let mut name_units = Vec::with_capacity(NAME_SIZE / 2);
        let mut name_input = name_data;
        while !name_input.is_empty() {
            let (remaining, unit) = le_u16(name_input)?;
            name_units.push(unit);
            name_input = remaining;
        }
        let name = String::from_utf16_lossy(&name_units)
            .trim_end_matches(char::from(0))
            .to_string();

        let entry = PartitionEntry {
            type_guid: Guid::from_bytes(to_array(type_guid)),
            partition_guid: Guid::from_bytes(to_array(partition_guid)),
            start_lba,
            offset: start_lba.wrapping_mul(sector_size),
            name,
        };
        Ok((input, entry))
    }

    /// Look up a partition by its unique partition GUID
    pub fn get(&self, partition_guid: &Guid) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .find(|entry| &entry.partition_guid == partition_guid)
    }

    /// Byte offsets of every partition with the provided type GUID, in table order
    pub fn partitions_of_type(&self, type_guid: &Guid) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|entry| &entry.type_guid == type_guid)
            .map(|entry| entry.offset)
            .collect()
    }
}

fn to_array(data: &[u8]) -> [u8; 16] {
    let mut bytes = [0; 16];
    bytes.copy_from_slice(data);
    bytes
}
