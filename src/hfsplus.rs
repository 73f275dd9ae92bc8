// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

//! Read-only HFS+ support, enough to walk the catalog of a boot (Recovery HD) volume and read
//! small files from it.
//! Reference: <https://developer.apple.com/library/archive/technotes/tn/tn1150.html>

use crate::error::{FvdeError, nom_format};
use crate::image::read_exact_at;
use crate::traits::{DirectoryTree, EntryKind, TreeEntry};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use nom::bytes::complete::take;
use nom::number::complete::{be_i8, be_i16, be_u8, be_u16, be_u32, be_u64};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};

const HFS_PLUS_SIGNATURE: u16 = 0x482B;
const HFSX_SIGNATURE: u16 = 0x4858;
const VOLUME_HEADER_OFFSET: u64 = 1024;
const VOLUME_HEADER_SIZE: usize = 512;
const NODE_DESCRIPTOR_SIZE: usize = 14;
/// Smallest valid B-tree node size, also enough to hold the header node descriptor and record
const MIN_NODE_SIZE: usize = 512;
const MAX_NODE_SIZE: usize = 32768;

/// Catalog node ID of the root folder
pub const ROOT_FOLDER_ID: u32 = 2;

const LEAF_NODE: i8 = -1;
const CATALOG_FOLDER: i16 = 1;
const CATALOG_FILE: i16 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    /// Only the eight extents stored inline, the extents overflow file is not read
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], ForkData> {
        let (mut input, logical_size) = be_u64(input)?;
        let (remaining, clump_size) = be_u32(input)?;
        let (remaining, total_blocks) = be_u32(remaining)?;
        input = remaining;

        let mut extents = [ExtentDescriptor::default(); 8];
        for extent in &mut extents {
            let (remaining, start_block) = be_u32(input)?;
            let (remaining, block_count) = be_u32(remaining)?;
            *extent = ExtentDescriptor {
                start_block,
                block_count,
            };
            input = remaining;
        }

        Ok((
            input,
            ForkData {
                logical_size,
                clump_size,
                total_blocks,
                extents,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeHeader {
    /// "H+" or "HX"
    pub signature: u16,
    pub version: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub catalog_file: ForkData,
}

impl VolumeHeader {
    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], VolumeHeader> {
        // Attributes, last mounted version, journal info block and four dates
        const SKIPPED_HEADER_SIZE: usize = 28;
        // Everything between total blocks and the catalog file fork (allocation and extents files)
        const SKIPPED_FORKS_SIZE: usize = 224;

        let (input, signature) = be_u16(input)?;
        let (input, version) = be_u16(input)?;
        let (input, _unknown) = take(SKIPPED_HEADER_SIZE)(input)?;
        let (input, file_count) = be_u32(input)?;
        let (input, folder_count) = be_u32(input)?;
        let (input, block_size) = be_u32(input)?;
        let (input, total_blocks) = be_u32(input)?;
        let (input, _forks) = take(SKIPPED_FORKS_SIZE)(input)?;
        let (input, catalog_file) = ForkData::parse(input)?;

        Ok((
            input,
            VolumeHeader {
                signature,
                version,
                file_count,
                folder_count,
                block_size,
                total_blocks,
                catalog_file,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: i8,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], NodeDescriptor> {
        let (input, forward_link) = be_u32(input)?;
        let (input, backward_link) = be_u32(input)?;
        let (input, kind) = be_i8(input)?;
        let (input, height) = be_u8(input)?;
        let (input, num_records) = be_u16(input)?;
        let (input, _reserved) = be_u16(input)?;
        Ok((
            input,
            NodeDescriptor {
                forward_link,
                backward_link,
                kind,
                height,
                num_records,
            },
        ))
    }
}

/// Header record of the catalog B-tree, stored in node 0
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeHeader {
    pub depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
}

impl BTreeHeader {
    pub fn parse(input: &[u8]) -> nom::IResult<&[u8], BTreeHeader> {
        let (input, depth) = be_u16(input)?;
        let (input, root_node) = be_u32(input)?;
        let (input, leaf_records) = be_u32(input)?;
        let (input, first_leaf_node) = be_u32(input)?;
        let (input, last_leaf_node) = be_u32(input)?;
        let (input, node_size) = be_u16(input)?;
        let (input, max_key_length) = be_u16(input)?;
        let (input, total_nodes) = be_u32(input)?;
        let (input, free_nodes) = be_u32(input)?;
        Ok((
            input,
            BTreeHeader {
                depth,
                root_node,
                leaf_records,
                first_leaf_node,
                last_leaf_node,
                node_size,
                max_key_length,
                total_nodes,
                free_nodes,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CatalogRecord {
    Folder {
        parent_id: u32,
        name: String,
        folder_id: u32,
    },
    File {
        parent_id: u32,
        name: String,
        file_id: u32,
        data_fork: ForkData,
    },
}

/// Parse one leaf record. Thread records and unknown record types return `None`
fn parse_catalog_record(record: &[u8]) -> nom::IResult<&[u8], Option<CatalogRecord>> {
    let (input, key_length) = be_u16(record)?;
    let (data, key) = take(key_length)(input)?;

    let (key, parent_id) = be_u32(key)?;
    let (key, name_length) = be_u16(key)?;
    let (_, name_data) = take(usize::from(name_length) * 2)(key)?;
    let name_units: Vec<u16> = name_data.chunks_exact(2).map(BigEndian::read_u16).collect();
    let name = String::from_utf16_lossy(&name_units);

    // Record data starts on an even offset
    let (data, _) = take(usize::from(key_length) % 2)(data)?;
    let (body, record_type) = be_i16(data)?;
    match record_type {
        CATALOG_FOLDER => {
            let (body, _flags) = be_u16(body)?;
            let (body, _valence) = be_u32(body)?;
            let (body, folder_id) = be_u32(body)?;
            Ok((
                body,
                Some(CatalogRecord::Folder {
                    parent_id,
                    name,
                    folder_id,
                }),
            ))
        }
        CATALOG_FILE => {
            // Dates, permissions and finder info sit between the file ID and the data fork
            const FILE_INFO_SIZE: usize = 76;

            let (body, _flags) = be_u16(body)?;
            let (body, _reserved) = be_u32(body)?;
            let (body, file_id) = be_u32(body)?;
            let (body, _info) = take(FILE_INFO_SIZE)(body)?;
            let (body, data_fork) = ForkData::parse(body)?;
            Ok((
                body,
                Some(CatalogRecord::File {
                    parent_id,
                    name,
                    file_id,
                    data_fork,
                }),
            ))
        }
        _ => Ok((body, None)),
    }
}

/// Read `length` bytes starting at `offset` inside a fork, following its extents
fn read_fork_range<R: Read + Seek + ?Sized>(
    reader: &mut R,
    partition_offset: u64,
    block_size: u64,
    fork: &ForkData,
    offset: u64,
    length: usize,
) -> Result<Vec<u8>, FvdeError> {
    let end = offset
        .checked_add(length as u64)
        .filter(|end| *end <= fork.logical_size)
        .ok_or_else(|| {
            FvdeError::Format(format!(
                "Fork range {offset}+{length} is outside the fork size {}",
                fork.logical_size
            ))
        })?;

    // The sizes come from the image, check them against the extents before allocating
    let covered = fork
        .extents
        .iter()
        .take_while(|extent| extent.block_count != 0)
        .map(|extent| u64::from(extent.block_count))
        .sum::<u64>()
        .saturating_mul(block_size);
    if end > covered {
        return Err(FvdeError::Format(format!(
            "Fork range {offset}+{length} needs more than the {covered} bytes in the inline extents, the extents overflow file is not supported"
        )));
    }

    // Grown per extent, each read is bounded by the image size
    let mut data = Vec::new();
    let mut extent_start: u64 = 0;
    for extent in fork.extents.iter().take_while(|extent| extent.block_count != 0) {
        if data.len() == length {
            break;
        }
        let extent_end = extent_start.saturating_add(u64::from(extent.block_count) * block_size);
        let position = offset + data.len() as u64;
        if position >= extent_start && position < extent_end {
            let count = (extent_end.min(end) - position) as usize;
            let physical_offset = (u64::from(extent.start_block) * block_size)
                .checked_add(position - extent_start)
                .and_then(|relative| relative.checked_add(partition_offset))
                .ok_or_else(|| {
                    FvdeError::Format(format!(
                        "Extent starting at block {} is outside the image",
                        extent.start_block
                    ))
                })?;
            data.extend(read_exact_at(reader, physical_offset, count)?);
        }
        extent_start = extent_end;
    }

    if data.len() != length {
        return Err(FvdeError::Format(format!(
            "Fork of {} bytes continues in the extents overflow file, which is not supported",
            fork.logical_size
        )));
    }
    Ok(data)
}

/// An HFS+ or HFSX volume inside a disk image. The catalog is indexed once when the volume is
/// opened, file contents are read on demand
pub struct HfsPlusVolume<'a, R: Read + Seek> {
    reader: &'a mut R,
    partition_offset: u64,
    pub header: VolumeHeader,
    /// Entries below each folder ID, in catalog order
    children: HashMap<u32, Vec<TreeEntry>>,
    data_forks: HashMap<u32, ForkData>,
}

impl<'a, R: Read + Seek> HfsPlusVolume<'a, R> {
    pub fn open(reader: &'a mut R, partition_offset: u64) -> Result<Self, FvdeError> {
        let header_offset = partition_offset
            .checked_add(VOLUME_HEADER_OFFSET)
            .ok_or_else(|| FvdeError::Format(format!("Invalid partition offset {partition_offset}")))?;
        let header_data = read_exact_at(reader, header_offset, VOLUME_HEADER_SIZE)?;
        let (_, header) = VolumeHeader::parse(&header_data)
            .map_err(|err| nom_format("Failed to parse HFS+ volume header", err))?;

        if header.signature != HFS_PLUS_SIGNATURE && header.signature != HFSX_SIGNATURE {
            return Err(FvdeError::Format(format!(
                "Invalid HFS+ signature {:#06x} at offset {partition_offset}",
                header.signature
            )));
        }
        if header.block_size == 0 || !header.block_size.is_power_of_two() {
            return Err(FvdeError::Format(format!(
                "Invalid HFS+ block size {}",
                header.block_size
            )));
        }
        debug!(
            "[macos-fvde] HFS+ volume at {partition_offset}: block size {}, {} files, {} folders",
            header.block_size, header.file_count, header.folder_count
        );

        let mut volume = HfsPlusVolume {
            reader,
            partition_offset,
            header,
            children: HashMap::new(),
            data_forks: HashMap::new(),
        };
        volume.index_catalog()?;
        Ok(volume)
    }

    fn read_catalog(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, FvdeError> {
        read_fork_range(
            &mut *self.reader,
            self.partition_offset,
            u64::from(self.header.block_size),
            &self.header.catalog_file,
            offset,
            length,
        )
    }

    /// Walk the catalog leaf nodes and record every folder and file by parent folder ID
    fn index_catalog(&mut self) -> Result<(), FvdeError> {
        let header_node = self.read_catalog(0, MIN_NODE_SIZE)?;
        let (_, btree_header) = BTreeHeader::parse(&header_node[NODE_DESCRIPTOR_SIZE..])
            .map_err(|err| nom_format("Failed to parse catalog B-tree header", err))?;

        let node_size = usize::from(btree_header.node_size);
        if !(MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&node_size) || !node_size.is_power_of_two() {
            return Err(FvdeError::Format(format!(
                "Invalid catalog node size {node_size}"
            )));
        }
        debug!(
            "[macos-fvde] Catalog B-tree: node size {node_size}, {} leaf records, first leaf node {}",
            btree_header.leaf_records, btree_header.first_leaf_node
        );

        let mut visited = HashSet::new();
        let mut node_index = btree_header.first_leaf_node;
        while node_index != 0 {
            if !visited.insert(node_index) || visited.len() > btree_header.total_nodes as usize {
                return Err(FvdeError::Format(format!(
                    "Catalog leaf node chain loops at node {node_index}"
                )));
            }

            let node =
                self.read_catalog(u64::from(node_index) * node_size as u64, node_size)?;
            let (_, descriptor) = NodeDescriptor::parse(&node)
                .map_err(|err| nom_format("Failed to parse catalog node descriptor", err))?;
            if descriptor.kind != LEAF_NODE {
                return Err(FvdeError::Format(format!(
                    "Catalog node {node_index} in the leaf chain has kind {}",
                    descriptor.kind
                )));
            }

            self.index_leaf_node(node_index, &node, &descriptor)?;
            node_index = descriptor.forward_link;
        }
        Ok(())
    }

    fn index_leaf_node(
        &mut self,
        node_index: u32,
        node: &[u8],
        descriptor: &NodeDescriptor,
    ) -> Result<(), FvdeError> {
        // Record offsets are stored at the end of the node, growing backward
        for record_index in 0..usize::from(descriptor.num_records) {
            let offset_position = node
                .len()
                .checked_sub(2 * (record_index + 1))
                .filter(|position| *position >= NODE_DESCRIPTOR_SIZE)
                .ok_or_else(|| {
                    FvdeError::Format(format!(
                        "Catalog node {node_index} has too many records"
                    ))
                })?;
            let record_offset =
                usize::from(BigEndian::read_u16(&node[offset_position..offset_position + 2]));
            let record = node.get(record_offset..offset_position).ok_or_else(|| {
                FvdeError::Format(format!(
                    "Catalog node {node_index} record {record_index} has invalid offset {record_offset}"
                ))
            })?;

            let (_, catalog_record) = parse_catalog_record(record)
                .map_err(|err| nom_format("Failed to parse catalog record", err))?;
            match catalog_record {
                Some(CatalogRecord::Folder {
                    parent_id,
                    name,
                    folder_id,
                }) => {
                    self.children.entry(parent_id).or_default().push(TreeEntry {
                        id: u64::from(folder_id),
                        name,
                        kind: EntryKind::Directory,
                        size: 0,
                    });
                }
                Some(CatalogRecord::File {
                    parent_id,
                    name,
                    file_id,
                    data_fork,
                }) => {
                    self.children.entry(parent_id).or_default().push(TreeEntry {
                        id: u64::from(file_id),
                        name,
                        kind: EntryKind::File,
                        size: data_fork.logical_size,
                    });
                    self.data_forks.insert(file_id, data_fork);
                }
                None => {}
            }
        }
        Ok(())
    }
}

impl<R: Read + Seek> DirectoryTree for HfsPlusVolume<'_, R> {
    fn root(&mut self) -> Result<TreeEntry, FvdeError> {
        Ok(TreeEntry {
            id: u64::from(ROOT_FOLDER_ID),
            name: String::from("/"),
            kind: EntryKind::Directory,
            size: 0,
        })
    }

    fn list_directory(&mut self, directory: &TreeEntry) -> Result<Vec<TreeEntry>, FvdeError> {
        let folder_id = u32::try_from(directory.id)
            .map_err(|_| FvdeError::Format(format!("Invalid folder ID {}", directory.id)))?;
        Ok(self.children.get(&folder_id).cloned().unwrap_or_default())
    }

    fn read_file(&mut self, file: &TreeEntry) -> Result<Vec<u8>, FvdeError> {
        let fork = u32::try_from(file.id)
            .ok()
            .and_then(|file_id| self.data_forks.get(&file_id))
            .cloned()
            .ok_or_else(|| FvdeError::NotFound(format!("No catalog file record for {}", file.name)))?;

        let length = usize::try_from(fork.logical_size).map_err(|_| {
            FvdeError::Format(format!("File {} is too large to read", file.name))
        })?;
        read_fork_range(
            &mut *self.reader,
            self.partition_offset,
            u64::from(self.header.block_size),
            &fork,
            0,
            length,
        )
    }
}
