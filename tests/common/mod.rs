// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

//! Builders for small synthetic disk images: a GUID partition table, CoreStorage volume headers
//! and HFS+ boot volumes holding an encrypted `EncryptedRoot.plist.wipekey`

#![allow(dead_code)]

use base64::{Engine, engine::general_purpose};
use macos_fvde::guid::Guid;
use macos_fvde::xts::{ZERO_TWEAK, encrypt};
use simplelog::{Config, LevelFilter, SimpleLogger};

pub const VOLUME_KEY: [u8; 16] = [
    0x3d, 0x21, 0x6a, 0x90, 0x0e, 0x51, 0xc7, 0x42, 0x88, 0x19, 0x5b, 0xf4, 0x02, 0xae, 0x77, 0x6c,
];
pub const HASH: &str = "$fvde$1$16$08090a0b0c0d0e0f1011121314151617$41000$202122232425262728292a2b2c2d2e2f3031323334353637";

const FIRST_PARTITION_LBA: u64 = 40;
const HFS_BLOCK_SIZE: usize = 512;
const NODE_SIZE: usize = 512;
const ROOT_FOLDER_ID: u32 = 2;

/// Send library log output to the test harness. Only the first call in a test binary installs
/// the logger
pub fn init_logger() {
    let _ = SimpleLogger::init(LevelFilter::Debug, Config::default());
}

/// A `PassphraseWrappedKEKStruct` with salt 08..17, kek 20..37 and 41000 iterations
pub fn wrapped_kek_struct() -> Vec<u8> {
    let mut data: Vec<u8> = (0..=255).collect();
    data[168..172].copy_from_slice(&41000_u32.to_le_bytes());
    data
}

pub struct TestUser {
    pub user_type: u64,
    pub user_name: String,
    pub full_name: String,
    pub hint: Option<String>,
}

impl TestUser {
    pub fn local(user_name: &str, full_name: &str, hint: &str) -> TestUser {
        TestUser {
            user_type: 0x10060002,
            user_name: user_name.to_string(),
            full_name: full_name.to_string(),
            hint: Some(hint.to_string()),
        }
    }
}

/// Decrypted `EncryptedRoot.plist` contents, ending in a line of trailing junk like real files
pub fn encrypted_root_plaintext(users: &[TestUser]) -> Vec<u8> {
    let mut lines = vec![
        String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#),
        String::from(
            r#"<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">"#,
        ),
        String::from(r#"<plist version="1.0">"#),
        String::from("<dict>"),
        String::from("\t<key>CryptoUsers</key>"),
        String::from("\t<array>"),
    ];
    for user in users {
        lines.push(String::from("\t\t<dict>"));
        if let Some(hint) = &user.hint {
            lines.push(String::from("\t\t\t<key>PassphraseHint</key>"));
            lines.push(format!("\t\t\t<string>{hint}</string>"));
        }
        lines.push(String::from("\t\t\t<key>PassphraseWrappedKEKStruct</key>"));
        lines.push(format!(
            "\t\t\t<data>{}</data>",
            general_purpose::STANDARD.encode(wrapped_kek_struct())
        ));
        lines.push(String::from("\t\t\t<key>UserNamesData</key>"));
        lines.push(String::from("\t\t\t<array>"));
        lines.push(format!(
            "\t\t\t\t<data>{}</data>",
            general_purpose::STANDARD.encode(&user.full_name)
        ));
        lines.push(format!(
            "\t\t\t\t<data>{}</data>",
            general_purpose::STANDARD.encode(&user.user_name)
        ));
        lines.push(String::from("\t\t\t</array>"));
        lines.push(String::from("\t\t\t<key>UserType</key>"));
        lines.push(format!("\t\t\t<integer>{}</integer>", user.user_type));
        lines.push(String::from("\t\t</dict>"));
    }
    lines.push(String::from("\t</array>"));
    lines.push(String::from("</dict>"));
    lines.push(String::from("</plist>"));

    let mut plaintext = lines.join("\n").into_bytes();
    plaintext.push(b'\n');
    plaintext.extend_from_slice(&[0x00, 0x00, 0x9c, 0x00, 0x00, 0x00, 0x00]);
    plaintext
}

pub fn encrypted_root(key: &[u8; 16], users: &[TestUser]) -> Vec<u8> {
    encrypt(key, ZERO_TWEAK, &encrypted_root_plaintext(users)).unwrap()
}

/// CoreStorage volume header with the metadata key at offset 176
pub fn core_storage_volume(key: &[u8; 16]) -> Vec<u8> {
    let mut volume = vec![0u8; 4096];
    volume[88..90].copy_from_slice(b"CS");
    volume[176..192].copy_from_slice(key);
    volume
}

enum HfsEntry {
    Folder { id: u32 },
    File { id: u32, data: Vec<u8> },
}

/// Builds an HFS+ volume with a single catalog B-tree laid out over as many leaf nodes as needed
pub struct HfsPlusBuilder {
    next_id: u32,
    entries: Vec<(u32, String, HfsEntry)>,
}

impl Default for HfsPlusBuilder {
    fn default() -> Self {
        HfsPlusBuilder {
            // First user CNID
            next_id: 16,
            entries: Vec::new(),
        }
    }
}

impl HfsPlusBuilder {
    pub fn root(&self) -> u32 {
        ROOT_FOLDER_ID
    }

    pub fn add_folder(&mut self, parent: u32, name: &str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries
            .push((parent, name.to_string(), HfsEntry::Folder { id }));
        id
    }

    pub fn add_file(&mut self, parent: u32, name: &str, data: &[u8]) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((
            parent,
            name.to_string(),
            HfsEntry::File {
                id,
                data: data.to_vec(),
            },
        ));
        id
    }

    /// Create `/com.apple.boot.X/System/Library/Caches/com.apple.corestorage/<name>`
    pub fn add_boot_layout(&mut self, name: &str, data: &[u8]) -> u32 {
        self.add_file(ROOT_FOLDER_ID, "mach_kernel", b"kernel");
        let mut parent = self.add_folder(ROOT_FOLDER_ID, "com.apple.boot.X");
        for folder in ["System", "Library", "Caches", "com.apple.corestorage"] {
            parent = self.add_folder(parent, folder);
        }
        self.add_file(parent, "SystemVersion.plist", b"<plist/>");
        self.add_file(parent, name, data)
    }

    pub fn build(&self) -> Vec<u8> {
        let records = self.catalog_records();
        let leaf_nodes = pack_leaf_nodes(&records);
        let node_count = leaf_nodes.len() + 1;

        // Boot blocks and volume header take blocks 0-3, the catalog follows
        let catalog_start = 4;
        let mut file_start = catalog_start + node_count;

        let mut catalog = header_node(records.len(), leaf_nodes.len());
        let mut file_blocks = Vec::new();
        let mut file_locations = Vec::new();
        for (_, _, entry) in &self.entries {
            if let HfsEntry::File { data, .. } = entry {
                let blocks = data.len().div_ceil(HFS_BLOCK_SIZE).max(1);
                file_locations.push((file_start, blocks));
                let mut padded = data.clone();
                padded.resize(blocks * HFS_BLOCK_SIZE, 0);
                file_blocks.extend(padded);
                file_start += blocks;
            }
        }

        let located_records = self.catalog_records_with_forks(&file_locations);
        for (index, node) in pack_leaf_nodes(&located_records).iter().enumerate() {
            catalog.extend(leaf_node(index + 1, leaf_nodes.len(), node));
        }

        let total_blocks = file_start;
        let mut volume = vec![0u8; total_blocks * HFS_BLOCK_SIZE];
        let header = volume_header(total_blocks, catalog_start, node_count);
        volume[1024..1024 + header.len()].copy_from_slice(&header);
        let catalog_offset = catalog_start * HFS_BLOCK_SIZE;
        volume[catalog_offset..catalog_offset + catalog.len()].copy_from_slice(&catalog);
        let files_offset = (catalog_start + node_count) * HFS_BLOCK_SIZE;
        volume[files_offset..files_offset + file_blocks.len()].copy_from_slice(&file_blocks);
        volume
    }

    fn catalog_records(&self) -> Vec<Vec<u8>> {
        let placeholders: Vec<(usize, usize)> = self
            .entries
            .iter()
            .filter(|(_, _, entry)| matches!(entry, HfsEntry::File { .. }))
            .map(|_| (0, 0))
            .collect();
        self.catalog_records_with_forks(&placeholders)
    }

    /// Leaf records sorted by parent ID then name, with a thread record for every folder
    fn catalog_records_with_forks(&self, file_locations: &[(usize, usize)]) -> Vec<Vec<u8>> {
        let mut keyed: Vec<(u32, String, Vec<u8>)> = Vec::new();
        keyed.push((
            ROOT_FOLDER_ID,
            String::new(),
            thread_record(ROOT_FOLDER_ID, "Macintosh HD"),
        ));

        let mut file_index = 0;
        for (parent, name, entry) in &self.entries {
            match entry {
                HfsEntry::Folder { id } => {
                    keyed.push((*parent, name.clone(), folder_record(*id)));
                    keyed.push((*id, String::new(), thread_record(*parent, name)));
                }
                HfsEntry::File { id, data } => {
                    let (start, blocks) = file_locations[file_index];
                    file_index += 1;
                    keyed.push((*parent, name.clone(), file_record(*id, data.len(), start, blocks)));
                }
            }
        }

        keyed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        keyed
            .into_iter()
            .map(|(parent, name, data)| {
                let mut record = catalog_key(parent, &name);
                record.extend(data);
                record
            })
            .collect()
    }
}

fn catalog_key(parent: u32, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let key_length = 6 + 2 * units.len() as u16;
    let mut key = key_length.to_be_bytes().to_vec();
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(&(units.len() as u16).to_be_bytes());
    key.extend(units.iter().flat_map(|unit| unit.to_be_bytes()));
    key
}

fn folder_record(id: u32) -> Vec<u8> {
    let mut record = vec![0u8; 88];
    record[0..2].copy_from_slice(&1_i16.to_be_bytes());
    record[8..12].copy_from_slice(&id.to_be_bytes());
    record
}

fn file_record(id: u32, size: usize, start_block: usize, blocks: usize) -> Vec<u8> {
    let mut record = vec![0u8; 248];
    record[0..2].copy_from_slice(&2_i16.to_be_bytes());
    record[8..12].copy_from_slice(&id.to_be_bytes());
    record[88..96].copy_from_slice(&(size as u64).to_be_bytes());
    record[100..104].copy_from_slice(&(blocks as u32).to_be_bytes());
    record[104..108].copy_from_slice(&(start_block as u32).to_be_bytes());
    record[108..112].copy_from_slice(&(blocks as u32).to_be_bytes());
    record
}

fn thread_record(parent: u32, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut record = 3_i16.to_be_bytes().to_vec();
    record.extend_from_slice(&[0, 0]);
    record.extend_from_slice(&parent.to_be_bytes());
    record.extend_from_slice(&(units.len() as u16).to_be_bytes());
    record.extend(units.iter().flat_map(|unit| unit.to_be_bytes()));
    record
}

/// Split records over leaf nodes, leaving room for the descriptor and the offset table
fn pack_leaf_nodes(records: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
    let mut nodes: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    let mut used = 14;
    for record in records {
        let count = nodes.last().map_or(0, Vec::len);
        if used + record.len() + 2 * (count + 2) > NODE_SIZE {
            nodes.push(Vec::new());
            used = 14;
        }
        used += record.len();
        if let Some(node) = nodes.last_mut() {
            node.push(record.clone());
        }
    }
    nodes
}

fn header_node(leaf_records: usize, leaf_nodes: usize) -> Vec<u8> {
    let mut node = vec![0u8; NODE_SIZE];
    node[8] = 1;
    node[10..12].copy_from_slice(&3_u16.to_be_bytes());

    let header = &mut node[14..];
    header[0..2].copy_from_slice(&1_u16.to_be_bytes());
    header[2..6].copy_from_slice(&1_u32.to_be_bytes());
    header[6..10].copy_from_slice(&(leaf_records as u32).to_be_bytes());
    header[10..14].copy_from_slice(&1_u32.to_be_bytes());
    header[14..18].copy_from_slice(&(leaf_nodes as u32).to_be_bytes());
    header[18..20].copy_from_slice(&(NODE_SIZE as u16).to_be_bytes());
    header[20..22].copy_from_slice(&516_u16.to_be_bytes());
    header[22..26].copy_from_slice(&(leaf_nodes as u32 + 1).to_be_bytes());
    node
}

fn leaf_node(index: usize, leaf_nodes: usize, records: &[Vec<u8>]) -> Vec<u8> {
    let mut node = vec![0u8; NODE_SIZE];
    let forward_link = if index < leaf_nodes { index + 1 } else { 0 };
    node[0..4].copy_from_slice(&(forward_link as u32).to_be_bytes());
    node[4..8].copy_from_slice(&((index - 1) as u32).to_be_bytes());
    node[8] = 0xff;
    node[9] = 1;
    node[10..12].copy_from_slice(&(records.len() as u16).to_be_bytes());

    let mut offset = 14;
    for (record_index, record) in records.iter().enumerate() {
        node[offset..offset + record.len()].copy_from_slice(record);
        let slot = NODE_SIZE - 2 * (record_index + 1);
        node[slot..slot + 2].copy_from_slice(&(offset as u16).to_be_bytes());
        offset += record.len();
    }
    // Free space offset
    let slot = NODE_SIZE - 2 * (records.len() + 1);
    node[slot..slot + 2].copy_from_slice(&(offset as u16).to_be_bytes());
    node
}

fn volume_header(total_blocks: usize, catalog_start: usize, catalog_nodes: usize) -> Vec<u8> {
    let mut header = vec![0u8; 512];
    header[0..2].copy_from_slice(b"H+");
    header[2..4].copy_from_slice(&4_u16.to_be_bytes());
    header[40..44].copy_from_slice(&(HFS_BLOCK_SIZE as u32).to_be_bytes());
    header[44..48].copy_from_slice(&(total_blocks as u32).to_be_bytes());

    let catalog_size = (catalog_nodes * NODE_SIZE) as u64;
    let catalog_blocks = (catalog_nodes * NODE_SIZE / HFS_BLOCK_SIZE) as u32;
    header[272..280].copy_from_slice(&catalog_size.to_be_bytes());
    header[284..288].copy_from_slice(&catalog_blocks.to_be_bytes());
    header[288..292].copy_from_slice(&(catalog_start as u32).to_be_bytes());
    header[292..296].copy_from_slice(&catalog_blocks.to_be_bytes());
    header
}

/// Assembles a GPT disk image from partition type GUIDs and contents
pub struct DiskImage {
    sector_size: u64,
    partitions: Vec<(Guid, String, Vec<u8>)>,
}

impl DiskImage {
    pub fn new(sector_size: u64) -> DiskImage {
        DiskImage {
            sector_size,
            partitions: Vec::new(),
        }
    }

    pub fn add_partition(&mut self, type_guid: Guid, name: &str, contents: Vec<u8>) -> &mut Self {
        self.partitions.push((type_guid, name.to_string(), contents));
        self
    }

    /// Byte offsets the partitions will be placed at
    pub fn partition_offsets(&self) -> Vec<u64> {
        let mut offsets = Vec::new();
        let mut lba = FIRST_PARTITION_LBA;
        for (_, _, contents) in &self.partitions {
            offsets.push(lba * self.sector_size);
            lba += (contents.len() as u64).div_ceil(self.sector_size);
        }
        offsets
    }

    pub fn build(&self) -> Vec<u8> {
        let sector_size = self.sector_size as usize;
        let offsets = self.partition_offsets();
        let end = offsets
            .iter()
            .zip(&self.partitions)
            .map(|(offset, (_, _, contents))| *offset as usize + contents.len())
            .max()
            .unwrap_or(FIRST_PARTITION_LBA as usize * sector_size);
        let mut image = vec![0u8; end.div_ceil(sector_size) * sector_size];

        image[sector_size..sector_size + 8].copy_from_slice(b"EFI PART");
        let mut entry_offset = 2 * sector_size;
        for (index, (type_guid, name, contents)) in self.partitions.iter().enumerate() {
            let start_lba = offsets[index] / self.sector_size;
            let end_lba = start_lba + (contents.len() as u64).div_ceil(self.sector_size) - 1;

            let entry = &mut image[entry_offset..entry_offset + 128];
            entry[0..16].copy_from_slice(type_guid.as_bytes());
            entry[16] = index as u8 + 1;
            entry[32..40].copy_from_slice(&start_lba.to_le_bytes());
            entry[40..48].copy_from_slice(&end_lba.to_le_bytes());
            for (unit_index, unit) in name.encode_utf16().take(36).enumerate() {
                let position = 56 + unit_index * 2;
                entry[position..position + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entry_offset += 128;

            let offset = offsets[index] as usize;
            image[offset..offset + contents.len()].copy_from_slice(contents);
        }
        image
    }
}
