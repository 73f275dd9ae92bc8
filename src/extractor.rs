// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::corestorage::read_volume_key;
use crate::error::FvdeError;
use crate::gpt::PartitionTable;
use crate::guid::{APPLE_BOOT_TYPE, CORE_STORAGE_TYPE};
use crate::hash::HashLine;
use crate::locator::{DEFAULT_MAX_DEPTH, ENCRYPTED_ROOT_FILE, locate_file};
use crate::metadata::EncryptedRoot;
use crate::xts::{ZERO_TWEAK, decrypt};
use log::{error, info, warn};
use std::io::{Read, Seek};

/// Tunables of [`extract_hashes`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    /// File searched for on every boot volume
    pub target_name: String,
    /// Directory nesting limit of the boot volume search
    pub max_depth: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            target_name: String::from(ENCRYPTED_ROOT_FILE),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// A boot and CoreStorage volume combination that did not produce a line
#[derive(Debug)]
pub struct PairFailure {
    pub boot_offset: u64,
    pub core_storage_offset: u64,
    pub error: FvdeError,
}

#[derive(Debug, Default)]
pub struct Extraction {
    /// One line per pair with a local user, boot volume major then CoreStorage volume order
    pub lines: Vec<HashLine>,
    pub failures: Vec<PairFailure>,
}

/// Extract FileVault2 hashes from a raw disk image.
///
/// Every boot volume is paired with every CoreStorage volume since the partition table does not
/// record which belong together. A failing pair is recorded in [`Extraction::failures`] and the
/// remaining pairs are still tried. Errors before any pair is tried (bad partition table, no
/// partitions of a required type) are returned directly
pub fn extract_hashes<R: Read + Seek>(
    reader: &mut R,
    options: &ExtractOptions,
) -> Result<Extraction, FvdeError> {
    let table = PartitionTable::parse(reader)?;

    let core_storage_offsets = table.partitions_of_type(&CORE_STORAGE_TYPE);
    if core_storage_offsets.is_empty() {
        return Err(FvdeError::NotFound(String::from(
            "No CoreStorage partitions in partition table",
        )));
    }
    let boot_offsets = table.partitions_of_type(&APPLE_BOOT_TYPE);
    if boot_offsets.is_empty() {
        return Err(FvdeError::NotFound(String::from(
            "No Apple boot partitions in partition table",
        )));
    }
    info!(
        "[macos-fvde] Found {} CoreStorage and {} boot partitions",
        core_storage_offsets.len(),
        boot_offsets.len()
    );

    let mut extraction = Extraction::default();
    for boot_offset in &boot_offsets {
        let encrypted_root = match locate_file(
            reader,
            *boot_offset,
            &options.target_name,
            options.max_depth,
        ) {
            Ok(result) => result,
            Err(err) => {
                error!(
                    "[macos-fvde] Could not read {} from boot volume at offset {boot_offset}: {err}",
                    options.target_name
                );
                // Without the file no CoreStorage volume can be paired with this boot volume
                for core_storage_offset in &core_storage_offsets {
                    extraction.failures.push(PairFailure {
                        boot_offset: *boot_offset,
                        core_storage_offset: *core_storage_offset,
                        error: clone_error(&err),
                    });
                }
                continue;
            }
        };

        for core_storage_offset in &core_storage_offsets {
            match extract_pair(reader, *core_storage_offset, &encrypted_root) {
                Ok(Some(line)) => extraction.lines.push(line),
                Ok(None) => warn!(
                    "[macos-fvde] No local user for boot volume at {boot_offset} and CoreStorage volume at {core_storage_offset}"
                ),
                Err(err) => {
                    error!(
                        "[macos-fvde] Failed to extract hash for boot volume at {boot_offset} and CoreStorage volume at {core_storage_offset}: {err}"
                    );
                    extraction.failures.push(PairFailure {
                        boot_offset: *boot_offset,
                        core_storage_offset: *core_storage_offset,
                        error: err,
                    });
                }
            }
        }
    }

    Ok(extraction)
}

/// Decrypt the boot volume's encrypted file with one CoreStorage volume key and build the line
/// for its first local user
fn extract_pair<R: Read + Seek>(
    reader: &mut R,
    core_storage_offset: u64,
    encrypted_root: &[u8],
) -> Result<Option<HashLine>, FvdeError> {
    let key = read_volume_key(reader, core_storage_offset)?;
    let plaintext = decrypt(&key, ZERO_TWEAK, encrypted_root)?;
    let root = EncryptedRoot::parse(&plaintext)?;
    HashLine::from_document(&root)
}

/// `io::Error` is not `Clone`, keep its kind and message when the same error is reported for
/// several pairs
fn clone_error(err: &FvdeError) -> FvdeError {
    match err {
        FvdeError::Format(message) => FvdeError::Format(message.clone()),
        FvdeError::TruncatedRead { offset, length } => FvdeError::TruncatedRead {
            offset: *offset,
            length: *length,
        },
        FvdeError::NotFound(message) => FvdeError::NotFound(message.clone()),
        FvdeError::Corruption(message) => FvdeError::Corruption(message.clone()),
        FvdeError::Io(io_err) => FvdeError::Io(std::io::Error::new(io_err.kind(), io_err.to_string())),
    }
}
