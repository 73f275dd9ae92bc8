// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use crate::hfsplus::HfsPlusVolume;
use crate::traits::{DirectoryTree, EntryKind, TreeEntry};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::io::{Read, Seek};

/// Encrypted metadata file stored on the boot (Recovery HD) volume, usually under
/// `/com.apple.boot.X/System/Library/Caches/com.apple.corestorage/`
pub const ENCRYPTED_ROOT_FILE: &str = "EncryptedRoot.plist.wipekey";
/// Directory nesting limit for the file search
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Open the HFS+ filesystem at `partition_offset` and return the contents of the first regular
/// file named `target_name`
pub fn locate_file<R: Read + Seek>(
    reader: &mut R,
    partition_offset: u64,
    target_name: &str,
    max_depth: usize,
) -> Result<Vec<u8>, FvdeError> {
    let mut volume = HfsPlusVolume::open(reader, partition_offset)?;
    find_file(&mut volume, target_name, max_depth)
}

/// Depth first search of `tree` for a regular file named `target_name`.
///
/// Entries are visited in the same order as a recursive walk: each directory is descended into
/// before its later siblings. The first match wins. Directories deeper than `max_depth` or seen
/// twice are skipped
pub fn find_file<T: DirectoryTree + ?Sized>(
    tree: &mut T,
    target_name: &str,
    max_depth: usize,
) -> Result<Vec<u8>, FvdeError> {
    let root = tree.root()?;
    let mut visited = HashSet::from([root.id]);
    let mut pending: Vec<(TreeEntry, usize)> = Vec::new();
    push_children(&mut pending, tree.list_directory(&root)?, 1);

    while let Some((entry, depth)) = pending.pop() {
        if entry.name == "." || entry.name == ".." {
            continue;
        }

        match entry.kind {
            EntryKind::File if entry.name == target_name => {
                info!(
                    "[macos-fvde] Found {target_name} ({} bytes) at depth {depth}",
                    entry.size
                );
                return tree.read_file(&entry);
            }
            EntryKind::Directory => {
                if depth >= max_depth {
                    warn!(
                        "[macos-fvde] Skipping directory {} nested deeper than {max_depth} levels",
                        entry.name
                    );
                    continue;
                }
                if !visited.insert(entry.id) {
                    warn!(
                        "[macos-fvde] Directory {} (id {}) was already visited, skipping",
                        entry.name, entry.id
                    );
                    continue;
                }
                debug!("[macos-fvde] Descending into {}", entry.name);
                let children = tree.list_directory(&entry)?;
                push_children(&mut pending, children, depth + 1);
            }
            _ => {}
        }
    }

    Err(FvdeError::NotFound(format!(
        "{target_name} not found in boot volume"
    )))
}

/// Push in reverse so the first entry is popped first
fn push_children(pending: &mut Vec<(TreeEntry, usize)>, children: Vec<TreeEntry>, depth: usize) {
    pending.extend(children.into_iter().rev().map(|child| (child, depth)));
}
