// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use std::fmt;

#[derive(Debug)]
pub enum FvdeError {
    /// Data did not match the expected on-disk or document layout
    Format(String),
    /// Attempted to read past the end of the image
    TruncatedRead { offset: u64, length: usize },
    NotFound(String),
    /// Keybag data that violates a hard invariant
    Corruption(String),
    Io(std::io::Error),
}

impl std::error::Error for FvdeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for FvdeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(message) => write!(f, "Invalid format: {message}"),
            Self::TruncatedRead { offset, length } => write!(
                f,
                "Attempted to read {length} bytes at offset {offset} past the end of the image"
            ),
            Self::NotFound(message) => write!(f, "Not found: {message}"),
            Self::Corruption(message) => write!(f, "Corrupted data: {message}"),
            Self::Io(err) => write!(f, "Failed to read image: {err}"),
        }
    }
}

impl From<std::io::Error> for FvdeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Map a nom failure from one of the binary parsers into a format error
pub(crate) fn nom_format<E: fmt::Debug>(context: &str, err: nom::Err<E>) -> FvdeError {
    FvdeError::Format(format!("{context}: {err:?}"))
}
