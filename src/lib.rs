// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::doc_markdown,
    clippy::needless_continue,
    clippy::match_on_vec_items,
    clippy::imprecise_flops,
    clippy::suboptimal_flops,
    clippy::lossy_float_literal,
    clippy::fn_params_excessive_bools,
    clippy::inefficient_to_string,
    clippy::verbose_file_reads,
    clippy::unnested_or_patterns,
    rust_2018_idioms,
    future_incompatible
)]
#![deny(
    clippy::cast_lossless,
    //clippy::cast_possible_truncation, 
    clippy::cast_possible_wrap,
    clippy::cast_ptr_alignment,
    //clippy::cast_sign_loss,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::unnecessary_cast
)]

mod corestorage;
pub mod error;
/// Pairs every boot volume with every CoreStorage volume and builds the hash lines
pub mod extractor;
/// Functions to parse the GUID partition table
pub mod gpt;
pub mod guid;
/// Functions to build the `$fvde$` hash lines
pub mod hash;
pub mod hfsplus;
mod image;
pub mod keybag;
/// Functions to find the encrypted metadata file on a boot volume
pub mod locator;
/// Functions to parse the decrypted `EncryptedRoot.plist`
pub mod metadata;
pub mod traits;
/// AES-XTS decryption of CoreStorage metadata
pub mod xts;

pub use corestorage::read_volume_key;
pub use error::FvdeError;
pub use extractor::{ExtractOptions, Extraction, PairFailure, extract_hashes};
