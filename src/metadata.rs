// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::FvdeError;
use log::{debug, error, warn};
use plist::Value;
use serde::Serialize;
use std::io::Cursor;

/// A user entry from the `CryptoUsers` array of the decrypted `EncryptedRoot.plist`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CryptoUserRecord {
    pub user_type: Option<u64>,
    pub passphrase_hint: Option<String>,
    pub full_name: String,
    pub user_name: String,
    /// Raw `PassphraseWrappedKEKStruct` bytes
    pub wrapped_kek_struct: Option<Vec<u8>>,
}

/// The decrypted `EncryptedRoot.plist` document
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedRoot {
    pub crypto_users: Vec<CryptoUserRecord>,
    pub document: Value,
}

impl EncryptedRoot {
    /// Parse decrypted `EncryptedRoot.plist.wipekey` bytes
    pub fn parse(plaintext: &[u8]) -> Result<EncryptedRoot, FvdeError> {
        let document = parse_document(plaintext)?;
        EncryptedRoot::from_document(document)
    }

    pub fn from_document(document: Value) -> Result<EncryptedRoot, FvdeError> {
        let users = document
            .as_dictionary()
            .and_then(|dict| dict.get("CryptoUsers"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                FvdeError::Format(String::from("Decrypted plist has no CryptoUsers array"))
            })?;

        let crypto_users = users.iter().map(parse_crypto_user).collect();
        Ok(EncryptedRoot {
            crypto_users,
            document,
        })
    }
}

/// Decode the decrypted payload as a plist.
///
/// Decryption leaves exactly one malformed line at the end of the payload. Everything after the
/// last newline is dropped and the remaining lines are joined without separators
pub fn parse_document(plaintext: &[u8]) -> Result<Value, FvdeError> {
    let mut lines: Vec<&[u8]> = plaintext.split(|byte| *byte == b'\n').collect();
    lines.pop();
    debug!(
        "[macos-fvde] Decoding {} plist lines from {} decrypted bytes",
        lines.len(),
        plaintext.len()
    );

    let joined = lines.concat();
    let text = match String::from_utf8(joined) {
        Ok(results) => results,
        Err(err) => {
            error!("[macos-fvde] Decrypted plist is not valid UTF8: {err:?}");
            return Err(FvdeError::Format(format!(
                "Decrypted plist is not valid UTF8: {err}"
            )));
        }
    };

    Value::from_reader(Cursor::new(text.as_bytes()))
        .map_err(|err| FvdeError::Format(format!("Failed to parse decrypted plist: {err}")))
}

fn parse_crypto_user(value: &Value) -> CryptoUserRecord {
    let mut record = CryptoUserRecord::default();
    let Some(user) = value.as_dictionary() else {
        return record;
    };

    record.user_type = user.get("UserType").and_then(Value::as_unsigned_integer);
    record.passphrase_hint = user
        .get("PassphraseHint")
        .and_then(Value::as_string)
        .map(str::to_string);
    record.wrapped_kek_struct = user
        .get("PassphraseWrappedKEKStruct")
        .and_then(Value::as_data)
        .map(<[u8]>::to_vec);

    // Full name followed by the short login name
    if let Some([full_name, user_name]) = user
        .get("UserNamesData")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
    {
        record.full_name = data_string(full_name);
        record.user_name = data_string(user_name);
    }
    record
}

fn data_string(value: &Value) -> String {
    let Some(data) = value.as_data() else {
        return String::new();
    };
    match String::from_utf8(data.to_vec()) {
        Ok(text) => text,
        Err(err) => {
            warn!("[macos-fvde] UserNamesData entry is not valid UTF8, replacing invalid bytes: {err}");
            String::from_utf8_lossy(data).into_owned()
        }
    }
}
