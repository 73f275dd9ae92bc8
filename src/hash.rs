// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

use crate::error::{FvdeError, nom_format};
use crate::metadata::{CryptoUserRecord, EncryptedRoot};
use log::warn;
use nom::bytes::complete::take;
use nom::number::complete::le_u32;
use serde::Serialize;
use std::fmt;

/// `UserType` of a local (non iCloud) account
pub const LOCAL_USER_TYPE: u64 = 0x10060002;
const HASH_PREFIX: &str = "$fvde$1$";

/// Fields of the `PassphraseWrappedKEKStruct` needed to crack the passphrase
#[derive(Debug, Clone, PartialEq)]
pub struct PassphraseWrappedKek {
    /// Bytes 8-24
    pub salt: Vec<u8>,
    /// Bytes 32-56
    pub kek: Vec<u8>,
    /// PBKDF2 iterations, bytes 168-172
    pub iterations: u32,
}

impl PassphraseWrappedKek {
    pub fn parse(data: &[u8]) -> nom::IResult<&[u8], PassphraseWrappedKek> {
        const SALT_SIZE: u8 = 16;
        const KEK_SIZE: u8 = 24;

        let (input, _unknown) = take(8_usize)(data)?;
        let (input, salt) = take(SALT_SIZE)(input)?;
        let (input, _unknown_2) = take(8_usize)(input)?;
        let (input, kek) = take(KEK_SIZE)(input)?;
        let (input, _unknown_3) = take(112_usize)(input)?;
        let (input, iterations) = le_u32(input)?;

        Ok((
            input,
            PassphraseWrappedKek {
                salt: salt.to_vec(),
                kek: kek.to_vec(),
                iterations,
            },
        ))
    }
}

/// Build the `$fvde$1$<salt len>$<salt>$<iterations>$<kek>` hash from a `PassphraseWrappedKEKStruct`
pub fn build_hash(wrapped_kek_struct: &[u8]) -> Result<String, FvdeError> {
    let (_, wrapped_kek) = PassphraseWrappedKek::parse(wrapped_kek_struct)
        .map_err(|err| nom_format("PassphraseWrappedKEKStruct is too short", err))?;

    Ok(format!(
        "{HASH_PREFIX}{}${}${}${}",
        wrapped_kek.salt.len(),
        hex::encode(&wrapped_kek.salt),
        wrapped_kek.iterations,
        hex::encode(&wrapped_kek.kek)
    ))
}

/// Remove characters that would break the colon separated output line
pub fn sanitize_field(text: Option<&str>) -> String {
    text.unwrap_or_default()
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | ':'))
        .collect()
}

/// Local user records in document order
pub fn select_local_users(root: &EncryptedRoot) -> Vec<&CryptoUserRecord> {
    root.crypto_users
        .iter()
        .filter(|user| user.user_type == Some(LOCAL_USER_TYPE))
        .collect()
}

/// One output line: `username:hash:fullname:hint`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HashLine {
    pub user_name: String,
    pub hash: String,
    pub full_name: String,
    pub hint: String,
}

impl HashLine {
    pub fn from_user(user: &CryptoUserRecord) -> Result<HashLine, FvdeError> {
        let wrapped_kek_struct = user.wrapped_kek_struct.as_deref().ok_or_else(|| {
            FvdeError::Format(String::from(
                "Local user has no PassphraseWrappedKEKStruct",
            ))
        })?;

        Ok(HashLine {
            user_name: sanitize_field(Some(&user.user_name)),
            hash: build_hash(wrapped_kek_struct)?,
            full_name: sanitize_field(Some(&user.full_name)),
            hint: sanitize_field(user.passphrase_hint.as_deref()),
        })
    }

    /// Build the line for the first local user of the document.
    /// Other local users are not reported
    pub fn from_document(root: &EncryptedRoot) -> Result<Option<HashLine>, FvdeError> {
        let local_users = select_local_users(root);
        if local_users.len() > 1 {
            warn!(
                "[macos-fvde] Found {} local users, only the first is used",
                local_users.len()
            );
        }

        match local_users.first() {
            Some(user) => Ok(Some(HashLine::from_user(user)?)),
            None => Ok(None),
        }
    }
}

impl fmt::Display for HashLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.user_name, self.hash, self.full_name, self.hint
        )
    }
}
