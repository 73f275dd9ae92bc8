// Copyright 2022 Mandiant, Inc. All Rights Reserved
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except in compliance with the License. You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and limitations under the License.

//! AES-XTS handling for `EncryptedRoot.plist.wipekey`.
//!
//! The file is encrypted as a single XTS data unit. The 32 byte XTS key is the 16 byte volume key
//! followed by 16 zero bytes, so the volume key is the data key and the tweak key is all zeroes.
//! The tweak itself is always zero. This only applies to this one file, CoreStorage volume data
//! uses a different scheme.

use crate::error::FvdeError;
use aes::Aes128;
use aes::cipher::KeyInit;
use xts_mode::Xts128;

pub const AES_BLOCK_SIZE: usize = 16;
/// Tweak used for the encrypted metadata file
pub const ZERO_TWEAK: [u8; 16] = [0; 16];

fn metadata_cipher(key: &[u8; 16]) -> Result<Xts128<Aes128>, FvdeError> {
    let data_cipher = Aes128::new_from_slice(key)
        .map_err(|err| FvdeError::Format(format!("Invalid AES key: {err}")))?;
    let tweak_cipher = Aes128::new_from_slice(&[0; 16])
        .map_err(|err| FvdeError::Format(format!("Invalid AES tweak key: {err}")))?;
    Ok(Xts128::new(data_cipher, tweak_cipher))
}

fn check_length(data: &[u8]) -> Result<(), FvdeError> {
    if data.len() < AES_BLOCK_SIZE {
        return Err(FvdeError::Format(format!(
            "XTS data must be at least {AES_BLOCK_SIZE} bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// Decrypt `ciphertext` with the volume key. Output has the same length as the input
pub fn decrypt(key: &[u8; 16], tweak: [u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, FvdeError> {
    check_length(ciphertext)?;
    let cipher = metadata_cipher(key)?;

    let mut plaintext = ciphertext.to_vec();
    cipher.decrypt_sector(&mut plaintext, tweak);
    Ok(plaintext)
}

/// Inverse of [`decrypt`] under the same key convention
pub fn encrypt(key: &[u8; 16], tweak: [u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, FvdeError> {
    check_length(plaintext)?;
    let cipher = metadata_cipher(key)?;

    let mut ciphertext = plaintext.to_vec();
    cipher.encrypt_sector(&mut ciphertext, tweak);
    Ok(ciphertext)
}
