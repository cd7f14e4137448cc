// Copyright (c) 2025 Saorsa Labs Limited
//
// This file is part of the Saorsa P2P network.
//
// Licensed under the AGPL-3.0 license:
// <https://www.gnu.org/licenses/agpl-3.0.html>
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! AES-256-GCM AEAD. Nonces are always drawn from `crypto::csprng_fill` by
//! the caller — this module never generates its own nonce, so a repeated
//! (key, nonce) pair can only happen if the caller misuses the API.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::CryptoError;

pub const AEAD_KEY_LEN: usize = 32;
pub const AEAD_NONCE_LEN: usize = 12;
pub const AEAD_TAG_LEN: usize = 16;

pub type AeadTag = [u8; AEAD_TAG_LEN];

/// Seal `plain` under `key`/`nonce`, returning `(ciphertext, tag)` with the
/// tag split out so callers can lay it out per the envelope's canonical
/// field order (§3).
pub fn aead_seal(
    key32: &[u8; AEAD_KEY_LEN],
    nonce12: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    plain: &[u8],
) -> Result<(Vec<u8>, AeadTag), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key32));
    let nonce = Nonce::from_slice(nonce12);
    let mut sealed = cipher
        .encrypt(nonce, Payload { msg: plain, aad })
        .map_err(|_| CryptoError::Seal)?;
    if sealed.len() < AEAD_TAG_LEN {
        return Err(CryptoError::Seal);
    }
    let tag_start = sealed.len() - AEAD_TAG_LEN;
    let mut tag = [0u8; AEAD_TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok((sealed, tag))
}

/// Open a (ciphertext, tag) pair produced by `aead_seal`.
pub fn aead_open(
    key32: &[u8; AEAD_KEY_LEN],
    nonce12: &[u8; AEAD_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &AeadTag,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key32));
    let nonce = Nonce::from_slice(nonce12);
    let mut combined = Vec::with_capacity(ciphertext.len() + AEAD_TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::Open)
}
