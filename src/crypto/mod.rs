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

//! Crypto façade: thin, side-effect-free contracts over the post-quantum
//! primitives (ML-KEM-1024, ML-DSA-87, SHA3-512, AES-256-GCM, HKDF-SHA3-512,
//! CSPRNG). No module outside `crypto` touches a primitive directly.

mod aead;
mod dsa;
mod hash;
mod kdf;
mod kem;

pub use aead::{aead_open, aead_seal, AeadTag, AEAD_KEY_LEN, AEAD_NONCE_LEN, AEAD_TAG_LEN};
pub use dsa::{
    dsa_keypair_from_seed, dsa_sign, dsa_verify, DsaPublicKey, DsaSecretKey, DsaSignature,
    DSA_PUBLIC_KEY_LEN, DSA_SIGNATURE_LEN,
};
pub use hash::sha3_512;
pub use kdf::hkdf_sha3_512;
pub use kem::{
    kem_decap, kem_encap, kem_keypair, kem_keypair_from_seed, KemCiphertext, KemPublicKey,
    KemSecretKey, KemSharedSecret, KEM_CIPHERTEXT_LEN, KEM_PUBLIC_KEY_LEN,
};

use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGen,
    #[error("encapsulation failed")]
    Encap,
    #[error("decapsulation failed")]
    Decap,
    #[error("signing failed")]
    Sign,
    #[error("signature verification failed")]
    Verify,
    #[error("aead seal failed")]
    Seal,
    #[error("aead open failed")]
    Open,
    #[error("key derivation failed")]
    Kdf,
}

/// Fill `buf` with CSPRNG output. Every nonce in this crate is drawn from
/// here — never derived deterministically from message content, so a
/// repeated (key, nonce) pair cannot occur outside of adversarial RNG
/// failure.
pub fn csprng_fill(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}
