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

//! ML-KEM-1024 (Kyber1024) key encapsulation.

use saorsa_pqc::api::ml_kem_1024;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

pub const KEM_PUBLIC_KEY_LEN: usize = 1568;
pub const KEM_CIPHERTEXT_LEN: usize = 1568;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KemPublicKey(pub Vec<u8>);

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KemSecretKey(pub Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KemCiphertext(pub Vec<u8>);

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemSharedSecret(pub Vec<u8>);

impl std::fmt::Debug for KemSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KemSecretKey").field(&"<redacted>").finish()
    }
}

impl std::fmt::Debug for KemSharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KemSharedSecret").field(&"<redacted>").finish()
    }
}

/// Generate a fresh ML-KEM-1024 keypair.
pub fn kem_keypair() -> Result<(KemPublicKey, KemSecretKey), CryptoError> {
    let kem = ml_kem_1024();
    let (pk, sk) = kem.generate_keypair().map_err(|_| CryptoError::KeyGen)?;
    Ok((KemPublicKey(pk.to_vec()), KemSecretKey(sk.to_vec())))
}

/// Derive an ML-KEM-1024 keypair deterministically from a 32-byte seed, so
/// the encryption keypair is recoverable from the same BIP-39 mnemonic that
/// recovers the signing keypair (§4.2, Host API `create_identity`).
pub fn kem_keypair_from_seed(seed32: &[u8; 32]) -> Result<(KemPublicKey, KemSecretKey), CryptoError> {
    let kem = ml_kem_1024();
    let (pk, sk) = kem
        .generate_keypair_from_seed(seed32)
        .map_err(|_| CryptoError::KeyGen)?;
    Ok((KemPublicKey(pk.to_vec()), KemSecretKey(sk.to_vec())))
}

/// Encapsulate a fresh shared secret to `pk`, returning `(ciphertext, shared_secret)`.
pub fn kem_encap(pk: &KemPublicKey) -> Result<(KemCiphertext, KemSharedSecret), CryptoError> {
    let kem = ml_kem_1024();
    let (shared_secret, ciphertext) =
        kem.encapsulate(&pk.0).map_err(|_| CryptoError::Encap)?;
    Ok((
        KemCiphertext(ciphertext.to_vec()),
        KemSharedSecret(shared_secret.to_vec()),
    ))
}

/// Decapsulate `ct` with `sk`, recovering the shared secret.
pub fn kem_decap(ct: &KemCiphertext, sk: &KemSecretKey) -> Result<KemSharedSecret, CryptoError> {
    let kem = ml_kem_1024();
    let shared_secret = kem
        .decapsulate(&sk.0, &ct.0)
        .map_err(|_| CryptoError::Decap)?;
    Ok(KemSharedSecret(shared_secret.to_vec()))
}
