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

//! ML-DSA-87 (Dilithium5) signatures. Key generation is the one
//! deterministic surface in the whole crypto façade: `dsa_keypair_from_seed`
//! derives a keypair from a 32-byte seed so identity recovery from a BIP-39
//! mnemonic is possible.

use saorsa_pqc::api::ml_dsa_87;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

pub const DSA_PUBLIC_KEY_LEN: usize = 2592;
pub const DSA_SIGNATURE_LEN: usize = 4627;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DsaPublicKey(pub Vec<u8>);

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct DsaSecretKey(pub Vec<u8>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsaSignature(pub Vec<u8>);

impl std::fmt::Debug for DsaSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DsaSecretKey").field(&"<redacted>").finish()
    }
}

/// Derive an ML-DSA-87 keypair deterministically from a 32-byte seed.
///
/// The seed is expected to come from a BIP-39 mnemonic (§4.2); the KEM
/// keypair is generated separately from an independent seed so that
/// compromise of one does not imply the other.
pub fn dsa_keypair_from_seed(seed32: &[u8; 32]) -> Result<(DsaPublicKey, DsaSecretKey), CryptoError> {
    let dsa = ml_dsa_87();
    let (pk, sk) = dsa
        .generate_keypair_from_seed(seed32)
        .map_err(|_| CryptoError::KeyGen)?;
    Ok((DsaPublicKey(pk.to_vec()), DsaSecretKey(sk.to_vec())))
}

pub fn dsa_sign(msg: &[u8], sk: &DsaSecretKey) -> Result<DsaSignature, CryptoError> {
    let dsa = ml_dsa_87();
    let sig = dsa.sign(&sk.0, msg).map_err(|_| CryptoError::Sign)?;
    Ok(DsaSignature(sig.to_vec()))
}

pub fn dsa_verify(msg: &[u8], sig: &DsaSignature, pk: &DsaPublicKey) -> bool {
    let dsa = ml_dsa_87();
    matches!(dsa.verify(&pk.0, msg, &sig.0), Ok(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trips() {
        let (pk, sk) = dsa_keypair_from_seed(&[7u8; 32]).unwrap();
        let sig = dsa_sign(b"hello", &sk).unwrap();
        assert!(dsa_verify(b"hello", &sig, &pk));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (pk, sk) = dsa_keypair_from_seed(&[7u8; 32]).unwrap();
        let sig = dsa_sign(b"hello", &sk).unwrap();
        assert!(!dsa_verify(b"goodbye", &sig, &pk));
    }

    #[test]
    fn same_seed_yields_same_keypair() {
        let (pk1, _) = dsa_keypair_from_seed(&[3u8; 32]).unwrap();
        let (pk2, _) = dsa_keypair_from_seed(&[3u8; 32]).unwrap();
        assert_eq!(pk1, pk2);
    }
}
