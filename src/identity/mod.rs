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

//! Identity & keystore (§4.2): keypair generation from two independent
//! 32-byte seeds, fingerprint derivation, encrypted-at-rest key files, and
//! the process-wide identity lock.

mod fingerprint;
mod keystore;
mod lock;

pub use fingerprint::Fingerprint;
pub use lock::IdentityLock;

use std::path::Path;

use bip39::Mnemonic;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    dsa_keypair_from_seed, dsa_sign, dsa_verify, hkdf_sha3_512, kem_keypair_from_seed,
    DsaPublicKey, DsaSecretKey, DsaSignature, KemPublicKey, KemSecretKey,
};
use crate::error::{AppError, AppResult};

/// The full keypair set for one identity, held only in memory (and
/// encrypted at rest — never logged, never sent over the wire).
pub struct IdentityKeys {
    pub fingerprint: Fingerprint,
    pub dsa_pk: DsaPublicKey,
    pub dsa_sk: DsaSecretKey,
    pub kem_pk: KemPublicKey,
    pub kem_sk: KemSecretKey,
}

/// The keyserver value of §3: `{ fingerprint, display_name?, kem_public_key,
/// dsa_public_key, signature_over_prev_fields_by_dsa_sk, created_at }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub fingerprint: Fingerprint,
    pub display_name: Option<String>,
    pub kem_public_key: KemPublicKey,
    pub dsa_public_key: DsaPublicKey,
    pub signature: DsaSignature,
    pub created_at: u64,
}

impl IdentityRecord {
    fn signed_fields(
        fingerprint: &Fingerprint,
        display_name: &Option<String>,
        kem_pk: &KemPublicKey,
        dsa_pk: &DsaPublicKey,
        created_at: u64,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(fingerprint.as_str().as_bytes());
        if let Some(name) = display_name {
            buf.extend_from_slice(name.as_bytes());
        }
        buf.extend_from_slice(&kem_pk.0);
        buf.extend_from_slice(&dsa_pk.0);
        buf.extend_from_slice(&created_at.to_le_bytes());
        buf
    }

    pub fn new(
        keys: &IdentityKeys,
        display_name: Option<String>,
        created_at: u64,
    ) -> AppResult<Self> {
        let msg = Self::signed_fields(
            &keys.fingerprint,
            &display_name,
            &keys.kem_pk,
            &keys.dsa_pk,
            created_at,
        );
        let signature = dsa_sign(&msg, &keys.dsa_sk)?;
        Ok(Self {
            fingerprint: keys.fingerprint.clone(),
            display_name,
            kem_public_key: keys.kem_pk.clone(),
            dsa_public_key: keys.dsa_pk.clone(),
            signature,
            created_at,
        })
    }

    /// Invariant 2 of §8: `sha3_512(dsa_public_key) == fingerprint` and the
    /// signature verifies under `dsa_public_key`.
    pub fn verify(&self) -> AppResult<()> {
        let expected = Fingerprint::of(&self.dsa_public_key);
        if expected != self.fingerprint {
            return Err(AppError::BadInput("fingerprint does not match dsa_public_key".into()));
        }
        let msg = Self::signed_fields(
            &self.fingerprint,
            &self.display_name,
            &self.kem_public_key,
            &self.dsa_public_key,
            self.created_at,
        );
        if !dsa_verify(&msg, &self.signature, &self.dsa_public_key) {
            return Err(AppError::CryptoFailure);
        }
        Ok(())
    }
}

/// Derive two independent 32-byte seeds (signing, encryption) from a
/// BIP-39 mnemonic and optional passphrase. This is the only deterministic
/// surface in the whole identity layer.
pub fn seeds_from_mnemonic(mnemonic: &Mnemonic, passphrase: &str) -> AppResult<([u8; 32], [u8; 32])> {
    let seed64 = mnemonic.to_seed(passphrase);
    let signing = hkdf_sha3_512(&seed64, b"dna/seed", b"dna/seed/dsa/v1", 32)?;
    let encryption = hkdf_sha3_512(&seed64, b"dna/seed", b"dna/seed/kem/v1", 32)?;
    let mut signing32 = [0u8; 32];
    let mut encryption32 = [0u8; 32];
    signing32.copy_from_slice(&signing);
    encryption32.copy_from_slice(&encryption);
    Ok((signing32, encryption32))
}

pub fn keys_from_seeds(signing_seed: &[u8; 32], encryption_seed: &[u8; 32]) -> AppResult<IdentityKeys> {
    let (dsa_pk, dsa_sk) = dsa_keypair_from_seed(signing_seed)?;
    let (kem_pk, kem_sk) = kem_keypair_from_seed(encryption_seed)?;
    let fingerprint = Fingerprint::of(&dsa_pk);
    Ok(IdentityKeys {
        fingerprint,
        dsa_pk,
        dsa_sk,
        kem_pk,
        kem_sk,
    })
}

/// Create a brand-new identity from two independent seeds (§6 Host API:
/// `create_identity(signing_seed32, encryption_seed32, password?)`): derive
/// keys, write both encrypted key files, and return the fingerprint.
/// `password` is required — key files are always encrypted at rest (§4.2).
pub async fn create_identity(
    data_dir: &Path,
    signing_seed: &[u8; 32],
    encryption_seed: &[u8; 32],
    password: &str,
) -> AppResult<IdentityKeys> {
    let keys = keys_from_seeds(signing_seed, encryption_seed)?;
    let keys_dir = data_dir.join("keys");
    keystore::write_keyfile(&keys_dir.join("identity.dsa"), &keys.dsa_pk.0, &keys.dsa_sk.0, password)
        .await
        .map_err(|e| AppError::Internal(format!("writing identity.dsa: {e}")))?;
    keystore::write_keyfile(&keys_dir.join("identity.kem"), &keys.kem_pk.0, &keys.kem_sk.0, password)
        .await
        .map_err(|e| AppError::Internal(format!("writing identity.kem: {e}")))?;
    Ok(keys)
}

/// Load an existing identity's keys from disk, decrypting with `password`.
/// Does **not** acquire the identity lock — callers do that separately so
/// the lock's lifetime matches the engine's, not one load call.
pub async fn load_identity(data_dir: &Path, password: &str) -> AppResult<IdentityKeys> {
    let keys_dir = data_dir.join("keys");
    let (dsa_pk, dsa_sk) = keystore::read_keyfile(&keys_dir.join("identity.dsa"), password)
        .await
        .map_err(|_| AppError::BadInput("wrong password or missing identity".into()))?;
    let (kem_pk, kem_sk) = keystore::read_keyfile(&keys_dir.join("identity.kem"), password)
        .await
        .map_err(|_| AppError::BadInput("wrong password or missing identity".into()))?;
    let dsa_pk = DsaPublicKey(dsa_pk);
    let fingerprint = Fingerprint::of(&dsa_pk);
    Ok(IdentityKeys {
        fingerprint,
        dsa_pk,
        dsa_sk: DsaSecretKey(dsa_sk),
        kem_pk: KemPublicKey(kem_pk),
        kem_sk: KemSecretKey(kem_sk),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kem_keypair;

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let signing_seed = [42u8; 32];
        let encryption_seed = [43u8; 32];
        let created = create_identity(dir.path(), &signing_seed, &encryption_seed, "pw")
            .await
            .unwrap();
        let loaded = load_identity(dir.path(), "pw").await.unwrap();
        assert_eq!(created.fingerprint, loaded.fingerprint);
        assert_eq!(created.dsa_pk, loaded.dsa_pk);
    }

    #[tokio::test]
    async fn same_seed_yields_same_fingerprint() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let signing_seed = [9u8; 32];
        let encryption_seed = [10u8; 32];
        let a = create_identity(dir1.path(), &signing_seed, &encryption_seed, "pw")
            .await
            .unwrap();
        let b = create_identity(dir2.path(), &signing_seed, &encryption_seed, "pw")
            .await
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn identity_record_round_trips() {
        let (dsa_pk, dsa_sk) = dsa_keypair_from_seed(&[1u8; 32]).unwrap();
        let (kem_pk, _) = kem_keypair().unwrap();
        let keys = IdentityKeys {
            fingerprint: Fingerprint::of(&dsa_pk),
            dsa_pk,
            dsa_sk,
            kem_pk,
            kem_sk: kem_keypair().unwrap().1,
        };
        let record = IdentityRecord::new(&keys, Some("alice".into()), 1_700_000_000).unwrap();
        record.verify().unwrap();
    }

    #[test]
    fn tampered_identity_record_fails_verification() {
        let (dsa_pk, dsa_sk) = dsa_keypair_from_seed(&[2u8; 32]).unwrap();
        let (kem_pk, kem_sk) = kem_keypair().unwrap();
        let keys = IdentityKeys {
            fingerprint: Fingerprint::of(&dsa_pk),
            dsa_pk,
            dsa_sk,
            kem_pk,
            kem_sk,
        };
        let mut record = IdentityRecord::new(&keys, None, 1_700_000_000).unwrap();
        record.display_name = Some("mallory".into());
        assert!(record.verify().is_err());
    }

    #[test]
    fn seeds_from_mnemonic_are_independent() {
        let mnemonic = Mnemonic::generate(24).unwrap();
        let (signing, encryption) = seeds_from_mnemonic(&mnemonic, "").unwrap();
        assert_ne!(signing, encryption);
    }
}
