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

//! `<data_dir>/keys/identity.dsa` and `identity.kem`: password-encrypted
//! keypair files in the `"QGPK"`-magic format of §6:
//!
//! ```text
//! "QGPK" magic | version_u8 | kdf_params(12) | salt16 | nonce12 | ciphertext | tag16
//! ```
//!
//! `kdf_params` is `m_cost_kib_u32_LE | t_cost_u32_LE | p_cost_u32_LE`, so
//! the Argon2id work factor can change across versions without breaking
//! old files. The plaintext payload inside the AEAD envelope is
//! `pk_len_u16_LE | pk | sk`.

use anyhow::{bail, Context, Result};
use argon2::Argon2;
use tokio::io::AsyncWriteExt;
use zeroize::Zeroize;

use crate::crypto::{aead_open, aead_seal, csprng_fill, AEAD_KEY_LEN, AEAD_NONCE_LEN};

const MAGIC: &[u8; 4] = b"QGPK";
const VERSION: u8 = 1;

/// Argon2id parameters (§ "Identity & keystore" of SPEC_FULL.md): 19 MiB
/// memory, 2 iterations, parallelism 1 — OWASP's minimum interactive
/// profile, chosen to stay usable on memory-constrained mobile hosts.
const KDF_M_COST_KIB: u32 = 19_456;
const KDF_T_COST: u32 = 2;
const KDF_P_COST: u32 = 1;

pub async fn write_keyfile(path: &std::path::Path, pk: &[u8], sk: &[u8], password: &str) -> Result<()> {
    let mut plaintext = Vec::with_capacity(2 + pk.len() + sk.len());
    plaintext.extend_from_slice(&(pk.len() as u16).to_le_bytes());
    plaintext.extend_from_slice(pk);
    plaintext.extend_from_slice(sk);

    let mut salt = [0u8; 16];
    csprng_fill(&mut salt);
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    csprng_fill(&mut nonce);

    let key = derive_key(password, &salt, KDF_M_COST_KIB, KDF_T_COST, KDF_P_COST)?;
    let (ciphertext, tag) = aead_seal(&key, &nonce, MAGIC, &plaintext).map_err(|_| anyhow::anyhow!("seal failed"))?;

    let mut out = Vec::with_capacity(4 + 1 + 12 + 16 + 12 + ciphertext.len() + 16);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&KDF_M_COST_KIB.to_le_bytes());
    out.extend_from_slice(&KDF_T_COST.to_le_bytes());
    out.extend_from_slice(&KDF_P_COST.to_le_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.context("creating keys dir")?;
    }
    let mut file = tokio::fs::File::create(path).await.context("creating key file")?;
    file.write_all(&out).await.context("writing key file")?;
    file.flush().await.ok();

    plaintext.zeroize();
    Ok(())
}

pub async fn read_keyfile(path: &std::path::Path, password: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading key file {}", path.display()))?;

    if bytes.len() < 4 + 1 + 12 + 16 + 12 + 16 {
        bail!("key file truncated");
    }
    let mut cursor = 0usize;
    if &bytes[cursor..cursor + 4] != MAGIC {
        bail!("bad key file magic");
    }
    cursor += 4;
    let version = bytes[cursor];
    cursor += 1;
    if version != VERSION {
        bail!("unsupported key file version {version}");
    }
    let m_cost = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
    cursor += 4;
    let t_cost = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
    cursor += 4;
    let p_cost = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
    cursor += 4;
    let salt: [u8; 16] = bytes[cursor..cursor + 16].try_into().unwrap();
    cursor += 16;
    let nonce: [u8; AEAD_NONCE_LEN] = bytes[cursor..cursor + AEAD_NONCE_LEN].try_into().unwrap();
    cursor += AEAD_NONCE_LEN;
    let tag_start = bytes.len() - 16;
    let ciphertext = &bytes[cursor..tag_start];
    let tag: [u8; 16] = bytes[tag_start..].try_into().unwrap();

    let key = derive_key(password, &salt, m_cost, t_cost, p_cost)?;
    let plaintext = aead_open(&key, &nonce, MAGIC, ciphertext, &tag)
        .map_err(|_| anyhow::anyhow!("wrong password or corrupted key file"))?;

    if plaintext.len() < 2 {
        bail!("key file payload truncated");
    }
    let pk_len = u16::from_le_bytes(plaintext[0..2].try_into().unwrap()) as usize;
    if plaintext.len() < 2 + pk_len {
        bail!("key file payload truncated");
    }
    let pk = plaintext[2..2 + pk_len].to_vec();
    let sk = plaintext[2 + pk_len..].to_vec();
    Ok((pk, sk))
}

fn derive_key(
    password: &str,
    salt: &[u8; 16],
    m_cost_kib: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<[u8; AEAD_KEY_LEN]> {
    let params = argon2::Params::new(m_cost_kib, t_cost, p_cost, Some(AEAD_KEY_LEN))
        .map_err(|e| anyhow::anyhow!("bad argon2 params: {e}"))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = [0u8; AEAD_KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("argon2 derivation failed: {e}"))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_with_correct_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dsa");
        write_keyfile(&path, b"pubkey-bytes", b"secret-key-bytes", "hunter2")
            .await
            .unwrap();
        let (pk, sk) = read_keyfile(&path, "hunter2").await.unwrap();
        assert_eq!(pk, b"pubkey-bytes");
        assert_eq!(sk, b"secret-key-bytes");
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dsa");
        write_keyfile(&path, b"pk", b"sk", "correct-password")
            .await
            .unwrap();
        assert!(read_keyfile(&path, "wrong-password").await.is_err());
    }

    #[tokio::test]
    async fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.dsa");
        tokio::fs::write(&path, b"not a key file").await.unwrap();
        assert!(read_keyfile(&path, "any").await.is_err());
    }
}
