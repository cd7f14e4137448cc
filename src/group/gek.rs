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

//! GEK/IKP engine (§4.8): rotate a fresh group encryption key to every
//! current member via per-member KEM-wrapped entries, and unwrap it again on
//! join. Only the group creator ever rotates — `rotate` takes the creator's
//! own `IdentityKeys` and signs the packet with it.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    aead_open, aead_seal, csprng_fill, dsa_sign, dsa_verify, hkdf_sha3_512, kem_decap, kem_encap,
    DsaPublicKey, DsaSignature, KemPublicKey,
};
use crate::dht::{truncated_key, DhtKey};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityKeys};

const GEK_WRAP_INFO: &[u8] = b"dna/gek/wrap/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IkpEntry {
    pub member_fingerprint: Fingerprint,
    pub kem_ciphertext: Vec<u8>,
    pub wrap_nonce: [u8; 12],
    pub wrapped_gek: Vec<u8>,
    pub wrap_tag: [u8; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialKeyPacket {
    pub group_uuid: String,
    pub gek_version: u32,
    pub entries: Vec<IkpEntry>,
    pub signature: Vec<u8>,
}

impl InitialKeyPacket {
    fn signed_fields(group_uuid: &str, gek_version: u32, entries: &[IkpEntry]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(group_uuid.as_bytes());
        buf.extend_from_slice(&gek_version.to_le_bytes());
        for entry in entries {
            buf.extend_from_slice(entry.member_fingerprint.as_str().as_bytes());
            buf.extend_from_slice(&entry.kem_ciphertext);
            buf.extend_from_slice(&entry.wrap_nonce);
            buf.extend_from_slice(&entry.wrapped_gek);
            buf.extend_from_slice(&entry.wrap_tag);
        }
        buf
    }
}

pub fn ikp_key(group_uuid: &str, gek_version: u32) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(b"gek:");
    input.extend_from_slice(group_uuid.as_bytes());
    input.push(b':');
    input.extend_from_slice(gek_version.to_string().as_bytes());
    truncated_key(&input)
}

fn wrap_key_for(shared_secret: &[u8], group_uuid: &str) -> AppResult<[u8; 32]> {
    let derived = hkdf_sha3_512(shared_secret, group_uuid.as_bytes(), GEK_WRAP_INFO, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived);
    Ok(key)
}

/// Generate a fresh GEK, wrap it to every member in `member_kem_pks`, and
/// sign the resulting IKP with `creator`'s DSA key. Returns the raw GEK and
/// the encoded IKP bytes ready to `put` at [`ikp_key`].
pub fn rotate(
    group_uuid: &str,
    gek_version: u32,
    creator: &IdentityKeys,
    member_kem_pks: &[(Fingerprint, KemPublicKey)],
) -> AppResult<([u8; 32], Vec<u8>)> {
    let mut gek = [0u8; 32];
    csprng_fill(&mut gek);

    let mut entries = Vec::with_capacity(member_kem_pks.len());
    for (member_fingerprint, kem_pk) in member_kem_pks {
        let (ciphertext, shared_secret) = kem_encap(kem_pk)?;
        let wrap_key = wrap_key_for(&shared_secret.0, group_uuid)?;
        let mut nonce = [0u8; 12];
        csprng_fill(&mut nonce);
        let (wrapped_gek, wrap_tag) = aead_seal(&wrap_key, &nonce, &[], &gek)?;
        entries.push(IkpEntry {
            member_fingerprint: member_fingerprint.clone(),
            kem_ciphertext: ciphertext.0,
            wrap_nonce: nonce,
            wrapped_gek,
            wrap_tag,
        });
    }

    let signed = InitialKeyPacket::signed_fields(group_uuid, gek_version, &entries);
    let signature = dsa_sign(&signed, &creator.dsa_sk)?;
    let ikp = InitialKeyPacket {
        group_uuid: group_uuid.to_string(),
        gek_version,
        entries,
        signature: signature.0,
    };
    let bytes = bincode::serialize(&ikp)
        .map_err(|e| AppError::Internal(format!("encoding IKP: {e}")))?;
    Ok((gek, bytes))
}

/// §4.8 "On join": decode the IKP, verify it was signed by the creator,
/// locate `me`'s own entry, and unwrap the GEK.
pub fn unwrap_for_member(
    ikp_bytes: &[u8],
    creator_dsa_pk: &DsaPublicKey,
    me: &IdentityKeys,
) -> AppResult<[u8; 32]> {
    let ikp: InitialKeyPacket = bincode::deserialize(ikp_bytes)
        .map_err(|e| AppError::Internal(format!("decoding IKP: {e}")))?;
    let signed = InitialKeyPacket::signed_fields(&ikp.group_uuid, ikp.gek_version, &ikp.entries);
    if !dsa_verify(&signed, &DsaSignature(ikp.signature.clone()), creator_dsa_pk) {
        return Err(AppError::CryptoFailure);
    }
    let entry = ikp
        .entries
        .iter()
        .find(|e| e.member_fingerprint == me.fingerprint)
        .ok_or_else(|| AppError::NotFound("no IKP entry for this member".into()))?;

    let shared_secret = kem_decap(&crate::crypto::KemCiphertext(entry.kem_ciphertext.clone()), &me.kem_sk)?;
    let wrap_key = wrap_key_for(&shared_secret.0, &ikp.group_uuid)?;
    let gek_vec = aead_open(&wrap_key, &entry.wrap_nonce, &[], &entry.wrapped_gek, &entry.wrap_tag)?;
    let mut gek = [0u8; 32];
    if gek_vec.len() != 32 {
        return Err(AppError::Internal("unwrapped GEK is not 32 bytes".into()));
    }
    gek.copy_from_slice(&gek_vec);
    Ok(gek)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsa_keypair_from_seed, kem_keypair};

    fn sample_keys(seed: u8) -> IdentityKeys {
        let (dsa_pk, dsa_sk) = dsa_keypair_from_seed(&[seed; 32]).unwrap();
        let (kem_pk, kem_sk) = kem_keypair().unwrap();
        IdentityKeys {
            fingerprint: Fingerprint::of(&dsa_pk),
            dsa_pk,
            dsa_sk,
            kem_pk,
            kem_sk,
        }
    }

    #[test]
    fn rotate_then_unwrap_round_trips_for_each_member() {
        let creator = sample_keys(1);
        let bob = sample_keys(2);
        let carol = sample_keys(3);
        let members = vec![
            (creator.fingerprint.clone(), creator.kem_pk.clone()),
            (bob.fingerprint.clone(), bob.kem_pk.clone()),
            (carol.fingerprint.clone(), carol.kem_pk.clone()),
        ];
        let (gek, ikp_bytes) = rotate("group-1", 0, &creator, &members).unwrap();

        let bob_gek = unwrap_for_member(&ikp_bytes, &creator.dsa_pk, &bob).unwrap();
        assert_eq!(bob_gek, gek);
        let carol_gek = unwrap_for_member(&ikp_bytes, &creator.dsa_pk, &carol).unwrap();
        assert_eq!(carol_gek, gek);
    }

    #[test]
    fn unwrap_fails_for_non_member() {
        let creator = sample_keys(4);
        let bob = sample_keys(5);
        let outsider = sample_keys(6);
        let members = vec![
            (creator.fingerprint.clone(), creator.kem_pk.clone()),
            (bob.fingerprint.clone(), bob.kem_pk.clone()),
        ];
        let (_gek, ikp_bytes) = rotate("group-2", 0, &creator, &members).unwrap();
        assert!(unwrap_for_member(&ikp_bytes, &creator.dsa_pk, &outsider).is_err());
    }

    #[test]
    fn unwrap_rejects_wrong_signer() {
        let creator = sample_keys(7);
        let impostor = sample_keys(8);
        let bob = sample_keys(9);
        let members = vec![
            (creator.fingerprint.clone(), creator.kem_pk.clone()),
            (bob.fingerprint.clone(), bob.kem_pk.clone()),
        ];
        let (_gek, ikp_bytes) = rotate("group-3", 0, &creator, &members).unwrap();
        assert!(unwrap_for_member(&ikp_bytes, &impostor.dsa_pk, &bob).is_err());
    }
}
