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

//! Envelope codec (§3, §4.3): canonical serialize/parse of the encrypted
//! packet exchanged between two users, and the KEM+AEAD+DSA operations that
//! produce and consume it.
//!
//! Canonical field order, all fixed-width except the AEAD ciphertext:
//! `version_byte(1), sender_fingerprint(64), recipient_fingerprint(64),
//! sender_timestamp_u64_LE(8), kem_ciphertext(1568), aead_nonce(12),
//! aead_tag(16), aead_ciphertext(var), sender_dsa_pubkey(2592),
//! signature(4627)`. The signature covers every byte that precedes it.

use crate::crypto::{
    aead_open, aead_seal, csprng_fill, dsa_sign, dsa_verify, hkdf_sha3_512, kem_decap, kem_encap,
    DsaPublicKey, DsaSecretKey, DsaSignature, KemCiphertext, KemPublicKey, KemSecretKey,
    AEAD_NONCE_LEN, AEAD_TAG_LEN, DSA_PUBLIC_KEY_LEN, DSA_SIGNATURE_LEN, KEM_CIPHERTEXT_LEN,
};
use crate::identity::Fingerprint;

pub const ENVELOPE_VERSION: u8 = 1;

/// Fixed-width prefix before the variable-length AEAD ciphertext.
const HEADER_LEN: usize = 1 + 64 + 64 + 8 + KEM_CIPHERTEXT_LEN + AEAD_NONCE_LEN + AEAD_TAG_LEN;
/// Fixed-width suffix after the variable-length AEAD ciphertext.
const TRAILER_LEN: usize = DSA_PUBLIC_KEY_LEN + DSA_SIGNATURE_LEN;

const ENVELOPE_AEAD_INFO: &[u8] = b"dna/envelope/v1";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("bad signature")]
    BadSignature,
    #[error("fingerprint does not match sender public key")]
    BadFingerprint,
    #[error("decryption failed")]
    DecryptFailed,
}

/// A decoded-but-not-yet-verified envelope: the canonical fields, split out
/// for inspection. `encode`/`decode` round-trip to the exact wire bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub version: u8,
    pub sender_fingerprint: Fingerprint,
    pub recipient_fingerprint: Fingerprint,
    pub sender_timestamp: u64,
    pub kem_ciphertext: KemCiphertext,
    pub aead_nonce: [u8; AEAD_NONCE_LEN],
    pub aead_tag: [u8; AEAD_TAG_LEN],
    pub aead_ciphertext: Vec<u8>,
    pub sender_dsa_pubkey: DsaPublicKey,
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Bytes covered by the trailing signature: every field up to and
    /// including `sender_dsa_pubkey`.
    fn signed_prefix(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.aead_ciphertext.len() + DSA_PUBLIC_KEY_LEN);
        buf.push(self.version);
        buf.extend_from_slice(&self.sender_fingerprint.to_bytes());
        buf.extend_from_slice(&self.recipient_fingerprint.to_bytes());
        buf.extend_from_slice(&self.sender_timestamp.to_le_bytes());
        buf.extend_from_slice(&self.kem_ciphertext.0);
        buf.extend_from_slice(&self.aead_nonce);
        buf.extend_from_slice(&self.aead_tag);
        buf.extend_from_slice(&self.aead_ciphertext);
        buf.extend_from_slice(&self.sender_dsa_pubkey.0);
        buf
    }

    /// Canonical wire encoding (§3).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.signed_prefix();
        buf.extend_from_slice(&self.signature);
        buf
    }

    /// Parse the canonical wire encoding without verifying signature or
    /// fingerprint binding — structural validation only.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(EnvelopeError::MalformedEnvelope);
        }
        let mut cursor = 0usize;
        let version = bytes[cursor];
        cursor += 1;

        let sender_fingerprint_bytes: [u8; 64] = bytes[cursor..cursor + 64]
            .try_into()
            .map_err(|_| EnvelopeError::MalformedEnvelope)?;
        let sender_fingerprint = Fingerprint::from_bytes(&sender_fingerprint_bytes);
        cursor += 64;

        let recipient_fingerprint_bytes: [u8; 64] = bytes[cursor..cursor + 64]
            .try_into()
            .map_err(|_| EnvelopeError::MalformedEnvelope)?;
        let recipient_fingerprint = Fingerprint::from_bytes(&recipient_fingerprint_bytes);
        cursor += 64;

        let sender_timestamp = u64::from_le_bytes(
            bytes[cursor..cursor + 8]
                .try_into()
                .map_err(|_| EnvelopeError::MalformedEnvelope)?,
        );
        cursor += 8;

        let kem_ciphertext = KemCiphertext(bytes[cursor..cursor + KEM_CIPHERTEXT_LEN].to_vec());
        cursor += KEM_CIPHERTEXT_LEN;

        let aead_nonce: [u8; AEAD_NONCE_LEN] = bytes[cursor..cursor + AEAD_NONCE_LEN]
            .try_into()
            .map_err(|_| EnvelopeError::MalformedEnvelope)?;
        cursor += AEAD_NONCE_LEN;

        let aead_tag: [u8; AEAD_TAG_LEN] = bytes[cursor..cursor + AEAD_TAG_LEN]
            .try_into()
            .map_err(|_| EnvelopeError::MalformedEnvelope)?;
        cursor += AEAD_TAG_LEN;

        let remaining = bytes.len() - cursor;
        if remaining < TRAILER_LEN {
            return Err(EnvelopeError::MalformedEnvelope);
        }
        let ciphertext_len = remaining - TRAILER_LEN;
        let aead_ciphertext = bytes[cursor..cursor + ciphertext_len].to_vec();
        cursor += ciphertext_len;

        let sender_dsa_pubkey =
            DsaPublicKey(bytes[cursor..cursor + DSA_PUBLIC_KEY_LEN].to_vec());
        cursor += DSA_PUBLIC_KEY_LEN;

        let signature = bytes[cursor..cursor + DSA_SIGNATURE_LEN].to_vec();

        Ok(Self {
            version,
            sender_fingerprint,
            recipient_fingerprint,
            sender_timestamp,
            kem_ciphertext,
            aead_nonce,
            aead_tag,
            aead_ciphertext,
            sender_dsa_pubkey,
            signature,
        })
    }
}

/// Plaintext message exceeding this size is rejected with `BadInput` by
/// callers (§8 boundary behaviors) before ever reaching this module.
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

/// Encrypt `plaintext` to `recipient_kem_pk`, signing with `sender_dsa_sk`,
/// and return the canonical wire bytes (§4.3).
pub fn encrypt_to(
    recipient_kem_pk: &KemPublicKey,
    sender_dsa_sk: &DsaSecretKey,
    sender_fingerprint: &Fingerprint,
    recipient_fingerprint: &Fingerprint,
    sender_dsa_pubkey: &DsaPublicKey,
    plaintext: &[u8],
    timestamp: u64,
) -> Result<Vec<u8>, EnvelopeError> {
    let (kem_ciphertext, shared_secret) =
        kem_encap(recipient_kem_pk).map_err(|_| EnvelopeError::DecryptFailed)?;
    let aead_key_vec = hkdf_sha3_512(&shared_secret.0, &[], ENVELOPE_AEAD_INFO, 32)
        .map_err(|_| EnvelopeError::DecryptFailed)?;
    let mut aead_key = [0u8; 32];
    aead_key.copy_from_slice(&aead_key_vec);

    let mut nonce = [0u8; AEAD_NONCE_LEN];
    csprng_fill(&mut nonce);

    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        sender_fingerprint: sender_fingerprint.clone(),
        recipient_fingerprint: recipient_fingerprint.clone(),
        sender_timestamp: timestamp,
        kem_ciphertext,
        aead_nonce: nonce,
        aead_tag: [0u8; AEAD_TAG_LEN],
        aead_ciphertext: Vec::new(),
        sender_dsa_pubkey: sender_dsa_pubkey.clone(),
        signature: Vec::new(),
    };

    // AAD binds the AEAD ciphertext to the fixed header fields so a swapped
    // header can't be paired with someone else's ciphertext.
    let aad = header_aad(&envelope);
    let (ciphertext, tag) =
        aead_seal(&aead_key, &nonce, &aad, plaintext).map_err(|_| EnvelopeError::DecryptFailed)?;

    let mut envelope = envelope;
    envelope.aead_ciphertext = ciphertext;
    envelope.aead_tag = tag;

    let signed_prefix = envelope.signed_prefix();
    let signature = dsa_sign(&signed_prefix, sender_dsa_sk).map_err(|_| EnvelopeError::DecryptFailed)?;
    envelope.signature = signature.0;

    Ok(envelope.encode())
}

fn header_aad(envelope: &Envelope) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 64 + 64 + 8);
    aad.push(envelope.version);
    aad.extend_from_slice(&envelope.sender_fingerprint.to_bytes());
    aad.extend_from_slice(&envelope.recipient_fingerprint.to_bytes());
    aad.extend_from_slice(&envelope.sender_timestamp.to_le_bytes());
    aad
}

/// Result of a successful `decrypt_and_verify` (§4.3).
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub sender_fingerprint: Fingerprint,
    pub sender_dsa_pubkey: DsaPublicKey,
    pub sender_timestamp: u64,
}

/// Verify `sender_fingerprint == sha3_512(sender_dsa_pubkey)`, verify the
/// signature, KEM-decapsulate with `my_kem_sk`, HKDF, and AEAD-open (§4.3).
pub fn decrypt_and_verify(
    envelope_bytes: &[u8],
    my_kem_sk: &KemSecretKey,
) -> Result<Decrypted, EnvelopeError> {
    let envelope = Envelope::decode(envelope_bytes)?;

    let expected_fingerprint = Fingerprint::of(&envelope.sender_dsa_pubkey);
    if expected_fingerprint != envelope.sender_fingerprint {
        return Err(EnvelopeError::BadFingerprint);
    }

    let signed_prefix = envelope.signed_prefix();
    let signature = DsaSignature(envelope.signature.clone());
    if !dsa_verify(&signed_prefix, &signature, &envelope.sender_dsa_pubkey) {
        return Err(EnvelopeError::BadSignature);
    }

    let shared_secret =
        kem_decap(&envelope.kem_ciphertext, my_kem_sk).map_err(|_| EnvelopeError::DecryptFailed)?;
    let aead_key_vec = hkdf_sha3_512(&shared_secret.0, &[], ENVELOPE_AEAD_INFO, 32)
        .map_err(|_| EnvelopeError::DecryptFailed)?;
    let mut aead_key = [0u8; 32];
    aead_key.copy_from_slice(&aead_key_vec);

    let aad = header_aad(&envelope);
    let plaintext = aead_open(
        &aead_key,
        &envelope.aead_nonce,
        &aad,
        &envelope.aead_ciphertext,
        &envelope.aead_tag,
    )
    .map_err(|_| EnvelopeError::DecryptFailed)?;

    Ok(Decrypted {
        plaintext,
        sender_fingerprint: envelope.sender_fingerprint,
        sender_dsa_pubkey: envelope.sender_dsa_pubkey,
        sender_timestamp: envelope.sender_timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsa_keypair_from_seed, kem_keypair};

    fn make_pair(seed: u8) -> (DsaPublicKey, DsaSecretKey, KemPublicKey, KemSecretKey, Fingerprint) {
        let (dsa_pk, dsa_sk) = dsa_keypair_from_seed(&[seed; 32]).unwrap();
        let (kem_pk, kem_sk) = kem_keypair().unwrap();
        let fp = Fingerprint::of(&dsa_pk);
        (dsa_pk, dsa_sk, kem_pk, kem_sk, fp)
    }

    #[test]
    fn round_trip_encrypt_decrypt() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(1);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, b_kem_sk, b_fp) = make_pair(2);

        let bytes = encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"hello", 1_700_000_000)
            .unwrap();

        let decrypted = decrypt_and_verify(&bytes, &b_kem_sk).unwrap();
        assert_eq!(decrypted.plaintext, b"hello");
        assert_eq!(decrypted.sender_fingerprint, a_fp);
        assert_eq!(decrypted.sender_timestamp, 1_700_000_000);
    }

    #[test]
    fn empty_plaintext_is_accepted() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(3);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, b_kem_sk, b_fp) = make_pair(4);
        let bytes = encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"", 1).unwrap();
        let decrypted = decrypt_and_verify(&bytes, &b_kem_sk).unwrap();
        assert!(decrypted.plaintext.is_empty());
    }

    #[test]
    fn byte_level_round_trip_is_identity() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(5);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, _b_kem_sk, b_fp) = make_pair(6);
        let bytes =
            encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"round trip", 42).unwrap();
        let parsed = Envelope::decode(&bytes).unwrap();
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn tampered_ciphertext_fails_decrypt() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(7);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, b_kem_sk, b_fp) = make_pair(8);
        let mut bytes =
            encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"secret", 9).unwrap();
        let last = bytes.len() - 1 - DSA_SIGNATURE_LEN - DSA_PUBLIC_KEY_LEN;
        bytes[last] ^= 0xFF;
        assert!(decrypt_and_verify(&bytes, &b_kem_sk).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(9);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, b_kem_sk, b_fp) = make_pair(10);
        let mut bytes =
            encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"secret", 9).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        assert!(matches!(
            decrypt_and_verify(&bytes, &b_kem_sk),
            Err(EnvelopeError::BadSignature)
        ));
    }

    #[test]
    fn decapsulating_with_wrong_key_fails() {
        let (a_dsa_pk, a_dsa_sk, _a_kem_pk, _a_kem_sk, a_fp) = make_pair(11);
        let (_b_dsa_pk, _b_dsa_sk, b_kem_pk, _b_kem_sk, b_fp) = make_pair(12);
        let (_c_dsa_pk, _c_dsa_sk, _c_kem_pk, c_kem_sk, _c_fp) = make_pair(13);
        let bytes =
            encrypt_to(&b_kem_pk, &a_dsa_sk, &a_fp, &b_fp, &a_dsa_pk, b"secret", 9).unwrap();
        assert!(decrypt_and_verify(&bytes, &c_kem_sk).is_err());
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        let bytes = vec![0u8; 10];
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(EnvelopeError::MalformedEnvelope)
        ));
    }
}
