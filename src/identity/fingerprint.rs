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

//! Fingerprint: SHA3-512 of a DSA public key, rendered as 128 lowercase hex
//! characters (§3). This is the canonical, immutable identity.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha3_512, DsaPublicKey};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(dsa_pk: &DsaPublicKey) -> Self {
        Self(hex::encode(sha3_512(&dsa_pk.0)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse and validate a 128-hex-char fingerprint (§8 boundary: wrong
    /// length or non-hex is rejected as `BadInput`).
    pub fn parse(s: &str) -> AppResult<Self> {
        if s.len() != 128 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AppError::BadInput(format!("invalid fingerprint: {s}")));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn is_fingerprint_like(s: &str) -> bool {
        s.len() == 128 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// The raw 64-byte SHA3-512 digest, as carried in the envelope wire
    /// format's `sender_fingerprint(64)` / `recipient_fingerprint(64)` fields
    /// (§3) rather than the 128-hex-char form used everywhere else.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        hex::decode_to_slice(&self.0, &mut out).expect("fingerprint is always valid hex");
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(hex::encode(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_128_lowercase_hex_chars() {
        let fp = Fingerprint::of(&DsaPublicKey(vec![0xAB; 2592]));
        assert_eq!(fp.as_str().len(), 128);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(Fingerprint::parse("deadbeef").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = "g".repeat(128);
        assert!(Fingerprint::parse(&bad).is_err());
    }

    #[test]
    fn parse_accepts_valid_fingerprint() {
        let fp = Fingerprint::of(&DsaPublicKey(vec![1, 2, 3]));
        assert_eq!(Fingerprint::parse(fp.as_str()).unwrap(), fp);
    }

    #[test]
    fn bytes_round_trip() {
        let fp = Fingerprint::of(&DsaPublicKey(vec![7, 8, 9]));
        let bytes = fp.to_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(Fingerprint::from_bytes(&bytes), fp);
    }
}
