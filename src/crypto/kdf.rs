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

//! HKDF-SHA3-512, used to turn a KEM shared secret into an AEAD key.

use hkdf::Hkdf;
use sha3::Sha3_512;

use super::CryptoError;

pub fn hkdf_sha3_512(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha3_512>::new(Some(salt), ikm);
    let mut out = vec![0u8; len];
    hk.expand(info, &mut out).map_err(|_| CryptoError::Kdf)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let a = hkdf_sha3_512(b"ikm", b"salt", b"info", 32).unwrap();
        let b = hkdf_sha3_512(b"ikm", b"salt", b"info", 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_info_yields_different_output() {
        let a = hkdf_sha3_512(b"ikm", b"salt", b"info-a", 32).unwrap();
        let b = hkdf_sha3_512(b"ikm", b"salt", b"info-b", 32).unwrap();
        assert_ne!(a, b);
    }
}
