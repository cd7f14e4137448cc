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

//! Stable error kinds for the Host API (§7). `CryptoFailure` never carries
//! the underlying cause in its `Display` — that cause is logged at
//! `error!` and dropped, so a crafted envelope can't be used to fingerprint
//! which crypto step failed.

use crate::crypto::CryptoError;

pub type AppResult<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cryptographic operation failed")]
    CryptoFailure,

    #[error("DHT unavailable: {0}")]
    DhtUnavailable(String),

    #[error("DHT operation timed out")]
    DhtTimeout,

    #[error("DHT put rejected: {0}")]
    DhtPutRejected(String),

    #[error("message is stale")]
    Stale,

    #[error("identity lock held by another process")]
    Locked,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        tracing::error!(cause = %e, "crypto operation failed");
        AppError::CryptoFailure
    }
}

impl AppError {
    /// CLI-style exit code per §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::BadInput(_) => 1,
            AppError::NotFound(_) | AppError::Unauthorized(_) | AppError::AlreadyExists(_) => 1,
            AppError::DhtUnavailable(_) | AppError::DhtTimeout | AppError::DhtPutRejected(_) => 3,
            AppError::CryptoFailure => 4,
            AppError::Locked => 5,
            AppError::Stale => 1,
            AppError::Internal(_) => 2,
        }
    }
}
