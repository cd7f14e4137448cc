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

//! Local persistence (§3.1): `messages.db` and `groups.db`, both SQLite via
//! `rusqlite`, WAL journal mode so UI reads never block the engine's single
//! writer.

pub mod groups;
pub mod messages;

pub use groups::GroupStore;
pub use messages::MessageStore;

use rusqlite::Connection;

use crate::error::{AppError, AppResult};

pub(crate) fn open_wal(path: &std::path::Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AppError::Internal(format!("creating db dir: {e}")))?;
    }
    let conn = Connection::open(path)
        .map_err(|e| AppError::Internal(format!("opening {}: {e}", path.display())))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::Internal(format!("enabling WAL: {e}")))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| AppError::Internal(format!("enabling foreign keys: {e}")))?;
    Ok(conn)
}

pub(crate) fn open_wal_readonly(path: &std::path::Path) -> AppResult<Connection> {
    let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| AppError::Internal(format!("opening {} read-only: {e}", path.display())))?;
    Ok(conn)
}
