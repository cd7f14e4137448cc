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

//! `<data_dir>/identity.lock`: an advisory per-data-dir file lock so only
//! one engine instance holds an identity at a time (§4.2, §9 "cyclic
//! ownership" — the lock coordinates across *processes*, not within one).
//!
//! The OS-level `flock` taken by `fd_lock` lives for as long as its file
//! descriptor stays open, not for as long as the typed guard is held. We
//! take the write lock once, `mem::forget` the guard (ending its borrow
//! without releasing the lock), and release on `Drop` simply by closing
//! the file.

use std::fs::{File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};

use fd_lock::RwLock;

use crate::error::{AppError, AppResult};

fn open_lock_file(data_dir: &Path) -> AppResult<(PathBuf, File)> {
    let path = data_dir.join("identity.lock");
    std::fs::create_dir_all(data_dir)
        .map_err(|e| AppError::Internal(format!("creating data dir: {e}")))?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| AppError::Internal(format!("opening lock file: {e}")))?;
    Ok((path, file))
}

/// Held for as long as this engine instance owns the identity. Dropping it
/// closes the underlying file descriptor, releasing the advisory lock.
pub struct IdentityLock {
    path: PathBuf,
    held: Box<RwLock<File>>,
}

impl IdentityLock {
    /// Non-blocking: fails with `AppError::Locked` if another process holds it.
    pub fn try_acquire(data_dir: &Path) -> AppResult<Self> {
        let (path, file) = open_lock_file(data_dir)?;
        let mut held = Box::new(RwLock::new(file));
        let guard = held.try_write().map_err(|_| AppError::Locked)?;
        mem::forget(guard);
        Ok(Self { path, held })
    }

    /// Query whether the lock is currently held by another process, without
    /// taking it ourselves (§4.2: "queryable by a second process before
    /// attempting load").
    pub fn is_held(data_dir: &Path) -> AppResult<bool> {
        let (_, file) = open_lock_file(data_dir)?;
        let mut lock = RwLock::new(file);
        match lock.try_write() {
            Ok(_guard) => Ok(false),
            Err(_) => Ok(true),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        // Dropping `held` closes the file descriptor, which releases the
        // OS-level flock.
        let _ = &self.held;
    }
}
