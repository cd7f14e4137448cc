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

//! `groups.db`: cached group metadata, the append-only GEK store, pending
//! invitations (§3.1), and the local contact list (§4.11).

use std::path::Path;

use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct GroupMetadataRow {
    pub local_id: i64,
    pub group_uuid: String,
    pub name: String,
    pub description: String,
    pub creator_fingerprint: String,
    pub members: Vec<String>,
    pub created_at: i64,
    pub gek_version: u32,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub group_uuid: String,
    pub name: String,
    pub creator_fingerprint: String,
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct ContactRow {
    pub fingerprint: String,
    pub added_at: i64,
}

pub struct GroupStore {
    writer: Mutex<rusqlite::Connection>,
}

impl GroupStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = super::open_wal(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS groups (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_uuid TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                creator_fingerprint TEXT NOT NULL,
                members TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                gek_version INTEGER NOT NULL,
                signature BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS gek_store (
                group_uuid TEXT NOT NULL,
                gek_version INTEGER NOT NULL,
                gek BLOB NOT NULL,
                PRIMARY KEY (group_uuid, gek_version)
            );
            CREATE TABLE IF NOT EXISTS invitations (
                group_uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                creator_fingerprint TEXT NOT NULL,
                received_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS contacts (
                fingerprint TEXT PRIMARY KEY,
                added_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| AppError::Internal(format!("creating groups schema: {e}")))?;
        Ok(Self {
            writer: Mutex::new(conn),
        })
    }

    /// Insert or update the cached metadata for a group (§4.7 "creator
    /// mutates metadata ... re-signs, puts"); preserves the stable local
    /// integer id across updates.
    pub async fn upsert_group(&self, row: &GroupMetadataRow) -> AppResult<()> {
        let members_json = serde_json::to_string(&row.members)
            .map_err(|e| AppError::Internal(format!("serializing members: {e}")))?;
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT INTO groups (group_uuid, name, description, creator_fingerprint, members,
                created_at, gek_version, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(group_uuid) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                members = excluded.members,
                gek_version = excluded.gek_version,
                signature = excluded.signature",
            params![
                row.group_uuid,
                row.name,
                row.description,
                row.creator_fingerprint,
                members_json,
                row.created_at,
                row.gek_version,
                row.signature,
            ],
        )
        .map_err(|e| AppError::Internal(format!("upserting group: {e}")))?;
        Ok(())
    }

    pub async fn get_group(&self, group_uuid: &str) -> AppResult<Option<GroupMetadataRow>> {
        let conn = self.writer.lock().await;
        let row = conn
            .query_row(
                "SELECT local_id, group_uuid, name, description, creator_fingerprint, members,
                    created_at, gek_version, signature
                 FROM groups WHERE group_uuid = ?1",
                params![group_uuid],
                row_to_group,
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("querying group: {e}")))?;
        row.map(tuple_to_group).transpose()
    }

    pub async fn list_groups(&self) -> AppResult<Vec<GroupMetadataRow>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT local_id, group_uuid, name, description, creator_fingerprint, members,
                    created_at, gek_version, signature FROM groups ORDER BY local_id ASC",
            )
            .map_err(|e| AppError::Internal(format!("preparing groups query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_group)
            .map_err(|e| AppError::Internal(format!("querying groups: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(tuple_to_group(
                row.map_err(|e| AppError::Internal(format!("reading group row: {e}")))?,
            )?);
        }
        Ok(out)
    }

    /// Append-only: a GEK version is never overwritten or deleted, so
    /// historical feed messages stay decryptable (§3 Lifecycle summary).
    pub async fn store_gek(&self, group_uuid: &str, gek_version: u32, gek: &[u8; 32]) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO gek_store (group_uuid, gek_version, gek) VALUES (?1, ?2, ?3)",
            params![group_uuid, gek_version, gek.to_vec()],
        )
        .map_err(|e| AppError::Internal(format!("storing gek: {e}")))?;
        Ok(())
    }

    pub async fn get_gek(&self, group_uuid: &str, gek_version: u32) -> AppResult<Option<[u8; 32]>> {
        let conn = self.writer.lock().await;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT gek FROM gek_store WHERE group_uuid = ?1 AND gek_version = ?2",
                params![group_uuid, gek_version],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("querying gek: {e}")))?;
        bytes
            .map(|b| {
                let arr: [u8; 32] = b
                    .try_into()
                    .map_err(|_| AppError::Internal("stored gek is not 32 bytes".into()))?;
                Ok(arr)
            })
            .transpose()
    }

    pub async fn add_invitation(&self, invitation: &Invitation) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO invitations (group_uuid, name, creator_fingerprint, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                invitation.group_uuid,
                invitation.name,
                invitation.creator_fingerprint,
                invitation.received_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("adding invitation: {e}")))?;
        Ok(())
    }

    pub async fn list_invitations(&self) -> AppResult<Vec<Invitation>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare("SELECT group_uuid, name, creator_fingerprint, received_at FROM invitations")
            .map_err(|e| AppError::Internal(format!("preparing invitations query: {e}")))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Invitation {
                    group_uuid: r.get(0)?,
                    name: r.get(1)?,
                    creator_fingerprint: r.get(2)?,
                    received_at: r.get(3)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("querying invitations: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| AppError::Internal(format!("reading invitation: {e}")))?);
        }
        Ok(out)
    }

    /// Resolves an invitation whether accepted or rejected (§8 boundary:
    /// both terminal actions remove the pending invitation).
    pub async fn remove_invitation(&self, group_uuid: &str) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute("DELETE FROM invitations WHERE group_uuid = ?1", params![group_uuid])
            .map_err(|e| AppError::Internal(format!("removing invitation: {e}")))?;
        Ok(())
    }

    pub async fn add_contact(&self, fingerprint: &str, added_at: i64) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO contacts (fingerprint, added_at) VALUES (?1, ?2)",
            params![fingerprint, added_at],
        )
        .map_err(|e| AppError::Internal(format!("adding contact: {e}")))?;
        Ok(())
    }

    pub async fn remove_contact(&self, fingerprint: &str) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute("DELETE FROM contacts WHERE fingerprint = ?1", params![fingerprint])
            .map_err(|e| AppError::Internal(format!("removing contact: {e}")))?;
        Ok(())
    }

    pub async fn list_contacts(&self) -> AppResult<Vec<ContactRow>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare("SELECT fingerprint, added_at FROM contacts ORDER BY added_at ASC")
            .map_err(|e| AppError::Internal(format!("preparing contacts query: {e}")))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ContactRow {
                    fingerprint: r.get(0)?,
                    added_at: r.get(1)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("querying contacts: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| AppError::Internal(format!("reading contact: {e}")))?);
        }
        Ok(out)
    }
}

type GroupTuple = (i64, String, String, String, String, String, i64, u32, Vec<u8>);

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn tuple_to_group(t: GroupTuple) -> AppResult<GroupMetadataRow> {
    let members: Vec<String> = serde_json::from_str(&t.5)
        .map_err(|e| AppError::Internal(format!("deserializing members: {e}")))?;
    Ok(GroupMetadataRow {
        local_id: t.0,
        group_uuid: t.1,
        name: t.2,
        description: t.3,
        creator_fingerprint: t.4,
        members,
        created_at: t.6,
        gek_version: t.7,
        signature: t.8,
    })
}
