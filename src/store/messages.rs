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

//! `messages.db`: the local message store (§3 "Local message store") and
//! the durable per-recipient `seq_num` counter (§4.6, Invariant 5 of §8).

use std::path::Path;

use rusqlite::{params, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    SentLegacy,
    Failed,
    Delivered,
    Read,
    Stale,
}

impl MessageStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::SentLegacy => "SENT_LEGACY",
            Self::Failed => "FAILED",
            Self::Delivered => "DELIVERED",
            Self::Read => "READ",
            Self::Stale => "STALE",
        }
    }

    fn parse(s: &str) -> AppResult<Self> {
        Ok(match s {
            "PENDING" => Self::Pending,
            "SENT_LEGACY" => Self::SentLegacy,
            "FAILED" => Self::Failed,
            "DELIVERED" => Self::Delivered,
            "READ" => Self::Read,
            "STALE" => Self::Stale,
            other => return Err(AppError::Internal(format!("unknown message status {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    GroupInvitation,
}

impl MessageType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::GroupInvitation => "GROUP_INVITATION",
        }
    }

    fn parse(s: &str) -> AppResult<Self> {
        Ok(match s {
            "CHAT" => Self::Chat,
            "GROUP_INVITATION" => Self::GroupInvitation,
            other => return Err(AppError::Internal(format!("unknown message type {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub sender_fingerprint: String,
    pub plaintext: String,
    pub timestamp: i64,
    pub is_outgoing: bool,
    pub status: MessageStatus,
    pub group_uuid: Option<String>,
    pub message_type: MessageType,
    pub offline_seq: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub sender_fingerprint: String,
    pub plaintext: String,
    pub timestamp: i64,
    pub delivered: bool,
    pub read: bool,
    pub is_outgoing: bool,
    pub status: MessageStatus,
    pub group_uuid: Option<String>,
    pub message_type: MessageType,
    pub retry_count: i64,
    pub offline_seq: Option<i64>,
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, i64, bool, bool, bool, String, Option<String>, String, i64, Option<i64>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get::<_, i64>(6)? != 0,
        row.get::<_, i64>(7)? != 0,
        row.get::<_, i64>(8)? != 0,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn tuple_to_message(
    t: (i64, String, String, String, String, i64, bool, bool, bool, String, Option<String>, String, i64, Option<i64>),
) -> AppResult<Message> {
    Ok(Message {
        id: t.0,
        sender: t.1,
        recipient: t.2,
        sender_fingerprint: t.3,
        plaintext: t.4,
        timestamp: t.5,
        delivered: t.6,
        read: t.7,
        is_outgoing: t.8,
        status: MessageStatus::parse(&t.9)?,
        group_uuid: t.10,
        message_type: MessageType::parse(&t.11)?,
        retry_count: t.12,
        offline_seq: t.13,
    })
}

const COLUMNS: &str = "id, sender, recipient, sender_fingerprint, plaintext, timestamp, \
    delivered, read, is_outgoing, status, group_uuid, message_type, retry_count, offline_seq";

pub struct MessageStore {
    path: std::path::PathBuf,
    writer: Mutex<rusqlite::Connection>,
}

impl MessageStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = super::open_wal(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                sender_fingerprint TEXT NOT NULL,
                plaintext TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0,
                read INTEGER NOT NULL DEFAULT 0,
                is_outgoing INTEGER NOT NULL,
                status TEXT NOT NULL,
                group_uuid TEXT,
                message_type TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                offline_seq INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS messages_dedup
                ON messages(sender_fingerprint, recipient, timestamp);
            CREATE TABLE IF NOT EXISTS send_counters (
                recipient_fingerprint TEXT PRIMARY KEY,
                next_seq INTEGER NOT NULL
            );",
        )
        .map_err(|e| AppError::Internal(format!("creating messages schema: {e}")))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(conn),
        })
    }

    /// Allocate the next monotonic `seq_num` for `recipient_fingerprint`,
    /// durably, before any DHT put is attempted (Invariant 5 of §8).
    pub async fn next_seq_num(&self, recipient_fingerprint: &str) -> AppResult<u64> {
        let mut conn = self.writer.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::Internal(format!("begin tx: {e}")))?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT next_seq FROM send_counters WHERE recipient_fingerprint = ?1",
                params![recipient_fingerprint],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("reading counter: {e}")))?;
        let next = current.unwrap_or(0);
        tx.execute(
            "INSERT INTO send_counters(recipient_fingerprint, next_seq) VALUES (?1, ?2)
             ON CONFLICT(recipient_fingerprint) DO UPDATE SET next_seq = ?2",
            params![recipient_fingerprint, next + 1],
        )
        .map_err(|e| AppError::Internal(format!("updating counter: {e}")))?;
        tx.commit()
            .map_err(|e| AppError::Internal(format!("commit tx: {e}")))?;
        Ok(next as u64)
    }

    /// Insert a new message, enforcing the `(sender_fingerprint, recipient,
    /// timestamp)` dedup key. Returns `AlreadyExists` on a duplicate.
    pub async fn insert(&self, msg: NewMessage) -> AppResult<i64> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT INTO messages (sender, recipient, sender_fingerprint, plaintext, timestamp,
                is_outgoing, status, group_uuid, message_type, offline_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.sender,
                msg.recipient,
                msg.sender_fingerprint,
                msg.plaintext,
                msg.timestamp,
                msg.is_outgoing as i64,
                msg.status.as_str(),
                msg.group_uuid,
                msg.message_type.as_str(),
                msg.offline_seq,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                AppError::AlreadyExists("duplicate message".into())
            }
            e => AppError::Internal(format!("inserting message: {e}")),
        })?;
        Ok(conn.last_insert_rowid())
    }

    /// Dedup lookup tolerating a ±1 second timestamp skew (§4.6).
    pub async fn find_near_dedup_key(
        &self,
        sender_fingerprint: &str,
        recipient: &str,
        timestamp: i64,
    ) -> AppResult<Option<Message>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE sender_fingerprint = ?1 AND recipient = ?2
                   AND timestamp BETWEEN ?3 AND ?4
                 LIMIT 1"
            ))
            .map_err(|e| AppError::Internal(format!("preparing dedup query: {e}")))?;
        let row = stmt
            .query_row(
                params![sender_fingerprint, recipient, timestamp - 1, timestamp + 1],
                row_to_message,
            )
            .optional()
            .map_err(|e| AppError::Internal(format!("querying dedup: {e}")))?;
        row.map(tuple_to_message).transpose()
    }

    pub async fn get_conversation(&self, contact_fingerprint: &str) -> AppResult<Vec<Message>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM messages
                 WHERE sender_fingerprint = ?1 OR recipient = ?1
                 ORDER BY timestamp ASC"
            ))
            .map_err(|e| AppError::Internal(format!("preparing conversation query: {e}")))?;
        let rows = stmt
            .query_map(params![contact_fingerprint], row_to_message)
            .map_err(|e| AppError::Internal(format!("querying conversation: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(tuple_to_message(
                row.map_err(|e| AppError::Internal(format!("reading row: {e}")))?,
            )?);
        }
        Ok(out)
    }

    pub async fn set_status(&self, id: i64, status: MessageStatus) -> AppResult<()> {
        let conn = self.writer.lock().await;
        conn.execute(
            "UPDATE messages SET status = ?1, delivered = delivered OR ?2 WHERE id = ?3",
            params![status.as_str(), (status == MessageStatus::Delivered) as i64, id],
        )
        .map_err(|e| AppError::Internal(format!("updating status: {e}")))?;
        Ok(())
    }

    /// Ack path (§4.6): mark every PENDING/SENT_LEGACY outgoing message to
    /// `recipient_fingerprint` whose `offline_seq <= max_seq_num` as
    /// DELIVERED. Returns the number of rows updated.
    pub async fn mark_delivered_up_to(
        &self,
        recipient_fingerprint: &str,
        max_seq_num: u64,
    ) -> AppResult<usize> {
        let conn = self.writer.lock().await;
        let updated = conn
            .execute(
                "UPDATE messages SET status = 'DELIVERED', delivered = 1
                 WHERE recipient = ?1 AND is_outgoing = 1
                   AND status IN ('PENDING', 'SENT_LEGACY')
                   AND offline_seq IS NOT NULL AND offline_seq <= ?2",
                params![recipient_fingerprint, max_seq_num as i64],
            )
            .map_err(|e| AppError::Internal(format!("marking delivered: {e}")))?;
        Ok(updated)
    }

    /// Retry bookkeeping for the heartbeat resend loop (§4.6, §7): increment
    /// `retry_count` for a PENDING send and return the new count so the
    /// caller can decide whether retries are exhausted.
    pub async fn increment_retry_count(&self, id: i64) -> AppResult<i64> {
        let conn = self.writer.lock().await;
        conn.execute("UPDATE messages SET retry_count = retry_count + 1 WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("incrementing retry_count: {e}")))?;
        conn.query_row("SELECT retry_count FROM messages WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| AppError::Internal(format!("reading retry_count: {e}")))
    }

    /// Heartbeat prune (§4.6 Retention): outgoing PENDING messages older
    /// than `max_age_secs` become STALE.
    pub async fn mark_stale_older_than(&self, now: i64, max_age_secs: i64) -> AppResult<usize> {
        let conn = self.writer.lock().await;
        let updated = conn
            .execute(
                "UPDATE messages SET status = 'STALE'
                 WHERE is_outgoing = 1 AND status = 'PENDING' AND (?1 - timestamp) > ?2",
                params![now, max_age_secs],
            )
            .map_err(|e| AppError::Internal(format!("marking stale: {e}")))?;
        Ok(updated)
    }

    /// PENDING outgoing messages whose DHT put is overdue for a retry.
    pub async fn pending_outgoing(&self) -> AppResult<Vec<Message>> {
        let conn = self.writer.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE is_outgoing = 1 AND status = 'PENDING'"
            ))
            .map_err(|e| AppError::Internal(format!("preparing pending query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_message)
            .map_err(|e| AppError::Internal(format!("querying pending: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(tuple_to_message(
                row.map_err(|e| AppError::Internal(format!("reading row: {e}")))?,
            )?);
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh read-only connection for UI-side reads, so a long-running UI
    /// query never blocks the engine's single writer (§3.1, §5 "Shared
    /// resources"). WAL mode makes this safe to open concurrently with the
    /// writer.
    pub fn read_only_connection(&self) -> AppResult<rusqlite::Connection> {
        super::open_wal_readonly(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_msg(sender_fp: &str, recipient: &str, ts: i64) -> NewMessage {
        NewMessage {
            sender: sender_fp.to_string(),
            recipient: recipient.to_string(),
            sender_fingerprint: sender_fp.to_string(),
            plaintext: "hi".into(),
            timestamp: ts,
            is_outgoing: true,
            status: MessageStatus::Pending,
            group_uuid: None,
            message_type: MessageType::Chat,
            offline_seq: Some(1),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        store.insert(new_msg("alice", "bob", 100)).await.unwrap();
        let convo = store.get_conversation("bob").await.unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].plaintext, "hi");
    }

    #[tokio::test]
    async fn duplicate_dedup_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        store.insert(new_msg("alice", "bob", 100)).await.unwrap();
        let err = store.insert(new_msg("alice", "bob", 100)).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn seq_num_is_monotonic_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        assert_eq!(store.next_seq_num("bob").await.unwrap(), 0);
        assert_eq!(store.next_seq_num("bob").await.unwrap(), 1);
        assert_eq!(store.next_seq_num("bob").await.unwrap(), 2);
        assert_eq!(store.next_seq_num("carol").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_delivered_up_to_covers_offline_seq() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        store.insert(new_msg("alice", "bob", 100)).await.unwrap();
        let updated = store.mark_delivered_up_to("bob", 1).await.unwrap();
        assert_eq!(updated, 1);
        let convo = store.get_conversation("bob").await.unwrap();
        assert_eq!(convo[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn stale_after_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        store.insert(new_msg("alice", "bob", 0)).await.unwrap();
        let updated = store.mark_stale_older_than(31 * 86_400, 30 * 86_400).await.unwrap();
        assert_eq!(updated, 1);
    }

    #[tokio::test]
    async fn near_dedup_key_tolerates_one_second_skew() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        store.insert(new_msg("alice", "bob", 100)).await.unwrap();
        let found = store.find_near_dedup_key("alice", "bob", 101).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn retry_count_increments_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("messages.db")).unwrap();
        let id = store.insert(new_msg("alice", "bob", 100)).await.unwrap();
        assert_eq!(store.increment_retry_count(id).await.unwrap(), 1);
        assert_eq!(store.increment_retry_count(id).await.unwrap(), 2);
    }
}
