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

//! Group feed-outbox (§4.9): one append-style DHT cell per
//! `(group_uuid, day_bucket)`, sealed directly under the current GEK.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::contact::Keyserver;
use crate::crypto::{aead_open, aead_seal, csprng_fill, dsa_sign, dsa_verify, DsaSignature};
use crate::dht::{truncated_key, DhtClient, DhtKey, ValueType};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityKeys};
use crate::store::messages::{MessageStatus, MessageType, NewMessage};
use crate::store::{GroupStore, MessageStore};

const FEED_TTL_SECONDS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedEntry {
    msg_id: [u8; 16],
    sender_fingerprint: Fingerprint,
    timestamp_ms: u64,
    gek_version: u32,
    aead_nonce: [u8; 12],
    aead_ciphertext: Vec<u8>,
    aead_tag: [u8; 16],
    signature: Vec<u8>,
}

impl FeedEntry {
    fn signed_fields(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.msg_id);
        buf.extend_from_slice(self.sender_fingerprint.as_str().as_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&self.gek_version.to_le_bytes());
        buf.extend_from_slice(&self.aead_nonce);
        buf.extend_from_slice(&self.aead_ciphertext);
        buf.extend_from_slice(&self.aead_tag);
        buf
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FeedCellValue {
    entries: Vec<FeedEntry>,
}

pub fn feed_key(group_uuid: &str, day_bucket: u64) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(b"group-out:");
    input.extend_from_slice(group_uuid.as_bytes());
    input.push(b':');
    input.extend_from_slice(day_bucket.to_string().as_bytes());
    truncated_key(&input)
}

pub struct GroupFeed<D: DhtClient> {
    dht: Arc<D>,
    groups: Arc<GroupStore>,
    messages: Arc<MessageStore>,
    keyserver: Arc<Keyserver<D>>,
}

impl<D: DhtClient> GroupFeed<D> {
    pub fn new(
        dht: Arc<D>,
        groups: Arc<GroupStore>,
        messages: Arc<MessageStore>,
        keyserver: Arc<Keyserver<D>>,
    ) -> Self {
        Self { dht, groups, messages, keyserver }
    }

    /// §4.9 "Send": seal under the current GEK, sign, append to today's
    /// cell.
    pub async fn send(
        &self,
        sender: &IdentityKeys,
        group_uuid: &str,
        gek_version: u32,
        gek: &[u8; 32],
        plaintext: &[u8],
        timestamp_ms: u64,
    ) -> AppResult<()> {
        let mut msg_id = [0u8; 16];
        csprng_fill(&mut msg_id);
        let mut nonce = [0u8; 12];
        csprng_fill(&mut nonce);
        let (ciphertext, tag) = aead_seal(gek, &nonce, &[], plaintext)?;

        let mut entry = FeedEntry {
            msg_id,
            sender_fingerprint: sender.fingerprint.clone(),
            timestamp_ms,
            gek_version,
            aead_nonce: nonce,
            aead_ciphertext: ciphertext,
            aead_tag: tag,
            signature: Vec::new(),
        };
        let signed = entry.signed_fields();
        entry.signature = dsa_sign(&signed, &sender.dsa_sk)?.0;

        let day_bucket = super::super::outbox::day_bucket(timestamp_ms / 1000);
        let key = feed_key(group_uuid, day_bucket);
        let mut cell = self.fetch_cell(key).await?;
        cell.entries.push(entry);
        self.publish_cell(key, cell).await?;

        self.messages
            .insert(NewMessage {
                sender: sender.fingerprint.as_str().to_string(),
                recipient: group_uuid.to_string(),
                sender_fingerprint: sender.fingerprint.as_str().to_string(),
                plaintext: String::from_utf8_lossy(plaintext).to_string(),
                timestamp: (timestamp_ms / 1000) as i64,
                is_outgoing: true,
                // Group sends have no delivery receipt (Open Question 3):
                // best-effort SENT once the feed cell publish succeeds, never
                // DELIVERED.
                status: MessageStatus::SentLegacy,
                group_uuid: Some(group_uuid.to_string()),
                message_type: MessageType::Chat,
                offline_seq: None,
            })
            .await?;
        Ok(())
    }

    /// §4.9 "Receive": fetch the cell, decrypt every entry whose
    /// `gek_version` we hold, dedup, persist. Entries at a version we lack
    /// (we joined later, or were removed) are skipped.
    pub async fn receive(&self, group_uuid: &str, day_bucket: u64) -> AppResult<usize> {
        let key = feed_key(group_uuid, day_bucket);
        let blobs = self.dht.get_all(key).await?;
        let mut new_count = 0usize;
        let mut seen = std::collections::HashSet::new();

        for blob in blobs {
            let Ok(cell) = bincode::deserialize::<FeedCellValue>(&blob) else {
                continue;
            };
            for entry in cell.entries {
                if !seen.insert(entry.msg_id) {
                    continue;
                }
                let Some(gek) = self.groups.get_gek(group_uuid, entry.gek_version).await? else {
                    tracing::debug!(version = entry.gek_version, "skipping feed entry at a GEK version we don't hold");
                    continue;
                };

                let plaintext = match self.verify_and_open(&entry, &gek).await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(cause = %e, "dropping group feed entry that failed verification");
                        continue;
                    }
                };

                let existing = self
                    .messages
                    .find_near_dedup_key(
                        entry.sender_fingerprint.as_str(),
                        group_uuid,
                        (entry.timestamp_ms / 1000) as i64,
                    )
                    .await?;
                if existing.is_none() {
                    self.messages
                        .insert(NewMessage {
                            sender: entry.sender_fingerprint.as_str().to_string(),
                            recipient: group_uuid.to_string(),
                            sender_fingerprint: entry.sender_fingerprint.as_str().to_string(),
                            plaintext: String::from_utf8_lossy(&plaintext).to_string(),
                            timestamp: (entry.timestamp_ms / 1000) as i64,
                            is_outgoing: false,
                            status: MessageStatus::Delivered,
                            group_uuid: Some(group_uuid.to_string()),
                            message_type: MessageType::Chat,
                            offline_seq: None,
                        })
                        .await?;
                    new_count += 1;
                }
            }
        }
        Ok(new_count)
    }

    /// Resolve the claimed sender's DSA key (the entry itself carries only
    /// their fingerprint), verify the signature, then AEAD-open.
    async fn verify_and_open(&self, entry: &FeedEntry, gek: &[u8; 32]) -> AppResult<Vec<u8>> {
        let sender_record = self.keyserver.resolve(entry.sender_fingerprint.as_str()).await?;
        let signed = entry.signed_fields();
        if !dsa_verify(&signed, &DsaSignature(entry.signature.clone()), &sender_record.dsa_public_key) {
            return Err(AppError::CryptoFailure);
        }
        aead_open(gek, &entry.aead_nonce, &[], &entry.aead_ciphertext, &entry.aead_tag)
            .map_err(AppError::from)
    }

    async fn fetch_cell(&self, key: DhtKey) -> AppResult<FeedCellValue> {
        match self.dht.get(key).await? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding feed cell: {e}"))),
            None => Ok(FeedCellValue::default()),
        }
    }

    async fn publish_cell(&self, key: DhtKey, cell: FeedCellValue) -> AppResult<()> {
        let bytes = bincode::serialize(&cell)
            .map_err(|e| AppError::Internal(format!("encoding feed cell: {e}")))?;
        self.dht.put(key, bytes, FEED_TTL_SECONDS, ValueType::Persist7Day).await?;
        Ok(())
    }
}
