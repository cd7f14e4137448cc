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

//! Direct outbox (§4.6): per-(sender, recipient, day) DHT cell, watermark
//! acknowledgement, and dedup.
//!
//! The outbox cell is a CRDT-like set of `(seq_num, envelope)` entries
//! merged from every record `get_all` returns for the cell key (§4.6 edge
//! cases: "the cell value is treated as a set ... mergers on conflict take
//! the union"). Each `send`/`resend` re-publishes the full merged set as one
//! new record rather than overwriting, so concurrent writers never lose
//! entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{dsa_sign, dsa_verify, DsaPublicKey, DsaSignature, KemPublicKey};
use crate::dht::{truncated_key, DhtClient, DhtKey, ValueType};
use crate::envelope::{self, MAX_PLAINTEXT_LEN};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityKeys};
use crate::store::messages::{MessageStatus, MessageType, NewMessage};
use crate::store::MessageStore;

const OUTBOX_TTL_SECONDS: u64 = 7 * 24 * 3600;
const WATERMARK_TTL_SECONDS: u64 = 7 * 24 * 3600;
/// §4.6 Retention: PENDING messages older than this become STALE.
pub const STALE_AFTER_SECONDS: i64 = 30 * 24 * 3600;
/// §4.6/§7: a PENDING send becomes FAILED once the engine heartbeat has
/// retried its DHT put this many times without success.
pub const MAX_SEND_RETRIES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaggedEnvelope {
    seq_num: u64,
    envelope: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OutboxCellValue {
    entries: Vec<TaggedEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkValue {
    max_seq_num_received: u64,
    timestamp: u64,
    signature: Vec<u8>,
}

fn watermark_signed_fields(recipient_fp: &Fingerprint, sender_fp: &Fingerprint, max_seq_num: u64, timestamp: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(recipient_fp.as_str().as_bytes());
    buf.extend_from_slice(sender_fp.as_str().as_bytes());
    buf.extend_from_slice(&max_seq_num.to_le_bytes());
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf
}

pub(crate) fn outbox_cell_key(sender_fp: &Fingerprint, recipient_fp: &Fingerprint, day_bucket: u64) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(sender_fp.as_str().as_bytes());
    input.extend_from_slice(b":outbox:");
    input.extend_from_slice(recipient_fp.as_str().as_bytes());
    input.push(b':');
    input.extend_from_slice(day_bucket.to_string().as_bytes());
    truncated_key(&input)
}

pub(crate) fn watermark_cell_key(recipient_fp: &Fingerprint, sender_fp: &Fingerprint) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(recipient_fp.as_str().as_bytes());
    input.extend_from_slice(b":watermark:");
    input.extend_from_slice(sender_fp.as_str().as_bytes());
    truncated_key(&input)
}

pub fn day_bucket(unix_seconds: u64) -> u64 {
    unix_seconds / 86_400
}

pub struct DirectOutbox<D: DhtClient> {
    dht: Arc<D>,
    messages: Arc<MessageStore>,
}

impl<D: DhtClient> DirectOutbox<D> {
    pub fn new(dht: Arc<D>, messages: Arc<MessageStore>) -> Self {
        Self { dht, messages }
    }

    async fn merged_entries(&self, key: DhtKey) -> AppResult<BTreeMap<u64, Vec<u8>>> {
        let blobs = self.dht.get_all(key).await?;
        let mut merged = BTreeMap::new();
        for blob in blobs {
            if let Ok(cell) = bincode::deserialize::<OutboxCellValue>(&blob) {
                for entry in cell.entries {
                    merged.entry(entry.seq_num).or_insert(entry.envelope);
                }
            }
        }
        Ok(merged)
    }

    async fn publish_merged(&self, key: DhtKey, merged: BTreeMap<u64, Vec<u8>>) -> AppResult<()> {
        let cell = OutboxCellValue {
            entries: merged
                .into_iter()
                .map(|(seq_num, envelope)| TaggedEnvelope { seq_num, envelope })
                .collect(),
        };
        let bytes = bincode::serialize(&cell)
            .map_err(|e| AppError::Internal(format!("encoding outbox cell: {e}")))?;
        self.dht
            .put(key, bytes, OUTBOX_TTL_SECONDS, ValueType::Persist7Day)
            .await?;
        Ok(())
    }

    /// Send path (§4.6): allocate a durable `seq_num`, persist the message
    /// as PENDING, then encrypt and append to today's cell. Persisting before
    /// the put means a failed send still leaves a record the UI can surface
    /// (§7 "persistent message-status update"); a failed encrypt is marked
    /// FAILED immediately since crypto failures are never retried (§7), while
    /// a failed DHT put is left PENDING for the engine heartbeat to retry.
    pub async fn send(
        &self,
        sender: &IdentityKeys,
        recipient_fp: &Fingerprint,
        recipient_kem_pk: &KemPublicKey,
        plaintext: &str,
        now: u64,
    ) -> AppResult<()> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(AppError::BadInput("plaintext exceeds 64 KiB".into()));
        }
        let seq_num = self.messages.next_seq_num(recipient_fp.as_str()).await?;
        let row_id = self
            .messages
            .insert(NewMessage {
                sender: sender.fingerprint.as_str().to_string(),
                recipient: recipient_fp.as_str().to_string(),
                sender_fingerprint: sender.fingerprint.as_str().to_string(),
                plaintext: plaintext.to_string(),
                timestamp: now as i64,
                is_outgoing: true,
                status: MessageStatus::Pending,
                group_uuid: None,
                message_type: MessageType::Chat,
                offline_seq: Some(seq_num as i64),
            })
            .await?;

        let envelope_bytes = match envelope::encrypt_to(
            recipient_kem_pk,
            &sender.dsa_sk,
            &sender.fingerprint,
            recipient_fp,
            &sender.dsa_pk,
            plaintext.as_bytes(),
            now,
        ) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.messages.set_status(row_id, MessageStatus::Failed).await?;
                return Err(AppError::CryptoFailure);
            }
        };

        let key = outbox_cell_key(&sender.fingerprint, recipient_fp, day_bucket(now));
        let mut merged = self.merged_entries(key).await?;
        merged.insert(seq_num, envelope_bytes);
        self.publish_merged(key, merged).await?;
        Ok(())
    }

    /// Re-publish an already-allocated `seq_num` (engine heartbeat retry,
    /// §4.6 state machine). A no-op if the entry is already present.
    pub async fn resend(
        &self,
        sender: &IdentityKeys,
        recipient_fp: &Fingerprint,
        recipient_kem_pk: &KemPublicKey,
        plaintext: &str,
        timestamp: u64,
        seq_num: u64,
    ) -> AppResult<()> {
        let key = outbox_cell_key(&sender.fingerprint, recipient_fp, day_bucket(timestamp));
        let mut merged = self.merged_entries(key).await?;
        if merged.contains_key(&seq_num) {
            return Ok(());
        }
        let envelope_bytes = envelope::encrypt_to(
            recipient_kem_pk,
            &sender.dsa_sk,
            &sender.fingerprint,
            recipient_fp,
            &sender.dsa_pk,
            plaintext.as_bytes(),
            timestamp,
        )
        .map_err(|_| AppError::CryptoFailure)?;
        merged.insert(seq_num, envelope_bytes);
        self.publish_merged(key, merged).await
    }

    /// Receive path (§4.6): fetch `sender_fp`'s cell for `day_bucket`,
    /// decrypt and persist every envelope not already seen, then publish an
    /// updated watermark covering the highest `seq_num` processed. Returns
    /// the number of newly persisted messages.
    pub async fn receive(
        &self,
        me: &IdentityKeys,
        sender_fp: &Fingerprint,
        day_bucket_value: u64,
        now: u64,
    ) -> AppResult<usize> {
        let key = outbox_cell_key(sender_fp, &me.fingerprint, day_bucket_value);
        let merged = self.merged_entries(key).await?;

        let mut max_seq_seen: Option<u64> = None;
        let mut new_count = 0usize;
        for (seq_num, envelope_bytes) in merged {
            let decrypted = match envelope::decrypt_and_verify(&envelope_bytes, &me.kem_sk) {
                Ok(d) => d,
                Err(e) => {
                    // An attacker-crafted envelope must never propagate to
                    // the host (§7 "Propagation"); log and drop.
                    tracing::warn!(cause = %e, "dropping envelope that failed decrypt_and_verify");
                    continue;
                }
            };
            if &decrypted.sender_fingerprint != sender_fp {
                tracing::warn!("envelope sender fingerprint did not match outbox cell owner; dropping");
                continue;
            }

            let existing = self
                .messages
                .find_near_dedup_key(
                    sender_fp.as_str(),
                    me.fingerprint.as_str(),
                    decrypted.sender_timestamp as i64,
                )
                .await?;
            if existing.is_none() {
                self.messages
                    .insert(NewMessage {
                        sender: sender_fp.as_str().to_string(),
                        recipient: me.fingerprint.as_str().to_string(),
                        sender_fingerprint: sender_fp.as_str().to_string(),
                        plaintext: String::from_utf8_lossy(&decrypted.plaintext).to_string(),
                        timestamp: decrypted.sender_timestamp as i64,
                        is_outgoing: false,
                        status: MessageStatus::Delivered,
                        group_uuid: None,
                        message_type: MessageType::Chat,
                        offline_seq: Some(seq_num as i64),
                    })
                    .await?;
                new_count += 1;
            }
            max_seq_seen = Some(max_seq_seen.map_or(seq_num, |m| m.max(seq_num)));
        }

        if let Some(max_seq) = max_seq_seen {
            self.publish_watermark(me, sender_fp, max_seq, now).await?;
        }
        Ok(new_count)
    }

    async fn publish_watermark(
        &self,
        me: &IdentityKeys,
        sender_fp: &Fingerprint,
        max_seq_num: u64,
        now: u64,
    ) -> AppResult<()> {
        let key = watermark_cell_key(&me.fingerprint, sender_fp);
        let current_max = match self.dht.get(key).await? {
            Some(bytes) => bincode::deserialize::<WatermarkValue>(&bytes)
                .map(|w| w.max_seq_num_received)
                .unwrap_or(0),
            None => 0,
        };
        // Watermarks are monotonic by construction (§3 Invariant).
        let new_max = current_max.max(max_seq_num);
        let signed = watermark_signed_fields(&me.fingerprint, sender_fp, new_max, now);
        let signature = dsa_sign(&signed, &me.dsa_sk)?;
        let value = WatermarkValue {
            max_seq_num_received: new_max,
            timestamp: now,
            signature: signature.0,
        };
        let bytes = bincode::serialize(&value)
            .map_err(|e| AppError::Internal(format!("encoding watermark: {e}")))?;
        self.dht
            .put(key, bytes, WATERMARK_TTL_SECONDS, ValueType::Persist7Day)
            .await?;
        Ok(())
    }

    /// Acknowledgement path (§4.6): fetch and verify `recipient_fp`'s
    /// watermark cell for `me`, mark every covered PENDING/SENT_LEGACY
    /// outgoing message DELIVERED. `recipient_dsa_pk` must already be
    /// resolved (via the keyserver) by the caller.
    pub async fn process_watermark_update(
        &self,
        me: &Fingerprint,
        recipient_fp: &Fingerprint,
        recipient_dsa_pk: &DsaPublicKey,
    ) -> AppResult<usize> {
        let key = watermark_cell_key(recipient_fp, me);
        let Some(bytes) = self.dht.get(key).await? else {
            return Ok(0);
        };
        let watermark: WatermarkValue = bincode::deserialize(&bytes)
            .map_err(|e| AppError::Internal(format!("decoding watermark: {e}")))?;
        let signed = watermark_signed_fields(recipient_fp, me, watermark.max_seq_num_received, watermark.timestamp);
        if !dsa_verify(&signed, &DsaSignature(watermark.signature), recipient_dsa_pk) {
            tracing::warn!("watermark signature failed verification; ignoring");
            return Ok(0);
        }
        self.messages
            .mark_delivered_up_to(recipient_fp.as_str(), watermark.max_seq_num_received)
            .await
    }

    /// Presence signal (§4.10 "ContactOnline/Offline ... derived from
    /// watermark freshness"): how long ago `contact_fp` last acknowledged
    /// receipt of a message from `me`. `None` if they never have. This is an
    /// advisory read, not a security check, so the watermark signature is not
    /// verified here.
    pub async fn watermark_age_seconds(
        &self,
        me: &Fingerprint,
        contact_fp: &Fingerprint,
        now: u64,
    ) -> AppResult<Option<u64>> {
        let key = watermark_cell_key(contact_fp, me);
        let Some(bytes) = self.dht.get(key).await? else {
            return Ok(None);
        };
        let watermark: WatermarkValue = bincode::deserialize(&bytes)
            .map_err(|e| AppError::Internal(format!("decoding watermark: {e}")))?;
        Ok(Some(now.saturating_sub(watermark.timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsa_keypair_from_seed, kem_keypair};
    use crate::dht::memory::MemoryDht;

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

    #[tokio::test]
    async fn send_then_receive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let alice_messages = Arc::new(MessageStore::open(&dir.path().join("alice.db")).unwrap());
        let bob_messages = Arc::new(MessageStore::open(&dir.path().join("bob.db")).unwrap());
        let alice_outbox = DirectOutbox::new(dht.clone(), alice_messages.clone());
        let bob_outbox = DirectOutbox::new(dht, bob_messages.clone());

        let alice = sample_keys(1);
        let bob = sample_keys(2);

        alice_outbox
            .send(&alice, &bob.fingerprint, &bob.kem_pk, "hello", 1_700_000_000)
            .await
            .unwrap();

        let new_count = bob_outbox
            .receive(&bob, &alice.fingerprint, day_bucket(1_700_000_000), 1_700_000_001)
            .await
            .unwrap();
        assert_eq!(new_count, 1);

        let convo = bob_messages.get_conversation(alice.fingerprint.as_str()).await.unwrap();
        assert_eq!(convo.len(), 1);
        assert_eq!(convo[0].plaintext, "hello");

        let updated = alice_outbox
            .process_watermark_update(&alice.fingerprint, &bob.fingerprint, &bob.dsa_pk)
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let alice_convo = alice_messages.get_conversation(bob.fingerprint.as_str()).await.unwrap();
        assert_eq!(alice_convo[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn oversized_plaintext_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let messages = Arc::new(MessageStore::open(&dir.path().join("m.db")).unwrap());
        let outbox = DirectOutbox::new(dht, messages);
        let alice = sample_keys(3);
        let bob = sample_keys(4);
        let big = "x".repeat(MAX_PLAINTEXT_LEN + 1);
        let err = outbox
            .send(&alice, &bob.fingerprint, &bob.kem_pk, &big, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadInput(_)));
    }

    #[tokio::test]
    async fn duplicate_receive_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let alice_messages = Arc::new(MessageStore::open(&dir.path().join("alice.db")).unwrap());
        let bob_messages = Arc::new(MessageStore::open(&dir.path().join("bob.db")).unwrap());
        let alice_outbox = DirectOutbox::new(dht.clone(), alice_messages);
        let bob_outbox = DirectOutbox::new(dht, bob_messages.clone());
        let alice = sample_keys(5);
        let bob = sample_keys(6);
        alice_outbox
            .send(&alice, &bob.fingerprint, &bob.kem_pk, "once", 100)
            .await
            .unwrap();
        let bucket = day_bucket(100);
        bob_outbox.receive(&bob, &alice.fingerprint, bucket, 101).await.unwrap();
        let second = bob_outbox.receive(&bob, &alice.fingerprint, bucket, 102).await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(bob_messages.get_conversation(alice.fingerprint.as_str()).await.unwrap().len(), 1);
    }
}
