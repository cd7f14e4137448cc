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

//! Contact & keyserver (§4.5): publishes and resolves
//! `fingerprint → {kem_pk, dsa_pk, name}` records, with a short-TTL
//! in-memory cache and first-writer-wins name registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::dht::{truncated_key, DhtClient, ValueType};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityRecord};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// §4.4: EPHEMERAL/PERSIST cells don't apply to keyserver records; they are
/// long-lived like group metadata, so persisted for the longest TTL class.
const KEYSERVER_TTL_SECONDS: u64 = 365 * 24 * 3600;

struct CacheEntry {
    record: IdentityRecord,
    cached_at: Instant,
}

/// DHT-backed directory of identity records, addressable by fingerprint or
/// by registered display name.
pub struct Keyserver<D: DhtClient> {
    dht: Arc<D>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

fn name_key(name: &str) -> [u8; 32] {
    let mut input = Vec::with_capacity(5 + name.len());
    input.extend_from_slice(b"name:");
    input.extend_from_slice(name.as_bytes());
    truncated_key(&input)
}

fn fingerprint_key(fingerprint: &Fingerprint) -> [u8; 32] {
    let mut input = Vec::with_capacity(3 + 128);
    input.extend_from_slice(b"fp:");
    input.extend_from_slice(fingerprint.as_str().as_bytes());
    truncated_key(&input)
}

impl<D: DhtClient> Keyserver<D> {
    pub fn new(dht: Arc<D>) -> Self {
        Self {
            dht,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Publish `record` under both the reverse (`fp:`) and, if a display
    /// name is set, the forward (`name:`) key. Name registration is
    /// first-writer-wins: a conflicting name already bound to a different
    /// fingerprint is rejected with `AlreadyExists` (§4.5).
    pub async fn publish_identity(&self, record: &IdentityRecord) -> AppResult<()> {
        record.verify()?;

        if let Some(name) = &record.display_name {
            let key = name_key(name);
            if let Some(existing) = self.dht.get(key).await? {
                let existing: IdentityRecord = serde_json::from_slice(&existing)
                    .map_err(|e| AppError::Internal(format!("decoding existing name record: {e}")))?;
                if existing.fingerprint != record.fingerprint {
                    return Err(AppError::AlreadyExists(format!("name '{name}' already registered")));
                }
            }
            let bytes = serde_json::to_vec(record)
                .map_err(|e| AppError::Internal(format!("encoding identity record: {e}")))?;
            self.dht
                .put(key, bytes, KEYSERVER_TTL_SECONDS, ValueType::Persist365Day)
                .await?;
        }

        let bytes = serde_json::to_vec(record)
            .map_err(|e| AppError::Internal(format!("encoding identity record: {e}")))?;
        self.dht
            .put(
                fingerprint_key(&record.fingerprint),
                bytes,
                KEYSERVER_TTL_SECONDS,
                ValueType::Persist365Day,
            )
            .await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            record.fingerprint.as_str().to_string(),
            CacheEntry {
                record: record.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Resolve `identifier` — treated as a fingerprint if it is 128 hex
    /// characters, otherwise as a registered name (§4.5).
    pub async fn resolve(&self, identifier: &str) -> AppResult<IdentityRecord> {
        if Fingerprint::is_fingerprint_like(identifier) {
            if let Some(cached) = self.cached(identifier).await {
                return Ok(cached);
            }
            let key = fingerprint_key(&Fingerprint::parse(identifier)?);
            let bytes = self
                .dht
                .get(key)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("no identity for fingerprint {identifier}")))?;
            let record: IdentityRecord = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding identity record: {e}")))?;
            record.verify()?;
            self.cache.write().await.insert(
                record.fingerprint.as_str().to_string(),
                CacheEntry {
                    record: record.clone(),
                    cached_at: Instant::now(),
                },
            );
            Ok(record)
        } else {
            let key = name_key(identifier);
            let bytes = self
                .dht
                .get(key)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("no identity registered for name {identifier}")))?;
            let record: IdentityRecord = serde_json::from_slice(&bytes)
                .map_err(|e| AppError::Internal(format!("decoding identity record: {e}")))?;
            record.verify()?;
            Ok(record)
        }
    }

    async fn cached(&self, fingerprint: &str) -> Option<IdentityRecord> {
        let cache = self.cache.read().await;
        cache.get(fingerprint).and_then(|entry| {
            if entry.cached_at.elapsed() < CACHE_TTL {
                Some(entry.record.clone())
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsa_keypair_from_seed, kem_keypair};
    use crate::dht::memory::MemoryDht;
    use crate::identity::IdentityKeys;

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
    async fn publish_then_resolve_by_fingerprint() {
        let dht = Arc::new(MemoryDht::new());
        let keyserver = Keyserver::new(dht);
        let keys = sample_keys(1);
        let record = IdentityRecord::new(&keys, Some("alice".into()), 1).unwrap();
        keyserver.publish_identity(&record).await.unwrap();
        let resolved = keyserver.resolve(keys.fingerprint.as_str()).await.unwrap();
        assert_eq!(resolved.fingerprint, keys.fingerprint);
    }

    #[tokio::test]
    async fn publish_then_resolve_by_name() {
        let dht = Arc::new(MemoryDht::new());
        let keyserver = Keyserver::new(dht);
        let keys = sample_keys(2);
        let record = IdentityRecord::new(&keys, Some("bob".into()), 1).unwrap();
        keyserver.publish_identity(&record).await.unwrap();
        let resolved = keyserver.resolve("bob").await.unwrap();
        assert_eq!(resolved.fingerprint, keys.fingerprint);
    }

    #[tokio::test]
    async fn conflicting_name_registration_is_rejected() {
        let dht = Arc::new(MemoryDht::new());
        let keyserver = Keyserver::new(dht);
        let alice = sample_keys(3);
        let bob = sample_keys(4);
        let alice_record = IdentityRecord::new(&alice, Some("shared-name".into()), 1).unwrap();
        keyserver.publish_identity(&alice_record).await.unwrap();
        let bob_record = IdentityRecord::new(&bob, Some("shared-name".into()), 2).unwrap();
        let err = keyserver.publish_identity(&bob_record).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn resolve_unknown_fingerprint_fails() {
        let dht = Arc::new(MemoryDht::new());
        let keyserver = Keyserver::new(dht);
        let unknown = "a".repeat(128);
        assert!(keyserver.resolve(&unknown).await.is_err());
    }
}
