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

//! In-process reference implementation of [`DhtClient`] (§6.1): an
//! `Arc<RwLock<HashMap<..>>>` table standing in for the overlay, suitable
//! for single-process integration tests and for driving the engine in the
//! absence of a real Kademlia implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DhtClient, DhtKey, ListenCallback, ListenHandle, ValueType};
use crate::error::AppResult;

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(t) => Instant::now() < t,
            None => true,
        }
    }
}

#[derive(Default)]
struct Inner {
    table: HashMap<DhtKey, Vec<StoredValue>>,
    listeners: HashMap<Uuid, (DhtKey, ListenCallback)>,
}

/// Single-process reference DHT. Cloning shares the same underlying table —
/// clone it freely to hand out to multiple simulated peers in a test.
#[derive(Clone)]
pub struct MemoryDht {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDht {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    async fn notify(&self, key: DhtKey) {
        let inner = self.inner.read().await;
        for (listen_key, callback) in inner.listeners.values() {
            if *listen_key == key {
                callback(key);
            }
        }
    }
}

#[async_trait]
impl DhtClient for MemoryDht {
    async fn put(
        &self,
        key: DhtKey,
        value: Vec<u8>,
        ttl_seconds: u64,
        value_type: ValueType,
    ) -> AppResult<Uuid> {
        let expires_at = match value_type {
            ValueType::Ephemeral => None,
            ValueType::Persist7Day | ValueType::Persist365Day => {
                Some(Instant::now() + Duration::from_secs(ttl_seconds))
            }
        };
        {
            let mut inner = self.inner.write().await;
            inner
                .table
                .entry(key)
                .or_default()
                .push(StoredValue { value, expires_at });
        }
        self.notify(key).await;
        Ok(Uuid::new_v4())
    }

    async fn get(&self, key: DhtKey) -> AppResult<Option<Vec<u8>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .table
            .get(&key)
            .and_then(|entries| entries.iter().rev().find(|e| e.is_live()))
            .map(|e| e.value.clone()))
    }

    async fn get_all(&self, key: DhtKey) -> AppResult<Vec<Vec<u8>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .table
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.is_live())
                    .map(|e| e.value.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn listen(&self, key: DhtKey, callback: ListenCallback) -> AppResult<ListenHandle> {
        let handle = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.listeners.insert(handle, (key, callback));
        Ok(ListenHandle(handle))
    }

    async fn cancel_listen(&self, handle: ListenHandle) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.listeners.remove(&handle.0);
        Ok(())
    }

    async fn delete(&self, key: DhtKey, _signed_tombstone: Vec<u8>) -> AppResult<()> {
        {
            let mut inner = self.inner.write().await;
            inner.table.remove(&key);
        }
        self.notify(key).await;
        Ok(())
    }
}
