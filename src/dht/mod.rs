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

//! DHT service contract (§4.4): the overlay is treated as a content-addressed
//! key-value store with put/get/listen primitives. `memory` ships the
//! in-process reference implementation that stands in for a Kademlia overlay
//! in this repository — Kademlia routing internals are out of scope.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::crypto::sha3_512;
use crate::error::AppResult;

pub type DhtKey = [u8; 32];

/// Every composite DHT key in this repository is `sha3-512(...)` truncated
/// to 32 bytes (§3, §9 open question 1 — the fingerprint itself is never
/// truncated, only the hash of the composite key).
pub fn truncated_key(input: &[u8]) -> DhtKey {
    let digest = sha3_512(input);
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

/// Replication/persistence class requested for a `put` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Ephemeral,
    Persist7Day,
    Persist365Day,
}

/// Fired when the overlay observes a change to a subscribed cell.
/// At-least-once: may fire spuriously (§4.4). The callback receives the key
/// that changed and is expected to re-`get`/`get_all` it.
pub type ListenCallback = std::sync::Arc<dyn Fn(DhtKey) + Send + Sync>;

/// Opaque handle returned by `listen`; must be passed to `cancel_listen` to
/// free the subscription. Dropping it without cancelling leaks the
/// subscription (§5 "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub Uuid);

#[async_trait]
pub trait DhtClient: Send + Sync {
    async fn put(
        &self,
        key: DhtKey,
        value: Vec<u8>,
        ttl_seconds: u64,
        value_type: ValueType,
    ) -> AppResult<Uuid>;

    async fn get(&self, key: DhtKey) -> AppResult<Option<Vec<u8>>>;

    /// All non-expired records published under `key`, for append-style
    /// cells with multiple publisher records (outbox, feed).
    async fn get_all(&self, key: DhtKey) -> AppResult<Vec<Vec<u8>>>;

    async fn listen(&self, key: DhtKey, callback: ListenCallback) -> AppResult<ListenHandle>;

    async fn cancel_listen(&self, handle: ListenHandle) -> AppResult<()>;

    async fn delete(&self, key: DhtKey, signed_tombstone: Vec<u8>) -> AppResult<()>;
}
