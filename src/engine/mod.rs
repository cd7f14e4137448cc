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

//! Engine orchestrator (§4.10, §5, §6): the one place that owns every
//! stateful service and implements the Host API surface. DHT `listen`
//! callbacks are synchronous and must never block the DHT worker, so they
//! just drop a [`ListenerKey`] onto an unbounded channel; a dedicated worker
//! task drains that channel and does the real (async) receive/verify work.
//! A second background task runs the 4-minute heartbeat: day-bucket
//! listener rotation, PENDING-message retries, stale marking, and a
//! presence refresh.

pub mod events;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::contact::Keyserver;
use crate::dht::memory::MemoryDht;
use crate::dht::{DhtClient, DhtKey, ListenHandle};
use crate::error::{AppError, AppResult};
use crate::group::feed::GroupFeed;
use crate::group::{self, gek, invite, GroupService};
use crate::identity::{self, Fingerprint, IdentityKeys, IdentityLock, IdentityRecord};
use crate::outbox::{self, DirectOutbox};
use crate::store::groups::Invitation;
use crate::store::messages::{Message, MessageStatus};
use crate::store::{GroupStore, MessageStore};

pub use events::{EngineEvent, EventListener};

/// §4.10 "Heartbeat".
const HEARTBEAT_INTERVAL_SECS: u64 = 4 * 60;
/// A contact counts as online if their last watermark ack is newer than
/// this — two heartbeat periods of slack.
const PRESENCE_FRESH_SECONDS: u64 = 2 * HEARTBEAT_INTERVAL_SECS;

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub fingerprint: Fingerprint,
    pub display_name: Option<String>,
    pub added_at: i64,
}

#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub group_uuid: String,
    pub name: String,
    pub members: Vec<String>,
    pub gek_version: u32,
}

#[derive(Debug, Clone)]
pub struct InvitationSummary {
    pub group_uuid: String,
    pub name: String,
    pub creator_fingerprint: String,
    pub received_at: i64,
}

/// A tracked DHT subscription, doubling as the payload sent over the wake
/// channel when its key changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ListenerKey {
    DirectOutbox(Fingerprint),
    Watermark(Fingerprint),
    GroupMetadata(String),
    GroupFeed(String),
    Invitations,
}

struct TrackedListener {
    handle: ListenHandle,
    /// `Some` for listeners on a day-bucketed cell (outbox, feed); those get
    /// rearmed at the new bucket's key every time the day rolls over.
    day_bucket: Option<u64>,
}

struct EngineInner<D: DhtClient> {
    data_dir: PathBuf,
    #[allow(dead_code)]
    config: Config,
    dht: Arc<D>,
    keyserver: Arc<Keyserver<D>>,
    messages: Arc<MessageStore>,
    groups: Arc<GroupStore>,
    outbox: Arc<DirectOutbox<D>>,
    group_service: Arc<GroupService<D>>,
    group_feed: Arc<GroupFeed<D>>,
    identity: RwLock<Option<Arc<IdentityKeys>>>,
    identity_lock: Mutex<Option<IdentityLock>>,
    listeners: Mutex<HashMap<ListenerKey, TrackedListener>>,
    presence: Mutex<HashMap<String, bool>>,
    request_counter: AtomicU64,
    event_listener: RwLock<Option<EventListener>>,
    wake_tx: mpsc::UnboundedSender<ListenerKey>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
    wake_handle: Mutex<Option<JoinHandle<()>>>,
}

/// One running instance of the messenger (§4.10). Cheap to clone — it's a
/// handle around a shared `Arc<EngineInner<D>>`.
pub struct Engine<D: DhtClient> {
    inner: Arc<EngineInner<D>>,
}

impl<D: DhtClient> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<D: DhtClient> std::fmt::Debug for Engine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("data_dir", &self.inner.data_dir).finish()
    }
}

impl Engine<MemoryDht> {
    /// Convenience constructor for tests and for hosts that have no real
    /// overlay wired up yet — backed by the in-process reference DHT.
    pub async fn create_in_memory(data_dir: impl Into<PathBuf>) -> AppResult<Self> {
        Self::create(data_dir, Arc::new(MemoryDht::new())).await
    }
}

impl<D: DhtClient + 'static> Engine<D> {
    /// §6 "create": bring up every local service against `data_dir`, but do
    /// not touch an identity yet — that's [`Engine::load_identity`].
    pub async fn create(data_dir: impl Into<PathBuf>, dht: Arc<D>) -> AppResult<Self> {
        let data_dir = data_dir.into();
        let config = Config::load_or_init(&data_dir)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let messages = Arc::new(MessageStore::open(&data_dir.join("messages.db"))?);
        let groups = Arc::new(GroupStore::open(&data_dir.join("groups.db"))?);
        let keyserver = Arc::new(Keyserver::new(dht.clone()));
        let outbox = Arc::new(DirectOutbox::new(dht.clone(), messages.clone()));
        let group_service = Arc::new(GroupService::new(dht.clone(), groups.clone(), keyserver.clone()));
        let group_feed = Arc::new(GroupFeed::new(dht.clone(), groups.clone(), messages.clone(), keyserver.clone()));
        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(EngineInner {
            data_dir,
            config,
            dht,
            keyserver,
            messages,
            groups,
            outbox,
            group_service,
            group_feed,
            identity: RwLock::new(None),
            identity_lock: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            request_counter: AtomicU64::new(0),
            event_listener: RwLock::new(None),
            wake_tx,
            heartbeat_handle: Mutex::new(None),
            wake_handle: Mutex::new(None),
        });

        let engine = Self { inner };
        let wake_engine = engine.clone();
        let wake_handle = tokio::spawn(async move {
            while let Some(signal) = wake_rx.recv().await {
                wake_engine.handle_wake(signal).await;
            }
        });
        *engine.inner.wake_handle.lock().await = Some(wake_handle);
        Ok(engine)
    }

    /// §6 "destroy": stop the background tasks and release the identity
    /// lock. The local databases and DHT handle are simply dropped with the
    /// last clone of this engine.
    pub async fn destroy(self) -> AppResult<()> {
        if let Some(handle) = self.inner.heartbeat_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.wake_handle.lock().await.take() {
            handle.abort();
        }
        self.inner.identity_lock.lock().await.take();
        Ok(())
    }

    pub async fn set_event_listener(&self, listener: Option<EventListener>) {
        *self.inner.event_listener.write().await = listener;
    }

    async fn emit(&self, event: EngineEvent) {
        let listener = self.inner.event_listener.read().await.clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    async fn current_identity(&self) -> AppResult<Arc<IdentityKeys>> {
        self.inner
            .identity
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::BadInput("no identity loaded".into()))
    }

    /// §6 "create_identity": derive keys from two independent seeds and
    /// write the encrypted key files, without loading them into the engine.
    pub async fn create_identity(
        &self,
        signing_seed: &[u8; 32],
        encryption_seed: &[u8; 32],
        password: &str,
    ) -> AppResult<Fingerprint> {
        let keys = identity::create_identity(&self.inner.data_dir, signing_seed, encryption_seed, password).await?;
        Ok(keys.fingerprint)
    }

    /// §6 "load_identity": decrypt the on-disk identity, take the process
    /// lock, arm every listener a loaded identity needs, and start the
    /// heartbeat. `fingerprint` must match the identity on disk — a data
    /// directory holds exactly one identity (§4.2).
    pub async fn load_identity(&self, fingerprint: &Fingerprint, password: &str) -> AppResult<()> {
        let keys = identity::load_identity(&self.inner.data_dir, password).await?;
        if &keys.fingerprint != fingerprint {
            return Err(AppError::BadInput("fingerprint does not match the identity on disk".into()));
        }
        let lock = IdentityLock::try_acquire(&self.inner.data_dir)?;
        *self.inner.identity_lock.lock().await = Some(lock);
        *self.inner.identity.write().await = Some(Arc::new(keys));

        self.arm_all_listeners().await?;
        self.start_heartbeat().await;
        self.emit(EngineEvent::IdentityLoaded {
            fingerprint: fingerprint.as_str().to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn register_name(&self, name: &str) -> AppResult<()> {
        let identity = self.current_identity().await?;
        let record = IdentityRecord::new(&identity, Some(name.to_string()), now_unix())?;
        self.inner.keyserver.publish_identity(&record).await
    }

    pub async fn get_display_name(&self, fp: &Fingerprint) -> AppResult<Option<String>> {
        match self.inner.keyserver.resolve(fp.as_str()).await {
            Ok(record) => Ok(record.display_name),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `identifier` is resolved via the keyserver (fingerprint or name)
    /// before being recorded, so a bad name can never be added as a contact.
    pub async fn add_contact(&self, identifier: &str) -> AppResult<Fingerprint> {
        let record = self.inner.keyserver.resolve(identifier).await?;
        self.inner.groups.add_contact(record.fingerprint.as_str(), now_unix() as i64).await?;
        self.arm_contact_listeners(&record.fingerprint).await?;
        Ok(record.fingerprint)
    }

    pub async fn remove_contact(&self, fp: &Fingerprint) -> AppResult<()> {
        self.inner.groups.remove_contact(fp.as_str()).await?;
        self.cancel_contact_listeners(fp).await;
        Ok(())
    }

    pub async fn get_contacts(&self) -> AppResult<Vec<Contact>> {
        let rows = self.inner.groups.list_contacts().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let fingerprint = Fingerprint::parse(&row.fingerprint)?;
            let display_name = self.get_display_name(&fingerprint).await.unwrap_or(None);
            out.push(Contact {
                fingerprint,
                display_name,
                added_at: row.added_at,
            });
        }
        Ok(out)
    }

    /// §6 "send_message": returns immediately with an opaque request id; the
    /// actual send runs in the background and reports its outcome as an
    /// [`EngineEvent::OutboxUpdated`] or [`EngineEvent::Error`].
    pub async fn send_message(&self, recipient_fp: &Fingerprint, plaintext: &str) -> AppResult<u64> {
        let identity = self.current_identity().await?;
        let recipient_record = self.inner.keyserver.resolve(recipient_fp.as_str()).await?;
        let request_id = self.inner.request_counter.fetch_add(1, Ordering::SeqCst);

        let outbox = self.inner.outbox.clone();
        let recipient_fp = recipient_fp.clone();
        let plaintext = plaintext.to_string();
        let now = now_unix();
        let engine = self.clone();
        tokio::spawn(async move {
            let result = outbox
                .send(&identity, &recipient_fp, &recipient_record.kem_public_key, &plaintext, now)
                .await;
            match result {
                Ok(()) => {
                    engine
                        .emit(EngineEvent::OutboxUpdated {
                            contact_fingerprint: recipient_fp.as_str().to_string(),
                        })
                        .await;
                }
                Err(e) => {
                    engine.emit(EngineEvent::Error { message: e.to_string() }).await;
                }
            }
        });
        Ok(request_id)
    }

    /// §6 "get_conversation": one unified lookup keyed by whatever the
    /// caller is asking about — a contact's fingerprint for a direct
    /// conversation, or a group's UUID for its feed, since the local store
    /// indexes both under the same string column (§4.9 stores group
    /// messages with `recipient = group_uuid`).
    pub async fn get_conversation(&self, conversation_key: &str) -> AppResult<Vec<Message>> {
        self.inner.messages.get_conversation(conversation_key).await
    }

    /// §6 "create_group": also delivers a signed invitation to every other
    /// member over their invitation cell, since a brand-new member has no
    /// other way to learn the group's UUID (an Open Question in the
    /// original design: resolved by piggy-backing on the same per-recipient
    /// append-cell shape as the outbox and feed, see [`invite`]).
    pub async fn create_group(&self, name: &str, other_members: &[Fingerprint]) -> AppResult<String> {
        let identity = self.current_identity().await?;
        let now = now_unix();
        let group_uuid = self.inner.group_service.create_group(&identity, name, other_members, now).await?;
        for member in other_members {
            if let Err(e) = invite::publish_invitation(self.inner.dht.as_ref(), member, &group_uuid, name, &identity, now).await {
                tracing::warn!(cause = %e, member = %member, "failed to deliver group invitation");
            }
        }
        self.arm_group_listeners(&group_uuid).await?;
        Ok(group_uuid)
    }

    pub async fn add_group_member(&self, group_uuid: &str, new_member: Fingerprint) -> AppResult<u32> {
        let identity = self.current_identity().await?;
        let now = now_unix();
        let version = self
            .inner
            .group_service
            .add_member(&identity, group_uuid, new_member.clone(), now)
            .await?;
        if let Some(row) = self.inner.groups.get_group(group_uuid).await? {
            if let Err(e) = invite::publish_invitation(self.inner.dht.as_ref(), &new_member, group_uuid, &row.name, &identity, now).await {
                tracing::warn!(cause = %e, "failed to deliver group invitation to new member");
            }
        }
        Ok(version)
    }

    pub async fn remove_group_member(&self, group_uuid: &str, member: &Fingerprint) -> AppResult<u32> {
        let identity = self.current_identity().await?;
        let now = now_unix();
        self.inner.group_service.remove_member(&identity, group_uuid, member, now).await
    }

    pub async fn send_group_message(&self, group_uuid: &str, plaintext: &str) -> AppResult<()> {
        let identity = self.current_identity().await?;
        let row = self
            .inner
            .groups
            .get_group(group_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown group {group_uuid}")))?;
        let gek = self
            .inner
            .groups
            .get_gek(group_uuid, row.gek_version)
            .await?
            .ok_or_else(|| AppError::Internal("missing current GEK for group".into()))?;
        let now_ms = now_unix() * 1000;
        self.inner
            .group_feed
            .send(&identity, group_uuid, row.gek_version, &gek, plaintext.as_bytes(), now_ms)
            .await
    }

    pub async fn get_groups(&self) -> AppResult<Vec<GroupSummary>> {
        let rows = self.inner.groups.list_groups().await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupSummary {
                group_uuid: r.group_uuid,
                name: r.name,
                members: r.members,
                gek_version: r.gek_version,
            })
            .collect())
    }

    pub async fn get_invitations(&self) -> AppResult<Vec<InvitationSummary>> {
        let rows = self.inner.groups.list_invitations().await?;
        Ok(rows
            .into_iter()
            .map(|r| InvitationSummary {
                group_uuid: r.group_uuid,
                name: r.name,
                creator_fingerprint: r.creator_fingerprint,
                received_at: r.received_at,
            })
            .collect())
    }

    /// §6 "accept_invitation": pull the group's current metadata and IKP,
    /// unwrap our GEK entry, and start listening on the group's cells. The
    /// KEM-decap/unwrap step is CPU-bound enough to offload to the blocking
    /// pool rather than run inline on the engine's async worker (§5 "CPU
    /// crypto pool").
    pub async fn accept_invitation(&self, group_uuid: &str) -> AppResult<()> {
        let identity = self.current_identity().await?;
        let metadata = self.inner.group_service.refresh_metadata(group_uuid).await?;
        let creator_record = self.inner.keyserver.resolve(metadata.creator_fingerprint.as_str()).await?;
        let ikp_bytes = self
            .inner
            .dht
            .get(gek::ikp_key(group_uuid, metadata.gek_version))
            .await?
            .ok_or_else(|| AppError::NotFound("no IKP published for the current GEK version".into()))?;

        let creator_dsa_pk = creator_record.dsa_public_key.clone();
        let member_identity = identity.clone();
        let gek_bytes = tokio::task::spawn_blocking(move || {
            gek::unwrap_for_member(&ikp_bytes, &creator_dsa_pk, &member_identity)
        })
        .await
        .map_err(|e| AppError::Internal(format!("IKP unwrap task panicked: {e}")))??;

        self.inner.groups.store_gek(group_uuid, metadata.gek_version, &gek_bytes).await?;
        self.inner.groups.remove_invitation(group_uuid).await?;
        self.arm_group_listeners(group_uuid).await?;
        Ok(())
    }

    pub async fn reject_invitation(&self, group_uuid: &str) -> AppResult<()> {
        self.inner.groups.remove_invitation(group_uuid).await
    }

    /// §6 "is_peer_online": derived from watermark freshness, not a live
    /// ping — this overlay has no connection-oriented presence primitive.
    pub async fn is_peer_online(&self, contact_fp: &Fingerprint) -> AppResult<bool> {
        let identity = self.current_identity().await?;
        let age = self
            .inner
            .outbox
            .watermark_age_seconds(&identity.fingerprint, contact_fp, now_unix())
            .await?;
        Ok(age.is_some_and(|a| a < PRESENCE_FRESH_SECONDS))
    }

    /// §6 "refresh_presence": recompute online/offline for every contact and
    /// emit an event for each one whose state actually changed.
    pub async fn refresh_presence(&self) -> AppResult<()> {
        let Some(identity) = self.inner.identity.read().await.clone() else {
            return Ok(());
        };
        let contacts = self.inner.groups.list_contacts().await?;
        let now = now_unix();
        let mut changed = Vec::new();
        {
            let mut presence = self.inner.presence.lock().await;
            for contact in &contacts {
                let Ok(fp) = Fingerprint::parse(&contact.fingerprint) else {
                    continue;
                };
                let age = self.inner.outbox.watermark_age_seconds(&identity.fingerprint, &fp, now).await?;
                let online = age.is_some_and(|a| a < PRESENCE_FRESH_SECONDS);
                let previous = presence.insert(contact.fingerprint.clone(), online);
                if previous != Some(online) {
                    changed.push((contact.fingerprint.clone(), online));
                }
            }
        }
        for (fingerprint, online) in changed {
            let event = if online {
                EngineEvent::ContactOnline(fingerprint)
            } else {
                EngineEvent::ContactOffline(fingerprint)
            };
            self.emit(event).await;
        }
        Ok(())
    }

    /// §6 "network_changed": cancel and re-arm every tracked listener. The
    /// in-memory reference DHT has no connection state to reset, so this is
    /// just a rearm sweep; a real overlay client would also recreate its
    /// worker pool here.
    pub async fn network_changed(&self) -> AppResult<()> {
        let keys: Vec<ListenerKey> = self.inner.listeners.lock().await.keys().cloned().collect();
        for key in keys {
            self.rearm_listener(key).await?;
        }
        Ok(())
    }

    fn listener_dht_key(&self, key: &ListenerKey, my_fingerprint: &Fingerprint, day: u64) -> (DhtKey, Option<u64>) {
        match key {
            ListenerKey::DirectOutbox(contact) => (outbox::outbox_cell_key(contact, my_fingerprint, day), Some(day)),
            ListenerKey::Watermark(contact) => (outbox::watermark_cell_key(contact, my_fingerprint), None),
            ListenerKey::GroupMetadata(group_uuid) => (group::metadata_key(group_uuid), None),
            ListenerKey::GroupFeed(group_uuid) => (group::feed::feed_key(group_uuid, day), Some(day)),
            ListenerKey::Invitations => (invite::invite_key(my_fingerprint), None),
        }
    }

    async fn arm_listener(&self, key: ListenerKey) -> AppResult<()> {
        let identity = self.current_identity().await?;
        let day = outbox::day_bucket(now_unix());
        let (dht_key, day_bucket) = self.listener_dht_key(&key, &identity.fingerprint, day);

        let wake_tx = self.inner.wake_tx.clone();
        let signal = key.clone();
        let handle = self
            .inner
            .dht
            .listen(
                dht_key,
                Arc::new(move |_changed_key| {
                    let _ = wake_tx.send(signal.clone());
                }),
            )
            .await?;
        self.inner.listeners.lock().await.insert(key, TrackedListener { handle, day_bucket });
        Ok(())
    }

    async fn rearm_listener(&self, key: ListenerKey) -> AppResult<()> {
        if let Some(tracked) = self.inner.listeners.lock().await.remove(&key) {
            let _ = self.inner.dht.cancel_listen(tracked.handle).await;
        }
        self.arm_listener(key).await
    }

    async fn arm_all_listeners(&self) -> AppResult<()> {
        self.arm_listener(ListenerKey::Invitations).await?;
        for contact in self.inner.groups.list_contacts().await? {
            if let Ok(fp) = Fingerprint::parse(&contact.fingerprint) {
                self.arm_contact_listeners(&fp).await?;
            }
        }
        for row in self.inner.groups.list_groups().await? {
            self.arm_group_listeners(&row.group_uuid).await?;
        }
        let identity = self.current_identity().await?;
        self.poll_invitations(&identity).await?;
        Ok(())
    }

    async fn arm_contact_listeners(&self, contact_fp: &Fingerprint) -> AppResult<()> {
        self.arm_listener(ListenerKey::DirectOutbox(contact_fp.clone())).await?;
        self.arm_listener(ListenerKey::Watermark(contact_fp.clone())).await?;

        // Catch up on anything already published before we started
        // listening (e.g. a contact added after the sender's message).
        let identity = self.current_identity().await?;
        let now = now_unix();
        let day = outbox::day_bucket(now);
        let new_count = self.inner.outbox.receive(&identity, contact_fp, day, now).await?;
        if new_count > 0 {
            self.emit(EngineEvent::MessageReceived {
                contact_fingerprint: contact_fp.as_str().to_string(),
                group_uuid: None,
            })
            .await;
        }
        Ok(())
    }

    async fn cancel_contact_listeners(&self, contact_fp: &Fingerprint) {
        for key in [ListenerKey::DirectOutbox(contact_fp.clone()), ListenerKey::Watermark(contact_fp.clone())] {
            if let Some(tracked) = self.inner.listeners.lock().await.remove(&key) {
                let _ = self.inner.dht.cancel_listen(tracked.handle).await;
            }
        }
    }

    async fn arm_group_listeners(&self, group_uuid: &str) -> AppResult<()> {
        self.arm_listener(ListenerKey::GroupMetadata(group_uuid.to_string())).await?;
        self.arm_listener(ListenerKey::GroupFeed(group_uuid.to_string())).await?;

        let day = outbox::day_bucket(now_unix());
        let new_count = self.inner.group_feed.receive(group_uuid, day).await?;
        if new_count > 0 {
            self.emit(EngineEvent::MessageReceived {
                contact_fingerprint: group_uuid.to_string(),
                group_uuid: Some(group_uuid.to_string()),
            })
            .await;
        }
        Ok(())
    }

    async fn tracked_day_bucket(&self, key: &ListenerKey) -> Option<u64> {
        self.inner.listeners.lock().await.get(key).and_then(|t| t.day_bucket)
    }

    async fn handle_wake(&self, signal: ListenerKey) {
        if let Err(e) = self.process_wake(signal).await {
            self.emit(EngineEvent::Error { message: e.to_string() }).await;
        }
    }

    async fn process_wake(&self, signal: ListenerKey) -> AppResult<()> {
        let identity = self.current_identity().await?;
        match signal {
            ListenerKey::DirectOutbox(contact) => {
                let day = self
                    .tracked_day_bucket(&ListenerKey::DirectOutbox(contact.clone()))
                    .await
                    .unwrap_or_else(|| outbox::day_bucket(now_unix()));
                let new_count = self.inner.outbox.receive(&identity, &contact, day, now_unix()).await?;
                if new_count > 0 {
                    self.emit(EngineEvent::MessageReceived {
                        contact_fingerprint: contact.as_str().to_string(),
                        group_uuid: None,
                    })
                    .await;
                }
            }
            ListenerKey::Watermark(contact) => {
                let record = self.inner.keyserver.resolve(contact.as_str()).await?;
                let updated = self
                    .inner
                    .outbox
                    .process_watermark_update(&identity.fingerprint, &contact, &record.dsa_public_key)
                    .await?;
                if updated > 0 {
                    self.emit(EngineEvent::OutboxUpdated {
                        contact_fingerprint: contact.as_str().to_string(),
                    })
                    .await;
                }
            }
            ListenerKey::GroupMetadata(group_uuid) => {
                self.inner.group_service.refresh_metadata(&group_uuid).await?;
            }
            ListenerKey::GroupFeed(group_uuid) => {
                let day = self
                    .tracked_day_bucket(&ListenerKey::GroupFeed(group_uuid.clone()))
                    .await
                    .unwrap_or_else(|| outbox::day_bucket(now_unix()));
                let new_count = self.inner.group_feed.receive(&group_uuid, day).await?;
                if new_count > 0 {
                    self.emit(EngineEvent::MessageReceived {
                        contact_fingerprint: group_uuid.clone(),
                        group_uuid: Some(group_uuid),
                    })
                    .await;
                }
            }
            ListenerKey::Invitations => {
                self.poll_invitations(&identity).await?;
            }
        }
        Ok(())
    }

    /// Surface any invitation addressed to us that we haven't already
    /// recorded locally or already joined. A stale entry that lingers in the
    /// DHT cell after we've accepted or rejected it (union-merge cells can't
    /// express deletion, see [`invite`]) is simply skipped here.
    async fn poll_invitations(&self, identity: &IdentityKeys) -> AppResult<()> {
        let pending = invite::fetch_invitations(self.inner.dht.as_ref(), &self.inner.keyserver, &identity.fingerprint).await?;
        let known: std::collections::HashSet<String> =
            self.inner.groups.list_invitations().await?.into_iter().map(|i| i.group_uuid).collect();
        let joined: std::collections::HashSet<String> =
            self.inner.groups.list_groups().await?.into_iter().map(|g| g.group_uuid).collect();
        let now = now_unix() as i64;

        for entry in pending {
            if known.contains(&entry.group_uuid) || joined.contains(&entry.group_uuid) {
                continue;
            }
            self.inner
                .groups
                .add_invitation(&Invitation {
                    group_uuid: entry.group_uuid.clone(),
                    name: entry.name.clone(),
                    creator_fingerprint: entry.creator_fingerprint.as_str().to_string(),
                    received_at: now,
                })
                .await?;
            self.emit(EngineEvent::GroupInvitationReceived {
                group_uuid: entry.group_uuid,
                name: entry.name,
                creator_fingerprint: entry.creator_fingerprint.as_str().to_string(),
            })
            .await;
        }
        Ok(())
    }

    async fn start_heartbeat(&self) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            interval.tick().await; // first tick is immediate; the arm-on-load catch-up already covered it
            loop {
                interval.tick().await;
                engine.heartbeat_tick().await;
            }
        });
        *self.inner.heartbeat_handle.lock().await = Some(handle);
    }

    async fn heartbeat_tick(&self) {
        if let Err(e) = self.run_heartbeat().await {
            self.emit(EngineEvent::Error { message: e.to_string() }).await;
        }
    }

    async fn run_heartbeat(&self) -> AppResult<()> {
        let Some(identity) = self.inner.identity.read().await.clone() else {
            return Ok(());
        };
        let now = now_unix();
        let today = outbox::day_bucket(now);

        let rolled_over: Vec<ListenerKey> = {
            let listeners = self.inner.listeners.lock().await;
            listeners
                .iter()
                .filter(|(_, t)| t.day_bucket.is_some_and(|b| b != today))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in rolled_over {
            self.rearm_listener(key).await?;
        }

        for message in self.inner.messages.pending_outgoing().await? {
            let (Ok(recipient_fp), Some(seq_num)) = (Fingerprint::parse(&message.recipient), message.offline_seq) else {
                continue;
            };
            let record = match self.inner.keyserver.resolve(recipient_fp.as_str()).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(cause = %e, "could not resolve recipient for a retry");
                    continue;
                }
            };
            if let Err(e) = self
                .inner
                .outbox
                .resend(
                    &identity,
                    &recipient_fp,
                    &record.kem_public_key,
                    &message.plaintext,
                    message.timestamp as u64,
                    seq_num as u64,
                )
                .await
            {
                tracing::warn!(cause = %e, "retry resend failed");
                let retries = self.inner.messages.increment_retry_count(message.id).await?;
                if retries >= outbox::MAX_SEND_RETRIES {
                    self.inner.messages.set_status(message.id, MessageStatus::Failed).await?;
                    self.emit(EngineEvent::Error {
                        message: format!("message to {recipient_fp} failed after {retries} retries"),
                    })
                    .await;
                }
            }
        }

        self.inner.messages.mark_stale_older_than(now as i64, outbox::STALE_AFTER_SECONDS).await?;
        self.refresh_presence().await?;
        Ok(())
    }
}
