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

//! Group state (§4.7): metadata lifecycle, signed by the creator only, plus
//! the GEK/IKP engine ([`gek`]) and the group feed-outbox ([`feed`]) it
//! drives.

pub mod feed;
pub mod gek;
pub mod invite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contact::Keyserver;
use crate::crypto::{dsa_sign, dsa_verify, DsaPublicKey, DsaSignature};
use crate::dht::{truncated_key, DhtClient, DhtKey, ValueType};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityKeys};
use crate::store::groups::GroupMetadataRow;
use crate::store::GroupStore;

/// §3 "Group metadata (DHT)": long-lived, re-published on every mutation.
const METADATA_TTL_SECONDS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub group_uuid: String,
    pub name: String,
    pub description: String,
    pub creator_fingerprint: Fingerprint,
    pub members: Vec<Fingerprint>,
    pub created_at: u64,
    pub gek_version: u32,
    pub signature: Vec<u8>,
}

impl GroupMetadata {
    fn signed_fields(
        group_uuid: &str,
        name: &str,
        description: &str,
        creator_fingerprint: &Fingerprint,
        members: &[Fingerprint],
        created_at: u64,
        gek_version: u32,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(group_uuid.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(description.as_bytes());
        buf.extend_from_slice(creator_fingerprint.as_str().as_bytes());
        for member in members {
            buf.extend_from_slice(member.as_str().as_bytes());
        }
        buf.extend_from_slice(&created_at.to_le_bytes());
        buf.extend_from_slice(&gek_version.to_le_bytes());
        buf
    }

    fn new_signed(
        group_uuid: String,
        name: String,
        description: String,
        creator: &IdentityKeys,
        members: Vec<Fingerprint>,
        created_at: u64,
        gek_version: u32,
    ) -> AppResult<Self> {
        let msg = Self::signed_fields(
            &group_uuid,
            &name,
            &description,
            &creator.fingerprint,
            &members,
            created_at,
            gek_version,
        );
        let signature = dsa_sign(&msg, &creator.dsa_sk)?;
        Ok(Self {
            group_uuid,
            name,
            description,
            creator_fingerprint: creator.fingerprint.clone(),
            members,
            created_at,
            gek_version,
            signature: signature.0,
        })
    }

    /// Invariant (§8.4): only the creator's signature is accepted.
    fn verify(&self, creator_dsa_pk: &DsaPublicKey) -> AppResult<()> {
        let msg = Self::signed_fields(
            &self.group_uuid,
            &self.name,
            &self.description,
            &self.creator_fingerprint,
            &self.members,
            self.created_at,
            self.gek_version,
        );
        if !dsa_verify(&msg, &DsaSignature(self.signature.clone()), creator_dsa_pk) {
            return Err(AppError::CryptoFailure);
        }
        Ok(())
    }

    fn into_row(self, local_id: i64) -> GroupMetadataRow {
        GroupMetadataRow {
            local_id,
            group_uuid: self.group_uuid,
            name: self.name,
            description: self.description,
            creator_fingerprint: self.creator_fingerprint.as_str().to_string(),
            members: self.members.iter().map(|m| m.as_str().to_string()).collect(),
            created_at: self.created_at as i64,
            gek_version: self.gek_version,
            signature: self.signature,
        }
    }
}

pub fn metadata_key(group_uuid: &str) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(b"group:");
    input.extend_from_slice(group_uuid.as_bytes());
    truncated_key(&input)
}

pub fn new_group_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Orchestrates group metadata mutation, rotating the GEK/IKP on every
/// membership change (§4.7 "Add/remove member ... invokes 4.8").
pub struct GroupService<D: DhtClient> {
    dht: Arc<D>,
    groups: Arc<GroupStore>,
    keyserver: Arc<Keyserver<D>>,
}

impl<D: DhtClient> GroupService<D> {
    pub fn new(dht: Arc<D>, groups: Arc<GroupStore>, keyserver: Arc<Keyserver<D>>) -> Self {
        Self { dht, groups, keyserver }
    }

    async fn publish_metadata(&self, metadata: &GroupMetadata) -> AppResult<()> {
        let bytes = bincode::serialize(metadata)
            .map_err(|e| AppError::Internal(format!("encoding group metadata: {e}")))?;
        self.dht
            .put(metadata_key(&metadata.group_uuid), bytes, METADATA_TTL_SECONDS, ValueType::Persist365Day)
            .await?;
        Ok(())
    }

    async fn resolve_member_kem_pks(
        &self,
        members: &[Fingerprint],
    ) -> AppResult<Vec<(Fingerprint, crate::crypto::KemPublicKey)>> {
        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let record = self.keyserver.resolve(member.as_str()).await?;
            out.push((member.clone(), record.kem_public_key));
        }
        Ok(out)
    }

    /// §4.7 "Group create": random UUID, `gek_version=0`, signed metadata
    /// put, then GEK v0 generated and its IKP published.
    pub async fn create_group(
        &self,
        creator: &IdentityKeys,
        name: &str,
        other_members: &[Fingerprint],
        now: u64,
    ) -> AppResult<String> {
        if other_members.iter().any(|m| m == &creator.fingerprint) {
            return Err(AppError::BadInput("invitation to self".into()));
        }
        let group_uuid = new_group_uuid();
        let mut members = vec![creator.fingerprint.clone()];
        members.extend(other_members.iter().cloned());

        let metadata = GroupMetadata::new_signed(
            group_uuid.clone(),
            name.to_string(),
            String::new(),
            creator,
            members.clone(),
            now,
            0,
        )?;
        self.publish_metadata(&metadata).await?;
        self.groups.upsert_group(&metadata.clone().into_row(0)).await?;

        let member_kem_pks = self.resolve_member_kem_pks(&members).await?;
        let (gek, ikp_bytes) =
            gek::rotate(&group_uuid, 0, creator, &member_kem_pks)?;
        self.dht
            .put(gek::ikp_key(&group_uuid, 0), ikp_bytes, METADATA_TTL_SECONDS, ValueType::Persist365Day)
            .await?;
        self.groups.store_gek(&group_uuid, 0, &gek).await?;
        Ok(group_uuid)
    }

    /// §4.7 "Add/remove member": creator-only mutation, re-signed, then a
    /// fresh GEK rotation at the incremented version (§4.8 "Rotation policy:
    /// on every add and every remove").
    async fn mutate_members(
        &self,
        creator: &IdentityKeys,
        group_uuid: &str,
        new_members: Vec<Fingerprint>,
        now: u64,
    ) -> AppResult<u32> {
        let current = self
            .groups
            .get_group(group_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown group {group_uuid}")))?;
        if current.creator_fingerprint != creator.fingerprint.as_str() {
            return Err(AppError::Unauthorized("only the creator may mutate group membership".into()));
        }
        let next_version = current.gek_version + 1;
        let metadata = GroupMetadata::new_signed(
            group_uuid.to_string(),
            current.name,
            current.description,
            creator,
            new_members.clone(),
            now,
            next_version,
        )?;
        self.publish_metadata(&metadata).await?;
        self.groups
            .upsert_group(&metadata.clone().into_row(current.local_id))
            .await?;

        let member_kem_pks = self.resolve_member_kem_pks(&new_members).await?;
        let (gek, ikp_bytes) = gek::rotate(group_uuid, next_version, creator, &member_kem_pks)?;
        self.dht
            .put(
                gek::ikp_key(group_uuid, next_version),
                ikp_bytes,
                METADATA_TTL_SECONDS,
                ValueType::Persist365Day,
            )
            .await?;
        self.groups.store_gek(group_uuid, next_version, &gek).await?;
        Ok(next_version)
    }

    pub async fn add_member(
        &self,
        creator: &IdentityKeys,
        group_uuid: &str,
        new_member: Fingerprint,
        now: u64,
    ) -> AppResult<u32> {
        let current = self
            .groups
            .get_group(group_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown group {group_uuid}")))?;
        if current.members.iter().any(|m| m == new_member.as_str()) {
            return Err(AppError::AlreadyExists("already a member".into()));
        }
        let mut members: Vec<Fingerprint> = current
            .members
            .iter()
            .map(|m| Fingerprint::parse(m))
            .collect::<AppResult<_>>()?;
        members.push(new_member);
        self.mutate_members(creator, group_uuid, members, now).await
    }

    pub async fn remove_member(
        &self,
        creator: &IdentityKeys,
        group_uuid: &str,
        member: &Fingerprint,
        now: u64,
    ) -> AppResult<u32> {
        if member == &creator.fingerprint {
            return Err(AppError::Unauthorized(
                "creator may only leave by deleting the group".into(),
            ));
        }
        let current = self
            .groups
            .get_group(group_uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown group {group_uuid}")))?;
        let members: Vec<Fingerprint> = current
            .members
            .iter()
            .filter(|m| *m != member.as_str())
            .map(|m| Fingerprint::parse(m))
            .collect::<AppResult<_>>()?;
        self.mutate_members(creator, group_uuid, members, now).await
    }

    /// Fetch, verify, and cache the metadata cell's current value (driven by
    /// the engine's listener on the group metadata cell, §4.7 "Other members
    /// learn of the change via a listener").
    pub async fn refresh_metadata(&self, group_uuid: &str) -> AppResult<GroupMetadata> {
        let bytes = self
            .dht
            .get(metadata_key(group_uuid))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no metadata for group {group_uuid}")))?;
        let metadata: GroupMetadata = bincode::deserialize(&bytes)
            .map_err(|e| AppError::Internal(format!("decoding group metadata: {e}")))?;
        let creator_record = self.keyserver.resolve(metadata.creator_fingerprint.as_str()).await?;
        metadata.verify(&creator_record.dsa_public_key)?;

        if let Some(existing) = self.groups.get_group(group_uuid).await? {
            if metadata.gek_version < existing.gek_version {
                return Err(AppError::Internal("group metadata version went backwards".into()));
            }
            self.groups
                .upsert_group(&metadata.clone().into_row(existing.local_id))
                .await?;
        } else {
            self.groups.upsert_group(&metadata.clone().into_row(0)).await?;
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{dsa_keypair_from_seed, kem_keypair};
    use crate::dht::memory::MemoryDht;
    use crate::identity::IdentityRecord;

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

    async fn publish(keyserver: &Keyserver<MemoryDht>, keys: &IdentityKeys) {
        let record = IdentityRecord::new(keys, None, 1).unwrap();
        keyserver.publish_identity(&record).await.unwrap();
    }

    #[tokio::test]
    async fn create_group_publishes_metadata_and_gek_v0() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let groups = Arc::new(GroupStore::open(&dir.path().join("groups.db")).unwrap());
        let keyserver = Arc::new(Keyserver::new(dht.clone()));
        let service = GroupService::new(dht, groups.clone(), keyserver.clone());

        let alice = sample_keys(1);
        let bob = sample_keys(2);
        publish(&keyserver, &alice).await;
        publish(&keyserver, &bob).await;

        let group_uuid = service
            .create_group(&alice, "G1", &[bob.fingerprint.clone()], 1000)
            .await
            .unwrap();
        let row = groups.get_group(&group_uuid).await.unwrap().unwrap();
        assert_eq!(row.gek_version, 0);
        assert_eq!(row.members.len(), 2);
        assert!(groups.get_gek(&group_uuid, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn add_member_rotates_gek_version() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let groups = Arc::new(GroupStore::open(&dir.path().join("groups.db")).unwrap());
        let keyserver = Arc::new(Keyserver::new(dht.clone()));
        let service = GroupService::new(dht, groups.clone(), keyserver.clone());

        let alice = sample_keys(3);
        let bob = sample_keys(4);
        let carol = sample_keys(5);
        publish(&keyserver, &alice).await;
        publish(&keyserver, &bob).await;
        publish(&keyserver, &carol).await;

        let group_uuid = service.create_group(&alice, "G1", &[bob.fingerprint.clone()], 1000).await.unwrap();
        let new_version = service
            .add_member(&alice, &group_uuid, carol.fingerprint.clone(), 2000)
            .await
            .unwrap();
        assert_eq!(new_version, 1);
        let row = groups.get_group(&group_uuid).await.unwrap().unwrap();
        assert_eq!(row.members.len(), 3);
        assert!(groups.get_gek(&group_uuid, 1).await.unwrap().is_some());
        assert!(groups.get_gek(&group_uuid, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removing_creator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let groups = Arc::new(GroupStore::open(&dir.path().join("groups.db")).unwrap());
        let keyserver = Arc::new(Keyserver::new(dht.clone()));
        let service = GroupService::new(dht, groups.clone(), keyserver.clone());
        let alice = sample_keys(6);
        let bob = sample_keys(7);
        publish(&keyserver, &alice).await;
        publish(&keyserver, &bob).await;
        let group_uuid = service.create_group(&alice, "G1", &[bob.fingerprint.clone()], 1).await.unwrap();
        let err = service
            .remove_member(&alice, &group_uuid, &alice.fingerprint.clone(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn adding_existing_member_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dht = Arc::new(MemoryDht::new());
        let groups = Arc::new(GroupStore::open(&dir.path().join("groups.db")).unwrap());
        let keyserver = Arc::new(Keyserver::new(dht.clone()));
        let service = GroupService::new(dht, groups.clone(), keyserver.clone());
        let alice = sample_keys(8);
        let bob = sample_keys(9);
        publish(&keyserver, &alice).await;
        publish(&keyserver, &bob).await;
        let group_uuid = service.create_group(&alice, "G1", &[bob.fingerprint.clone()], 1).await.unwrap();
        let err = service
            .add_member(&alice, &group_uuid, bob.fingerprint.clone(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }
}
