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

//! Invitation delivery (§4.11 engine extension): a per-recipient append-style
//! DHT cell carrying signed, pending group invitations, so a brand-new member
//! can discover a group whose UUID they have no other way of learning. Same
//! union-merge shape as the direct outbox and group feed cells.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::contact::Keyserver;
use crate::crypto::{dsa_sign, dsa_verify, DsaPublicKey, DsaSignature};
use crate::dht::{truncated_key, DhtClient, DhtKey, ValueType};
use crate::error::{AppError, AppResult};
use crate::identity::{Fingerprint, IdentityKeys};

const INVITE_TTL_SECONDS: u64 = 30 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationEntry {
    pub group_uuid: String,
    pub name: String,
    pub creator_fingerprint: Fingerprint,
    pub issued_at: u64,
    pub signature: Vec<u8>,
}

impl InvitationEntry {
    fn signed_fields(group_uuid: &str, name: &str, creator_fingerprint: &Fingerprint, issued_at: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(group_uuid.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(creator_fingerprint.as_str().as_bytes());
        buf.extend_from_slice(&issued_at.to_le_bytes());
        buf
    }

    fn verify(&self, creator_dsa_pk: &DsaPublicKey) -> AppResult<()> {
        let msg = Self::signed_fields(&self.group_uuid, &self.name, &self.creator_fingerprint, self.issued_at);
        if !dsa_verify(&msg, &DsaSignature(self.signature.clone()), creator_dsa_pk) {
            return Err(AppError::CryptoFailure);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InviteCellValue {
    entries: Vec<InvitationEntry>,
}

pub(crate) fn invite_key(recipient_fp: &Fingerprint) -> DhtKey {
    let mut input = Vec::new();
    input.extend_from_slice(b"invite:");
    input.extend_from_slice(recipient_fp.as_str().as_bytes());
    truncated_key(&input)
}

/// Merge-append a signed invitation for `recipient_fp`, keyed by
/// `group_uuid` so re-inviting after a removal just replaces the stale
/// entry rather than accumulating duplicates.
pub async fn publish_invitation<D: DhtClient>(
    dht: &D,
    recipient_fp: &Fingerprint,
    group_uuid: &str,
    name: &str,
    creator: &IdentityKeys,
    issued_at: u64,
) -> AppResult<()> {
    let msg = InvitationEntry::signed_fields(group_uuid, name, &creator.fingerprint, issued_at);
    let signature = dsa_sign(&msg, &creator.dsa_sk)?;
    let entry = InvitationEntry {
        group_uuid: group_uuid.to_string(),
        name: name.to_string(),
        creator_fingerprint: creator.fingerprint.clone(),
        issued_at,
        signature: signature.0,
    };

    let key = invite_key(recipient_fp);
    let mut merged: BTreeMap<String, InvitationEntry> = BTreeMap::new();
    for blob in dht.get_all(key).await? {
        if let Ok(cell) = bincode::deserialize::<InviteCellValue>(&blob) {
            for e in cell.entries {
                merged.insert(e.group_uuid.clone(), e);
            }
        }
    }
    merged.insert(entry.group_uuid.clone(), entry);
    let cell = InviteCellValue {
        entries: merged.into_values().collect(),
    };
    let bytes = bincode::serialize(&cell)
        .map_err(|e| AppError::Internal(format!("encoding invitation cell: {e}")))?;
    dht.put(key, bytes, INVITE_TTL_SECONDS, ValueType::Persist7Day).await?;
    Ok(())
}

/// Fetch and verify every still-pending invitation addressed to
/// `recipient_fp`. Entries that fail to verify under the claimed creator's
/// resolved DSA key are dropped rather than propagated (§7 "Propagation").
pub async fn fetch_invitations<D: DhtClient>(
    dht: &D,
    keyserver: &Keyserver<D>,
    recipient_fp: &Fingerprint,
) -> AppResult<Vec<InvitationEntry>> {
    let key = invite_key(recipient_fp);
    let mut by_group: BTreeMap<String, InvitationEntry> = BTreeMap::new();
    for blob in dht.get_all(key).await? {
        let Ok(cell) = bincode::deserialize::<InviteCellValue>(&blob) else {
            continue;
        };
        for entry in cell.entries {
            by_group.insert(entry.group_uuid.clone(), entry);
        }
    }
    let mut out = Vec::with_capacity(by_group.len());
    for entry in by_group.into_values() {
        let creator_record = match keyserver.resolve(entry.creator_fingerprint.as_str()).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(cause = %e, "dropping invitation with unresolvable creator");
                continue;
            }
        };
        if entry.verify(&creator_record.dsa_public_key).is_err() {
            tracing::warn!("dropping invitation with bad signature");
            continue;
        }
        out.push(entry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

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

    #[tokio::test]
    async fn publish_then_fetch_round_trips() {
        let dht = MemoryDht::new();
        let keyserver = Keyserver::new(Arc::new(dht.clone()));
        let creator = sample_keys(1);
        let bob = sample_keys(2);
        keyserver
            .publish_identity(&IdentityRecord::new(&creator, None, 1).unwrap())
            .await
            .unwrap();

        publish_invitation(&dht, &bob.fingerprint, "g1", "Team", &creator, 1000)
            .await
            .unwrap();
        let found = fetch_invitations(&dht, &keyserver, &bob.fingerprint).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_uuid, "g1");
    }

    #[tokio::test]
    async fn tampered_invitation_is_dropped() {
        let dht = MemoryDht::new();
        let keyserver = Keyserver::new(Arc::new(dht.clone()));
        let creator = sample_keys(3);
        let bob = sample_keys(4);
        keyserver
            .publish_identity(&IdentityRecord::new(&creator, None, 1).unwrap())
            .await
            .unwrap();
        publish_invitation(&dht, &bob.fingerprint, "g2", "Team", &creator, 1000)
            .await
            .unwrap();

        let key = invite_key(&bob.fingerprint);
        let mut blob = dht.get(key).await.unwrap().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        dht.put(key, blob, INVITE_TTL_SECONDS, ValueType::Persist7Day)
            .await
            .unwrap();

        let found = fetch_invitations(&dht, &keyserver, &bob.fingerprint).await.unwrap();
        assert!(found.is_empty());
    }
}
