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

//! Host-facing event stream (§6): every event carries a stable integer code
//! so a host binding that only speaks C ints can still dispatch on it.

use std::sync::Arc;

/// Events delivered to whatever was registered via
/// [`crate::engine::Engine::set_event_listener`]. Dispatch always happens on
/// the engine's own worker, never inline with a DHT callback (§5).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    MessageReceived {
        contact_fingerprint: String,
        group_uuid: Option<String>,
    },
    ContactOnline(String),
    ContactOffline(String),
    GroupInvitationReceived {
        group_uuid: String,
        name: String,
        creator_fingerprint: String,
    },
    IdentityLoaded {
        fingerprint: String,
    },
    OutboxUpdated {
        contact_fingerprint: String,
    },
    Error {
        message: String,
    },
}

impl EngineEvent {
    /// Stable code per §6, safe to hand across an FFI boundary.
    pub fn code(&self) -> i32 {
        match self {
            EngineEvent::MessageReceived { .. } => 1,
            EngineEvent::ContactOnline(_) => 2,
            EngineEvent::ContactOffline(_) => 3,
            EngineEvent::GroupInvitationReceived { .. } => 4,
            EngineEvent::IdentityLoaded { .. } => 5,
            EngineEvent::OutboxUpdated { .. } => 6,
            EngineEvent::Error { .. } => 99,
        }
    }
}

pub type EventListener = Arc<dyn Fn(EngineEvent) + Send + Sync>;
