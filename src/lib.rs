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

//! Decentralized post-quantum messaging engine.
//!
//! Layering, bottom to top: `crypto` wraps the post-quantum primitives,
//! `identity` builds keypairs and on-disk key material from them, `dht`
//! defines the storage substrate every higher module publishes into,
//! `store` holds local SQLite state, `contact` resolves names to
//! identities, `outbox` and `group` implement direct and group message
//! delivery over the DHT, and `engine` wires all of it into the host-facing
//! API surface.

pub mod config;
pub mod contact;
pub mod crypto;
pub mod dht;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod group;
pub mod identity;
pub mod outbox;
pub mod store;

pub use engine::{Engine, EngineEvent, EventListener};
pub use error::{AppError, AppResult};
