// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collaborator ports for the Tandem sync core.
//!
//! The sync core never talks to a storage engine, an HTTP client or a
//! pub/sub socket directly. It consumes four narrow contracts:
//!
//! - [`LocalStore`]: typed collections, document reads/writes, plan execution
//!   and change notifications for the local replica.
//! - [`RemoteStore`]: filtered fetches, point lookups and guarded writes
//!   against the remote source of truth.
//! - [`PubSub`]: named channels carrying change messages with headers.
//! - [`LeaderChannel`]: `{is_leader, broadcast, on_message}` between
//!   cooperating replicas.
//!
//! Adapters implement these traits; `tandem-dry-tests` ships in-memory ones.

mod document;
mod leader;
mod local;
mod pubsub;
mod remote;

pub use document::{ChangeRow, LocalDocument, UPDATED_AT_PROPERTY, VERSION_PROPERTY};
pub use leader::{LeaderChannel, LeaderMessage};
pub use local::{LocalStore, StoreChange, StoreError};
pub use pubsub::{ChannelEvent, ChannelMessage, PubSub, TransportError, ENTITY_ID_HEADER, UPDATED_AT_HEADER};
pub use remote::{RemoteError, RemoteStore, VersionGuard};
