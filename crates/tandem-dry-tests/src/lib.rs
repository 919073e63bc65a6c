// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Tandem crates.
#![forbid(unsafe_code)]
//!
//! The in-memory stores execute plans naively; they exist so sync behavior
//! can be tested end to end without a storage engine or a network.
//!
//! # Modules
//!
//! - [`config`] - In-memory config store with an access journal and
//!   injectable failures
//! - [`fixtures`] - Blog schema (users, posts, comments) and row builders
//! - [`leader`] - Leader channel pair with switchable leadership
//! - [`local`] - In-memory local store executing local join plans
//! - [`pubsub`] - In-memory pub/sub with subscribe/unsubscribe counters
//! - [`remote`] - In-memory remote store executing nested fetches with
//!   version guards

pub mod config;
pub mod fixtures;
pub mod leader;
pub mod local;
pub mod pubsub;
pub mod remote;

pub use config::{ConfigAccess, InMemoryConfigStore};
pub use fixtures::{blog_schema, row, BLOG_SCHEMA_JSON};
pub use leader::{leader_pair, MemoryLeaderChannel};
pub use local::MemoryLocalStore;
pub use pubsub::MemoryPubSub;
pub use remote::MemoryRemoteStore;
