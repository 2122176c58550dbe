//! # IRN Store
//!
//! Storage abstractions for research nodes: short-lived handshake state,
//! the node registry, synchronised entities, and recording blobs.
//!
//! ## Overview
//!
//! Each concern is a trait with interchangeable backends selected at startup:
//!
//! | Trait | In-process | Shared / persistent |
//! |---|---|---|
//! | [`ChannelStore`] | [`MemoryChannelStore`] | [`RedisChannelStore`] |
//! | [`SessionStore`] | [`MemorySessionStore`] | [`RedisSessionStore`] |
//! | [`ChallengeStore`] | [`MemoryChallengeStore`] | [`RedisChallengeStore`] |
//! | [`NodeRegistry`] | [`MemoryNodeRegistry`] | [`SqliteStore`] |
//! | [`EntityStore`] | [`MemoryEntityStore`] | [`SqliteStore`] |
//! | [`BlobStore`] | [`MemoryBlobStore`] | [`FsBlobStore`] |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use irn_store::{EntityStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("irn.db").unwrap();
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory().unwrap();
//!
//!     let logs = store.list_sync_logs(None).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Key isolation**: channel keys are stored apart from channel metadata
//! - **Expiry on read**: every TTL store re-checks expiry and evicts on read
//! - **One transaction per import**: [`EntityStore::transaction`] commits or
//!   rolls back a whole batch; [`EntityStore::record_sync_log`] writes outside it
//! - **Microsecond timestamps**: entity watermarks are compared at the
//!   resolution every backend stores

pub mod blob;
pub mod cache;
pub mod error;
pub mod memory;
pub mod migration;
pub mod record;
pub mod sqlite;
pub mod traits;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use cache::{RedisChallengeStore, RedisChannelStore, RedisSessionStore};
pub use error::{Result, StoreError};
pub use memory::{MemoryChallengeStore, MemoryChannelStore, MemoryEntityStore, MemoryNodeRegistry, MemorySessionStore};
pub use record::{truncate_micros, EntityKind, EntityRecord, KindSummary, SyncCounts, SyncLog, SyncStatus};
pub use sqlite::SqliteStore;
pub use traits::{
    content_type_for, Blob, BlobStore, ChallengeStore, ChannelStore, EntityStore, EntityTx, NodeRegistry,
    SessionStore, StoredChallenge,
};
