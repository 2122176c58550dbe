//! Store traits: the abstract interfaces the protocol and sync engine need.
//!
//! Each concern is a capability trait with interchangeable backends chosen at
//! startup: in-process for single-node deployments and tests, Redis for
//! channel/session/challenge state shared between instances, SQLite for the
//! registry and entity data.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use irn_core::{
    AccessLevel, AuthorizationStatus, ChannelContext, ChannelId, NodeId, RateLimitDecision, RateLimitPolicy,
    RegisteredNode, SessionData, SessionToken,
};

use crate::error::Result;
use crate::record::{EntityKind, EntityRecord, KindSummary, SyncLog};

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

/// TTL-keyed storage of channel metadata and keys.
///
/// Entries expire at `ChannelContext::expires_at`. Reads re-check expiry and
/// evict stale entries even when the backend expires keys natively.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Insert or replace a channel. Metadata and key are written atomically.
    async fn put(&self, ctx: &ChannelContext) -> Result<()>;

    /// Fetch a live channel.
    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelContext>>;

    /// Remove a channel. Returns whether anything was removed.
    async fn remove(&self, id: &ChannelId) -> Result<bool>;

    /// Whether a live channel exists.
    async fn is_valid(&self, id: &ChannelId) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    /// Number of stored channels.
    async fn count(&self) -> Result<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// TTL-keyed session storage with per-session rate-limit windows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a newly issued session.
    async fn create(&self, session: &SessionData) -> Result<()>;

    /// Fetch a live session without touching it. Expired entries are evicted.
    async fn get(&self, token: &SessionToken) -> Result<Option<SessionData>>;

    /// Fetch a live session and refresh `last_accessed_at`.
    async fn touch(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionData>>;

    /// Apply the sliding-window check for one request.
    ///
    /// Returns `None` if the session does not exist.
    async fn record_request(
        &self,
        token: &SessionToken,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitDecision>>;

    /// Delete a session. Returns whether it existed.
    async fn revoke(&self, token: &SessionToken) -> Result<bool>;

    /// Extend a live session. Returns the new expiry.
    async fn renew(&self, token: &SessionToken, extra: Duration) -> Result<Option<DateTime<Utc>>>;

    /// All live sessions for a node.
    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<SessionData>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Challenges
// ─────────────────────────────────────────────────────────────────────────────

/// A stored Phase 3 challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChallenge {
    /// Base64 challenge value, exactly as sent to the peer.
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One active challenge per (channel, node) pair.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Store a challenge, replacing any earlier one for the same pair.
    async fn put(&self, channel_id: &ChannelId, node_id: &NodeId, challenge: &StoredChallenge) -> Result<()>;

    /// Remove and return the challenge for a pair.
    ///
    /// May return an expired challenge if the backend has not evicted it yet.
    async fn take(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<Option<StoredChallenge>>;

    /// Remove the challenge for a pair. Returns whether it existed.
    async fn remove(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<bool>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Node registry
// ─────────────────────────────────────────────────────────────────────────────

/// Identity records keyed by id, with a unique fingerprint index.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Insert a new node. Fails with `Conflict` if the id or fingerprint is taken.
    async fn insert(&self, node: &RegisteredNode) -> Result<()>;

    /// Replace an existing node. Fails with `NotFound` if absent, or `Conflict`
    /// if the new fingerprint belongs to another node.
    async fn update(&self, node: &RegisteredNode) -> Result<()>;

    async fn get_by_id(&self, id: &NodeId) -> Result<Option<RegisteredNode>>;

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredNode>>;

    /// All nodes, ordered by registration time.
    async fn list_all(&self) -> Result<Vec<RegisteredNode>>;

    /// Set status and optionally access level. Returns whether the node exists.
    async fn set_status(
        &self,
        id: &NodeId,
        status: AuthorizationStatus,
        access_level: Option<AccessLevel>,
    ) -> Result<bool>;

    /// Record a successful authentication.
    async fn mark_authenticated(&self, id: &NodeId, at: DateTime<Utc>) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Entities and sync logs
// ─────────────────────────────────────────────────────────────────────────────

/// Operations available inside an entity transaction.
///
/// Everything written through an `EntityTx` commits or rolls back together.
pub trait EntityTx {
    fn find(&mut self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>>;

    fn exists(&mut self, kind: EntityKind, id: &str) -> Result<bool> {
        Ok(self.find(kind, id)?.is_some())
    }

    fn insert(&mut self, record: &EntityRecord) -> Result<()>;

    fn update(&mut self, record: &EntityRecord) -> Result<()>;

    fn insert_sync_log(&mut self, log: &SyncLog) -> Result<()>;

    fn update_sync_log(&mut self, log: &SyncLog) -> Result<()>;
}

/// Relational storage for synchronised entities.
///
/// Reads are async. The two write paths are blocking and meant to be called
/// from `spawn_blocking`: [`transaction`](EntityStore::transaction) for the
/// import batch, [`record_sync_log`](EntityStore::record_sync_log) for the
/// independent write that records a failed attempt.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Count and newest update for `kind`, limited to `updated_at > since`.
    async fn summary(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Result<KindSummary>;

    /// One page of rows of `kind` with `updated_at > since`, ordered by
    /// `(updated_at, id)`. `page` is 1-based.
    async fn page(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<EntityRecord>>;

    /// Children of `kind` under `parent_id`, ordered by `(updated_at, id)`.
    async fn children(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<EntityRecord>>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>>;

    async fn get_sync_log(&self, id: &Uuid) -> Result<Option<SyncLog>>;

    /// Most recent completed attempt against `remote`.
    async fn last_completed_sync(&self, remote: &NodeId) -> Result<Option<SyncLog>>;

    /// Attempts, newest first, optionally for one remote.
    async fn list_sync_logs(&self, remote: Option<&NodeId>) -> Result<Vec<SyncLog>>;

    /// Run `work` in one ACID transaction. Blocking.
    ///
    /// Commits if `work` returns `Ok`, rolls back otherwise.
    fn transaction(&self, work: &mut dyn FnMut(&mut dyn EntityTx) -> Result<()>) -> Result<()>;

    /// Insert or replace a sync log outside any transaction. Blocking.
    fn record_sync_log(&self, log: &SyncLog) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Blobs
// ─────────────────────────────────────────────────────────────────────────────

/// A stored binary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Named binary storage with idempotent overwrite.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name`, replacing any existing object.
    async fn upload(&self, name: &str, bytes: Bytes, content_type: &str) -> Result<()>;

    /// Fetch an object, or `None` if absent.
    async fn download(&self, name: &str) -> Result<Option<Blob>>;

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.download(name).await?.is_some())
    }
}

/// Content type for a file name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("wav") => "audio/wav",
        Some("edf") | Some("bdf") => "application/edf",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
