//! Responder HTTP surface.
//!
//! Handlers run the request pipeline in [`pipeline`] explicitly, in order:
//! channel lookup, decryption, identity verification (identify only), then
//! session authorization (sync endpoints only). Each stage either hands the
//! next one its output or ends the request with an [`ApiError`].
//!
//! [`ApiError`]: crate::error::ApiError

pub mod handlers;
pub mod pipeline;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use irn_auth::{ChallengeAuth, NodeIdentityService};
use irn_core::NodeId;
use irn_sync::{SyncExporter, SyncImporter};

use crate::channel::ChannelManager;

/// Largest request body accepted on handshake and query endpoints.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Largest body accepted by `POST /api/sync/import`, which carries recording files.
pub const MAX_IMPORT_BYTES: usize = 512 * 1024 * 1024;

/// Everything the handlers need.
pub struct NodeServices {
    pub node_id: NodeId,
    pub node_name: String,
    pub channels: ChannelManager,
    pub identity: NodeIdentityService,
    pub challenges: ChallengeAuth,
    pub exporter: Arc<SyncExporter>,
    pub importer: Arc<SyncImporter>,
}

pub type AppState = Arc<NodeServices>;

/// Build the router for all node endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Phase 1
        .route("/api/channel/open", post(handlers::open_channel))
        .route("/api/channel/close", post(handlers::close_channel))
        // Phases 2 and 3
        .route("/api/node/identify", post(handlers::identify))
        .route("/api/node/register", post(handlers::register))
        .route("/api/node/challenge", post(handlers::challenge))
        .route("/api/node/authenticate", post(handlers::authenticate))
        // Sync
        .route("/api/sync/manifest", post(handlers::manifest))
        .route(
            "/api/sync/import",
            post(handlers::import).layer(DefaultBodyLimit::max(MAX_IMPORT_BYTES)),
        )
        .route("/api/sync/recordings/:id/file", get(handlers::recording_file))
        .route("/api/sync/:group", get(handlers::entity_page))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}
