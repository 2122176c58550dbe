//! Endpoint handlers.

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use irn_auth::EndpointClass;
use irn_core::messages::{
    AuthenticateRequest, ChallengeRequest, CloseChannelRequest, CloseChannelResponse, IdentifyRequest,
    OpenChannelRequest, RegisterRequest, CHANNEL_ID_HEADER,
};
use irn_core::{AccessLevel, ChannelContext, ChannelId, NodeCertificate, NodeId};
use irn_sync::{clamp_page_size, EntityGroup, ManifestRequest, PageQuery, SyncError, SyncImportPayload};

use super::pipeline::{authorize, load_channel, open_authorized, open_request, seal, verify_identity};
use super::AppState;
use crate::error::ApiError;

type HandlerResult = std::result::Result<Response, ApiError>;

pub async fn health() -> impl IntoResponse {
    "OK"
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 1
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/channel/open
pub async fn open_channel(State(state): State<AppState>, body: Bytes) -> HandlerResult {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::empty_body());
    }
    let request: OpenChannelRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::invalid_payload(e.to_string()))?;
    let (channel_id, response) = state.channels.accept(&request).await?;
    Ok(([(CHANNEL_ID_HEADER, channel_id.to_string())], Json(response)).into_response())
}

/// POST /api/channel/close
pub async fn close_channel(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, request) = open_request::<CloseChannelRequest>(&state, &headers, &body).await?;
    if request.channel_id != *channel.id() {
        return Err(ApiError::invalid_payload("channel id does not match header"));
    }
    let closed = state.channels.close(channel.id()).await.map_err(internal)?;
    seal(&channel, &CloseChannelResponse { closed })
}

// ─────────────────────────────────────────────────────────────────────────────
// Phases 2 and 3
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/node/identify
pub async fn identify(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (mut channel, request) = open_request::<IdentifyRequest>(&state, &headers, &body).await?;
    let certificate = verify_identity(&state, &channel, &request)?;

    let response = state.identity.identify(&request, &certificate).await?;
    if let Some(node_id) = response.node_id.filter(|_| response.is_authorized()) {
        channel.bind_identity(node_id, certificate.fingerprint());
        state.channels.update(&channel).await.map_err(internal)?;
    }
    seal(&channel, &response)
}

/// POST /api/node/register
pub async fn register(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, request) = open_request::<RegisterRequest>(&state, &headers, &body).await?;
    if request.channel_id != *channel.id() {
        return Err(ApiError::invalid_payload("channel id does not match header"));
    }
    let result = state.identity.register(&request).await?;
    seal(&channel, &result)
}

/// The channel must have been identified as `node_id` in Phase 2.
fn require_identified(channel: &ChannelContext, channel_id: &ChannelId, node_id: &NodeId) -> Result<(), ApiError> {
    if channel_id != channel.id() {
        return Err(ApiError::invalid_payload("channel id does not match header"));
    }
    if channel.identified_node() != Some(*node_id) {
        tracing::warn!(channel = %channel.id(), node = %node_id, "phase 3 on a channel not identified as this node");
        return Err(ApiError::authentication_failed("channel is not identified as this node"));
    }
    Ok(())
}

/// POST /api/node/challenge
pub async fn challenge(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, request) = open_request::<ChallengeRequest>(&state, &headers, &body).await?;
    require_identified(&channel, &request.channel_id, &request.node_id)?;
    let response = state
        .challenges
        .generate_challenge(channel.id(), &request.node_id)
        .await?;
    seal(&channel, &response)
}

/// POST /api/node/authenticate
pub async fn authenticate(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, request) = open_request::<AuthenticateRequest>(&state, &headers, &body).await?;
    require_identified(&channel, &request.channel_id, &request.node_id)?;

    let node = state
        .identity
        .get_by_id(&request.node_id)
        .await?
        .filter(|node| node.is_authorized())
        .ok_or_else(|| ApiError::authentication_failed("node is not authorized"))?;
    if channel.meta.certificate_fingerprint.as_deref() != Some(node.certificate_fingerprint.as_str()) {
        return Err(ApiError::authentication_failed("certificate changed since identify"));
    }
    let certificate = NodeCertificate::from_base64(&node.certificate)?;

    let response = state
        .challenges
        .authenticate(&request, &certificate, node.access_level)
        .await?;
    if response.authenticated {
        state.identity.mark_authenticated(&node.id, Utc::now()).await?;
    } else {
        tracing::warn!(
            channel = %channel.id(),
            node = %node.id,
            reason = response.message.as_deref().unwrap_or(""),
            "challenge response rejected"
        );
    }
    seal(&channel, &response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/sync/manifest
pub async fn manifest(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, request, session) = open_authorized::<ManifestRequest>(
        &state,
        &headers,
        &body,
        AccessLevel::ReadOnly,
        EndpointClass::Standard,
    )
    .await?;
    let manifest = state.exporter.manifest(request.since, Some(&session.node_id)).await?;
    tracing::info!(node = %session.node_id, since = ?request.since, total = manifest.total_count(), "manifest served");
    seal(&channel, &manifest)
}

/// GET /api/sync/:group?page&pageSize&since
pub async fn entity_page(
    State(state): State<AppState>,
    Path(group): Path<String>,
    query: Result<Query<PageQuery>, QueryRejection>,
    headers: HeaderMap,
) -> HandlerResult {
    let channel = load_channel(&state, &headers).await?;
    let session = authorize(
        &state,
        &headers,
        &channel,
        None,
        AccessLevel::ReadOnly,
        EndpointClass::Sync,
    )
    .await?;

    let Query(query) = query.map_err(|e| ApiError::invalid_payload(e.body_text()))?;
    let group: EntityGroup = group
        .parse()
        .map_err(|_| ApiError::not_found(format!("no entity group {group}")))?;
    let page = state
        .exporter
        .page(
            group,
            query.since,
            query.page.unwrap_or(1).max(1),
            clamp_page_size(query.page_size),
        )
        .await?;
    tracing::debug!(node = %session.node_id, group = %group, page = page.page, rows = page.data.len(), "page served");
    seal(&channel, &page)
}

/// GET /api/sync/recordings/:id/file
pub async fn recording_file(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> HandlerResult {
    let channel = load_channel(&state, &headers).await?;
    authorize(
        &state,
        &headers,
        &channel,
        None,
        AccessLevel::ReadOnly,
        EndpointClass::Sync,
    )
    .await?;

    let file = state
        .exporter
        .recording_file(&channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no recording for channel {channel_id}")))?;
    seal(&channel, &file)
}

/// POST /api/sync/import
pub async fn import(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let (channel, payload, session) = open_authorized::<SyncImportPayload>(
        &state,
        &headers,
        &body,
        AccessLevel::ReadWrite,
        EndpointClass::Sync,
    )
    .await?;
    if payload.source_node_id != session.node_id {
        tracing::warn!(
            session_node = %session.node_id,
            claimed = %payload.source_node_id,
            "import payload names another source, attributing to session node"
        );
    }

    let report = state
        .importer
        .import(session.node_id, payload)
        .await
        .map_err(|e| match e {
            SyncError::Task(_) => ApiError::from(e),
            other => {
                tracing::error!(node = %session.node_id, error = %other, "pushed import failed");
                ApiError::import_failed(other.to_string())
            }
        })?;
    seal(&channel, &report)
}

fn internal(e: crate::error::NodeError) -> ApiError {
    tracing::error!(error = %e, "request failed");
    ApiError::internal()
}
