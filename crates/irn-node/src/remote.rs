//! A [`SyncSource`] backed by an authenticated channel to a peer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::Value;

use irn_core::ErrorCode;
use irn_sync::{EntityGroup, EntityPage, Manifest, ManifestRequest, PageQuery, RecordingFile, SyncSource};

use crate::client::{AuthenticatedChannel, HandshakeClient};
use crate::error::NodeError;

/// Pulls from a peer over the sync endpoints.
pub struct RemoteSource {
    client: Arc<HandshakeClient>,
    session: AuthenticatedChannel,
    closed: bool,
}

impl RemoteSource {
    pub fn new(client: Arc<HandshakeClient>, session: AuthenticatedChannel) -> Self {
        Self {
            client,
            session,
            closed: false,
        }
    }

    pub fn session(&self) -> &AuthenticatedChannel {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl SyncSource for RemoteSource {
    async fn manifest(&mut self, since: Option<DateTime<Utc>>) -> irn_sync::Result<Manifest> {
        self.client
            .invoke(&self.session, Method::POST, "/api/sync/manifest", Some(&ManifestRequest { since }))
            .await
            .map_err(NodeError::into_sync)
    }

    async fn page(&mut self, group: EntityGroup, query: &PageQuery) -> irn_sync::Result<EntityPage<Value>> {
        self.client
            .invoke::<(), _>(&self.session, Method::GET, &page_path(group, query), None)
            .await
            .map_err(NodeError::into_sync)
    }

    async fn recording_file(&mut self, channel_id: &str) -> irn_sync::Result<Option<RecordingFile>> {
        let path = format!("/api/sync/recordings/{channel_id}/file");
        match self.client.invoke::<(), RecordingFile>(&self.session, Method::GET, &path, None).await {
            Ok(file) => Ok(Some(file)),
            Err(NodeError::Remote {
                code: ErrorCode::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e.into_sync()),
        }
    }

    async fn close(&mut self) -> irn_sync::Result<()> {
        if !self.closed {
            self.client.close(&self.session).await;
            self.closed = true;
        }
        Ok(())
    }
}

/// `/api/sync/{group}?page=..&pageSize=..&since=..`
fn page_path(group: EntityGroup, query: &PageQuery) -> String {
    let mut params = Vec::with_capacity(3);
    if let Some(page) = query.page {
        params.push(format!("page={page}"));
    }
    if let Some(size) = query.page_size {
        params.push(format!("pageSize={size}"));
    }
    if let Some(since) = query.since {
        params.push(format!("since={}", since.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }
    if params.is_empty() {
        format!("/api/sync/{}", group.as_str())
    } else {
        format!("/api/sync/{}?{}", group.as_str(), params.join("&"))
    }
}
