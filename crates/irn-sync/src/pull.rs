//! Requester side of sync: resolve, fetch every group, import.
//!
//! The transport is abstracted as a [`SyncSource`]. Over the network that is
//! an authenticated channel; in-process it is a [`LocalSource`] over a
//! [`SyncExporter`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use irn_core::{AuthorizationStatus, NodeId, RegisteredNode};
use irn_store::{EntityStore, NodeRegistry};

use crate::entities::decode_all;
use crate::error::{Result, SyncError};
use crate::export::SyncExporter;
use crate::import::{ImportReport, SyncImporter};
use crate::messages::{EntityGroup, EntityPage, Manifest, PageQuery, RecordingFile, SyncImportPayload, DEFAULT_PAGE_SIZE};

/// Where a pull fetches from.
#[async_trait]
pub trait SyncSource: Send {
    async fn manifest(&mut self, since: Option<DateTime<Utc>>) -> Result<Manifest>;

    async fn page(&mut self, group: EntityGroup, query: &PageQuery) -> Result<EntityPage<Value>>;

    /// `None` if the channel has no file or the file is gone.
    async fn recording_file(&mut self, channel_id: &str) -> Result<Option<RecordingFile>>;

    /// Release the underlying channel. Called once, whatever the outcome.
    async fn close(&mut self) -> Result<()>;
}

/// A [`SyncSource`] reading straight from an exporter.
pub struct LocalSource {
    exporter: Arc<SyncExporter>,
    requester: NodeId,
    closed: bool,
}

impl LocalSource {
    pub fn new(exporter: Arc<SyncExporter>, requester: NodeId) -> Self {
        Self {
            exporter,
            requester,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl SyncSource for LocalSource {
    async fn manifest(&mut self, since: Option<DateTime<Utc>>) -> Result<Manifest> {
        self.exporter.manifest(since, Some(&self.requester)).await
    }

    async fn page(&mut self, group: EntityGroup, query: &PageQuery) -> Result<EntityPage<Value>> {
        self.exporter
            .page(
                group,
                query.since,
                query.page.unwrap_or(1),
                query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            )
            .await
    }

    async fn recording_file(&mut self, channel_id: &str) -> Result<Option<RecordingFile>> {
        self.exporter.recording_file(channel_id).await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Pull configuration.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Rows requested per page.
    pub page_size: u32,
    /// Fetch recording files referenced by sessions.
    pub fetch_recordings: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fetch_recordings: true,
        }
    }
}

/// Drives a pull from a remote node into the local store.
pub struct SyncPuller {
    registry: Arc<dyn NodeRegistry>,
    store: Arc<dyn EntityStore>,
    importer: Arc<SyncImporter>,
    config: PullConfig,
}

impl SyncPuller {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        store: Arc<dyn EntityStore>,
        importer: Arc<SyncImporter>,
        config: PullConfig,
    ) -> Self {
        Self {
            registry,
            store,
            importer,
            config,
        }
    }

    /// The node to pull from. It must be `Authorized` and have a URL.
    pub async fn resolve_target(&self, node_id: &NodeId) -> Result<RegisteredNode> {
        let node = self
            .registry
            .get_by_id(node_id)
            .await?
            .ok_or(SyncError::NodeNotFound(*node_id))?;
        if node.status != AuthorizationStatus::Authorized {
            return Err(SyncError::NodeNotAuthorized(*node_id));
        }
        if node.node_url.as_deref().map_or(true, str::is_empty) {
            return Err(SyncError::MissingNodeUrl(*node_id));
        }
        Ok(node)
    }

    /// The caller's `since`, else the watermark of the last completed pull.
    pub async fn resolve_since(
        &self,
        node_id: &NodeId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        if since.is_some() {
            return Ok(since);
        }
        Ok(self
            .store
            .last_completed_sync(node_id)
            .await?
            .and_then(|log| log.last_synced_at))
    }

    /// Fetch everything newer than `since`, in dependency order.
    pub async fn fetch(&self, source: &mut dyn SyncSource, since: Option<DateTime<Utc>>) -> Result<SyncImportPayload> {
        let manifest = source.manifest(since).await?;
        tracing::info!(
            remote = %manifest.node_id,
            since = ?since,
            total = manifest.total_count(),
            recordings = manifest.recording_count,
            "manifest received"
        );

        let mut payload = SyncImportPayload::new(manifest.node_id, manifest.generated_at);
        for group in EntityGroup::ALL {
            if manifest.group(group).is_some_and(|g| g.count == 0) {
                continue;
            }
            let mut page = 1;
            loop {
                let query = PageQuery::new(page, self.config.page_size, since);
                let batch = source.page(group, &query).await?;
                let more = batch.has_more() && !batch.data.is_empty();
                tracing::debug!(group = %group, page, rows = batch.data.len(), total = batch.total_records, "page fetched");
                extend(&mut payload, group, batch.data)?;
                if !more {
                    break;
                }
                page += 1;
            }
        }

        if self.config.fetch_recordings {
            let channels: Vec<String> = payload
                .sessions
                .iter()
                .flat_map(|s| s.file_channels())
                .map(|c| c.id.clone())
                .collect();
            for channel_id in channels {
                match source.recording_file(&channel_id).await {
                    Ok(Some(file)) => payload.recording_files.push(file),
                    Ok(None) => tracing::debug!(channel = %channel_id, "recording file not available"),
                    Err(e) => tracing::warn!(channel = %channel_id, error = %e, "recording fetch failed, skipping"),
                }
            }
        }

        Ok(payload)
    }

    /// Fetch from `source`, close it, then import.
    ///
    /// The source is closed whether or not the fetch succeeded.
    pub async fn pull_from(
        &self,
        source: &mut dyn SyncSource,
        remote: NodeId,
        since: Option<DateTime<Utc>>,
    ) -> Result<ImportReport> {
        let fetched = self.fetch(source, since).await;
        if let Err(e) = source.close().await {
            tracing::warn!(remote = %remote, error = %e, "failed to close sync source");
        }
        let payload = fetched?;
        if payload.source_node_id != remote {
            tracing::warn!(
                expected = %remote,
                reported = %payload.source_node_id,
                "manifest node id differs from pull target"
            );
        }
        self.importer.import(remote, payload).await
    }
}

/// Decode one page of `group` into the payload's typed collection.
fn extend(payload: &mut SyncImportPayload, group: EntityGroup, rows: Vec<Value>) -> Result<()> {
    let snomed = &mut payload.snomed;
    match group {
        EntityGroup::SnomedBodyRegions => snomed.body_regions.extend(decode_all(rows)?),
        EntityGroup::SnomedBodyStructures => snomed.body_structures.extend(decode_all(rows)?),
        EntityGroup::SnomedTopographicalModifiers => snomed.topographical_modifiers.extend(decode_all(rows)?),
        EntityGroup::SnomedLateralities => snomed.lateralities.extend(decode_all(rows)?),
        EntityGroup::SnomedSeverityCodes => snomed.severity_codes.extend(decode_all(rows)?),
        EntityGroup::SnomedClinicalConditions => snomed.clinical_conditions.extend(decode_all(rows)?),
        EntityGroup::SnomedClinicalEvents => snomed.clinical_events.extend(decode_all(rows)?),
        EntityGroup::SnomedMedications => snomed.medications.extend(decode_all(rows)?),
        EntityGroup::SnomedAllergyIntolerances => snomed.allergy_intolerances.extend(decode_all(rows)?),
        EntityGroup::Volunteers => payload.volunteers.extend(decode_all(rows)?),
        EntityGroup::Researchers => payload.researchers.extend(decode_all(rows)?),
        EntityGroup::Devices => payload.devices.extend(decode_all(rows)?),
        EntityGroup::Research => payload.research.extend(decode_all(rows)?),
        EntityGroup::Sessions => payload.sessions.extend(decode_all(rows)?),
    }
    Ok(())
}
