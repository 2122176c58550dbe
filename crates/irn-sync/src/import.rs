//! Transactional newer-wins import.
//!
//! One payload is applied in one transaction, in dependency order:
//! catalog, volunteers, researchers, devices, research, sessions. The
//! `in_progress` SyncLog is written inside the transaction, so a rollback
//! removes it too. A failed attempt is then recorded with an independent
//! write. Recording files are uploaded only after commit.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use irn_core::NodeId;
use irn_store::{truncate_micros, BlobStore, EntityKind, EntityStore, EntityTx, StoreError, SyncCounts, SyncLog, SyncStatus};

use crate::conflict;
use crate::entities::{to_record, RecordSession, Research, SnomedCatalog, SyncEntity, Volunteer};
use crate::error::{Result, SyncError};
use crate::messages::{RecordingFile, SyncImportPayload};

/// Import configuration.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Upload recording files after commit.
    pub upload_recordings: bool,
    /// Recording files larger than this are skipped.
    pub max_recording_bytes: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            upload_recordings: true,
            max_recording_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Outcome of a committed import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub sync_log_id: Uuid,
    pub counts: SyncCounts,
    pub files_uploaded: u64,
    pub files_failed: u64,
    /// The new `lastSyncedAt` for the remote.
    pub watermark: DateTime<Utc>,
}

impl ImportReport {
    /// Rows inserted or overwritten across all groups.
    pub fn written(&self) -> u64 {
        self.counts.written()
    }
}

/// Applies payloads from remote nodes to the local store.
pub struct SyncImporter {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    local_node: NodeId,
    config: ImportConfig,
}

impl SyncImporter {
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        local_node: NodeId,
        config: ImportConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            local_node,
            config,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Import a payload fetched from (or pushed by) `remote`.
    ///
    /// On failure nothing from the payload is committed, a `failed` SyncLog
    /// with the partial counts is recorded, and the error is returned.
    pub async fn import(&self, remote: NodeId, payload: SyncImportPayload) -> Result<ImportReport> {
        let log = SyncLog::start(remote);
        let log_id = log.id;
        tracing::info!(
            remote = %remote,
            sync_log = %log_id,
            generated_at = %payload.generated_at,
            "import started"
        );

        let store = self.store.clone();
        let local = self.local_node;
        let (payload, committed) = tokio::task::spawn_blocking(move || {
            let committed = run_import(store.as_ref(), local, log, &payload);
            (payload, committed)
        })
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?;
        let mut log = committed?;

        let (files_uploaded, files_failed) = if self.config.upload_recordings {
            self.upload_recordings(&payload.recording_files).await
        } else {
            (0, 0)
        };

        if files_uploaded > 0 {
            log.counts.recording_files = files_uploaded;
            let store = self.store.clone();
            let update = log.clone();
            let recorded = tokio::task::spawn_blocking(move || store.record_sync_log(&update))
                .await
                .map_err(|e| SyncError::Task(e.to_string()))?;
            if let Err(e) = recorded {
                tracing::warn!(sync_log = %log_id, error = %e, "failed to record recording-file count");
            }
        }

        tracing::info!(
            remote = %remote,
            sync_log = %log_id,
            snomed = log.counts.snomed,
            volunteers = log.counts.volunteers,
            researchers = log.counts.researchers,
            devices = log.counts.devices,
            research = log.counts.research,
            sessions = log.counts.sessions,
            skipped = log.counts.skipped,
            files_uploaded,
            files_failed,
            "import completed"
        );

        Ok(ImportReport {
            sync_log_id: log_id,
            counts: log.counts,
            files_uploaded,
            files_failed,
            watermark: truncate_micros(payload.generated_at),
        })
    }

    async fn upload_recordings(&self, files: &[RecordingFile]) -> (u64, u64) {
        let mut uploaded = 0;
        let mut failed = 0;
        for file in files {
            match self.upload_one(file).await {
                Ok(()) => uploaded += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(channel = %file.channel_id, file = %file.file_name, error = %e, "recording upload failed");
                }
            }
        }
        (uploaded, failed)
    }

    async fn upload_one(&self, file: &RecordingFile) -> Result<()> {
        let bytes = STANDARD
            .decode(&file.content)
            .map_err(|e| SyncError::InvalidEntity(format!("recording {}: {e}", file.file_name)))?;
        if bytes.len() > self.config.max_recording_bytes {
            return Err(SyncError::InvalidEntity(format!(
                "recording {} exceeds {} bytes",
                file.file_name, self.config.max_recording_bytes
            )));
        }
        self.blobs
            .upload(&file.file_name, Bytes::from(bytes), &file.content_type)
            .await?;
        Ok(())
    }
}

/// Run the transaction, recording a failed log out of band on error. Blocking.
fn run_import(store: &dyn EntityStore, local: NodeId, mut log: SyncLog, payload: &SyncImportPayload) -> Result<SyncLog> {
    let mut counts = SyncCounts::default();
    let mut failure: Option<SyncError> = None;

    let committed = store.transaction(&mut |tx: &mut dyn EntityTx| {
        counts = SyncCounts::default();
        tx.insert_sync_log(&log)?;

        let mut batch = Batch {
            tx: &mut *tx,
            local,
            counts: &mut counts,
        };
        if let Err(e) = batch.apply(payload) {
            return Err(match e {
                SyncError::Store(store_err) => store_err,
                other => {
                    let message = other.to_string();
                    failure = Some(other);
                    StoreError::Aborted(message)
                }
            });
        }

        let mut done = log.clone();
        done.status = SyncStatus::Completed;
        done.completed_at = Some(truncate_micros(Utc::now()));
        done.last_synced_at = Some(truncate_micros(payload.generated_at));
        done.counts = counts;
        tx.update_sync_log(&done)
    });

    match committed {
        Ok(()) => {
            log.status = SyncStatus::Completed;
            log.completed_at = Some(truncate_micros(Utc::now()));
            log.last_synced_at = Some(truncate_micros(payload.generated_at));
            log.counts = counts;
            Ok(log)
        }
        Err(store_err) => {
            let error = failure.take().unwrap_or(SyncError::Store(store_err));
            log.status = SyncStatus::Failed;
            log.completed_at = Some(truncate_micros(Utc::now()));
            log.counts = counts;
            log.error_message = Some(error.to_string());
            if let Err(e) = store.record_sync_log(&log) {
                tracing::error!(sync_log = %log.id, error = %e, "failed to record failed sync attempt");
            }
            tracing::error!(
                remote = %log.remote_node_id,
                sync_log = %log.id,
                error = %error,
                "import rolled back"
            );
            Err(error)
        }
    }
}

/// Writes one payload through an open transaction.
struct Batch<'a> {
    tx: &'a mut dyn EntityTx,
    local: NodeId,
    counts: &'a mut SyncCounts,
}

impl Batch<'_> {
    fn apply(&mut self, payload: &SyncImportPayload) -> Result<()> {
        self.catalog(&payload.snomed)?;
        for volunteer in &payload.volunteers {
            self.volunteer(volunteer)?;
        }
        for researcher in &payload.researchers {
            if self.upsert(researcher, None)? {
                self.counts.researchers += 1;
            }
        }
        for device in &payload.devices {
            if self.upsert(device, None)? {
                self.counts.devices += 1;
            }
        }
        for research in &payload.research {
            self.research(research)?;
        }
        for session in &payload.sessions {
            self.session(session)?;
        }
        Ok(())
    }

    /// Each SNOMED collection is handled by its own concrete type.
    fn catalog(&mut self, catalog: &SnomedCatalog) -> Result<()> {
        let mut written = 0;
        for e in &catalog.body_regions {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.body_structures {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.topographical_modifiers {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.lateralities {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.severity_codes {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.clinical_conditions {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.clinical_events {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.medications {
            written += u64::from(self.upsert(e, None)?);
        }
        for e in &catalog.allergy_intolerances {
            written += u64::from(self.upsert(e, None)?);
        }
        self.counts.snomed += written;
        Ok(())
    }

    fn volunteer(&mut self, volunteer: &Volunteer) -> Result<()> {
        if self.upsert(volunteer, None)? {
            self.counts.volunteers += 1;
        }
        let parent = Some(volunteer.id.as_str());
        for c in &volunteer.conditions {
            self.upsert(c, parent)?;
        }
        for a in &volunteer.allergies {
            self.upsert(a, parent)?;
        }
        for m in &volunteer.medications {
            self.upsert(m, parent)?;
        }
        for e in &volunteer.clinical_events {
            self.upsert(e, parent)?;
        }
        Ok(())
    }

    fn research(&mut self, research: &Research) -> Result<()> {
        if self.upsert(research, None)? {
            self.counts.research += 1;
        }
        let parent = Some(research.id.as_str());
        for app in &research.applications {
            self.upsert(app, parent)?;
        }
        for link in &research.devices {
            self.require(EntityKind::Device, &link.device_id, EntityKind::ResearchDevice, &link.id)?;
            self.upsert(link, parent)?;
        }
        for link in &research.researchers {
            self.require(
                EntityKind::Researcher,
                &link.researcher_id,
                EntityKind::ResearchResearcher,
                &link.id,
            )?;
            self.upsert(link, parent)?;
        }
        for link in &research.volunteers {
            self.require(EntityKind::Volunteer, &link.volunteer_id, EntityKind::ResearchVolunteer, &link.id)?;
            self.upsert(link, parent)?;
        }
        Ok(())
    }

    fn session(&mut self, session: &RecordSession) -> Result<()> {
        self.require(EntityKind::Research, &session.research_id, EntityKind::RecordSession, &session.id)?;
        if let Some(volunteer_id) = &session.volunteer_id {
            self.require(EntityKind::Volunteer, volunteer_id, EntityKind::RecordSession, &session.id)?;
        }
        if self.upsert(session, None)? {
            self.counts.sessions += 1;
        }
        for record in &session.records {
            self.upsert(record, Some(&session.id))?;
            for channel in &record.channels {
                self.upsert(channel, Some(&record.id))?;
                for area in &channel.target_areas {
                    self.upsert(area, Some(&channel.id))?;
                }
            }
        }
        Ok(())
    }

    /// Resolve and write one entity. Returns whether it was written.
    fn upsert<E: SyncEntity>(&mut self, entity: &E, parent_id: Option<&str>) -> Result<bool> {
        let record = to_record(entity, parent_id, self.local)?;
        let written = conflict::apply(&mut *self.tx, &record)?.is_write();
        if !written {
            self.counts.skipped += 1;
        }
        Ok(written)
    }

    /// Fail unless the referenced row exists in this transaction's view.
    fn require(&mut self, parent_kind: EntityKind, parent_id: &str, kind: EntityKind, id: &str) -> Result<()> {
        if self.tx.exists(parent_kind, parent_id)? {
            return Ok(());
        }
        Err(StoreError::MissingParent {
            kind: kind.to_string(),
            id: id.to_string(),
            parent_kind: parent_kind.to_string(),
            parent_id: parent_id.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Device, ResearchDevice};
    use irn_store::{MemoryBlobStore, MemoryEntityStore};
    use serde_json::Map;

    fn importer(store: Arc<MemoryEntityStore>, blobs: Arc<MemoryBlobStore>, local: NodeId) -> SyncImporter {
        SyncImporter::new(store, blobs, local, ImportConfig::default())
    }

    fn device(id: &str, updated_at: DateTime<Utc>, owner: NodeId) -> Device {
        Device {
            id: id.into(),
            created_at: updated_at,
            updated_at,
            owner_node_id: Some(owner),
            attributes: Map::new(),
        }
    }

    fn research_linking(device_id: &str, now: DateTime<Utc>) -> Research {
        Research {
            id: "r1".into(),
            created_at: now,
            updated_at: now,
            owner_node_id: None,
            applications: vec![],
            devices: vec![ResearchDevice {
                id: "rd1".into(),
                created_at: now,
                updated_at: now,
                device_id: device_id.into(),
                attributes: Map::new(),
            }],
            researchers: vec![],
            volunteers: vec![],
            attributes: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_import_rewrites_owner_and_records_log() {
        let store = Arc::new(MemoryEntityStore::new());
        let local = NodeId::new();
        let remote = NodeId::new();
        let now = Utc::now();

        let mut payload = SyncImportPayload::new(remote, now);
        payload.devices.push(device("d1", now, remote));

        let report = importer(store.clone(), Arc::new(MemoryBlobStore::new()), local)
            .import(remote, payload)
            .await
            .unwrap();
        assert_eq!(report.counts.devices, 1);
        assert_eq!(report.watermark, truncate_micros(now));

        let stored = store.get(EntityKind::Device, "d1").await.unwrap().unwrap();
        assert_eq!(stored.owner_node_id, Some(local));
        assert_eq!(stored.data["ownerNodeId"], serde_json::json!(local));

        let log = store.last_completed_sync(&remote).await.unwrap().unwrap();
        assert_eq!(log.id, report.sync_log_id);
        assert_eq!(log.last_synced_at, Some(truncate_micros(now)));
    }

    #[tokio::test]
    async fn test_missing_link_target_rolls_back() {
        let store = Arc::new(MemoryEntityStore::new());
        let remote = NodeId::new();
        let now = Utc::now();

        let mut payload = SyncImportPayload::new(remote, now);
        payload.devices.push(device("d1", now, remote));
        payload.research.push(research_linking("ghost", now));

        let err = importer(store.clone(), Arc::new(MemoryBlobStore::new()), NodeId::new())
            .import(remote, payload)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::MissingParent { .. })));

        assert!(store.get(EntityKind::Device, "d1").await.unwrap().is_none());
        let logs = store.list_sync_logs(Some(&remote)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Failed);
        assert_eq!(logs[0].counts.devices, 1);
        assert!(logs[0].error_message.as_deref().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_link_to_device_in_same_payload() {
        let store = Arc::new(MemoryEntityStore::new());
        let remote = NodeId::new();
        let now = Utc::now();

        let mut payload = SyncImportPayload::new(remote, now);
        payload.devices.push(device("d1", now, remote));
        payload.research.push(research_linking("d1", now));

        let report = importer(store.clone(), Arc::new(MemoryBlobStore::new()), NodeId::new())
            .import(remote, payload)
            .await
            .unwrap();
        assert_eq!(report.counts.research, 1);
        let link = store.get(EntityKind::ResearchDevice, "rd1").await.unwrap().unwrap();
        assert_eq!(link.parent_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_recordings_uploaded_after_commit() {
        let store = Arc::new(MemoryEntityStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let remote = NodeId::new();

        let mut payload = SyncImportPayload::new(remote, Utc::now());
        payload.recording_files.push(RecordingFile {
            channel_id: "ch1".into(),
            file_name: "ch1.edf".into(),
            content_type: "application/edf".into(),
            content: STANDARD.encode(b"EDF"),
        });
        payload.recording_files.push(RecordingFile {
            channel_id: "ch2".into(),
            file_name: "ch2.edf".into(),
            content_type: "application/edf".into(),
            content: "%%% not base64".into(),
        });

        let report = importer(store.clone(), blobs.clone(), NodeId::new())
            .import(remote, payload)
            .await
            .unwrap();
        assert_eq!((report.files_uploaded, report.files_failed), (1, 1));
        assert!(blobs.exists("ch1.edf").await.unwrap());

        let log = store.get_sync_log(&report.sync_log_id).await.unwrap().unwrap();
        assert_eq!(log.counts.recording_files, 1);
        assert_eq!(log.status, SyncStatus::Completed);
    }
}
