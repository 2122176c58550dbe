//! Import and pull against in-memory nodes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};

use irn_core::NodeId;
use irn_store::{BlobStore, EntityKind, EntityStore, MemoryNodeRegistry, StoreError, SyncStatus};
use irn_sync::{
    EntityGroup, EntityPage, LocalSource, Manifest, PageQuery, PullConfig, RecordingFile, SyncError,
    SyncImportPayload, SyncPuller, SyncSource,
};
use irn_testkit::fixtures::{device, research, sample_payload, session};
use irn_testkit::{generators, SyncNode, SAMPLE_PAYLOAD_ROWS};

fn puller(node: &SyncNode) -> SyncPuller {
    SyncPuller::new(
        Arc::new(MemoryNodeRegistry::new()),
        node.store.clone(),
        node.importer.clone(),
        PullConfig {
            page_size: 2,
            ..PullConfig::default()
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Atomicity
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failure_midway_commits_nothing_and_logs_failure() {
    let node = SyncNode::new(NodeId::new(), "local");
    let remote = NodeId::new();
    let now = Utc::now();

    let mut payload = SyncImportPayload::new(remote, now);
    payload.research.push(research("study-1", now));
    for i in 1..=10 {
        let research_id = if i == 5 { "study-missing" } else { "study-1" };
        payload.sessions.push(session(&format!("sess-{i}"), research_id, now, false));
    }

    let before = Utc::now();
    let err = node.importer.import(remote, payload).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::MissingParent { .. })));

    assert!(node.store.get(EntityKind::Research, "study-1").await.unwrap().is_none());
    let sessions = node.store.summary(EntityKind::RecordSession, None).await.unwrap();
    assert_eq!(sessions.count, 0);
    assert_eq!(node.store.summary(EntityKind::Record, None).await.unwrap().count, 0);

    let logs = node.store.list_sync_logs(Some(&remote)).await.unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.status, SyncStatus::Failed);
    assert_eq!(log.counts.research, 1);
    assert_eq!(log.counts.sessions, 4);
    assert!(log.started_at >= before - Duration::milliseconds(1));
    assert!(log.completed_at.unwrap() >= log.started_at);
    assert!(log.error_message.as_deref().unwrap().contains("study-missing"));
    assert!(node.store.last_completed_sync(&remote).await.unwrap().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Newer wins
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reimport_is_noop() {
    let node = SyncNode::new(NodeId::new(), "local");
    let remote = NodeId::new();
    let payload = sample_payload(remote, Utc::now() - Duration::minutes(5));

    let first = node.importer.import(remote, payload.clone()).await.unwrap();
    assert_eq!(first.counts.skipped, 0);
    assert_eq!(first.written(), 3 + 1 + 1 + 1 + 1 + 2);
    let snapshot = node.store.page(EntityKind::RecordChannel, None, 1, 100).await.unwrap();

    let second = node.importer.import(remote, payload).await.unwrap();
    assert_eq!(second.written(), 0);
    assert_eq!(second.counts.skipped, SAMPLE_PAYLOAD_ROWS);
    assert_eq!(node.store.page(EntityKind::RecordChannel, None, 1, 100).await.unwrap(), snapshot);
    assert_eq!(node.store.list_sync_logs(Some(&remote)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_older_is_ignored_and_newer_overwrites() {
    let node = SyncNode::new(NodeId::new(), "local");
    let remote = NodeId::new();
    let t0 = Utc::now() - Duration::hours(1);

    let mut payload = SyncImportPayload::new(remote, t0);
    payload.devices.push(device("dev-1", t0));
    node.importer.import(remote, payload).await.unwrap();

    let mut older = device("dev-1", t0 - Duration::minutes(1));
    older.attributes.insert("manufacturer".into(), json!("Older Co"));
    let mut payload = SyncImportPayload::new(remote, t0);
    payload.devices.push(older);
    let report = node.importer.import(remote, payload).await.unwrap();
    assert_eq!(report.counts.devices, 0);
    let stored = node.store.get(EntityKind::Device, "dev-1").await.unwrap().unwrap();
    assert_eq!(stored.data["manufacturer"], "Acme");

    let mut newer = device("dev-1", t0 + Duration::minutes(1));
    newer.attributes.insert("manufacturer".into(), json!("Newer Co"));
    newer.attributes.insert("deviceName".into(), json!("EEG v2"));
    let mut payload = SyncImportPayload::new(remote, t0 + Duration::minutes(2));
    payload.devices.push(newer);
    let report = node.importer.import(remote, payload).await.unwrap();
    assert_eq!(report.counts.devices, 1);

    let stored = node.store.get(EntityKind::Device, "dev-1").await.unwrap().unwrap();
    assert_eq!(stored.data["manufacturer"], "Newer Co");
    assert_eq!(stored.data["deviceName"], "EEG v2");
    assert_eq!(stored.updated_at, irn_store::truncate_micros(t0 + Duration::minutes(1)));
    assert_eq!(stored.created_at, irn_store::truncate_micros(t0));
    assert_eq!(stored.owner_node_id, Some(node.node_id));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_import_twice_changes_nothing(payload in generators::payload()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let node = SyncNode::new(NodeId::new(), "local");
            let remote = payload.source_node_id;
            let rows = (payload.snomed.len() + payload.researchers.len() + payload.devices.len()) as u64;

            let first = node.importer.import(remote, payload.clone()).await.unwrap();
            prop_assert_eq!(first.written(), rows);
            let devices = node.store.page(EntityKind::Device, None, 1, 100).await.unwrap();

            let second = node.importer.import(remote, payload).await.unwrap();
            prop_assert_eq!(second.written(), 0);
            prop_assert_eq!(second.counts.skipped, rows);
            prop_assert_eq!(node.store.page(EntityKind::Device, None, 1, 100).await.unwrap(), devices);
            Ok(())
        })?;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pull
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pull_copies_everything_and_advances_watermark() {
    let a = SyncNode::new(NodeId::new(), "node-a");
    let b = SyncNode::new(NodeId::new(), "node-b");
    a.seed(sample_payload(NodeId::new(), Utc::now() - Duration::minutes(5))).await;
    a.blobs
        .upload("sess-1.edf", Bytes::from_static(b"EDF+C"), "application/edf")
        .await
        .unwrap();

    let puller = puller(&b);
    let mut source = LocalSource::new(a.exporter.clone(), b.node_id);
    let report = puller.pull_from(&mut source, a.node_id, None).await.unwrap();
    assert!(source.is_closed());
    assert_eq!(report.counts.sessions, 2);
    assert_eq!(report.files_uploaded, 1);

    for kind in [EntityKind::Volunteer, EntityKind::TargetArea, EntityKind::ResearchVolunteer] {
        assert_eq!(
            b.store.summary(kind, None).await.unwrap().count,
            a.store.summary(kind, None).await.unwrap().count,
            "{kind}"
        );
    }
    let session = b.store.get(EntityKind::RecordSession, "sess-1").await.unwrap().unwrap();
    assert_eq!(session.owner_node_id, Some(b.node_id));
    assert_eq!(b.blobs.download("sess-1.edf").await.unwrap().unwrap().bytes.as_ref(), b"EDF+C");

    let since = puller.resolve_since(&a.node_id, None).await.unwrap();
    assert_eq!(since, Some(report.watermark));

    let mut source = LocalSource::new(a.exporter.clone(), b.node_id);
    let again = puller.pull_from(&mut source, a.node_id, since).await.unwrap();
    assert_eq!(again.written(), 0);
    assert_eq!(again.counts.skipped, 0);

    let manifest = a.exporter.manifest(None, Some(&b.node_id)).await.unwrap();
    assert!(manifest.last_synced_at.is_none());
    let manifest = b.exporter.manifest(None, Some(&a.node_id)).await.unwrap();
    assert_eq!(manifest.last_synced_at, Some(again.watermark));
}

/// Fails on the first page of one group.
struct FailingSource {
    inner: LocalSource,
    fail_on: EntityGroup,
    closed: bool,
}

#[async_trait]
impl SyncSource for FailingSource {
    async fn manifest(&mut self, since: Option<DateTime<Utc>>) -> irn_sync::Result<Manifest> {
        self.inner.manifest(since).await
    }

    async fn page(&mut self, group: EntityGroup, query: &PageQuery) -> irn_sync::Result<EntityPage<Value>> {
        if group == self.fail_on {
            return Err(SyncError::Transport {
                message: "connection reset".into(),
                retryable: true,
            });
        }
        self.inner.page(group, query).await
    }

    async fn recording_file(&mut self, channel_id: &str) -> irn_sync::Result<Option<RecordingFile>> {
        self.inner.recording_file(channel_id).await
    }

    async fn close(&mut self) -> irn_sync::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[tokio::test]
async fn test_transport_failure_aborts_pull_but_closes_source() {
    let a = SyncNode::new(NodeId::new(), "node-a");
    let b = SyncNode::new(NodeId::new(), "node-b");
    a.seed(sample_payload(NodeId::new(), Utc::now() - Duration::minutes(5))).await;

    let mut source = FailingSource {
        inner: LocalSource::new(a.exporter.clone(), b.node_id),
        fail_on: EntityGroup::Research,
        closed: false,
    };
    let err = puller(&b).pull_from(&mut source, a.node_id, None).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(source.closed);
    assert_eq!(b.store.summary(EntityKind::Volunteer, None).await.unwrap().count, 0);
    assert!(b.store.list_sync_logs(None).await.unwrap().is_empty());
}

/// Serves pages but fails every recording download.
struct NoFiles(LocalSource);

#[async_trait]
impl SyncSource for NoFiles {
    async fn manifest(&mut self, since: Option<DateTime<Utc>>) -> irn_sync::Result<Manifest> {
        self.0.manifest(since).await
    }

    async fn page(&mut self, group: EntityGroup, query: &PageQuery) -> irn_sync::Result<EntityPage<Value>> {
        self.0.page(group, query).await
    }

    async fn recording_file(&mut self, _channel_id: &str) -> irn_sync::Result<Option<RecordingFile>> {
        Err(SyncError::Transport {
            message: "timed out".into(),
            retryable: true,
        })
    }

    async fn close(&mut self) -> irn_sync::Result<()> {
        self.0.close().await
    }
}

#[tokio::test]
async fn test_recording_fetch_failure_is_not_fatal() {
    let a = SyncNode::new(NodeId::new(), "node-a");
    let b = SyncNode::new(NodeId::new(), "node-b");
    a.seed(sample_payload(NodeId::new(), Utc::now() - Duration::minutes(5))).await;

    let mut source = NoFiles(LocalSource::new(a.exporter.clone(), b.node_id));
    let report = puller(&b).pull_from(&mut source, a.node_id, None).await.unwrap();
    assert_eq!(report.counts.sessions, 2);
    assert_eq!(report.files_uploaded, 0);
    assert!(!b.blobs.exists("sess-1.edf").await.unwrap());
}
