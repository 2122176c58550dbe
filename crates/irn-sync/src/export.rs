//! Responder side of sync: manifest, entity pages and recording files.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

use irn_core::NodeId;
use irn_store::{truncate_micros, BlobStore, EntityKind, EntityRecord, EntityStore};

use crate::error::{Result, SyncError};
use crate::messages::{
    file_name_from_url, page_count, ChildSpec, EntityGroup, EntityPage, GroupSummary, Manifest, RecordingFile,
    MAX_PAGE_SIZE,
};

/// Serves this node's entities to authenticated peers.
pub struct SyncExporter {
    store: Arc<dyn EntityStore>,
    blobs: Arc<dyn BlobStore>,
    node_id: NodeId,
    node_name: String,
}

impl SyncExporter {
    pub fn new(
        store: Arc<dyn EntityStore>,
        blobs: Arc<dyn BlobStore>,
        node_id: NodeId,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            node_id,
            node_name: node_name.into(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Per-group counts and newest updates, filtered to `updatedAt > since`.
    ///
    /// `requester` selects which completed import supplies `lastSyncedAt`.
    pub async fn manifest(&self, since: Option<DateTime<Utc>>, requester: Option<&NodeId>) -> Result<Manifest> {
        let generated_at = truncate_micros(Utc::now());

        let mut groups = Vec::with_capacity(EntityGroup::ALL.len());
        for group in EntityGroup::ALL {
            let summary = self.store.summary(group.root_kind(), since).await?;
            groups.push(GroupSummary {
                group,
                count: summary.count,
                latest_update: summary.latest_update,
            });
        }

        let last_synced_at = match requester {
            Some(node) => self
                .store
                .last_completed_sync(node)
                .await?
                .and_then(|log| log.last_synced_at),
            None => None,
        };

        let manifest = Manifest {
            node_id: self.node_id,
            node_name: self.node_name.clone(),
            generated_at,
            last_synced_at,
            groups,
            recording_count: self.recording_count(since).await?,
        };
        tracing::debug!(
            since = ?since,
            total = manifest.total_count(),
            recordings = manifest.recording_count,
            "manifest generated"
        );
        Ok(manifest)
    }

    /// One page of `group` with children embedded.
    ///
    /// `since` filters top-level rows only; a changed row is sent with all of
    /// its children.
    pub async fn page(
        &self,
        group: EntityGroup,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<EntityPage<Value>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let kind = group.root_kind();

        let total_records = self.store.summary(kind, since).await?.count;
        let rows = self.store.page(kind, since, page, page_size).await?;

        let mut data = Vec::with_capacity(rows.len());
        for row in rows {
            data.push(self.assemble(row, group.children()).await?);
        }

        Ok(EntityPage {
            data,
            page,
            page_size,
            total_records,
            total_pages: page_count(total_records, page_size),
        })
    }

    /// The recording file referenced by a channel, if both exist.
    pub async fn recording_file(&self, channel_id: &str) -> Result<Option<RecordingFile>> {
        let Some(channel) = self.store.get(EntityKind::RecordChannel, channel_id).await? else {
            return Ok(None);
        };
        let Some(file_name) = channel
            .data
            .get("fileUrl")
            .and_then(Value::as_str)
            .and_then(file_name_from_url)
        else {
            return Ok(None);
        };
        let Some(blob) = self.blobs.download(file_name).await? else {
            tracing::debug!(channel = channel_id, file = file_name, "recording file missing");
            return Ok(None);
        };

        Ok(Some(RecordingFile {
            channel_id: channel_id.to_string(),
            file_name: file_name.to_string(),
            content_type: blob.content_type,
            content: STANDARD.encode(&blob.bytes),
        }))
    }

    /// Embed children into a stored row, recursively.
    fn assemble<'a>(
        &'a self,
        row: EntityRecord,
        specs: &'static [ChildSpec],
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let mut value = row.data;
            let Some(obj) = value.as_object_mut() else {
                return Err(SyncError::InvalidEntity(format!("{} {} is not an object", row.kind, row.id)));
            };
            for spec in specs {
                let children = self.store.children(spec.kind, &row.id).await?;
                let mut items = Vec::with_capacity(children.len());
                for child in children {
                    items.push(self.assemble(child, spec.children).await?);
                }
                obj.insert(spec.field.to_string(), Value::Array(items));
            }
            Ok(value)
        })
    }

    async fn recording_count(&self, since: Option<DateTime<Utc>>) -> Result<u64> {
        let mut count = 0;
        let mut page = 1;
        loop {
            let rows = self.store.page(EntityKind::RecordChannel, since, page, MAX_PAGE_SIZE).await?;
            count += rows
                .iter()
                .filter(|r| r.data.get("fileUrl").and_then(Value::as_str).is_some_and(|u| !u.is_empty()))
                .count() as u64;
            if rows.len() < MAX_PAGE_SIZE as usize {
                return Ok(count);
            }
            page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{to_record, Device, Volunteer, VolunteerCondition};
    use bytes::Bytes;
    use chrono::Duration;
    use irn_store::{EntityTx, MemoryBlobStore, MemoryEntityStore, StoreError};
    use serde_json::{json, Map};

    fn device(id: &str, updated_at: DateTime<Utc>) -> Device {
        Device {
            id: id.into(),
            created_at: updated_at,
            updated_at,
            owner_node_id: None,
            attributes: Map::new(),
        }
    }

    fn seed(store: &MemoryEntityStore, records: Vec<EntityRecord>) {
        store
            .transaction(&mut |tx: &mut dyn EntityTx| {
                for r in &records {
                    tx.insert(r)?;
                }
                Ok::<(), StoreError>(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_manifest_filters_by_since() {
        let node = NodeId::new();
        let store = Arc::new(MemoryEntityStore::new());
        let base = Utc::now() - Duration::hours(1);
        seed(
            &store,
            vec![
                to_record(&device("d1", base), None, node).unwrap(),
                to_record(&device("d2", base + Duration::minutes(30)), None, node).unwrap(),
            ],
        );
        let exporter = SyncExporter::new(store, Arc::new(MemoryBlobStore::new()), node, "Node A");

        let all = exporter.manifest(None, None).await.unwrap();
        assert_eq!(all.group(EntityGroup::Devices).unwrap().count, 2);
        assert_eq!(all.node_name, "Node A");
        assert!(all.last_synced_at.is_none());

        let recent = exporter.manifest(Some(base + Duration::minutes(1)), None).await.unwrap();
        let devices = recent.group(EntityGroup::Devices).unwrap();
        assert_eq!(devices.count, 1);
        assert_eq!(devices.latest_update, Some(truncate_micros(base + Duration::minutes(30))));
    }

    #[tokio::test]
    async fn test_page_is_ordered_and_paginated() {
        let node = NodeId::new();
        let store = Arc::new(MemoryEntityStore::new());
        let base = Utc::now() - Duration::hours(1);
        let records = (0..5)
            .map(|i| to_record(&device(&format!("d{i}"), base + Duration::seconds(5 - i)), None, node).unwrap())
            .collect();
        seed(&store, records);
        let exporter = SyncExporter::new(store, Arc::new(MemoryBlobStore::new()), node, "A");

        let first = exporter.page(EntityGroup::Devices, None, 1, 2).await.unwrap();
        assert_eq!(first.total_records, 5);
        assert_eq!(first.total_pages, 3);
        assert!(first.has_more());
        let ids: Vec<_> = first.data.iter().map(|v| v["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids, vec!["d4", "d3"]);

        let last = exporter.page(EntityGroup::Devices, None, 3, 2).await.unwrap();
        assert_eq!(last.data.len(), 1);
        assert!(!last.has_more());
    }

    #[tokio::test]
    async fn test_page_embeds_children() {
        let node = NodeId::new();
        let store = Arc::new(MemoryEntityStore::new());
        let now = Utc::now();
        let volunteer = Volunteer {
            id: "v1".into(),
            created_at: now,
            updated_at: now,
            owner_node_id: None,
            conditions: vec![],
            allergies: vec![],
            medications: vec![],
            clinical_events: vec![],
            attributes: Map::new(),
        };
        let condition = VolunteerCondition {
            id: "c1".into(),
            created_at: now,
            updated_at: now,
            attributes: Map::new(),
        };
        seed(
            &store,
            vec![
                to_record(&volunteer, None, node).unwrap(),
                to_record(&condition, Some("v1"), node).unwrap(),
            ],
        );
        let exporter = SyncExporter::new(store, Arc::new(MemoryBlobStore::new()), node, "A");

        let page = exporter.page(EntityGroup::Volunteers, None, 1, 10).await.unwrap();
        let row = &page.data[0];
        assert_eq!(row["conditions"][0]["id"], "c1");
        assert_eq!(row["allergies"], json!([]));
        let decoded: Volunteer = serde_json::from_value(row.clone()).unwrap();
        assert_eq!(decoded.conditions.len(), 1);
        assert_eq!(decoded.owner_node_id, Some(node));
    }

    #[tokio::test]
    async fn test_recording_file_missing_is_none() {
        let node = NodeId::new();
        let store = Arc::new(MemoryEntityStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let now = Utc::now();
        seed(
            &store,
            vec![
                EntityRecord::new(
                    EntityKind::RecordChannel,
                    "ch1",
                    now,
                    now,
                    json!({ "id": "ch1", "fileUrl": "files/ch1.edf" }),
                )
                .with_parent("rec1"),
                EntityRecord::new(EntityKind::RecordChannel, "ch2", now, now, json!({ "id": "ch2" }))
                    .with_parent("rec1"),
            ],
        );
        let exporter = SyncExporter::new(store, blobs.clone(), node, "A");

        assert!(exporter.recording_file("ch1").await.unwrap().is_none());
        assert!(exporter.recording_file("ch2").await.unwrap().is_none());
        assert!(exporter.recording_file("nope").await.unwrap().is_none());

        blobs
            .upload("ch1.edf", Bytes::from_static(b"EDF"), "application/edf")
            .await
            .unwrap();
        let file = exporter.recording_file("ch1").await.unwrap().unwrap();
        assert_eq!(file.file_name, "ch1.edf");
        assert_eq!(STANDARD.decode(file.content).unwrap(), b"EDF");
        assert_eq!(exporter.manifest(None, None).await.unwrap().recording_count, 1);
    }
}
