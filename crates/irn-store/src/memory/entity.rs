use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use irn_core::NodeId;

use super::{read, write};
use crate::error::{Result, StoreError};
use crate::record::{EntityKind, EntityRecord, KindSummary, SyncLog, SyncStatus};
use crate::traits::{EntityStore, EntityTx};

/// In-memory entity store.
///
/// A transaction works on a copy of the state and swaps it in on commit,
/// holding the write lock throughout so transactions are serialised.
#[derive(Default)]
pub struct MemoryEntityStore {
    inner: RwLock<Inner>,
}

#[derive(Clone, Default)]
struct Inner {
    entities: BTreeMap<(EntityKind, String), EntityRecord>,
    sync_logs: HashMap<Uuid, SyncLog>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newer_than(record: &EntityRecord, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |s| record.updated_at > s)
}

fn sorted(mut records: Vec<EntityRecord>) -> Vec<EntityRecord> {
    records.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
    records
}

struct MemoryTx<'a> {
    state: &'a mut Inner,
}

impl EntityTx for MemoryTx<'_> {
    fn find(&mut self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        Ok(self.state.entities.get(&(kind, id.to_string())).cloned())
    }

    fn insert(&mut self, record: &EntityRecord) -> Result<()> {
        let key = (record.kind, record.id.clone());
        if self.state.entities.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} {} already exists", record.kind, record.id)));
        }
        self.state.entities.insert(key, record.clone());
        Ok(())
    }

    fn update(&mut self, record: &EntityRecord) -> Result<()> {
        match self.state.entities.get_mut(&(record.kind, record.id.clone())) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("{} {}", record.kind, record.id))),
        }
    }

    fn insert_sync_log(&mut self, log: &SyncLog) -> Result<()> {
        if self.state.sync_logs.contains_key(&log.id) {
            return Err(StoreError::Conflict(format!("sync log {} already exists", log.id)));
        }
        self.state.sync_logs.insert(log.id, log.clone());
        Ok(())
    }

    fn update_sync_log(&mut self, log: &SyncLog) -> Result<()> {
        match self.state.sync_logs.get_mut(&log.id) {
            Some(existing) => {
                *existing = log.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("sync log {}", log.id))),
        }
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn summary(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Result<KindSummary> {
        let inner = read(&self.inner)?;
        let mut summary = KindSummary::default();
        for record in inner.entities.values().filter(|r| r.kind == kind && newer_than(r, since)) {
            summary.count += 1;
            summary.latest_update = summary.latest_update.max(Some(record.updated_at));
        }
        Ok(summary)
    }

    async fn page(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<EntityRecord>> {
        let matching: Vec<EntityRecord> = read(&self.inner)?
            .entities
            .values()
            .filter(|r| r.kind == kind && newer_than(r, since))
            .cloned()
            .collect();

        let offset = (page.max(1) as usize - 1) * page_size as usize;
        Ok(sorted(matching).into_iter().skip(offset).take(page_size as usize).collect())
    }

    async fn children(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<EntityRecord>> {
        let children: Vec<EntityRecord> = read(&self.inner)?
            .entities
            .values()
            .filter(|r| r.kind == kind && r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        Ok(sorted(children))
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        Ok(read(&self.inner)?.entities.get(&(kind, id.to_string())).cloned())
    }

    async fn get_sync_log(&self, id: &Uuid) -> Result<Option<SyncLog>> {
        Ok(read(&self.inner)?.sync_logs.get(id).cloned())
    }

    async fn last_completed_sync(&self, remote: &NodeId) -> Result<Option<SyncLog>> {
        Ok(read(&self.inner)?
            .sync_logs
            .values()
            .filter(|l| l.remote_node_id == *remote && l.status == SyncStatus::Completed)
            .max_by_key(|l| (l.completed_at, l.started_at))
            .cloned())
    }

    async fn list_sync_logs(&self, remote: Option<&NodeId>) -> Result<Vec<SyncLog>> {
        let mut logs: Vec<SyncLog> = read(&self.inner)?
            .sync_logs
            .values()
            .filter(|l| remote.map_or(true, |r| l.remote_node_id == *r))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(logs)
    }

    fn transaction(&self, work: &mut dyn FnMut(&mut dyn EntityTx) -> Result<()>) -> Result<()> {
        let mut inner = write(&self.inner)?;
        let mut snapshot = inner.clone();
        work(&mut MemoryTx { state: &mut snapshot })?;
        *inner = snapshot;
        Ok(())
    }

    fn record_sync_log(&self, log: &SyncLog) -> Result<()> {
        write(&self.inner)?.sync_logs.insert(log.id, log.clone());
        Ok(())
    }
}
