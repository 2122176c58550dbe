//! SQLite implementation of the registry and entity store.
//!
//! Uses rusqlite with bundled SQLite. Async trait methods run their queries on
//! the blocking pool via `tokio::task::spawn_blocking`.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use irn_core::{AccessLevel, AuthorizationStatus, NodeContact, NodeId, RegisteredNode};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::record::{EntityKind, EntityRecord, KindSummary, SyncLog, SyncStatus};
use crate::traits::{EntityStore, EntityTx, NodeRegistry};

/// SQLite-backed store.
///
/// Thread-safe via an internal mutex around a single connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a database file, creating it and running migrations as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migrate_and_wrap(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate_and_wrap(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn migrate_and_wrap(conn: &mut Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    migration::migrate(conn)
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Row conversion
// ─────────────────────────────────────────────────────────────────────────────

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(idx: usize, value: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {value}")))
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e.to_string()))
}

const NODE_COLUMNS: &str = "id, node_name, certificate, certificate_fingerprint, node_url, contact_name, \
     contact_email, institution_name, institution_details, status, access_level, registered_at, updated_at, \
     last_authenticated_at";

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<RegisteredNode> {
    let last_auth: Option<i64> = row.get(13)?;
    Ok(RegisteredNode {
        id: parse_col(row, 0)?,
        node_name: row.get(1)?,
        certificate: row.get(2)?,
        certificate_fingerprint: row.get(3)?,
        node_url: row.get(4)?,
        contact: NodeContact {
            contact_name: row.get(5)?,
            contact_email: row.get(6)?,
            institution_name: row.get(7)?,
            institution_details: row.get(8)?,
        },
        status: parse_col(row, 9)?,
        access_level: parse_col(row, 10)?,
        registered_at: from_micros(11, row.get(11)?)?,
        updated_at: from_micros(12, row.get(12)?)?,
        last_authenticated_at: last_auth.map(|v| from_micros(13, v)).transpose()?,
    })
}

const ENTITY_COLUMNS: &str = "kind, id, parent_id, owner_node_id, created_at, updated_at, data";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<EntityRecord> {
    let owner: Option<String> = row.get(3)?;
    let data: String = row.get(6)?;
    Ok(EntityRecord {
        kind: parse_col(row, 0)?,
        id: row.get(1)?,
        parent_id: row.get(2)?,
        owner_node_id: owner
            .map(|s| NodeId::parse(&s).map_err(|e| conversion_error(3, e.to_string())))
            .transpose()?,
        created_at: from_micros(4, row.get(4)?)?,
        updated_at: from_micros(5, row.get(5)?)?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(6, e.to_string()))?,
    })
}

const SYNC_LOG_COLUMNS: &str =
    "id, remote_node_id, started_at, completed_at, status, last_synced_at, counts, error_message";

fn row_to_sync_log(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    let completed: Option<i64> = row.get(3)?;
    let last_synced: Option<i64> = row.get(5)?;
    let counts: String = row.get(6)?;
    Ok(SyncLog {
        id: parse_col::<Uuid>(row, 0)?,
        remote_node_id: parse_col(row, 1)?,
        started_at: from_micros(2, row.get(2)?)?,
        completed_at: completed.map(|v| from_micros(3, v)).transpose()?,
        status: parse_col::<SyncStatus>(row, 4)?,
        last_synced_at: last_synced.map(|v| from_micros(5, v)).transpose()?,
        counts: serde_json::from_str(&counts).map_err(|e| conversion_error(6, e.to_string()))?,
        error_message: row.get(7)?,
    })
}

fn upsert_sync_log(conn: &Connection, log: &SyncLog) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_logs (id, remote_node_id, started_at, completed_at, status, last_synced_at, counts, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            remote_node_id = excluded.remote_node_id,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            status = excluded.status,
            last_synced_at = excluded.last_synced_at,
            counts = excluded.counts,
            error_message = excluded.error_message",
        params![
            log.id.to_string(),
            log.remote_node_id.to_string(),
            micros(log.started_at),
            log.completed_at.map(micros),
            log.status.as_str(),
            log.last_synced_at.map(micros),
            serde_json::to_string(&log.counts)?,
            log.error_message,
        ],
    )?;
    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Node registry
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl NodeRegistry for SqliteStore {
    async fn insert(&self, node: &RegisteredNode) -> Result<()> {
        let node = node.clone();
        self.blocking(move |conn| {
            let result = conn.execute(
                &format!("INSERT INTO nodes ({NODE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    node.id.to_string(),
                    node.node_name,
                    node.certificate,
                    node.certificate_fingerprint,
                    node.node_url,
                    node.contact.contact_name,
                    node.contact.contact_email,
                    node.contact.institution_name,
                    node.contact.institution_details,
                    node.status.as_str(),
                    node.access_level.as_str(),
                    micros(node.registered_at),
                    micros(node.updated_at),
                    node.last_authenticated_at.map(micros),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                    "node {} or fingerprint {} already registered",
                    node.id, node.certificate_fingerprint
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, node: &RegisteredNode) -> Result<()> {
        let node = node.clone();
        self.blocking(move |conn| {
            let result = conn.execute(
                "UPDATE nodes SET node_name = ?2, certificate = ?3, certificate_fingerprint = ?4, node_url = ?5,
                    contact_name = ?6, contact_email = ?7, institution_name = ?8, institution_details = ?9,
                    status = ?10, access_level = ?11, updated_at = ?12, last_authenticated_at = ?13
                 WHERE id = ?1",
                params![
                    node.id.to_string(),
                    node.node_name,
                    node.certificate,
                    node.certificate_fingerprint,
                    node.node_url,
                    node.contact.contact_name,
                    node.contact.contact_email,
                    node.contact.institution_name,
                    node.contact.institution_details,
                    node.status.as_str(),
                    node.access_level.as_str(),
                    micros(node.updated_at),
                    node.last_authenticated_at.map(micros),
                ],
            );
            match result {
                Ok(0) => Err(StoreError::NotFound(format!("node {}", node.id))),
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                    "fingerprint {} belongs to another node",
                    node.certificate_fingerprint
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_by_id(&self, id: &NodeId) -> Result<Option<RegisteredNode>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"), params![id], row_to_node)
                .optional()?)
        })
        .await
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredNode>> {
        let fingerprint = fingerprint.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE certificate_fingerprint = ?1"),
                    params![fingerprint],
                    row_to_node,
                )
                .optional()?)
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<RegisteredNode>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY registered_at, id"))?;
            let nodes = stmt
                .query_map([], row_to_node)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn set_status(
        &self,
        id: &NodeId,
        status: AuthorizationStatus,
        access_level: Option<AccessLevel>,
    ) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE nodes SET status = ?2, access_level = COALESCE(?3, access_level), updated_at = ?4 WHERE id = ?1",
                params![id, status.as_str(), access_level.map(AccessLevel::as_str), micros(Utc::now())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_authenticated(&self, id: &NodeId, at: DateTime<Utc>) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE nodes SET last_authenticated_at = ?2 WHERE id = ?1",
                params![id, micros(at)],
            )?;
            Ok(())
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

struct SqliteTx<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl EntityTx for SqliteTx<'_> {
    fn find(&mut self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .tx
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND id = ?2"),
                params![kind.as_str(), id],
                row_to_entity,
            )
            .optional()?)
    }

    fn exists(&mut self, kind: EntityKind, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert(&mut self, record: &EntityRecord) -> Result<()> {
        let result = self.tx.execute(
            &format!("INSERT INTO entities ({ENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                record.kind.as_str(),
                record.id,
                record.parent_id,
                record.owner_node_id.map(|n| n.to_string()),
                micros(record.created_at),
                micros(record.updated_at),
                serde_json::to_string(&record.data)?,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Conflict(format!("{} {} already exists", record.kind, record.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&mut self, record: &EntityRecord) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE entities SET parent_id = ?3, owner_node_id = ?4, created_at = ?5, updated_at = ?6, data = ?7
             WHERE kind = ?1 AND id = ?2",
            params![
                record.kind.as_str(),
                record.id,
                record.parent_id,
                record.owner_node_id.map(|n| n.to_string()),
                micros(record.created_at),
                micros(record.updated_at),
                serde_json::to_string(&record.data)?,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("{} {}", record.kind, record.id)));
        }
        Ok(())
    }

    fn insert_sync_log(&mut self, log: &SyncLog) -> Result<()> {
        upsert_sync_log(self.tx, log)
    }

    fn update_sync_log(&mut self, log: &SyncLog) -> Result<()> {
        upsert_sync_log(self.tx, log)
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn summary(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> Result<KindSummary> {
        let since = since.map(micros).unwrap_or(i64::MIN);
        self.blocking(move |conn| {
            let (count, latest): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MAX(updated_at) FROM entities WHERE kind = ?1 AND updated_at > ?2",
                params![kind.as_str(), since],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(KindSummary {
                count: count as u64,
                latest_update: latest.map(|v| from_micros(1, v)).transpose()?,
            })
        })
        .await
    }

    async fn page(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<EntityRecord>> {
        let since = since.map(micros).unwrap_or(i64::MIN);
        let offset = (i64::from(page.max(1)) - 1) * i64::from(page_size);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND updated_at > ?2
                 ORDER BY updated_at, id LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(params![kind.as_str(), since, i64::from(page_size), offset], row_to_entity)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn children(&self, kind: EntityKind, parent_id: &str) -> Result<Vec<EntityRecord>> {
        let parent_id = parent_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND parent_id = ?2 ORDER BY updated_at, id"
            ))?;
            let rows = stmt
                .query_map(params![kind.as_str(), parent_id], row_to_entity)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE kind = ?1 AND id = ?2"),
                    params![kind.as_str(), id],
                    row_to_entity,
                )
                .optional()?)
        })
        .await
    }

    async fn get_sync_log(&self, id: &Uuid) -> Result<Option<SyncLog>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE id = ?1"),
                    params![id],
                    row_to_sync_log,
                )
                .optional()?)
        })
        .await
    }

    async fn last_completed_sync(&self, remote: &NodeId) -> Result<Option<SyncLog>> {
        let remote = remote.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE remote_node_id = ?1 AND status = 'completed'
                         ORDER BY completed_at DESC, started_at DESC LIMIT 1"
                    ),
                    params![remote],
                    row_to_sync_log,
                )
                .optional()?)
        })
        .await
    }

    async fn list_sync_logs(&self, remote: Option<&NodeId>) -> Result<Vec<SyncLog>> {
        let remote = remote.map(|r| r.to_string());
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE (?1 IS NULL OR remote_node_id = ?1)
                 ORDER BY started_at DESC"
            ))?;
            let rows = stmt
                .query_map(params![remote], row_to_sync_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    fn transaction(&self, work: &mut dyn FnMut(&mut dyn EntityTx) -> Result<()>) -> Result<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        work(&mut SqliteTx { tx: &tx })?;
        tx.commit()?;
        Ok(())
    }

    fn record_sync_log(&self, log: &SyncLog) -> Result<()> {
        let conn = lock(&self.conn)?;
        upsert_sync_log(&conn, log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SyncCounts;
    use chrono::Duration;
    use serde_json::json;

    fn node(fingerprint: &str) -> RegisteredNode {
        let now = crate::record::truncate_micros(Utc::now());
        RegisteredNode {
            id: NodeId::new(),
            node_name: "node-b".into(),
            certificate: "MII=".into(),
            certificate_fingerprint: fingerprint.into(),
            node_url: Some("https://b.example".into()),
            contact: NodeContact {
                institution_name: Some("Institute B".into()),
                ..Default::default()
            },
            status: AuthorizationStatus::Pending,
            access_level: AccessLevel::ReadOnly,
            registered_at: now,
            updated_at: now,
            last_authenticated_at: None,
        }
    }

    fn record(kind: EntityKind, id: &str, updated_at: DateTime<Utc>) -> EntityRecord {
        EntityRecord::new(kind, id, updated_at, updated_at, json!({ "id": id }))
    }

    #[tokio::test]
    async fn test_node_round_trip() {
        let store = SqliteStore::open_memory().unwrap();
        let n = node("aa");
        store.insert(&n).await.unwrap();

        assert_eq!(store.get_by_id(&n.id).await.unwrap().unwrap(), n);
        assert_eq!(store.get_by_fingerprint("aa").await.unwrap().unwrap(), n);
        assert!(matches!(store.insert(&node("aa")).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_set_status_keeps_access_level_when_absent() {
        let store = SqliteStore::open_memory().unwrap();
        let n = node("aa");
        store.insert(&n).await.unwrap();

        store
            .set_status(&n.id, AuthorizationStatus::Authorized, Some(AccessLevel::ReadWrite))
            .await
            .unwrap();
        store.set_status(&n.id, AuthorizationStatus::Revoked, None).await.unwrap();

        let got = store.get_by_id(&n.id).await.unwrap().unwrap();
        assert_eq!(got.status, AuthorizationStatus::Revoked);
        assert_eq!(got.access_level, AccessLevel::ReadWrite);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let log = SyncLog::start(NodeId::new());

        let result = store.transaction(&mut |tx| {
            tx.insert_sync_log(&log)?;
            tx.insert(&record(EntityKind::Volunteer, "v1", now))?;
            Err(StoreError::Aborted("simulated".into()))
        });
        assert!(result.is_err());

        assert!(store.get(EntityKind::Volunteer, "v1").await.unwrap().is_none());
        assert!(store.get_sync_log(&log.id).await.unwrap().is_none());

        let mut failed = log.clone();
        failed.status = SyncStatus::Failed;
        failed.error_message = Some("simulated".into());
        store.record_sync_log(&failed).unwrap();
        assert_eq!(store.get_sync_log(&log.id).await.unwrap().unwrap(), failed);
    }

    #[tokio::test]
    async fn test_page_summary_and_children() {
        let store = SqliteStore::open_memory().unwrap();
        let base = Utc::now();

        store
            .transaction(&mut |tx| {
                for i in 0..4 {
                    tx.insert(&record(EntityKind::Research, &format!("r{i}"), base + Duration::seconds(i)))?;
                }
                tx.insert(&record(EntityKind::ResearchApplication, "app-1", base).with_parent("r1"))?;
                tx.insert(&record(EntityKind::ResearchApplication, "app-2", base).with_parent("r2"))?;
                Ok(())
            })
            .unwrap();

        let page = store.page(EntityKind::Research, Some(base), 1, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);

        let summary = store.summary(EntityKind::Research, None).await.unwrap();
        assert_eq!(summary.count, 4);

        let children = store.children(EntityKind::ResearchApplication, "r1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "app-1");
    }

    #[tokio::test]
    async fn test_update_preserves_micros() {
        let store = SqliteStore::open_memory().unwrap();
        let ts = DateTime::from_timestamp(1_700_000_000, 987_654_321).unwrap();
        let rec = record(EntityKind::Device, "d1", ts);

        store
            .transaction(&mut |tx| {
                tx.insert(&rec)?;
                let stored = tx.find(EntityKind::Device, "d1")?.unwrap();
                assert_eq!(stored.updated_at, rec.updated_at);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_last_completed_sync_and_counts() {
        let store = SqliteStore::open_memory().unwrap();
        let remote = NodeId::new();
        let mut log = SyncLog::start(remote);
        log.status = SyncStatus::Completed;
        log.completed_at = Some(log.started_at);
        log.counts = SyncCounts {
            volunteers: 3,
            ..Default::default()
        };
        store.record_sync_log(&log).unwrap();

        let got = store.last_completed_sync(&remote).await.unwrap().unwrap();
        assert_eq!(got.counts.volunteers, 3);
        assert_eq!(store.list_sync_logs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("irn.db");
        let n = node("cc");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&n).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_by_fingerprint("cc").await.unwrap().is_some());
    }
}
