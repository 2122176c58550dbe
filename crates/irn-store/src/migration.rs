//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system. Each migration transforms the schema
//! from version N to N+1 inside one transaction.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent: safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, chrono::Utc::now().timestamp_millis()],
            )?;
        }

        tx.commit()?;
        tracing::info!(from = current, to = CURRENT_VERSION, "migrated database schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!("unknown migration version: {}", version))),
    }
}

/// Migration v1: registry, entities, sync logs.
///
/// Timestamps are Unix microseconds.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Known peer nodes
        CREATE TABLE nodes (
            id TEXT PRIMARY KEY,
            node_name TEXT NOT NULL,
            certificate TEXT NOT NULL,            -- base64 DER
            certificate_fingerprint TEXT NOT NULL UNIQUE,
            node_url TEXT,
            contact_name TEXT,
            contact_email TEXT,
            institution_name TEXT,
            institution_details TEXT,
            status TEXT NOT NULL,                 -- Unknown|Pending|Authorized|Revoked
            access_level TEXT NOT NULL,           -- ReadOnly|ReadWrite|Admin
            registered_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_authenticated_at INTEGER
        );

        -- Synchronised entities, one row per entity of any kind
        CREATE TABLE entities (
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            parent_id TEXT,
            owner_node_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,          -- watermark for newer-wins
            data TEXT NOT NULL,                   -- entity JSON without children
            PRIMARY KEY (kind, id)
        );

        -- One row per pull/import attempt
        CREATE TABLE sync_logs (
            id TEXT PRIMARY KEY,
            remote_node_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            status TEXT NOT NULL,                 -- in_progress|completed|failed
            last_synced_at INTEGER,
            counts TEXT NOT NULL,                 -- JSON SyncCounts
            error_message TEXT
        );

        CREATE INDEX idx_entities_kind_updated ON entities(kind, updated_at, id);
        CREATE INDEX idx_entities_parent ON entities(kind, parent_id);
        CREATE INDEX idx_sync_logs_remote ON sync_logs(remote_node_id, status, started_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["nodes", "entities", "sync_logs", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
