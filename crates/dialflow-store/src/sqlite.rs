use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use dialflow_core::error::{DialflowError, Result};
use dialflow_core::flow::{FlowDefinition, VersionMeta};
use dialflow_core::state::ConversationSnapshot;
use dialflow_core::traits::{ConversationStore, FlowStore, PublishOutcome};
use dialflow_core::types::{FlowId, TenantId, ThreadId, Version};

use crate::check_successor;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS flow_versions (
        tenant_id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        definition TEXT NOT NULL,
        published_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, flow_id, version)
    );

    CREATE TABLE IF NOT EXISTS conversations (
        tenant_id TEXT NOT NULL,
        thread_id TEXT NOT NULL,
        snapshot TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, thread_id)
    );";

fn db_err(e: impl std::fmt::Display) -> DialflowError {
    DialflowError::Database(e.to_string())
}

/// SQLite-backed flow and conversation store.
///
/// Flow definitions and conversation snapshots are stored as JSON documents.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL keeps readers of pinned versions unblocked while a publish commits.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(db_err)
    }
}

fn version_param(version: Version) -> Result<i64> {
    i64::try_from(version.0).map_err(db_err)
}

impl FlowStore for SqliteStore {
    fn latest(&self, tenant: &TenantId, flow: &FlowId) -> Result<Option<FlowDefinition>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT definition FROM flow_versions
                 WHERE tenant_id = ?1 AND flow_id = ?2
                 ORDER BY version DESC LIMIT 1",
                params![tenant.as_str(), flow.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    fn load(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        version: Version,
    ) -> Result<Option<FlowDefinition>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT definition FROM flow_versions
                 WHERE tenant_id = ?1 AND flow_id = ?2 AND version = ?3",
                params![tenant.as_str(), flow.as_str(), version_param(version)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    fn publish(
        &self,
        tenant: &TenantId,
        definition: &FlowDefinition,
        expected: Option<Version>,
    ) -> Result<PublishOutcome> {
        let document = serde_json::to_string(definition)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM flow_versions WHERE tenant_id = ?1 AND flow_id = ?2",
                params![tenant.as_str(), definition.id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let current = current.map(|v| Version(v as u64));
        if current != expected {
            return Ok(PublishOutcome::Stale {
                current: current.unwrap_or_default(),
            });
        }
        check_successor(definition, current)?;

        tx.execute(
            "INSERT INTO flow_versions (tenant_id, flow_id, version, definition, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.as_str(),
                definition.id.as_str(),
                version_param(definition.version)?,
                document,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        debug!(tenant = %tenant, flow = %definition.id, version = %definition.version, "Flow version stored");
        Ok(PublishOutcome::Published)
    }

    fn history(&self, tenant: &TenantId, flow: &FlowId) -> Result<Vec<VersionMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT definition FROM flow_versions
                 WHERE tenant_id = ?1 AND flow_id = ?2
                 ORDER BY version ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tenant.as_str(), flow.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;

        let mut history = Vec::new();
        for row in rows {
            let raw = row.map_err(db_err)?;
            let definition: FlowDefinition = serde_json::from_str(&raw)?;
            if let Some(meta) = definition.meta {
                history.push(meta);
            }
        }
        Ok(history)
    }
}

impl ConversationStore for SqliteStore {
    fn load(&self, tenant: &TenantId, thread: &ThreadId) -> Result<Option<ConversationSnapshot>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM conversations WHERE tenant_id = ?1 AND thread_id = ?2",
                params![tenant.as_str(), thread.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    fn save(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        snapshot: &ConversationSnapshot,
    ) -> Result<()> {
        let document = serde_json::to_string(snapshot)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations (tenant_id, thread_id, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id, thread_id)
             DO UPDATE SET snapshot = excluded.snapshot, updated_at = excluded.updated_at",
            params![
                tenant.as_str(),
                thread.as_str(),
                document,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn delete(&self, tenant: &TenantId, thread: &ThreadId) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM conversations WHERE tenant_id = ?1 AND thread_id = ?2",
                params![tenant.as_str(), thread.as_str()],
            )
            .map_err(db_err)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialflow_test_utils::fixtures;

    #[test]
    fn test_publish_and_load_versions() {
        let store = SqliteStore::in_memory().unwrap();
        let tenant = TenantId::new("acme");
        let v1 = fixtures::qualification_flow();
        assert_eq!(store.publish(&tenant, &v1, None).unwrap(), PublishOutcome::Published);

        let mut v2 = v1.clone();
        v2.version = Version(2);
        v2.nodes[0].prompt = Some("Who am I speaking with?".into());
        assert_eq!(
            store.publish(&tenant, &v2, Some(Version(1))).unwrap(),
            PublishOutcome::Published
        );

        assert_eq!(store.latest(&tenant, &v1.id).unwrap(), Some(v2));
        assert_eq!(FlowStore::load(&store, &tenant, &v1.id, Version(1)).unwrap(), Some(v1));
    }

    #[test]
    fn test_stale_publish_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let tenant = TenantId::new("acme");
        let v1 = fixtures::qualification_flow();
        store.publish(&tenant, &v1, None).unwrap();

        let mut v2 = v1.clone();
        v2.version = Version(2);
        store.publish(&tenant, &v2, Some(Version(1))).unwrap();

        let mut late = v1.clone();
        late.version = Version(2);
        assert_eq!(
            store.publish(&tenant, &late, Some(Version(1))).unwrap(),
            PublishOutcome::Stale { current: Version(2) }
        );
    }

    #[test]
    fn test_conversation_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let tenant = TenantId::new("acme");
        let thread = ThreadId::new("t-1");
        let flow = fixtures::qualification_flow();

        let first = fixtures::snapshot_at(&flow, "name");
        store.save(&tenant, &thread, &first).unwrap();
        let second = fixtures::snapshot_at(&flow, "budget");
        store.save(&tenant, &thread, &second).unwrap();

        let loaded = ConversationStore::load(&store, &tenant, &thread).unwrap().unwrap();
        assert_eq!(loaded.state.current_node_id.as_str(), "budget");
        assert!(store.delete(&tenant, &thread).unwrap());
        assert!(ConversationStore::load(&store, &tenant, &thread).unwrap().is_none());
    }

    #[test]
    fn test_open_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dialflow.db");
        let store = SqliteStore::open(&path).unwrap();
        store
            .publish(&TenantId::new("acme"), &fixtures::qualification_flow(), None)
            .unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        let flow = reopened
            .latest(&TenantId::new("acme"), &FlowId::new("qualification"))
            .unwrap();
        assert!(flow.is_some());
    }
}
