//! Durable records beneath the registry
//!
//! The [`PersistenceBackend`] stores swarm, agent and settings records.
//! Two implementations are provided: SQLite for deployments and an
//! in-memory store for tests and ephemeral runs.

use crate::{
    config::SwarmConfig,
    error::{SwarmError, SwarmResult},
    types::{AgentId, SwarmId, SwarmStatus},
    value::StateValue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, sync::Arc};
use tokio_rusqlite::Connection as AsyncConnection;
use tracing::{debug, info};

/// Current schema version for migration support
pub const SCHEMA_VERSION: i32 = 1;

/// Persisted description of a swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmRecord {
    pub id: SwarmId,
    pub name: String,
    pub status: SwarmStatus,
    pub config: SwarmConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted description of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    /// Free-form attributes such as venue, strategy or owner
    pub metadata: BTreeMap<String, StateValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: impl Into<AgentId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Storage health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealth {
    pub is_healthy: bool,
    pub backend: String,
    pub error_message: Option<String>,
    pub total_swarms: usize,
    pub total_agents: usize,
    pub total_settings: usize,
}

/// Create/get/update/delete for swarm, agent and settings records
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Insert a new swarm record, failing if the id exists
    async fn create_swarm(&self, record: &SwarmRecord) -> SwarmResult<()>;

    async fn get_swarm(&self, id: &str) -> SwarmResult<Option<SwarmRecord>>;

    /// Replace an existing swarm record
    async fn update_swarm(&self, record: &SwarmRecord) -> SwarmResult<()>;

    /// Returns whether a record was removed
    async fn delete_swarm(&self, id: &str) -> SwarmResult<bool>;

    async fn list_swarms(&self) -> SwarmResult<Vec<SwarmRecord>>;

    /// Insert a new agent record, failing if the id exists
    async fn create_agent(&self, record: &AgentRecord) -> SwarmResult<()>;

    async fn get_agent(&self, id: &str) -> SwarmResult<Option<AgentRecord>>;

    /// Replace an existing agent record
    async fn update_agent(&self, record: &AgentRecord) -> SwarmResult<()>;

    async fn delete_agent(&self, id: &str) -> SwarmResult<bool>;

    async fn list_agents(&self) -> SwarmResult<Vec<AgentRecord>>;

    /// Insert or replace a setting
    async fn put_setting(&self, key: &str, value: &StateValue) -> SwarmResult<()>;

    async fn get_setting(&self, key: &str) -> SwarmResult<Option<StateValue>>;

    async fn delete_setting(&self, key: &str) -> SwarmResult<bool>;

    /// Health check for the storage system
    async fn health_check(&self) -> SwarmResult<StorageHealth>;
}

fn already_exists(kind: &str, id: &str) -> SwarmError {
    SwarmError::Storage(format!("{kind} record {id} already exists"))
}

/// In-memory implementation for testing
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    swarms: DashMap<SwarmId, SwarmRecord>,
    agents: DashMap<AgentId, AgentRecord>,
    settings: DashMap<String, StateValue>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn create_swarm(&self, record: &SwarmRecord) -> SwarmResult<()> {
        match self.swarms.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(already_exists("Swarm", &record.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_swarm(&self, id: &str) -> SwarmResult<Option<SwarmRecord>> {
        Ok(self.swarms.get(id).map(|r| r.clone()))
    }

    async fn update_swarm(&self, record: &SwarmRecord) -> SwarmResult<()> {
        let mut existing = self
            .swarms
            .get_mut(&record.id)
            .ok_or_else(|| SwarmError::swarm_not_found(record.id.as_str()))?;
        *existing = record.clone();
        Ok(())
    }

    async fn delete_swarm(&self, id: &str) -> SwarmResult<bool> {
        Ok(self.swarms.remove(id).is_some())
    }

    async fn list_swarms(&self) -> SwarmResult<Vec<SwarmRecord>> {
        let mut records: Vec<_> = self.swarms.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn create_agent(&self, record: &AgentRecord) -> SwarmResult<()> {
        match self.agents.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(already_exists("Agent", &record.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get_agent(&self, id: &str) -> SwarmResult<Option<AgentRecord>> {
        Ok(self.agents.get(id).map(|r| r.clone()))
    }

    async fn update_agent(&self, record: &AgentRecord) -> SwarmResult<()> {
        let mut existing = self
            .agents
            .get_mut(&record.id)
            .ok_or_else(|| SwarmError::agent_not_found(record.id.as_str()))?;
        *existing = record.clone();
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> SwarmResult<bool> {
        Ok(self.agents.remove(id).is_some())
    }

    async fn list_agents(&self) -> SwarmResult<Vec<AgentRecord>> {
        let mut records: Vec<_> = self.agents.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn put_setting(&self, key: &str, value: &StateValue) -> SwarmResult<()> {
        self.settings.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> SwarmResult<Option<StateValue>> {
        Ok(self.settings.get(key).map(|v| v.clone()))
    }

    async fn delete_setting(&self, key: &str) -> SwarmResult<bool> {
        Ok(self.settings.remove(key).is_some())
    }

    async fn health_check(&self) -> SwarmResult<StorageHealth> {
        Ok(StorageHealth {
            is_healthy: true,
            backend: "memory".to_string(),
            error_message: None,
            total_swarms: self.swarms.len(),
            total_agents: self.agents.len(),
            total_settings: self.settings.len(),
        })
    }
}

/// Raw swarm row before JSON decoding
type SwarmRow = (String, String, String, String, DateTime<Utc>, DateTime<Utc>);

/// Raw agent row before JSON decoding
type AgentRow = (String, String, DateTime<Utc>, DateTime<Utc>);

/// SQLite implementation of PersistenceBackend
pub struct SqliteBackend {
    connection: Arc<AsyncConnection>,
}

impl SqliteBackend {
    /// Open (or create) a database file and apply the schema
    pub async fn open(db_path: impl AsRef<Path>) -> SwarmResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SwarmError::Storage(format!("Failed to create database directory: {}", e))
            })?;
        }

        let connection = AsyncConnection::open(db_path).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to open SQLite database: {}", e))
        })?;
        let backend = Self { connection: Arc::new(connection) };
        backend.init_schema().await?;
        info!("Opened SQLite persistence backend at {}", db_path.display());
        Ok(backend)
    }

    /// Private in-memory database
    pub async fn open_in_memory() -> SwarmResult<Self> {
        let connection = AsyncConnection::open_in_memory().await.map_err(|e| {
            SwarmError::Storage(format!("Failed to open SQLite database: {}", e))
        })?;
        let backend = Self { connection: Arc::new(connection) };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> SwarmResult<()> {
        self.connection
            .call(|conn| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA foreign_keys = ON;

                     CREATE TABLE IF NOT EXISTS schema_info (
                         version INTEGER NOT NULL,
                         applied_at TEXT NOT NULL
                     );

                     CREATE TABLE IF NOT EXISTS swarms (
                         id TEXT PRIMARY KEY,
                         name TEXT NOT NULL,
                         status TEXT NOT NULL,
                         config TEXT NOT NULL,
                         created_at TEXT NOT NULL,
                         updated_at TEXT NOT NULL
                     );

                     CREATE TABLE IF NOT EXISTS agents (
                         id TEXT PRIMARY KEY,
                         metadata TEXT NOT NULL,
                         created_at TEXT NOT NULL,
                         updated_at TEXT NOT NULL
                     );

                     CREATE TABLE IF NOT EXISTS settings (
                         key TEXT PRIMARY KEY,
                         value TEXT NOT NULL,
                         updated_at TEXT NOT NULL
                     );

                     CREATE INDEX IF NOT EXISTS idx_swarms_status ON swarms(status);",
                )?;

                let recorded: Option<i32> = conn
                    .query_row("SELECT MAX(version) FROM schema_info", [], |row| row.get(0))
                    .optional()?
                    .flatten();
                if recorded.is_none() {
                    conn.execute(
                        "INSERT INTO schema_info (version, applied_at) VALUES (?1, ?2)",
                        params![SCHEMA_VERSION, Utc::now()],
                    )?;
                }
                Ok::<_, tokio_rusqlite::Error>(())
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to initialize schema: {}", e)))
    }

    fn decode_swarm(row: SwarmRow) -> SwarmResult<SwarmRecord> {
        let (id, name, status, config, created_at, updated_at) = row;
        let status = SwarmStatus::parse(&status)
            .ok_or_else(|| SwarmError::Storage(format!("Unknown swarm status {status} for {id}")))?;
        Ok(SwarmRecord {
            config: serde_json::from_str(&config)?,
            id,
            name,
            status,
            created_at,
            updated_at,
        })
    }

    fn decode_agent(row: AgentRow) -> SwarmResult<AgentRecord> {
        let (id, metadata, created_at, updated_at) = row;
        Ok(AgentRecord {
            metadata: serde_json::from_str(&metadata)?,
            id,
            created_at,
            updated_at,
        })
    }

    async fn write_swarm(&self, record: &SwarmRecord, create: bool) -> SwarmResult<usize> {
        let id = record.id.clone();
        let name = record.name.clone();
        let status = record.status.as_str();
        let config = serde_json::to_string(&record.config)?;
        let created_at = record.created_at;
        let updated_at = record.updated_at;

        self.connection
            .call(move |conn| {
                let sql = if create {
                    "INSERT OR IGNORE INTO swarms (id, name, status, config, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                } else {
                    "UPDATE swarms SET name = ?2, status = ?3, config = ?4, created_at = ?5, updated_at = ?6
                     WHERE id = ?1"
                };
                let changed = conn.execute(sql, params![id, name, status, config, created_at, updated_at])?;
                Ok::<_, tokio_rusqlite::Error>(changed)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to write swarm record: {}", e)))
    }

    async fn write_agent(&self, record: &AgentRecord, create: bool) -> SwarmResult<usize> {
        let id = record.id.clone();
        let metadata = serde_json::to_string(&record.metadata)?;
        let created_at = record.created_at;
        let updated_at = record.updated_at;

        self.connection
            .call(move |conn| {
                let sql = if create {
                    "INSERT OR IGNORE INTO agents (id, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4)"
                } else {
                    "UPDATE agents SET metadata = ?2, created_at = ?3, updated_at = ?4 WHERE id = ?1"
                };
                let changed = conn.execute(sql, params![id, metadata, created_at, updated_at])?;
                Ok::<_, tokio_rusqlite::Error>(changed)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to write agent record: {}", e)))
    }

    async fn delete_row(&self, table: &'static str, key_column: &'static str, key: &str) -> SwarmResult<bool> {
        let key = key.to_string();
        self.connection
            .call(move |conn| {
                let sql = format!("DELETE FROM {table} WHERE {key_column} = ?1");
                let changed = conn.execute(&sql, params![key])?;
                Ok::<_, tokio_rusqlite::Error>(changed > 0)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to delete from {}: {}", table, e)))
    }
}

#[async_trait]
impl PersistenceBackend for SqliteBackend {
    async fn create_swarm(&self, record: &SwarmRecord) -> SwarmResult<()> {
        if self.write_swarm(record, true).await? == 0 {
            return Err(already_exists("Swarm", &record.id));
        }
        debug!("Persisted swarm record {}", record.id);
        Ok(())
    }

    async fn get_swarm(&self, id: &str) -> SwarmResult<Option<SwarmRecord>> {
        let id = id.to_string();
        let row = self
            .connection
            .call(move |conn| {
                let row: Option<SwarmRow> = conn
                    .query_row(
                        "SELECT id, name, status, config, created_at, updated_at FROM swarms WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
                    )
                    .optional()?;
                Ok::<_, tokio_rusqlite::Error>(row)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to get swarm record: {}", e)))?;
        row.map(Self::decode_swarm).transpose()
    }

    async fn update_swarm(&self, record: &SwarmRecord) -> SwarmResult<()> {
        if self.write_swarm(record, false).await? == 0 {
            return Err(SwarmError::swarm_not_found(record.id.as_str()));
        }
        Ok(())
    }

    async fn delete_swarm(&self, id: &str) -> SwarmResult<bool> {
        self.delete_row("swarms", "id", id).await
    }

    async fn list_swarms(&self) -> SwarmResult<Vec<SwarmRecord>> {
        let rows = self
            .connection
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, status, config, created_at, updated_at
                     FROM swarms ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                    })?
                    .collect::<Result<Vec<SwarmRow>, _>>()?;
                Ok::<_, tokio_rusqlite::Error>(rows)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to list swarm records: {}", e)))?;
        rows.into_iter().map(Self::decode_swarm).collect()
    }

    async fn create_agent(&self, record: &AgentRecord) -> SwarmResult<()> {
        if self.write_agent(record, true).await? == 0 {
            return Err(already_exists("Agent", &record.id));
        }
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> SwarmResult<Option<AgentRecord>> {
        let id = id.to_string();
        let row = self
            .connection
            .call(move |conn| {
                let row: Option<AgentRow> = conn
                    .query_row(
                        "SELECT id, metadata, created_at, updated_at FROM agents WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()?;
                Ok::<_, tokio_rusqlite::Error>(row)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to get agent record: {}", e)))?;
        row.map(Self::decode_agent).transpose()
    }

    async fn update_agent(&self, record: &AgentRecord) -> SwarmResult<()> {
        if self.write_agent(record, false).await? == 0 {
            return Err(SwarmError::agent_not_found(record.id.as_str()));
        }
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> SwarmResult<bool> {
        self.delete_row("agents", "id", id).await
    }

    async fn list_agents(&self) -> SwarmResult<Vec<AgentRecord>> {
        let rows = self
            .connection
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, metadata, created_at, updated_at FROM agents ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
                    .collect::<Result<Vec<AgentRow>, _>>()?;
                Ok::<_, tokio_rusqlite::Error>(rows)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to list agent records: {}", e)))?;
        rows.into_iter().map(Self::decode_agent).collect()
    }

    async fn put_setting(&self, key: &str, value: &StateValue) -> SwarmResult<()> {
        let key = key.to_string();
        let value = serde_json::to_string(value)?;
        self.connection
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value, Utc::now()],
                )?;
                Ok::<_, tokio_rusqlite::Error>(())
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to store setting: {}", e)))
    }

    async fn get_setting(&self, key: &str) -> SwarmResult<Option<StateValue>> {
        let key = key.to_string();
        let raw = self
            .connection
            .call(move |conn| {
                let raw: Option<String> = conn
                    .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()?;
                Ok::<_, tokio_rusqlite::Error>(raw)
            })
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to get setting: {}", e)))?;
        Ok(raw.map(|text| serde_json::from_str(&text)).transpose()?)
    }

    async fn delete_setting(&self, key: &str) -> SwarmResult<bool> {
        self.delete_row("settings", "key", key).await
    }

    async fn health_check(&self) -> SwarmResult<StorageHealth> {
        let counts = self
            .connection
            .call(|conn| {
                let count = |table: &str| -> rusqlite::Result<i64> {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                };
                Ok::<_, tokio_rusqlite::Error>((count("swarms")?, count("agents")?, count("settings")?))
            })
            .await;

        Ok(match counts {
            Ok((swarms, agents, settings)) => StorageHealth {
                is_healthy: true,
                backend: "sqlite".to_string(),
                error_message: None,
                total_swarms: swarms as usize,
                total_agents: agents as usize,
                total_settings: settings as usize,
            },
            Err(e) => StorageHealth {
                is_healthy: false,
                backend: "sqlite".to_string(),
                error_message: Some(e.to_string()),
                total_swarms: 0,
                total_agents: 0,
                total_settings: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn swarm_record(id: &str) -> SwarmRecord {
        let now = Utc::now();
        SwarmRecord {
            id: id.to_string(),
            name: id.to_string(),
            status: SwarmStatus::Created,
            config: SwarmConfig::new(id).with_parameter("inertia", 0.7),
            created_at: now,
            updated_at: now,
        }
    }

    async fn exercise(backend: &dyn PersistenceBackend) {
        let mut record = swarm_record("s1");
        backend.create_swarm(&record).await.unwrap();
        assert!(matches!(
            backend.create_swarm(&record).await,
            Err(SwarmError::Storage(_))
        ));

        record.status = SwarmStatus::Running;
        record.updated_at = Utc::now();
        backend.update_swarm(&record).await.unwrap();
        assert_eq!(backend.get_swarm("s1").await.unwrap(), Some(record.clone()));
        assert!(matches!(
            backend.update_swarm(&swarm_record("ghost")).await,
            Err(SwarmError::NotFound { .. })
        ));

        backend.create_swarm(&swarm_record("s2")).await.unwrap();
        assert_eq!(backend.list_swarms().await.unwrap().len(), 2);
        assert!(backend.delete_swarm("s2").await.unwrap());
        assert!(!backend.delete_swarm("s2").await.unwrap());

        let mut agent = AgentRecord::new("a1").with_metadata("venue", "binance");
        backend.create_agent(&agent).await.unwrap();
        agent.metadata.insert("strategy".into(), StateValue::from("grid"));
        backend.update_agent(&agent).await.unwrap();
        assert_eq!(backend.get_agent("a1").await.unwrap(), Some(agent));
        assert_eq!(backend.list_agents().await.unwrap().len(), 1);
        assert!(backend.delete_agent("a1").await.unwrap());
        assert!(backend.get_agent("a1").await.unwrap().is_none());

        let value = StateValue::map([("max_drawdown", StateValue::from(0.2))]);
        backend.put_setting("risk", &value).await.unwrap();
        assert_eq!(backend.get_setting("risk").await.unwrap(), Some(value));
        assert!(backend.delete_setting("risk").await.unwrap());
        assert!(backend.get_setting("risk").await.unwrap().is_none());

        let health = backend.health_check().await.unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.total_swarms, 1);
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        exercise(&InMemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path().join("hive.db")).await.unwrap();
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hive.db");
        {
            let backend = SqliteBackend::open(&path).await.unwrap();
            backend.create_swarm(&swarm_record("s1")).await.unwrap();
        }
        let backend = SqliteBackend::open(&path).await.unwrap();
        assert!(backend.get_swarm("s1").await.unwrap().is_some());
    }
}
