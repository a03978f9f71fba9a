//! Checkpoint artifacts and the process-wide checkpoint store
//!
//! A checkpoint serializes to a flat JSON object:
//!
//! ```text
//! { "version": 1, "artifact_id": "ckpt-...", "swarm_id": "s1",
//!   "timestamp": "...", "members": [..], "shared_state": {..},
//!   "task_queue": [..] }
//! ```
//!
//! Stores are shared by all swarms and partitioned by swarm id.

use crate::{
    error::{SwarmContext, SwarmError, SwarmResult},
    swarm::SwarmSnapshot,
    types::SwarmId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Artifact format written by this crate
pub const CHECKPOINT_VERSION: u32 = 1;

/// Snapshot of a swarm at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Artifact format version
    pub version: u32,
    /// Unique, time-ordered artifact name
    pub artifact_id: String,
    /// Swarm the snapshot belongs to
    pub swarm_id: SwarmId,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Members, shared state and tasks
    #[serde(flatten)]
    pub snapshot: SwarmSnapshot,
}

impl Checkpoint {
    /// Stamp a snapshot with a time-ordered, content-addressed artifact id
    pub fn new(swarm_id: impl Into<SwarmId>, snapshot: SwarmSnapshot) -> SwarmResult<Self> {
        let swarm_id = swarm_id.into();
        let timestamp = Utc::now();
        let encoded = serde_json::to_vec(&snapshot).swarm_context(&swarm_id)?;
        let digest = blake3::hash(&encoded);
        let artifact_id = format!(
            "ckpt-{:020}-{}",
            timestamp.timestamp_micros(),
            &digest.to_hex()[..12]
        );
        Ok(Self {
            version: CHECKPOINT_VERSION,
            artifact_id,
            swarm_id,
            timestamp,
            snapshot,
        })
    }

    /// Reject artifacts written by another format version
    pub fn ensure_compatible(&self) -> SwarmResult<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(SwarmError::IncompatibleCheckpoint {
                expected: CHECKPOINT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Durable home for checkpoint artifacts
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint under its swarm id
    async fn save(&self, checkpoint: &Checkpoint) -> SwarmResult<()>;

    /// Most recent checkpoint of a swarm
    async fn latest(&self, swarm_id: &str) -> SwarmResult<Option<Checkpoint>>;

    /// Load one artifact
    async fn load(&self, swarm_id: &str, artifact_id: &str) -> SwarmResult<Option<Checkpoint>>;

    /// Artifact ids of a swarm, oldest first
    async fn list(&self, swarm_id: &str) -> SwarmResult<Vec<String>>;

    /// Keep only the newest `keep` artifacts, returning how many were removed
    async fn prune(&self, swarm_id: &str, keep: usize) -> SwarmResult<usize>;

    /// Remove every artifact of a swarm
    async fn delete_all(&self, swarm_id: &str) -> SwarmResult<usize>;
}

/// Checkpoints held in memory, for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<SwarmId, VecDeque<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> SwarmResult<()> {
        self.checkpoints
            .entry(checkpoint.swarm_id.clone())
            .or_default()
            .push_back(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, swarm_id: &str) -> SwarmResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .get(swarm_id)
            .and_then(|list| list.back().cloned()))
    }

    async fn load(&self, swarm_id: &str, artifact_id: &str) -> SwarmResult<Option<Checkpoint>> {
        Ok(self.checkpoints.get(swarm_id).and_then(|list| {
            list.iter()
                .find(|c| c.artifact_id == artifact_id)
                .cloned()
        }))
    }

    async fn list(&self, swarm_id: &str) -> SwarmResult<Vec<String>> {
        Ok(self
            .checkpoints
            .get(swarm_id)
            .map(|list| list.iter().map(|c| c.artifact_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, swarm_id: &str, keep: usize) -> SwarmResult<usize> {
        let Some(mut list) = self.checkpoints.get_mut(swarm_id) else {
            return Ok(0);
        };
        let excess = list.len().saturating_sub(keep);
        list.drain(..excess);
        Ok(excess)
    }

    async fn delete_all(&self, swarm_id: &str) -> SwarmResult<usize> {
        Ok(self
            .checkpoints
            .remove(swarm_id)
            .map(|(_, list)| list.len())
            .unwrap_or(0))
    }
}

/// One directory per swarm, one JSON file per artifact
///
/// Files are written to a temporary name and renamed into place, so a
/// reader never sees a partial artifact.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(root: impl AsRef<Path>) -> SwarmResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to create checkpoint directory: {}", e))
        })?;
        info!("Checkpoint store at {}", root.display());
        Ok(Self { root })
    }

    fn partition(&self, swarm_id: &str) -> PathBuf {
        let safe = !swarm_id.is_empty()
            && swarm_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if safe {
            self.root.join(swarm_id)
        } else {
            self.root
                .join(format!("x-{}", &blake3::hash(swarm_id.as_bytes()).to_hex()[..16]))
        }
    }

    async fn read(&self, path: &Path) -> SwarmResult<Checkpoint> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to read checkpoint {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SwarmError::Storage(format!("Failed to parse checkpoint {}: {}", path.display(), e))
        })
    }

    async fn artifact_ids(&self, swarm_id: &str) -> SwarmResult<Vec<String>> {
        let dir = self.partition(swarm_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SwarmError::Storage(format!(
                    "Failed to list checkpoints in {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwarmError::Storage(format!("Failed to list checkpoints: {}", e)))?
        {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                ids.push(id.to_string());
            }
        }
        // artifact ids embed a zero-padded timestamp
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> SwarmResult<()> {
        let dir = self.partition(&checkpoint.swarm_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(format!("{}.json", checkpoint.artifact_id));
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        tokio::fs::write(&temp_path, &bytes).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to write checkpoint: {}", e))
        })?;
        tokio::fs::rename(&temp_path, &path).await.map_err(|e| {
            SwarmError::Storage(format!("Failed to rename checkpoint: {}", e))
        })?;

        debug!("Wrote checkpoint {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    async fn latest(&self, swarm_id: &str) -> SwarmResult<Option<Checkpoint>> {
        match self.artifact_ids(swarm_id).await?.last() {
            Some(id) => self.load(swarm_id, id).await,
            None => Ok(None),
        }
    }

    async fn load(&self, swarm_id: &str, artifact_id: &str) -> SwarmResult<Option<Checkpoint>> {
        let path = self.partition(swarm_id).join(format!("{artifact_id}.json"));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        self.read(&path).await.map(Some)
    }

    async fn list(&self, swarm_id: &str) -> SwarmResult<Vec<String>> {
        self.artifact_ids(swarm_id).await
    }

    async fn prune(&self, swarm_id: &str, keep: usize) -> SwarmResult<usize> {
        let ids = self.artifact_ids(swarm_id).await?;
        let excess = ids.len().saturating_sub(keep);
        let dir = self.partition(swarm_id);
        for id in &ids[..excess] {
            tokio::fs::remove_file(dir.join(format!("{id}.json")))
                .await
                .map_err(|e| SwarmError::Storage(format!("Failed to remove checkpoint {}: {}", id, e)))?;
        }
        Ok(excess)
    }

    async fn delete_all(&self, swarm_id: &str) -> SwarmResult<usize> {
        let count = self.artifact_ids(swarm_id).await?.len();
        match tokio::fs::remove_dir_all(self.partition(swarm_id)).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(SwarmError::Storage(format!("Failed to remove checkpoints: {}", e))),
        }
    }
}
