//! Process-wide wiring
//!
//! [`Hive`] is built once per process from a [`HiveConfig`] and hands the
//! same registry to every component.

use crate::{
    checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore},
    config::{HiveConfig, StorageBackendConfig},
    error::SwarmResult,
    fault_tolerance::{FaultToleranceSupervisor, MonitorHandle},
    persistence::{InMemoryBackend, PersistenceBackend, SqliteBackend},
    registry::SwarmRegistry,
    routing::{CommunicationRouter, MessageTransport},
    security::{CredentialVerifier, SecurityManager},
    swarm::Swarm,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The assembled orchestration engine
pub struct Hive {
    config: HiveConfig,
    registry: Arc<SwarmRegistry>,
    supervisor: FaultToleranceSupervisor,
    security: Arc<SecurityManager>,
    router: CommunicationRouter,
    monitors: DashMap<String, MonitorHandle>,
}

impl std::fmt::Debug for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hive")
            .field("registry", &self.registry)
            .field("monitors", &self.monitors.len())
            .finish_non_exhaustive()
    }
}

impl Hive {
    /// Open the configured stores and wire every component
    pub async fn from_config(
        config: HiveConfig,
        verifier: Arc<dyn CredentialVerifier>,
        transport: Arc<dyn MessageTransport>,
    ) -> SwarmResult<Self> {
        config.validate()?;

        let backend: Arc<dyn PersistenceBackend> = match &config.persistence.backend {
            StorageBackendConfig::Memory => Arc::new(InMemoryBackend::new()),
            StorageBackendConfig::Sqlite { path } => Arc::new(SqliteBackend::open(path).await?),
        };
        let store: Arc<dyn CheckpointStore> = match &config.persistence.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir).await?),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };

        let registry = Arc::new(SwarmRegistry::with_backend(backend));
        let supervisor = FaultToleranceSupervisor::new(store, config.fault_tolerance.clone())?;
        let security = Arc::new(SecurityManager::new(verifier, config.security.clone())?);
        let router = CommunicationRouter::new(registry.clone(), transport, config.routing.clone())?
            .with_security(security.clone());

        info!(
            "Hive ready (backend: {:?}, checkpoints: {})",
            config.persistence.backend,
            config
                .persistence
                .checkpoint_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "memory".to_string())
        );

        Ok(Self {
            config,
            registry,
            supervisor,
            security,
            router,
            monitors: DashMap::new(),
        })
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SwarmRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &FaultToleranceSupervisor {
        &self.supervisor
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn router(&self) -> &CommunicationRouter {
        &self.router
    }

    /// Create a swarm from the configured defaults under `name`
    pub async fn create_swarm(&self, name: &str) -> SwarmResult<Arc<Swarm>> {
        self.registry
            .create_swarm(self.config.swarm_defaults.clone().renamed(name))
            .await
    }

    /// Start a swarm and health-check it at the configured health interval
    ///
    /// Checkpoints follow their own, usually longer, interval.
    pub async fn start_supervised(&self, swarm_id: &str) -> SwarmResult<()> {
        self.registry.start_swarm(swarm_id).await?;
        let swarm = self.registry.get_swarm(swarm_id)?;
        let handle = self
            .supervisor
            .monitor_swarm(&swarm, self.config.fault_tolerance.health_interval())?;
        if let Some(previous) = self.monitors.insert(swarm_id.to_string(), handle) {
            previous.stop().await;
        }
        Ok(())
    }

    /// Stop supervision and the swarm itself
    pub async fn stop_supervised(&self, swarm_id: &str) -> SwarmResult<()> {
        if let Some((_, handle)) = self.monitors.remove(swarm_id) {
            handle.stop().await;
        }
        self.registry.stop_swarm(swarm_id).await
    }

    /// Recover a swarm and mirror its new status to the backend
    pub async fn recover_swarm(&self, swarm_id: &str) -> SwarmResult<Checkpoint> {
        let swarm = self.registry.get_swarm(swarm_id)?;
        let checkpoint = self.supervisor.recover_swarm(&swarm).await?;
        if let Err(e) = self.registry.sync_record(swarm_id).await {
            warn!("Failed to persist recovery of swarm {}: {}", swarm_id, e);
        }
        Ok(checkpoint)
    }

    /// Delete a stopped swarm with its routing table and checkpoints
    pub async fn delete_swarm(&self, swarm_id: &str) -> SwarmResult<()> {
        self.registry.delete_swarm(swarm_id).await?;
        if let Some((_, handle)) = self.monitors.remove(swarm_id) {
            handle.stop().await;
        }
        self.router.remove_pattern(swarm_id);
        let removed = self.supervisor.store().delete_all(swarm_id).await?;
        info!("Deleted swarm {} and {} checkpoints", swarm_id, removed);
        Ok(())
    }

    /// Stop every monitor and running swarm
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.monitors.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.monitors.remove(&id) {
                handle.stop().await;
            }
        }
        for swarm in self.registry.list_swarms() {
            if let Err(e) = self.registry.stop_swarm(swarm.id()).await {
                warn!("Swarm {} not stopped during shutdown: {}", swarm.id(), e);
            }
        }
        info!("Hive shut down");
    }
}
