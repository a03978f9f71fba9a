//! Swarm registry
//!
//! The registry owns one [`Swarm`] per id and is the entry point for every
//! caller-facing operation. Swarms are held as `Arc`s in a `DashMap`; each
//! call clones the `Arc` out and releases the map shard before awaiting, so
//! no registry-wide lock is ever held across a suspension point.
//!
//! Swarm records are mirrored into a [`PersistenceBackend`]. A new swarm only
//! becomes visible once its record is written; until then its id is held in
//! a separate reservation map so concurrent creations cannot take it. Later
//! status writes are best effort and can be retried with
//! [`SwarmRegistry::sync_record`]. Escalation to FAILED and recovery happen
//! outside the registry, so a per-swarm follower task writes those from the
//! swarm's event feed.

use crate::{
    config::SwarmConfig,
    election::ElectionPolicy,
    error::{SwarmError, SwarmResult},
    persistence::{AgentRecord, InMemoryBackend, PersistenceBackend, SwarmRecord},
    plugins::{
        forward_chain_action, ChainClient, ChainTransaction, OptimizationStrategy,
        ParameterTuningRequest, SettlementReceipt,
    },
    swarm::Swarm,
    tasks::Task,
    telemetry::names,
    types::{AgentId, SwarmEvent, SwarmId, SwarmMetrics, SwarmStatus, TaskStatus},
    value::StateValue,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Top-level store of swarms
pub struct SwarmRegistry {
    swarms: DashMap<SwarmId, Arc<Swarm>>,
    /// Ids of creations whose record write is in flight
    reserved: DashMap<SwarmId, ()>,
    backend: Arc<dyn PersistenceBackend>,
}

/// Holds a swarm id in the reservation map until dropped
struct Reservation<'a> {
    reserved: &'a DashMap<SwarmId, ()>,
    id: SwarmId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.id);
    }
}

impl std::fmt::Debug for SwarmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmRegistry")
            .field("swarms", &self.swarms.len())
            .finish_non_exhaustive()
    }
}

impl Default for SwarmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SwarmRegistry {
    /// Registry backed by an in-memory record store
    pub fn new() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            swarms: DashMap::new(),
            reserved: DashMap::new(),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.swarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swarms.is_empty()
    }

    // ---- lifecycle ----

    /// Create a swarm in CREATED status using the configured election strategy
    pub async fn create_swarm(&self, config: SwarmConfig) -> SwarmResult<Arc<Swarm>> {
        let policy = config.election.policy();
        self.create_swarm_with_policy(config, policy).await
    }

    /// Create a swarm with a custom election policy
    ///
    /// The id is the configured name when free, otherwise the name with the
    /// first free numeric suffix (`s1-2`, `s1-3`, ...). An empty name gets a
    /// UUID.
    #[instrument(skip(self, config, policy), fields(name = %config.name))]
    pub async fn create_swarm_with_policy(
        &self,
        config: SwarmConfig,
        policy: Arc<dyn ElectionPolicy>,
    ) -> SwarmResult<Arc<Swarm>> {
        config.validate()?;
        let reservation = self.reserve(&config.name);
        let swarm = Arc::new(Swarm::new(reservation.id.clone(), config, policy));

        if let Err(e) = self.persist_new(&swarm).await {
            warn!("Abandoned creation of swarm {}: {}", swarm.id(), e);
            return Err(e);
        }
        self.swarms.insert(swarm.id().to_string(), swarm.clone());
        drop(reservation);
        self.follow_status(&swarm);

        counter!(names::SWARMS_CREATED).increment(1);
        info!(
            "Created swarm {} ({} topology, {} election)",
            swarm.id(),
            swarm.config().topology.name(),
            swarm.election_policy().name()
        );
        Ok(swarm)
    }

    /// Claim a free id; published swarms and in-flight creations both count
    fn reserve(&self, name: &str) -> Reservation<'_> {
        let base = name.trim().to_string();
        let mut suffix = 1u64;
        loop {
            let candidate = if base.is_empty() {
                Uuid::new_v4().to_string()
            } else if suffix == 1 {
                base.clone()
            } else {
                format!("{base}-{suffix}")
            };
            suffix += 1;

            if self.swarms.contains_key(&candidate) {
                continue;
            }
            let Entry::Vacant(slot) = self.reserved.entry(candidate) else {
                continue;
            };
            let id = slot.key().clone();
            slot.insert(());
            let reservation = Reservation {
                reserved: &self.reserved,
                id,
            };
            // published between the check and the reservation
            if !self.swarms.contains_key(&reservation.id) {
                return reservation;
            }
        }
    }

    async fn persist_new(&self, swarm: &Swarm) -> SwarmResult<()> {
        let record = swarm_record(swarm, SwarmStatus::Created);
        let written = match self.backend.get_swarm(swarm.id()).await {
            Ok(Some(_)) => {
                debug!("Replacing stale record for swarm {}", swarm.id());
                self.backend.update_swarm(&record).await
            }
            Ok(None) => self.backend.create_swarm(&record).await,
            Err(e) => Err(e),
        };
        written.map_err(|e| e.in_swarm(swarm.id()))
    }

    /// Write the swarm's current status to the backend
    pub async fn sync_record(&self, swarm_id: &str) -> SwarmResult<()> {
        let swarm = self.get_swarm(swarm_id)?;
        write_status(self.backend.as_ref(), &swarm).await
    }

    /// Mirror FAILED and RECOVERED transitions into the backend
    ///
    /// The follower holds the swarm weakly and ends when the swarm is dropped.
    fn follow_status(&self, swarm: &Arc<Swarm>) {
        let mut events = swarm.subscribe();
        let weak = Arc::downgrade(swarm);
        let backend = self.backend.clone();
        tokio::spawn(async move {
            loop {
                let sync = match events.recv().await {
                    Ok(SwarmEvent::Failed { .. } | SwarmEvent::Recovered { .. }) => true,
                    Ok(_) => false,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Status follower skipped {} events", skipped);
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                if !sync {
                    continue;
                }
                let Some(swarm) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = write_status(backend.as_ref(), &swarm).await {
                    warn!("Failed to persist status of swarm {}: {}", swarm.id(), e);
                }
            }
        });
    }

    async fn sync_best_effort(&self, swarm_id: &str) {
        if let Err(e) = self.sync_record(swarm_id).await {
            warn!("Failed to persist status of swarm {}: {}", swarm_id, e);
        }
    }

    pub fn get_swarm(&self, swarm_id: &str) -> SwarmResult<Arc<Swarm>> {
        self.swarms
            .get(swarm_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SwarmError::swarm_not_found(swarm_id))
    }

    /// All swarms ordered by id
    pub fn list_swarms(&self) -> Vec<Arc<Swarm>> {
        let mut swarms: Vec<_> = self.swarms.iter().map(|e| e.value().clone()).collect();
        swarms.sort_by(|a, b| a.id().cmp(b.id()));
        swarms
    }

    /// CREATED | STOPPED -> RUNNING
    pub async fn start_swarm(&self, swarm_id: &str) -> SwarmResult<()> {
        self.get_swarm(swarm_id)?.start().await?;
        self.sync_best_effort(swarm_id).await;
        Ok(())
    }

    /// RUNNING -> STOPPED; a no-op when already stopped
    pub async fn stop_swarm(&self, swarm_id: &str) -> SwarmResult<()> {
        if self.get_swarm(swarm_id)?.stop().await? {
            self.sync_best_effort(swarm_id).await;
        }
        Ok(())
    }

    pub async fn get_swarm_status(&self, swarm_id: &str) -> SwarmResult<SwarmStatus> {
        Ok(self.get_swarm(swarm_id)?.status().await)
    }

    /// Remove a swarm that is not RUNNING
    pub async fn delete_swarm(&self, swarm_id: &str) -> SwarmResult<()> {
        let swarm = self.get_swarm(swarm_id)?;
        let status = swarm.status().await;
        if status == SwarmStatus::Running {
            return Err(SwarmError::InvalidState {
                swarm_id: swarm_id.to_string(),
                status: status.to_string(),
                operation: "delete",
            });
        }

        self.swarms.remove(swarm_id);
        // started concurrently between the check and the removal
        if swarm.status().await == SwarmStatus::Running {
            swarm.stop().await?;
        }
        if let Err(e) = self.backend.delete_swarm(swarm_id).await {
            warn!("Failed to delete record of swarm {}: {}", swarm_id, e);
        }
        info!("Deleted swarm {}", swarm_id);
        Ok(())
    }

    // ---- membership ----

    /// Returns false when the duplicate policy ignored an existing member
    pub async fn add_agent_to_swarm(&self, swarm_id: &str, agent_id: &str) -> SwarmResult<bool> {
        let added = self
            .get_swarm(swarm_id)?
            .add_member(agent_id.to_string())
            .await?;
        if added {
            self.ensure_agent_record(agent_id).await;
        }
        Ok(added)
    }

    async fn ensure_agent_record(&self, agent_id: &str) {
        let result = match self.backend.get_agent(agent_id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.backend.create_agent(&AgentRecord::new(agent_id)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to persist record of agent {}: {}", agent_id, e);
        }
    }

    pub async fn remove_agent_from_swarm(&self, swarm_id: &str, agent_id: &str) -> SwarmResult<()> {
        self.get_swarm(swarm_id)?.remove_member(agent_id).await
    }

    // ---- shared state ----

    pub async fn update_shared_state(
        &self,
        swarm_id: &str,
        key: &str,
        value: impl Into<StateValue>,
    ) -> SwarmResult<()> {
        self.get_swarm(swarm_id)?.set_shared(key, value.into()).await
    }

    pub async fn get_shared_state(&self, swarm_id: &str, key: &str) -> SwarmResult<Option<StateValue>> {
        Ok(self.get_swarm(swarm_id)?.get_shared(key).await)
    }

    pub async fn get_shared_state_keys(&self, swarm_id: &str) -> SwarmResult<Vec<String>> {
        Ok(self.get_swarm(swarm_id)?.shared_keys().await)
    }

    pub async fn elect_leader(&self, swarm_id: &str) -> SwarmResult<AgentId> {
        self.get_swarm(swarm_id)?.elect_leader().await
    }

    // ---- tasks ----

    pub async fn allocate_task(&self, swarm_id: &str, payload: impl Into<StateValue>) -> SwarmResult<Task> {
        self.get_swarm(swarm_id)?.allocate_task(payload.into()).await
    }

    pub async fn claim_task(&self, swarm_id: &str, task_id: &str, agent_id: &str) -> SwarmResult<Task> {
        self.get_swarm(swarm_id)?.claim_task(task_id, agent_id).await
    }

    pub async fn complete_task(
        &self,
        swarm_id: &str,
        task_id: &str,
        agent_id: &str,
        result: impl Into<StateValue>,
    ) -> SwarmResult<Task> {
        self.get_swarm(swarm_id)?
            .complete_task(task_id, agent_id, result.into())
            .await
    }

    pub async fn fail_task(
        &self,
        swarm_id: &str,
        task_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> SwarmResult<Task> {
        self.get_swarm(swarm_id)?
            .fail_task(task_id, agent_id, reason)
            .await
    }

    pub async fn get_task(&self, swarm_id: &str, task_id: &str) -> SwarmResult<Task> {
        self.get_swarm(swarm_id)?.get_task(task_id).await
    }

    pub async fn list_tasks(&self, swarm_id: &str) -> SwarmResult<Vec<Task>> {
        Ok(self.get_swarm(swarm_id)?.tasks().await)
    }

    pub async fn get_swarm_metrics(&self, swarm_id: &str) -> SwarmResult<SwarmMetrics> {
        Ok(self.get_swarm(swarm_id)?.metrics().await)
    }

    // ---- external collaborators ----

    /// Run a claimed parameter tuning task and record its outcome
    ///
    /// The task is completed with the tuning outcome, or failed with the
    /// reason if the payload is malformed or the strategy errors.
    #[instrument(skip(self, strategy, objective))]
    pub async fn run_tuning_task(
        &self,
        swarm_id: &str,
        task_id: &str,
        agent_id: &str,
        strategy: &mut dyn OptimizationStrategy,
        objective: &(dyn Fn(&[f64]) -> f64 + Sync),
    ) -> SwarmResult<Task> {
        let swarm = self.get_swarm(swarm_id)?;
        let task = swarm.get_task(task_id).await?;
        if task.status != TaskStatus::Claimed {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        if task.claimant.as_deref() != Some(agent_id) {
            return Err(SwarmError::ClaimantMismatch {
                task_id: task_id.to_string(),
                claimant: task.claimant.unwrap_or_default(),
                agent_id: agent_id.to_string(),
            });
        }

        let outcome = ParameterTuningRequest::from_payload(&task.payload, &swarm.config().tuning)
            .and_then(|request| request.run(strategy, objective))
            .and_then(|outcome| {
                info!(
                    "Tuning task {} in swarm {} finished with fitness {} using {}",
                    task_id, swarm_id, outcome.best_fitness, outcome.strategy
                );
                let result = outcome.into_result();
                result.ensure_finite("result")?;
                Ok(result)
            });
        match outcome {
            Ok(result) => swarm.complete_task(task_id, agent_id, result).await,
            Err(e) => {
                swarm.fail_task(task_id, agent_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Forward a completed task's `chain_action` through the client
    ///
    /// Returns `None` when the result carries no action. A task is settled at
    /// most once: the settlement mark is taken before the transaction is sent
    /// and later calls fail with `InvalidTaskTransition`. A failed send drops
    /// the mark so the settlement can be retried.
    #[instrument(skip(self, client))]
    pub async fn settle_on_chain(
        &self,
        swarm_id: &str,
        task_id: &str,
        client: &dyn ChainClient,
    ) -> SwarmResult<Option<SettlementReceipt>> {
        let swarm = self.get_swarm(swarm_id)?;
        let task = swarm.get_task(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: "SETTLED".to_string(),
            });
        }

        let Some(tx) = task
            .result
            .as_ref()
            .map(ChainTransaction::from_result)
            .transpose()?
            .flatten()
        else {
            debug!("Task {} in swarm {} has no chain action", task_id, swarm_id);
            return Ok(None);
        };

        swarm.begin_settlement(task_id).await?;
        let receipt = match forward_chain_action(task_id, tx, client).await {
            Ok(receipt) => receipt,
            Err(e) => {
                swarm.abort_settlement(task_id).await?;
                warn!("Settlement of task {} in swarm {} failed: {}", task_id, swarm_id, e);
                return Err(e);
            }
        };
        swarm
            .finish_settlement(task_id, receipt.tx_hash.clone())
            .await?;
        info!(
            "Task {} in swarm {} settled on {} as {}",
            task_id, swarm_id, receipt.transaction.chain, receipt.tx_hash
        );
        Ok(Some(receipt))
    }
}

fn swarm_record(swarm: &Swarm, status: SwarmStatus) -> SwarmRecord {
    SwarmRecord {
        id: swarm.id().to_string(),
        name: swarm.name().to_string(),
        status,
        config: swarm.config().clone(),
        created_at: swarm.created_at(),
        updated_at: Utc::now(),
    }
}

async fn write_status(backend: &dyn PersistenceBackend, swarm: &Swarm) -> SwarmResult<()> {
    let record = swarm_record(swarm, swarm.status().await);
    backend
        .update_swarm(&record)
        .await
        .map_err(|e| e.in_swarm(swarm.id()))
}
