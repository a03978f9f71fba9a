//! Fault tolerance supervisor
//!
//! Checkpoints swarms into a [`CheckpointStore`], watches their execution
//! loops through a [`HealthProbe`], counts failures inside a sliding
//! window and restores a swarm from its latest checkpoint on request.
//!
//! A swarm whose failures exceed `max_failures` within the window is moved
//! to FAILED. The escalation is visible through status and metrics; it is
//! never returned as an error to the call that triggered it.

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    config::FaultToleranceConfig,
    error::{SwarmError, SwarmResult},
    swarm::Swarm,
    telemetry::names,
    types::{SwarmEvent, SwarmStatus},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::{interval, interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

/// Liveness check run against a swarm by the monitor loop
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries the reason the swarm is considered unhealthy
    async fn probe(&self, swarm: &Swarm) -> Result<(), String>;
}

/// Probe backed by the execution loop heartbeat
#[derive(Debug, Clone)]
pub struct HeartbeatProbe {
    staleness: Duration,
}

impl HeartbeatProbe {
    pub fn new(staleness: Duration) -> Self {
        Self { staleness }
    }
}

#[async_trait]
impl HealthProbe for HeartbeatProbe {
    async fn probe(&self, swarm: &Swarm) -> Result<(), String> {
        let heartbeat = swarm.heartbeat();
        if !heartbeat.loop_active {
            return Err("execution loop is not running".to_string());
        }
        match heartbeat.last_tick {
            Some(last) if last.elapsed() > self.staleness => Err(format!(
                "execution loop stalled for {}ms",
                last.elapsed().as_millis()
            )),
            _ => Ok(()),
        }
    }
}

/// Recovery operation statistics
#[derive(Debug, Clone, Default)]
pub struct RecoveryStatistics {
    /// Total recovery attempts
    pub total_recovery_attempts: u64,
    /// Successful recoveries
    pub successful_recoveries: u64,
    /// Failed recoveries
    pub failed_recoveries: u64,
    /// Checkpoints written
    pub checkpoints_written: u64,
    /// Checkpoint writes that failed or timed out
    pub checkpoint_failures: u64,
    /// Health checks that exhausted their retries
    pub unhealthy_probes: u64,
    /// Last recovery timestamp
    pub last_recovery: Option<DateTime<Utc>>,
}

/// Checkpoints, monitors and recovers swarms
#[derive(Clone)]
pub struct FaultToleranceSupervisor {
    /// Configuration
    config: Arc<FaultToleranceConfig>,
    /// Process-wide artifact store
    store: Arc<dyn CheckpointStore>,
    /// Liveness check used by monitor loops
    probe: Arc<dyn HealthProbe>,
    /// Recovery statistics
    stats: Arc<RwLock<RecoveryStatistics>>,
}

impl std::fmt::Debug for FaultToleranceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultToleranceSupervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FaultToleranceSupervisor {
    /// Create a supervisor using the heartbeat probe
    pub fn new(store: Arc<dyn CheckpointStore>, config: FaultToleranceConfig) -> SwarmResult<Self> {
        config.validate()?;
        let probe = Arc::new(HeartbeatProbe::new(config.heartbeat_staleness()));
        Ok(Self {
            config: Arc::new(config),
            store,
            probe,
            stats: Arc::new(RwLock::new(RecoveryStatistics::default())),
        })
    }

    /// Replace the health probe
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &FaultToleranceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Write a checkpoint of the swarm's members, shared state and tasks
    #[instrument(skip(self, swarm), fields(swarm_id = %swarm.id()))]
    pub async fn checkpoint_swarm(&self, swarm: &Swarm) -> SwarmResult<Checkpoint> {
        let _guard = swarm.checkpoint_guard().lock().await;

        let checkpoint = Checkpoint::new(swarm.id(), swarm.snapshot().await)?;
        let saved = self
            .bounded("checkpoint save", self.store.save(&checkpoint))
            .await
            .map_err(|e| e.in_swarm(swarm.id()));
        if let Err(e) = saved {
            self.stats.write().await.checkpoint_failures += 1;
            error!("Failed to write checkpoint for swarm {}: {}", swarm.id(), e);
            return Err(e);
        }

        match self
            .bounded("checkpoint prune", self.store.prune(swarm.id(), self.config.max_checkpoints))
            .await
        {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} old checkpoints of swarm {}", pruned, swarm.id()),
            Err(e) => warn!("Failed to prune checkpoints of swarm {}: {}", swarm.id(), e),
        }

        swarm.mark_checkpointed(checkpoint.timestamp).await;
        swarm.record_event(SwarmEvent::CheckpointCreated {
            artifact_id: checkpoint.artifact_id.clone(),
            timestamp: Utc::now(),
        });
        self.stats.write().await.checkpoints_written += 1;
        counter!(names::CHECKPOINTS, "swarm" => swarm.id().to_string()).increment(1);
        info!("Checkpoint {} written for swarm {}", checkpoint.artifact_id, swarm.id());
        Ok(checkpoint)
    }

    /// Count a failure against the swarm
    ///
    /// Returns the swarm status afterwards; FAILED once the failures inside
    /// the window exceed `max_failures`.
    pub async fn record_failure(&self, swarm: &Swarm, reason: &str) -> SwarmStatus {
        swarm
            .register_failure(reason, self.config.failure_window(), self.config.max_failures)
            .await
    }

    /// Run the health probe with its timeout and bounded retries
    pub async fn check_health(&self, swarm: &Swarm) -> Result<(), String> {
        let probe_timeout = self.config.health_probe_timeout();
        let attempts = self.config.health_retry_count + 1;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            match timeout(probe_timeout, self.probe.probe(swarm)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(reason)) => last_reason = reason,
                Err(_) => {
                    last_reason = format!("health probe timed out after {}ms", probe_timeout.as_millis())
                }
            }
            debug!(
                "Health probe {}/{} failed for swarm {}: {}",
                attempt,
                attempts,
                swarm.id(),
                last_reason
            );
        }

        self.stats.write().await.unhealthy_probes += 1;
        Err(last_reason)
    }

    /// Start a supervising loop that health-checks and checkpoints the swarm
    ///
    /// Health checks run every `interval`; checkpoints every
    /// `checkpoint_interval`. Both only act while the swarm is RUNNING.
    pub fn monitor_swarm(&self, swarm: &Arc<Swarm>, interval: Duration) -> SwarmResult<MonitorHandle> {
        if interval.is_zero() {
            return Err(SwarmError::Configuration("monitor interval must be positive".into()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_monitor(
            self.clone(),
            Arc::downgrade(swarm),
            interval,
            stop_rx,
        ));
        info!("Monitoring swarm {} every {}ms", swarm.id(), interval.as_millis());

        Ok(MonitorHandle {
            swarm_id: swarm.id().to_string(),
            stop_tx,
            join: Some(join),
        })
    }

    /// Restore the swarm from its most recent checkpoint and run it again
    #[instrument(skip(self, swarm), fields(swarm_id = %swarm.id()))]
    pub async fn recover_swarm(&self, swarm: &Arc<Swarm>) -> SwarmResult<Checkpoint> {
        let _guard = swarm.checkpoint_guard().lock().await;
        self.stats.write().await.total_recovery_attempts += 1;

        let checkpoint = match self.load_latest(swarm).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                self.stats.write().await.failed_recoveries += 1;
                warn!("Recovery of swarm {} failed: {}", swarm.id(), e);
                return Err(e);
            }
        };

        swarm
            .restore(checkpoint.snapshot.clone(), &checkpoint.artifact_id)
            .await;

        {
            let mut stats = self.stats.write().await;
            stats.successful_recoveries += 1;
            stats.last_recovery = Some(Utc::now());
        }
        counter!(names::RECOVERIES, "swarm" => swarm.id().to_string()).increment(1);
        info!(
            "Swarm {} recovered from checkpoint {}",
            swarm.id(),
            checkpoint.artifact_id
        );
        Ok(checkpoint)
    }

    /// Get recovery statistics
    pub async fn statistics(&self) -> RecoveryStatistics {
        self.stats.read().await.clone()
    }

    async fn load_latest(&self, swarm: &Swarm) -> SwarmResult<Checkpoint> {
        let checkpoint = self
            .bounded("checkpoint load", self.store.latest(swarm.id()))
            .await?
            .ok_or_else(|| SwarmError::NoCheckpoint(swarm.id().to_string()))?;
        checkpoint.ensure_compatible()?;
        Ok(checkpoint)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        io: impl Future<Output = SwarmResult<T>>,
    ) -> SwarmResult<T> {
        let limit = self.config.checkpoint_timeout();
        timeout(limit, io).await.map_err(|_| SwarmError::Timeout {
            operation,
            after_ms: limit.as_millis() as u64,
        })?
    }
}

/// Handle to a running monitor loop
#[derive(Debug)]
pub struct MonitorHandle {
    swarm_id: String,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn swarm_id(&self) -> &str {
        &self.swarm_id
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Signal the loop and wait for it to finish
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("Monitor of swarm {} ended abnormally: {}", self.swarm_id, e);
            }
        }
        debug!("Monitor of swarm {} stopped", self.swarm_id);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.stop_tx.send(true);
        }
    }
}

async fn run_monitor(
    supervisor: FaultToleranceSupervisor,
    swarm: Weak<Swarm>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut health = interval(period);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let checkpoint_period = supervisor.config.checkpoint_interval();
    let mut checkpoints = interval_at(Instant::now() + checkpoint_period, checkpoint_period);
    checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = health.tick() => {
                let Some(swarm) = swarm.upgrade() else {
                    break;
                };
                if swarm.status().await != SwarmStatus::Running {
                    continue;
                }
                if let Err(reason) = supervisor.check_health(&swarm).await {
                    supervisor.record_failure(&swarm, &reason).await;
                }
            }
            _ = checkpoints.tick() => {
                let Some(swarm) = swarm.upgrade() else {
                    break;
                };
                if swarm.status().await != SwarmStatus::Running {
                    continue;
                }
                if let Err(e) = supervisor.checkpoint_swarm(&swarm).await {
                    supervisor
                        .record_failure(&swarm, &format!("checkpoint failed: {e}"))
                        .await;
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{Checkpoint, InMemoryCheckpointStore},
        config::SwarmConfig,
        election::LowestIdPolicy,
        value::StateValue,
    };

    fn supervisor(max_failures: u32) -> FaultToleranceSupervisor {
        let config = FaultToleranceConfig {
            max_failures,
            checkpoint_interval_ms: 20,
            health_probe_timeout_ms: 50,
            health_retry_count: 1,
            ..Default::default()
        };
        FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config).unwrap()
    }

    fn swarm(name: &str) -> Arc<Swarm> {
        let config = SwarmConfig::new(name).with_tick_interval(Duration::from_millis(10));
        Arc::new(Swarm::new(name.to_string(), config, Arc::new(LowestIdPolicy)))
    }

    #[derive(Debug)]
    struct AlwaysSick;

    #[async_trait]
    impl HealthProbe for AlwaysSick {
        async fn probe(&self, _swarm: &Swarm) -> Result<(), String> {
            Err("sick".to_string())
        }
    }

    /// Store that refuses every write
    #[derive(Debug)]
    struct ReadOnlyStore;

    #[async_trait]
    impl CheckpointStore for ReadOnlyStore {
        async fn save(&self, _checkpoint: &Checkpoint) -> SwarmResult<()> {
            Err(SwarmError::Storage("read-only file system".into()))
        }

        async fn latest(&self, _swarm_id: &str) -> SwarmResult<Option<Checkpoint>> {
            Ok(None)
        }

        async fn load(&self, _swarm_id: &str, _artifact_id: &str) -> SwarmResult<Option<Checkpoint>> {
            Ok(None)
        }

        async fn list(&self, _swarm_id: &str) -> SwarmResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn prune(&self, _swarm_id: &str, _keep: usize) -> SwarmResult<usize> {
            Ok(0)
        }

        async fn delete_all(&self, _swarm_id: &str) -> SwarmResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_checkpoint_write_fault_names_swarm() {
        let supervisor =
            FaultToleranceSupervisor::new(Arc::new(ReadOnlyStore), FaultToleranceConfig::default())
                .unwrap();
        let swarm = swarm("s7");

        match supervisor.checkpoint_swarm(&swarm).await {
            Err(SwarmError::Internal { swarm_id, source }) => {
                assert_eq!(swarm_id, "s7");
                assert!(source.to_string().contains("read-only"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(supervisor.statistics().await.checkpoint_failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = FaultToleranceConfig {
            checkpoint_interval_ms: 0,
            ..Default::default()
        };
        let result = FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config);
        assert!(matches!(result, Err(SwarmError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_failures_escalate_past_threshold() {
        let supervisor = supervisor(2);
        let swarm = swarm("s1");
        swarm.start().await.unwrap();

        assert_eq!(supervisor.record_failure(&swarm, "one").await, SwarmStatus::Running);
        assert_eq!(supervisor.record_failure(&swarm, "two").await, SwarmStatus::Running);
        assert_eq!(supervisor.record_failure(&swarm, "three").await, SwarmStatus::Failed);
        assert!(!swarm.heartbeat().loop_active);
        assert!(matches!(
            swarm.allocate_task(StateValue::Null).await,
            Err(SwarmError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_recover_without_checkpoint() {
        let supervisor = supervisor(3);
        let swarm = swarm("s1");
        assert!(matches!(
            supervisor.recover_swarm(&swarm).await,
            Err(SwarmError::NoCheckpoint(_))
        ));
        assert_eq!(supervisor.statistics().await.failed_recoveries, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_then_recover() {
        let supervisor = supervisor(3);
        let swarm = swarm("s1");
        swarm.add_member("a1".into()).await.unwrap();
        swarm.add_member("a2".into()).await.unwrap();
        let before = swarm.snapshot().await;

        let checkpoint = supervisor.checkpoint_swarm(&swarm).await.unwrap();
        swarm.remove_member("a2").await.unwrap();

        let restored = supervisor.recover_swarm(&swarm).await.unwrap();
        assert_eq!(restored.artifact_id, checkpoint.artifact_id);
        assert_eq!(swarm.snapshot().await, before);
        assert_eq!(swarm.status().await, SwarmStatus::Running);
        assert_eq!(swarm.metrics().await.checkpoints_taken, 1);
        swarm.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_retries_then_fails() {
        let supervisor = supervisor(3).with_probe(Arc::new(AlwaysSick));
        let swarm = swarm("s1");
        assert_eq!(supervisor.check_health(&swarm).await, Err("sick".to_string()));
        assert_eq!(supervisor.statistics().await.unhealthy_probes, 1);
    }

    #[tokio::test]
    async fn test_monitor_checkpoints_and_stops() {
        let supervisor = supervisor(3);
        let swarm = swarm("s1");
        swarm.start().await.unwrap();

        let handle = supervisor
            .monitor_swarm(&swarm, Duration::from_millis(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.is_running());
        handle.stop().await;

        let written = supervisor.statistics().await.checkpoints_written;
        assert!(written >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.statistics().await.checkpoints_written, written);
        assert_eq!(swarm.status().await, SwarmStatus::Running);
        swarm.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_escalates_dead_loop() {
        let supervisor = supervisor(1).with_probe(Arc::new(AlwaysSick));
        let swarm = swarm("s1");
        swarm.start().await.unwrap();

        let handle = supervisor
            .monitor_swarm(&swarm, Duration::from_millis(5))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        assert_eq!(swarm.status().await, SwarmStatus::Failed);
    }
}
