//! Integration tests for checkpointing, failure escalation and recovery

use std::{sync::Arc, time::Duration};
use synapsed_hive::{
    CheckpointStore, FaultToleranceConfig, FaultToleranceSupervisor, FileCheckpointStore,
    InMemoryCheckpointStore, StateValue, SwarmConfig, SwarmError, SwarmRegistry, SwarmResult,
    SwarmStatus, TaskStatus,
};
use tempfile::TempDir;
use tokio::time::sleep;

fn config(max_failures: u32) -> FaultToleranceConfig {
    FaultToleranceConfig {
        max_failures,
        checkpoint_interval_ms: 25,
        ..Default::default()
    }
}

async fn running_swarm(registry: &SwarmRegistry, name: &str) -> SwarmResult<()> {
    registry
        .create_swarm(SwarmConfig::new(name).with_tick_interval(Duration::from_millis(10)))
        .await?;
    for agent in ["a1", "a2", "a3"] {
        registry.add_agent_to_swarm(name, agent).await?;
    }
    registry.start_swarm(name).await
}

#[tokio::test]
async fn test_recover_restores_removed_agent() -> SwarmResult<()> {
    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let supervisor =
        FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config(3))?;
    let swarm = registry.get_swarm("s1")?;

    registry.update_shared_state("s1", "regime", "trending").await?;
    registry.allocate_task("s1", StateValue::Null).await?;
    registry.claim_task("s1", "t1", "a2").await?;
    let before = swarm.snapshot().await;

    supervisor.checkpoint_swarm(&swarm).await?;
    registry.remove_agent_from_swarm("s1", "a3").await?;
    registry.update_shared_state("s1", "regime", "ranging").await?;
    assert!(!swarm.is_member("a3").await);

    supervisor.recover_swarm(&swarm).await?;
    assert!(swarm.is_member("a3").await);
    assert_eq!(swarm.snapshot().await, before);
    assert_eq!(registry.get_task("s1", "t1").await?.status, TaskStatus::Claimed);
    registry.stop_swarm("s1").await
}

#[tokio::test]
async fn test_failures_block_allocation_until_recovery() -> SwarmResult<()> {
    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let supervisor =
        FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config(2))?;
    let swarm = registry.get_swarm("s1")?;
    supervisor.checkpoint_swarm(&swarm).await?;

    for i in 0..3 {
        supervisor.record_failure(&swarm, &format!("venue error {i}")).await;
    }
    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Failed);
    assert!(matches!(
        registry.allocate_task("s1", StateValue::Null).await,
        Err(SwarmError::InvalidState { .. })
    ));
    let metrics = registry.get_swarm_metrics("s1").await?;
    assert_eq!(metrics.failures_in_window, 3);

    supervisor.recover_swarm(&swarm).await?;
    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Running);
    assert_eq!(registry.get_swarm_metrics("s1").await?.failures_in_window, 0);
    registry.allocate_task("s1", StateValue::Null).await?;

    let stats = supervisor.statistics().await;
    assert_eq!(stats.successful_recoveries, 1);
    registry.stop_swarm("s1").await
}

async fn wait_for_record(registry: &SwarmRegistry, id: &str, status: SwarmStatus) -> SwarmResult<()> {
    for _ in 0..200 {
        let record = registry.backend().get_swarm(id).await?;
        if record.is_some_and(|r| r.status == status) {
            return Ok(());
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("record of {id} never reached {status}");
}

#[tokio::test]
async fn test_escalation_and_recovery_reach_backend() -> SwarmResult<()> {
    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let supervisor =
        FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config(0))?;
    let swarm = registry.get_swarm("s1")?;
    supervisor.checkpoint_swarm(&swarm).await?;

    supervisor.record_failure(&swarm, "venue offline").await;
    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Failed);
    wait_for_record(&registry, "s1", SwarmStatus::Failed).await?;

    supervisor.recover_swarm(&swarm).await?;
    wait_for_record(&registry, "s1", SwarmStatus::Running).await?;
    registry.stop_swarm("s1").await
}

#[tokio::test]
async fn test_failed_swarm_without_checkpoint_stays_failed() -> SwarmResult<()> {
    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let supervisor =
        FaultToleranceSupervisor::new(Arc::new(InMemoryCheckpointStore::new()), config(0))?;
    let swarm = registry.get_swarm("s1")?;

    supervisor.record_failure(&swarm, "boom").await;
    assert!(matches!(
        supervisor.recover_swarm(&swarm).await,
        Err(SwarmError::NoCheckpoint(_))
    ));
    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_monitor_writes_to_file_store() -> SwarmResult<()> {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()).await?);
    let supervisor = FaultToleranceSupervisor::new(
        store.clone(),
        FaultToleranceConfig {
            max_checkpoints: 2,
            ..config(3)
        },
    )?;

    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let swarm = registry.get_swarm("s1")?;

    let monitor = supervisor.monitor_swarm(&swarm, Duration::from_millis(10))?;
    sleep(Duration::from_millis(150)).await;
    monitor.stop().await;

    let artifacts = store.list("s1").await?;
    assert!(!artifacts.is_empty());
    assert!(artifacts.len() <= 2);
    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Running);

    registry.remove_agent_from_swarm("s1", "a1").await?;
    supervisor.recover_swarm(&swarm).await?;
    assert!(swarm.is_member("a1").await);
    registry.stop_swarm("s1").await
}

#[tokio::test]
async fn test_monitor_escalates_stopped_loop() -> SwarmResult<()> {
    let registry = SwarmRegistry::new();
    running_swarm(&registry, "s1").await?;
    let swarm = registry.get_swarm("s1")?;
    let supervisor = FaultToleranceSupervisor::new(
        Arc::new(InMemoryCheckpointStore::new()),
        FaultToleranceConfig {
            heartbeat_staleness_ms: 1,
            health_probe_timeout_ms: 20,
            health_retry_count: 0,
            checkpoint_interval_ms: 60_000,
            ..config(1)
        },
    )?;

    // a 1ms staleness bound is exceeded by any 10ms tick interval
    let monitor = supervisor.monitor_swarm(&swarm, Duration::from_millis(15))?;
    sleep(Duration::from_millis(200)).await;
    monitor.stop().await;

    assert_eq!(registry.get_swarm_status("s1").await?, SwarmStatus::Failed);
    assert!(!swarm.heartbeat().loop_active);
    Ok(())
}
