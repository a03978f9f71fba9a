//! Integration tests for task allocation and exactly-once claims

use futures::future::join_all;
use std::sync::Arc;
use synapsed_hive::{
    StateValue, SwarmConfig, SwarmError, SwarmRegistry, SwarmResult, TaskStatus,
};
use tokio_test::{assert_err, assert_ok};

async fn registry_with_agents(agents: usize) -> SwarmResult<Arc<SwarmRegistry>> {
    let registry = Arc::new(SwarmRegistry::new());
    registry
        .create_swarm(SwarmConfig::new("s1").with_max_agents(agents.max(1)))
        .await?;
    for i in 1..=agents {
        registry.add_agent_to_swarm("s1", &format!("a{i}")).await?;
    }
    Ok(registry)
}

#[tokio::test]
async fn test_allocate_claim_complete() -> SwarmResult<()> {
    let registry = registry_with_agents(2).await?;

    let task = registry
        .allocate_task("s1", StateValue::map([("type", "optimize")]))
        .await?;
    assert_eq!(task.id, "t1");
    assert_eq!(task.status, TaskStatus::Pending);

    registry.claim_task("s1", "t1", "a1").await?;
    assert!(matches!(
        registry.claim_task("s1", "t1", "a2").await,
        Err(SwarmError::AlreadyClaimed { .. })
    ));

    let done = registry
        .complete_task("s1", "t1", "a1", StateValue::map([("pnl", 12.5)]))
        .await?;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.claimant.as_deref(), Some("a1"));

    let stats = registry.get_swarm_metrics("s1").await?.task_stats;
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.claimed, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() -> SwarmResult<()> {
    let agents = 16;
    let registry = registry_with_agents(agents).await?;

    for _ in 0..10 {
        let task = registry.allocate_task("s1", StateValue::Null).await?;
        let attempts = (1..=agents).map(|i| {
            let registry = registry.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                registry
                    .claim_task("s1", &task_id, &format!("a{i}"))
                    .await
            })
        });

        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Err(SwarmError::AlreadyClaimed { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, agents - 1);
    }

    let metrics = registry.get_swarm_metrics("s1").await?;
    assert_eq!(metrics.task_stats.claimed, 10);
    Ok(())
}

#[tokio::test]
async fn test_completion_rules() -> SwarmResult<()> {
    let registry = registry_with_agents(2).await?;
    registry.allocate_task("s1", StateValue::Null).await?;

    assert!(matches!(
        registry.complete_task("s1", "t1", "a1", StateValue::Null).await,
        Err(SwarmError::InvalidTaskTransition { .. })
    ));
    registry.claim_task("s1", "t1", "a1").await?;
    assert!(matches!(
        registry.complete_task("s1", "t1", "a2", StateValue::Null).await,
        Err(SwarmError::ClaimantMismatch { .. })
    ));

    let failed = registry.fail_task("s1", "t1", "a1", "venue offline").await?;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("venue offline"));
    assert!(matches!(
        registry.complete_task("s1", "t1", "a1", StateValue::Null).await,
        Err(SwarmError::InvalidTaskTransition { .. })
    ));

    let stats = registry.get_swarm_metrics("s1").await?.task_stats;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 1);
    Ok(())
}

#[tokio::test]
async fn test_claim_errors() -> SwarmResult<()> {
    let registry = registry_with_agents(1).await?;
    registry.allocate_task("s1", StateValue::Null).await?;

    assert_err!(registry.claim_task("s1", "t9", "a1").await);
    assert!(matches!(
        registry.claim_task("s1", "t1", "outsider").await,
        Err(SwarmError::NotFound { kind: "Agent", .. })
    ));
    assert!(matches!(
        registry.claim_task("ghost", "t1", "a1").await,
        Err(SwarmError::NotFound { kind: "Swarm", .. })
    ));
    assert_ok!(registry.claim_task("s1", "t1", "a1").await);
    Ok(())
}

#[tokio::test]
async fn test_task_ids_are_sequential() -> SwarmResult<()> {
    let registry = registry_with_agents(1).await?;
    for expected in ["t1", "t2", "t3"] {
        let task = registry.allocate_task("s1", StateValue::Null).await?;
        assert_eq!(task.id, expected);
    }
    let ids: Vec<String> = registry
        .list_tasks("s1")
        .await?
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert_eq!(registry.get_task("s1", "t2").await?.status, TaskStatus::Pending);
    Ok(())
}
