//! Integration tests for topology-aware message routing

use std::{sync::Arc, time::Duration};
use synapsed_hive::{
    encrypt_message, CommunicationRouter, InMemoryTransport, MessageEnvelope, Route,
    RoutingConfig, SecurityConfig, SecurityManager, SecurityPolicy, SharedKey,
    StaticCredentialVerifier, SwarmConfig, SwarmError, SwarmRegistry, SwarmResult, Topology,
};

/// Registry with agents a0..a{n-1} joined in order
async fn populated(n: usize, topology: Topology) -> SwarmResult<Arc<SwarmRegistry>> {
    let registry = Arc::new(SwarmRegistry::new());
    registry
        .create_swarm(SwarmConfig::new("s1").with_topology(topology))
        .await?;
    for i in 0..n {
        registry.add_agent_to_swarm("s1", &format!("a{i}")).await?;
    }
    Ok(registry)
}

fn router(
    registry: &Arc<SwarmRegistry>,
    transport: &Arc<InMemoryTransport>,
    delivery_timeout_ms: u64,
) -> SwarmResult<CommunicationRouter> {
    CommunicationRouter::new(
        registry.clone(),
        transport.clone(),
        RoutingConfig { delivery_timeout_ms },
    )
}

fn message() -> MessageEnvelope {
    MessageEnvelope::plaintext(b"hedge".to_vec()).with_metadata("kind", "signal")
}

#[tokio::test]
async fn test_down_reaches_direct_children_only() -> SwarmResult<()> {
    let registry = populated(13, Topology::hierarchical(3, 3)).await?;
    let transport = Arc::new(InMemoryTransport::new());
    let router = router(&registry, &transport, 500)?;

    let table = router
        .setup_communication_pattern("s1", Topology::hierarchical(3, 3))
        .await?;
    assert_eq!(table.children("a0"), ["a1", "a2", "a3"]);
    assert_eq!(table.children("a1"), ["a4", "a5", "a6"]);
    assert_eq!(table.level("a12"), Some(2));

    let report = router.send_message("s1", "a0", message(), Route::Down).await?;
    assert_eq!(report.next_hops, vec!["a1", "a2", "a3"]);
    assert!(report.is_complete());
    for child in ["a1", "a2", "a3"] {
        assert_eq!(transport.pending("s1", child), 1);
    }
    for grandchild in ["a4", "a9", "a12"] {
        assert_eq!(transport.pending("s1", grandchild), 0);
    }

    let up = router.send_message("s1", "a5", message(), Route::Up).await?;
    assert_eq!(up.delivered, vec!["a1"]);
    let siblings = router.send_message("s1", "a5", message(), Route::Siblings).await?;
    assert_eq!(siblings.delivered, vec!["a4", "a6"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_branch_does_not_block_others() -> SwarmResult<()> {
    let registry = populated(4, Topology::hierarchical(2, 3)).await?;
    let transport = Arc::new(InMemoryTransport::new());
    transport.set_unreachable("a2", true);
    let router = router(&registry, &transport, 500)?;

    let report = router.send_message("s1", "a0", message(), Route::Down).await?;
    assert_eq!(report.delivered, vec!["a1", "a3"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a2");
    assert!(!report.is_complete());

    let received = transport.take("s1", "a1");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].from, "a0");
    assert_eq!(received[0].envelope.metadata.get("kind").map(String::as_str), Some("signal"));
    Ok(())
}

#[tokio::test]
async fn test_slow_branch_times_out() -> SwarmResult<()> {
    let registry = populated(3, Topology::Star).await?;
    let transport = Arc::new(InMemoryTransport::new());
    transport.set_delay("a1", Duration::from_secs(2));
    let router = router(&registry, &transport, 30)?;

    let report = router.send_message("s1", "a0", message(), Route::Down).await?;
    assert_eq!(report.delivered, vec!["a2"]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn test_table_follows_membership() -> SwarmResult<()> {
    let registry = populated(3, Topology::hierarchical(2, 2)).await?;
    let transport = Arc::new(InMemoryTransport::new());
    let router = router(&registry, &transport, 500)?;

    let table = router
        .setup_communication_pattern("s1", Topology::hierarchical(2, 2))
        .await?;
    assert!(table.unrouted().is_empty());

    registry.add_agent_to_swarm("s1", "a3").await?;
    let report = router.send_message("s1", "a0", message(), Route::Broadcast).await?;
    assert_eq!(report.next_hops, vec!["a1", "a2", "a3"]);
    let rebuilt = router.routing_table("s1").unwrap();
    assert_eq!(rebuilt.unrouted(), ["a3"]);

    registry.remove_agent_from_swarm("s1", "a1").await?;
    let report = router.send_message("s1", "a0", message(), Route::Down).await?;
    assert_eq!(report.next_hops, vec!["a2", "a3"]);
    Ok(())
}

#[tokio::test]
async fn test_ring_and_direct_routes() -> SwarmResult<()> {
    let registry = populated(4, Topology::Ring).await?;
    let transport = Arc::new(InMemoryTransport::new());
    let router = router(&registry, &transport, 500)?;

    let down = router.send_message("s1", "a3", message(), Route::Down).await?;
    assert_eq!(down.next_hops, vec!["a0"]);
    let direct = router
        .send_message("s1", "a0", message(), Route::Direct("a2".into()))
        .await?;
    assert_eq!(direct.delivered, vec!["a2"]);

    assert!(matches!(
        router.send_message("s1", "outsider", message(), Route::Down).await,
        Err(SwarmError::NotFound { kind: "Agent", .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_plaintext_refused_when_encryption_required() -> SwarmResult<()> {
    let registry = populated(3, Topology::Mesh).await?;
    let transport = Arc::new(InMemoryTransport::new());
    let security = Arc::new(SecurityManager::new(
        Arc::new(StaticCredentialVerifier::new()),
        SecurityConfig::default(),
    )?);
    security
        .initialize_security(
            &*registry.get_swarm("s1")?,
            SecurityPolicy {
                authentication_required: false,
                encryption_required: true,
            },
        )
        .await?;
    let router = router(&registry, &transport, 500)?.with_security(security);

    assert!(matches!(
        router.send_message("s1", "a0", message(), Route::Broadcast).await,
        Err(SwarmError::EncryptionRequired(_))
    ));

    let sealed = encrypt_message(b"hedge", &SharedKey::derive(b"desk-7")?)?;
    let report = router.send_message("s1", "a0", sealed, Route::Broadcast).await?;
    assert_eq!(report.delivered.len(), 2);
    Ok(())
}
