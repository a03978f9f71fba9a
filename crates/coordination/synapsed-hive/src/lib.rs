//! # Synapsed Hive
//!
//! Swarm orchestration engine for pools of autonomous trading agents.
//!
//! ## Key Features
//!
//! - **Swarm Lifecycle**: create, start, stop and delete swarms through one registry
//! - **Membership & Leadership**: ordered member sets with pluggable, deterministic election
//! - **Shared State**: per-swarm typed key/value store with a guarded `leader_id` slot
//! - **Task Allocation**: pull-model queue with exactly-once claims
//! - **Fault Tolerance**: periodic checkpoints, health monitoring and recovery
//! - **Security**: token authentication, per-action authorization, ChaCha20-Poly1305 envelopes
//! - **Routing**: topology-aware best-effort delivery over current membership
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Hive                      │
//! ├──────────────────────────────────────────────┤
//! │ FaultTolerance │ SecurityManager │  Router    │
//! │   Supervisor   │                 │            │
//! ├──────────────────────────────────────────────┤
//! │                SwarmRegistry                 │
//! ├──────────────────────────────────────────────┤
//! │  Swarm: Membership │ SharedState │ TaskQueue  │
//! ├──────────────────────────────────────────────┤
//! │ CheckpointStore    │    PersistenceBackend    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use synapsed_hive::prelude::*;
//!
//! # async fn run() -> SwarmResult<()> {
//! let registry = SwarmRegistry::new();
//! let swarm = registry.create_swarm(SwarmConfig::new("s1").with_max_agents(5)).await?;
//! registry.add_agent_to_swarm(swarm.id(), "a1").await?;
//! assert_eq!(registry.elect_leader("s1").await?, "a1");
//!
//! let task = registry.allocate_task("s1", StateValue::map([("type", "optimize")])).await?;
//! registry.claim_task("s1", &task.id, "a1").await?;
//! registry.complete_task("s1", &task.id, "a1", StateValue::from(true)).await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod election;
pub mod error;
pub mod fault_tolerance;
pub mod membership;
pub mod persistence;
pub mod plugins;
pub mod registry;
pub mod routing;
pub mod runtime;
pub mod security;
pub mod state;
pub mod swarm;
pub mod tasks;
pub mod telemetry;
pub mod types;
pub mod value;

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, CHECKPOINT_VERSION,
};
pub use config::{
    AlgorithmConfig, DuplicateMemberPolicy, FaultToleranceConfig, HiveConfig, LeaderReelection,
    LoggingConfig, PersistenceConfig, RoutingConfig, SecurityConfig, StorageBackendConfig,
    SwarmConfig, TuningLimits,
};
pub use crypto::{
    decrypt_message, encrypt_message, encrypt_with_metadata, MessageEnvelope, SharedKey,
};
pub use election::{EarliestJoinPolicy, ElectionPolicy, ElectionStrategy, LowestIdPolicy};
pub use error::{SwarmContext, SwarmError, SwarmResult};
pub use fault_tolerance::{
    FaultToleranceSupervisor, HealthProbe, HeartbeatProbe, MonitorHandle, RecoveryStatistics,
};
pub use membership::{Member, Membership};
pub use persistence::{
    AgentRecord, InMemoryBackend, PersistenceBackend, SqliteBackend, StorageHealth, SwarmRecord,
};
pub use plugins::{
    ChainClient, ChainTransaction, OptimizationStrategy, ParameterTuningRequest,
    SettlementReceipt, TuningOutcome,
};
pub use registry::SwarmRegistry;
pub use routing::{
    CommunicationRouter, DeliveryReport, InMemoryTransport, MessageTransport, Route,
    RoutedMessage, RoutingTable, Topology,
};
pub use runtime::Hive;
pub use security::{
    AccessLogEntry, AccessPolicy, AccessRule, CredentialVerifier, Credentials, IssuedToken,
    PolicyEffect, SecurityContext, SecurityManager, SecurityPolicy, StaticCredentialVerifier,
};
pub use state::{SharedState, LEADER_KEY};
pub use swarm::{Heartbeat, Swarm, SwarmSnapshot};
pub use tasks::{Settlement, Task, TaskQueue};
pub use types::*;
pub use value::StateValue;

/// Version of the hive coordination protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Maximum number of agents in a swarm
pub const MAX_SWARM_SIZE: usize = 100;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        decrypt_message, encrypt_message, AccessPolicy, AccessRule, Checkpoint, CheckpointStore,
        CommunicationRouter, Credentials, DuplicateMemberPolicy, ElectionStrategy,
        FaultToleranceConfig, FaultToleranceSupervisor, Hive, HiveConfig, InMemoryCheckpointStore,
        InMemoryTransport, LeaderReelection, MessageEnvelope, Route, SecurityManager,
        SecurityPolicy, SharedKey, StateValue, StaticCredentialVerifier, Swarm, SwarmConfig,
        SwarmError, SwarmEvent, SwarmRegistry, SwarmResult, SwarmStatus, Task, TaskStatus,
        Topology,
    };
}
