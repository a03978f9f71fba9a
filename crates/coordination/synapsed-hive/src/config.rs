//! Configuration for swarms and the hive runtime
//!
//! Every section defaults each field, so partial TOML files and
//! environment overrides compose. Values are validated after loading and
//! invalid values surface as [`SwarmError::Configuration`].

use crate::{
    election::ElectionStrategy,
    error::{SwarmError, SwarmResult},
    routing::Topology,
    security::AccessPolicy,
    value::StateValue,
    MAX_SWARM_SIZE,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Prefix for environment overrides, e.g. `SYNAPSED_HIVE_FAULT_TOLERANCE__MAX_FAILURES=5`
pub const ENV_PREFIX: &str = "SYNAPSED_HIVE";

/// What `add_agent_to_swarm` does with an id that is already a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateMemberPolicy {
    /// Fail with `DuplicateMember`
    #[default]
    Reject,
    /// Succeed without changing membership
    Ignore,
}

/// When a new leader is chosen after the slot becomes empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderReelection {
    /// Only on an explicit `elect_leader` call
    #[default]
    Manual,
    /// On the next coordination tick of a running swarm
    OnTick,
}

/// Algorithm the swarm runs, with free-form parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    /// Algorithm name, e.g. "pso" or "market_making"
    pub name: String,
    /// Algorithm parameters
    pub parameters: BTreeMap<String, StateValue>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

/// Upper bounds on parameter tuning payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningLimits {
    pub max_population_size: usize,
    pub max_iterations: usize,
    pub max_dimensions: usize,
}

impl Default for TuningLimits {
    fn default() -> Self {
        Self {
            max_population_size: 1_000,
            max_iterations: 10_000,
            max_dimensions: 256,
        }
    }
}

impl TuningLimits {
    pub fn validate(&self) -> SwarmResult<()> {
        let positive = [
            ("max_population_size", self.max_population_size),
            ("max_iterations", self.max_iterations),
            ("max_dimensions", self.max_dimensions),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SwarmError::Configuration(format!("tuning.{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

/// Configuration for a single swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Requested name, also the preferred id
    pub name: String,
    /// Default topology for message routing
    pub topology: Topology,
    /// Algorithm and parameters
    pub algorithm: AlgorithmConfig,
    /// Maximum number of members
    pub max_agents: usize,
    /// Handling of duplicate joins
    pub duplicate_policy: DuplicateMemberPolicy,
    /// Deterministic leader selection rule
    pub election: ElectionStrategy,
    /// When an empty leader slot is refilled
    pub reelection: LeaderReelection,
    /// Coordination tick of the background execution loop
    pub tick_interval_ms: u64,
    /// Events kept in the swarm's history
    pub max_events: usize,
    /// Bounds applied to tuning task payloads
    pub tuning: TuningLimits,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            topology: Topology::default(),
            algorithm: AlgorithmConfig::default(),
            max_agents: 50,
            duplicate_policy: DuplicateMemberPolicy::default(),
            election: ElectionStrategy::default(),
            reelection: LeaderReelection::default(),
            tick_interval_ms: 1000, // 1 second
            max_events: 1000,
            tuning: TuningLimits::default(),
        }
    }
}

impl SwarmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Same settings under another name
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = max_agents;
        self
    }

    pub fn with_algorithm(mut self, name: impl Into<String>) -> Self {
        self.algorithm.name = name.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.algorithm.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicateMemberPolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_election(mut self, election: ElectionStrategy) -> Self {
        self.election = election;
        self
    }

    pub fn with_reelection(mut self, reelection: LeaderReelection) -> Self {
        self.reelection = reelection;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_agents == 0 {
            return Err(SwarmError::Configuration("max_agents must be at least 1".into()));
        }
        if self.max_agents > MAX_SWARM_SIZE {
            return Err(SwarmError::Configuration(format!(
                "max_agents {} exceeds the limit of {}",
                self.max_agents, MAX_SWARM_SIZE
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(SwarmError::Configuration("tick_interval_ms must be positive".into()));
        }
        if self.max_events == 0 {
            return Err(SwarmError::Configuration("max_events must be at least 1".into()));
        }
        for (key, value) in &self.algorithm.parameters {
            value
                .ensure_finite(key)
                .map_err(|e| SwarmError::Configuration(e.to_string()))?;
        }
        self.tuning.validate()?;
        self.topology.validate()
    }
}

/// Configuration for the fault tolerance supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    /// Periodic checkpoint interval
    pub checkpoint_interval_ms: u64,
    /// Interval between health checks of a supervised swarm
    pub health_interval_ms: u64,
    /// Failures tolerated inside the window before the swarm is FAILED
    pub max_failures: u32,
    /// Sliding window in which failures are counted
    pub failure_window_ms: u64,
    /// Timeout for a single health probe
    pub health_probe_timeout_ms: u64,
    /// Extra probe attempts before declaring the swarm unhealthy
    pub health_retry_count: u32,
    /// Heartbeat age beyond which the execution loop counts as stalled
    pub heartbeat_staleness_ms: u64,
    /// Timeout for checkpoint reads and writes
    pub checkpoint_timeout_ms: u64,
    /// Checkpoints retained per swarm
    pub max_checkpoints: usize,
}

impl Default for FaultToleranceConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 30_000,  // 30 seconds
            health_interval_ms: 5_000,       // 5 seconds
            max_failures: 3,
            failure_window_ms: 300_000,      // 5 minutes
            health_probe_timeout_ms: 1_000,  // 1 second
            health_retry_count: 2,
            heartbeat_staleness_ms: 10_000,  // 10 seconds
            checkpoint_timeout_ms: 5_000,    // 5 seconds
            max_checkpoints: 10,
        }
    }
}

impl FaultToleranceConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn heartbeat_staleness(&self) -> Duration {
        Duration::from_millis(self.heartbeat_staleness_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        let positive = [
            ("checkpoint_interval_ms", self.checkpoint_interval_ms),
            ("health_interval_ms", self.health_interval_ms),
            ("failure_window_ms", self.failure_window_ms),
            ("health_probe_timeout_ms", self.health_probe_timeout_ms),
            ("heartbeat_staleness_ms", self.heartbeat_staleness_ms),
            ("checkpoint_timeout_ms", self.checkpoint_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SwarmError::Configuration(format!("{name} must be positive")));
            }
        }
        if self.max_checkpoints == 0 {
            return Err(SwarmError::Configuration("max_checkpoints must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration for the security manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Lifetime of issued tokens
    pub token_ttl_ms: u64,
    /// Timeout for the external credential verifier
    pub verify_timeout_ms: u64,
    /// Access log entries kept per swarm
    pub max_access_log: usize,
    /// Per-action allow/deny rules
    pub access: AccessPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: 3_600_000, // 1 hour
            verify_timeout_ms: 2_000,
            max_access_log: 1000,
            access: AccessPolicy::default(),
        }
    }
}

impl SecurityConfig {
    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.token_ttl_ms as i64)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        // chrono panics past i64::MAX milliseconds
        if self.token_ttl_ms == 0 || self.token_ttl_ms > i64::MAX as u64 {
            return Err(SwarmError::Configuration("token_ttl_ms out of range".into()));
        }
        if self.verify_timeout_ms == 0 {
            return Err(SwarmError::Configuration("verify_timeout_ms must be positive".into()));
        }
        if self.max_access_log == 0 {
            return Err(SwarmError::Configuration("max_access_log must be at least 1".into()));
        }
        Ok(())
    }
}

/// Configuration for the communication router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Timeout for delivery to a single next hop
    pub delivery_timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { delivery_timeout_ms: 2_000 }
    }
}

impl RoutingConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        if self.delivery_timeout_ms == 0 {
            return Err(SwarmError::Configuration("delivery_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Durable store selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackendConfig {
    /// Process-local maps, lost on exit
    #[default]
    Memory,
    /// SQLite database file
    Sqlite { path: PathBuf },
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Record store beneath the registry
    pub backend: StorageBackendConfig,
    /// Directory for checkpoint artifacts, in-memory when unset
    pub checkpoint_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Process-wide configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub logging: LoggingConfig,
    /// Template for swarms created through the runtime
    pub swarm_defaults: SwarmConfig,
    pub fault_tolerance: FaultToleranceConfig,
    pub security: SecurityConfig,
    pub routing: RoutingConfig,
    pub persistence: PersistenceConfig,
}

impl HiveConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> SwarmResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: HiveConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text directly
    pub fn from_toml_str(text: &str) -> SwarmResult<Self> {
        let config: HiveConfig =
            toml::from_str(text).map_err(|e| SwarmError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwarmResult<()> {
        if self.logging.level.trim().is_empty() {
            return Err(SwarmError::Configuration("logging.level must not be empty".into()));
        }
        self.swarm_defaults.validate()?;
        self.fault_tolerance.validate()?;
        self.security.validate()?;
        self.routing.validate()
    }

    /// Swarm config from the defaults with the given name
    pub fn swarm_config(&self, name: impl Into<String>) -> SwarmConfig {
        SwarmConfig {
            name: name.into(),
            ..self.swarm_defaults.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HiveConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = FaultToleranceConfig {
            checkpoint_interval_ms: 0,
            ..FaultToleranceConfig::default()
        };
        assert!(matches!(config.validate(), Err(SwarmError::Configuration(_))));

        let swarm = SwarmConfig::new("s1").with_max_agents(0);
        assert!(matches!(swarm.validate(), Err(SwarmError::Configuration(_))));

        let swarm = SwarmConfig::new("s1").with_max_agents(MAX_SWARM_SIZE + 1);
        assert!(matches!(swarm.validate(), Err(SwarmError::Configuration(_))));
    }

    #[test]
    fn test_negative_threshold_rejected_from_toml() {
        let err = HiveConfig::from_toml_str("[fault_tolerance]\nmax_failures = -1\n").unwrap_err();
        assert!(matches!(err, SwarmError::Configuration(_)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HiveConfig::from_toml_str(
            r#"
            [swarm_defaults]
            max_agents = 5
            reelection = "on_tick"

            [swarm_defaults.topology]
            kind = "hierarchical"
            levels = 2
            branching_factor = 4

            [swarm_defaults.algorithm]
            name = "pso"
            parameters = { inertia = 0.7, particles = 30 }

            [persistence.backend]
            kind = "sqlite"
            path = "/var/lib/hive/hive.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.swarm_defaults.max_agents, 5);
        assert_eq!(config.swarm_defaults.reelection, LeaderReelection::OnTick);
        assert_eq!(
            config.swarm_defaults.topology,
            Topology::Hierarchical { levels: 2, branching_factor: 4 }
        );
        assert_eq!(
            config.swarm_defaults.algorithm.parameters.get("particles"),
            Some(&StateValue::Integer(30))
        );
        assert_eq!(config.fault_tolerance, FaultToleranceConfig::default());
        assert_eq!(
            config.persistence.backend,
            StorageBackendConfig::Sqlite { path: PathBuf::from("/var/lib/hive/hive.db") }
        );

        let swarm = config.swarm_config("alpha");
        assert_eq!(swarm.name, "alpha");
        assert_eq!(swarm.max_agents, 5);
    }

    #[test]
    fn test_tuning_and_health_sections() {
        let config = HiveConfig::from_toml_str(
            r#"
            [fault_tolerance]
            health_interval_ms = 250

            [security]
            token_ttl_ms = 1500

            [swarm_defaults.tuning]
            max_iterations = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.fault_tolerance.health_interval(), Duration::from_millis(250));
        assert_eq!(config.security.token_ttl(), chrono::Duration::milliseconds(1500));
        assert_eq!(config.swarm_defaults.tuning.max_iterations, 50);
        assert_eq!(config.swarm_defaults.tuning.max_population_size, 1_000);

        let err = HiveConfig::from_toml_str("[swarm_defaults.tuning]\nmax_dimensions = 0\n")
            .unwrap_err();
        assert!(matches!(err, SwarmError::Configuration(_)));
    }

    #[test]
    fn test_non_finite_parameter_rejected() {
        let err = HiveConfig::from_toml_str(
            "[swarm_defaults.algorithm]\nparameters = { inertia = nan }\n",
        )
        .unwrap_err();
        assert!(matches!(err, SwarmError::Configuration(msg) if msg.contains("inertia")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[routing]\ndelivery_timeout_ms = 250").unwrap();

        let config = HiveConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.routing.delivery_timeout(), Duration::from_millis(250));
    }
}
