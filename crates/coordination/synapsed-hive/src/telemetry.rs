//! Logging and metrics setup

use crate::{
    config::LoggingConfig,
    error::{SwarmError, SwarmResult},
};
use tracing_subscriber::EnvFilter;

/// Metric names emitted by the hive
pub mod names {
    pub const SWARMS_CREATED: &str = "hive_swarms_created_total";
    pub const SWARM_MEMBERS: &str = "hive_swarm_members";
    pub const TASKS_CLAIMED: &str = "hive_tasks_claimed_total";
    pub const CLAIM_CONFLICTS: &str = "hive_claim_conflicts_total";
    pub const CHECKPOINTS: &str = "hive_checkpoints_total";
    pub const FAILURES: &str = "hive_failures_total";
    pub const RECOVERIES: &str = "hive_recoveries_total";
    pub const MESSAGES_DELIVERED: &str = "hive_messages_delivered_total";
    pub const MESSAGES_FAILED: &str = "hive_messages_failed_total";
    pub const AUTH_FAILURES: &str = "hive_auth_failures_total";
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> SwarmResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| SwarmError::Configuration(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| SwarmError::Configuration(format!("tracing already initialised: {e}")))
}

/// Serve collected metrics on `addr` in Prometheus text format
#[cfg(feature = "monitoring")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> SwarmResult<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SwarmError::Configuration(format!("prometheus exporter: {e}")))
}
