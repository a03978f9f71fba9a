//! Error types for swarm orchestration

use thiserror::Error;

/// Result type for swarm operations
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

/// Errors that can occur while orchestrating swarms
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Unknown swarm, agent or task
    #[error("{kind} not found: {id}")]
    NotFound {
        kind: &'static str,
        id: String,
    },

    /// Agent already belongs to the swarm
    #[error("Agent {agent_id} is already a member of swarm {swarm_id}")]
    DuplicateMember {
        swarm_id: String,
        agent_id: String,
    },

    /// Illegal lifecycle transition or operation in the current status
    #[error("Swarm {swarm_id} cannot {operation} while {status}")]
    InvalidState {
        swarm_id: String,
        status: String,
        operation: &'static str,
    },

    /// Lost a task claim race
    #[error("Task {task_id} is already {status}")]
    AlreadyClaimed {
        task_id: String,
        status: String,
    },

    /// Election requested on a swarm without members
    #[error("Swarm {0} has no members to elect from")]
    EmptySwarm(String),

    /// Recovery requested but no checkpoint exists
    #[error("No checkpoint available for swarm {0}")]
    NoCheckpoint(String),

    /// Credential verification rejected the agent
    #[error("Invalid credentials for agent {0}")]
    InvalidCredentials(String),

    /// Authenticated decryption failed
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Swarm size limit exceeded
    #[error("Swarm size limit exceeded: {current} >= {max}")]
    SwarmSizeLimitExceeded {
        current: usize,
        max: usize,
    },

    /// Task finished by an agent other than its claimant
    #[error("Task {task_id} is claimed by {claimant}, not {agent_id}")]
    ClaimantMismatch {
        task_id: String,
        claimant: String,
        agent_id: String,
    },

    /// Task transition not allowed from its current status
    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// Checkpoint written by an incompatible format version
    #[error("Checkpoint version mismatch: expected {expected}, found {found}")]
    IncompatibleCheckpoint {
        expected: u32,
        found: u32,
    },

    /// Value rejected for a reserved key or payload field
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue {
        key: String,
        reason: String,
    },

    /// Plaintext envelope sent in a swarm that requires encryption
    #[error("Swarm {0} requires encrypted messages")]
    EncryptionRequired(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Bounded operation ran out of time
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },

    /// Communication error between agents
    #[error("Agent communication error: {0}")]
    Communication(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected fault inside a swarm
    #[error("Internal error in swarm {swarm_id}: {source}")]
    Internal {
        swarm_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Other errors
    #[error("Swarm error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SwarmError {
    pub fn swarm_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Swarm", id: id.into() }
    }

    pub fn agent_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Agent", id: id.into() }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { kind: "Task", id: id.into() }
    }

    /// Wrap an unexpected fault with the swarm it happened in
    pub fn internal(swarm_id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Internal {
            swarm_id: swarm_id.into(),
            source: source.into(),
        }
    }

    /// Attach the swarm id to faults that do not carry one
    ///
    /// Storage, serialization and untyped errors become [`SwarmError::Internal`]
    /// with the original error as source. Domain errors are returned unchanged.
    pub fn in_swarm(self, swarm_id: &str) -> Self {
        match self {
            Self::Other(source) => Self::internal(swarm_id, source),
            err @ (Self::Storage(_) | Self::Serialization(_)) => Self::internal(swarm_id, err),
            err => err,
        }
    }

    /// Whether the caller can retry or pick different work
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyClaimed { .. } | Self::Timeout { .. } | Self::Communication(_)
        )
    }
}

impl From<config::ConfigError> for SwarmError {
    fn from(err: config::ConfigError) -> Self {
        SwarmError::Configuration(err.to_string())
    }
}

/// Attach swarm-id context to foreign errors
pub trait SwarmContext<T> {
    fn swarm_context(self, swarm_id: &str) -> SwarmResult<T>;
}

impl<T, E> SwarmContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn swarm_context(self, swarm_id: &str) -> SwarmResult<T> {
        self.map_err(|e| SwarmError::internal(swarm_id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let lost = SwarmError::AlreadyClaimed {
            task_id: "t1".into(),
            status: "claimed".into(),
        };
        assert!(lost.is_retryable());
        assert!(!SwarmError::EmptySwarm("s1".into()).is_retryable());
    }

    #[test]
    fn test_swarm_context_wraps_source() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = res.swarm_context("s1").unwrap_err();
        match err {
            SwarmError::Internal { swarm_id, source } => {
                assert_eq!(swarm_id, "s1");
                assert!(source.to_string().contains("disk gone"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_in_swarm_keeps_domain_errors() {
        let storage = SwarmError::Storage("disk full".into()).in_swarm("s2");
        match storage {
            SwarmError::Internal { swarm_id, source } => {
                assert_eq!(swarm_id, "s2");
                assert!(matches!(
                    source.downcast_ref::<SwarmError>(),
                    Some(SwarmError::Storage(_))
                ));
            }
            other => panic!("unexpected error: {other}"),
        }

        let missing = SwarmError::task_not_found("t1").in_swarm("s2");
        assert!(matches!(missing, SwarmError::NotFound { kind: "Task", .. }));
    }
}
