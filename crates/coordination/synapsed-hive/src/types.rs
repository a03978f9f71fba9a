//! Common types for swarm orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a swarm in the registry
pub type SwarmId = String;

/// Identifier of an agent, chosen by the agent's owner
pub type AgentId = String;

/// Identifier of a task, unique within its swarm
pub type TaskId = String;

/// Lifecycle status of a swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwarmStatus {
    /// Created but never started
    Created,
    /// Background execution loop is active
    Running,
    /// Stopped explicitly, resumable
    Stopped,
    /// Escalated by the fault tolerance supervisor
    Failed,
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwarmStatus::Created => "CREATED",
            SwarmStatus::Running => "RUNNING",
            SwarmStatus::Stopped => "STOPPED",
            SwarmStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(SwarmStatus::Created),
            "RUNNING" => Some(SwarmStatus::Running),
            "STOPPED" => Some(SwarmStatus::Stopped),
            "FAILED" => Some(SwarmStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SwarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a claimant
    Pending,
    /// Claimed by exactly one agent
    Claimed,
    /// Finished successfully by the claimant
    Completed,
    /// Given up by the claimant
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Completed or failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate task counters for a swarm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.completed + self.failed
    }

    pub(crate) fn counter_mut(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Claimed => &mut self.claimed,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
        }
    }
}

/// Event recorded in a swarm's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SwarmEvent {
    /// Swarm was registered
    Created {
        name: String,
        timestamp: DateTime<Utc>,
    },
    /// Background execution loop started
    Started {
        timestamp: DateTime<Utc>,
    },
    /// Background execution loop stopped
    Stopped {
        timestamp: DateTime<Utc>,
    },
    /// Escalated to FAILED
    Failed {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Restored from a checkpoint
    Recovered {
        artifact_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Agent joined the swarm
    AgentJoined {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    /// Agent left the swarm
    AgentLeft {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    /// Leader was elected
    LeaderElected {
        agent_id: AgentId,
        policy: String,
        timestamp: DateTime<Utc>,
    },
    /// Leader slot became empty
    LeaderCleared {
        previous: AgentId,
        timestamp: DateTime<Utc>,
    },
    /// Shared state key written or removed
    SharedStateUpdated {
        key: String,
        timestamp: DateTime<Utc>,
    },
    /// Task appended to the queue
    TaskAllocated {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// Task claimed by an agent
    TaskClaimed {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    /// Task completed by its claimant
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
    /// Task failed by its claimant
    TaskFailed {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Checkpoint written
    CheckpointCreated {
        artifact_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Failure counted against the swarm
    FailureRecorded {
        reason: String,
        failures_in_window: usize,
        timestamp: DateTime<Utc>,
    },
    /// Message routed to next hops
    MessageRouted {
        from: AgentId,
        delivered: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Derived metrics for a swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMetrics {
    /// Swarm the metrics describe
    pub swarm_id: SwarmId,
    /// Current lifecycle status
    pub status: SwarmStatus,
    /// Number of members
    pub member_count: usize,
    /// Current leader, if any
    pub leader_id: Option<AgentId>,
    /// Task counters
    pub task_stats: TaskStats,
    /// Failures inside the current monitoring window
    pub failures_in_window: usize,
    /// Failures recorded since creation
    pub total_failures: u64,
    /// Checkpoints written since creation
    pub checkpoints_taken: u64,
    /// Time of the last checkpoint
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Ticks completed by the execution loop
    pub coordination_ticks: u64,
    /// Events currently held in history
    pub events_recorded: usize,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
