//! Task queue with compare-and-swap claims
//!
//! Tasks only move `PENDING -> CLAIMED -> {COMPLETED | FAILED}`. The queue
//! itself is not synchronized; the owning swarm serializes every mutation
//! behind its write lock, which makes the status check and the status write
//! of a claim one atomic step.
//!
//! A COMPLETED task whose result carries a chain action can additionally be
//! settled once. The settlement mark is taken under the same lock before the
//! transaction is sent, so a task is never forwarded twice.

use crate::{
    error::{SwarmError, SwarmResult},
    types::{AgentId, TaskId, TaskStats, TaskStatus},
    value::StateValue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A unit of work in a swarm's queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the swarm
    pub id: TaskId,
    /// Opaque work description
    pub payload: StateValue,
    /// Current status
    pub status: TaskStatus,
    /// Agent that won the claim
    pub claimant: Option<AgentId>,
    /// Opaque result set on completion
    pub result: Option<StateValue>,
    /// Failure reason set by the claimant
    pub error: Option<String>,
    /// When the task was allocated
    pub created_at: DateTime<Utc>,
    /// When the task was claimed
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// On-chain settlement of a completed result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<Settlement>,
}

/// Settlement progress of a completed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Settlement {
    /// Transaction is being sent
    Settling { started_at: DateTime<Utc> },
    /// Transaction accepted by the chain client
    Settled {
        tx_hash: String,
        settled_at: DateTime<Utc>,
    },
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Settling { .. } => "SETTLING",
            Settlement::Settled { .. } => "SETTLED",
        }
    }

    pub fn tx_hash(&self) -> Option<&str> {
        match self {
            Settlement::Settled { tx_hash, .. } => Some(tx_hash),
            Settlement::Settling { .. } => None,
        }
    }
}

impl Task {
    fn new(id: TaskId, payload: StateValue) -> Self {
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            claimant: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            claimed_at: None,
            finished_at: None,
            settlement: None,
        }
    }
}

/// Ordered task collection with aggregate counters
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    stats: TaskStats,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a task list, recounting stats
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        let mut queue = Self::new();
        for task in tasks {
            *queue.stats.counter_mut(task.status) += 1;
            queue.index.insert(task.id.clone(), queue.tasks.len());
            queue.tasks.push(task);
        }
        queue
    }

    /// Append a PENDING task
    ///
    /// Ids come from the swarm's sequence, so a collision is an internal fault.
    pub fn allocate(&mut self, id: TaskId, payload: StateValue) -> anyhow::Result<&Task> {
        if self.index.contains_key(&id) {
            anyhow::bail!("task id {id} already allocated");
        }
        let pos = self.tasks.len();
        self.index.insert(id.clone(), pos);
        self.tasks.push(Task::new(id, payload));
        self.stats.pending += 1;
        Ok(&self.tasks[pos])
    }

    /// PENDING -> CLAIMED; any other status loses the race
    pub fn claim(&mut self, task_id: &str, agent_id: &str) -> SwarmResult<&Task> {
        let pos = self.position(task_id)?;
        let task = &mut self.tasks[pos];
        if task.status != TaskStatus::Pending {
            return Err(SwarmError::AlreadyClaimed {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
            });
        }

        task.status = TaskStatus::Claimed;
        task.claimant = Some(agent_id.to_string());
        task.claimed_at = Some(Utc::now());
        self.stats.pending -= 1;
        self.stats.claimed += 1;
        Ok(&self.tasks[pos])
    }

    /// CLAIMED -> COMPLETED by the claimant
    pub fn complete(
        &mut self,
        task_id: &str,
        agent_id: &str,
        result: StateValue,
    ) -> SwarmResult<&Task> {
        let pos = self.finishable(task_id, agent_id, TaskStatus::Completed)?;
        let task = &mut self.tasks[pos];
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.finished_at = Some(Utc::now());
        self.stats.claimed -= 1;
        self.stats.completed += 1;
        Ok(&self.tasks[pos])
    }

    /// CLAIMED -> FAILED by the claimant
    pub fn fail(&mut self, task_id: &str, agent_id: &str, reason: String) -> SwarmResult<&Task> {
        let pos = self.finishable(task_id, agent_id, TaskStatus::Failed)?;
        let task = &mut self.tasks[pos];
        task.status = TaskStatus::Failed;
        task.error = Some(reason);
        task.finished_at = Some(Utc::now());
        self.stats.claimed -= 1;
        self.stats.failed += 1;
        Ok(&self.tasks[pos])
    }

    /// Mark a COMPLETED task as settling; only the first caller wins
    pub fn begin_settlement(&mut self, task_id: &str) -> SwarmResult<&Task> {
        let pos = self.position(task_id)?;
        let task = &mut self.tasks[pos];
        let from = match (&task.status, &task.settlement) {
            (TaskStatus::Completed, None) => None,
            (TaskStatus::Completed, Some(settlement)) => Some(settlement.as_str().to_string()),
            (status, _) => Some(status.to_string()),
        };
        if let Some(from) = from {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from,
                to: "SETTLED".to_string(),
            });
        }

        task.settlement = Some(Settlement::Settling {
            started_at: Utc::now(),
        });
        Ok(&self.tasks[pos])
    }

    /// SETTLING -> SETTLED
    pub fn finish_settlement(&mut self, task_id: &str, tx_hash: String) -> SwarmResult<&Task> {
        let pos = self.position(task_id)?;
        let task = &mut self.tasks[pos];
        if !matches!(task.settlement, Some(Settlement::Settling { .. })) {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task
                    .settlement
                    .as_ref()
                    .map_or("COMPLETED", Settlement::as_str)
                    .to_string(),
                to: "SETTLED".to_string(),
            });
        }
        task.settlement = Some(Settlement::Settled {
            tx_hash,
            settled_at: Utc::now(),
        });
        Ok(&self.tasks[pos])
    }

    /// Drop a SETTLING mark after a failed send; settled tasks are untouched
    pub fn abort_settlement(&mut self, task_id: &str) -> SwarmResult<()> {
        let pos = self.position(task_id)?;
        let task = &mut self.tasks[pos];
        if matches!(task.settlement, Some(Settlement::Settling { .. })) {
            task.settlement = None;
        }
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.index.get(task_id).map(|&pos| &self.tasks[pos])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn position(&self, task_id: &str) -> SwarmResult<usize> {
        self.index
            .get(task_id)
            .copied()
            .ok_or_else(|| SwarmError::task_not_found(task_id))
    }

    fn finishable(&self, task_id: &str, agent_id: &str, to: TaskStatus) -> SwarmResult<usize> {
        let pos = self.position(task_id)?;
        let task = &self.tasks[pos];
        if task.status != TaskStatus::Claimed {
            return Err(SwarmError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        match task.claimant.as_deref() {
            Some(claimant) if claimant == agent_id => Ok(pos),
            claimant => Err(SwarmError::ClaimantMismatch {
                task_id: task_id.to_string(),
                claimant: claimant.unwrap_or_default().to_string(),
                agent_id: agent_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(ids: &[&str]) -> TaskQueue {
        let mut queue = TaskQueue::new();
        for id in ids {
            queue.allocate(id.to_string(), StateValue::Null).unwrap();
        }
        queue
    }

    #[test]
    fn test_claim_lifecycle_updates_stats() {
        let mut queue = queue_with(&["t1", "t2"]);
        assert_eq!(queue.stats().pending, 2);

        queue.claim("t1", "a1").unwrap();
        queue.complete("t1", "a1", StateValue::from("done")).unwrap();
        queue.claim("t2", "a2").unwrap();
        queue.fail("t2", "a2", "venue offline".into()).unwrap();

        let stats = queue.stats();
        assert_eq!(stats, TaskStats { pending: 0, claimed: 0, completed: 1, failed: 1 });
        assert_eq!(queue.get("t2").unwrap().error.as_deref(), Some("venue offline"));
    }

    #[test]
    fn test_second_claim_loses() {
        let mut queue = queue_with(&["t1"]);
        queue.claim("t1", "a1").unwrap();
        let err = queue.claim("t1", "a2").unwrap_err();
        assert!(matches!(err, SwarmError::AlreadyClaimed { .. }));
        assert_eq!(queue.get("t1").unwrap().claimant.as_deref(), Some("a1"));
    }

    #[test]
    fn test_complete_requires_claimant() {
        let mut queue = queue_with(&["t1"]);
        let err = queue.complete("t1", "a1", StateValue::Null).unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTaskTransition { .. }));

        queue.claim("t1", "a1").unwrap();
        let err = queue.complete("t1", "a2", StateValue::Null).unwrap_err();
        assert!(matches!(err, SwarmError::ClaimantMismatch { .. }));
        assert_eq!(queue.stats().claimed, 1);
    }

    #[test]
    fn test_terminal_tasks_cannot_be_reclaimed() {
        let mut queue = queue_with(&["t1"]);
        queue.claim("t1", "a1").unwrap();
        queue.complete("t1", "a1", StateValue::Null).unwrap();
        assert!(matches!(
            queue.claim("t1", "a1"),
            Err(SwarmError::AlreadyClaimed { .. })
        ));
        assert!(matches!(
            queue.fail("t1", "a1", "late".into()),
            Err(SwarmError::InvalidTaskTransition { .. })
        ));
    }

    #[test]
    fn test_settlement_taken_once() {
        let mut queue = queue_with(&["t1", "t2"]);
        assert!(matches!(
            queue.begin_settlement("t1"),
            Err(SwarmError::InvalidTaskTransition { .. })
        ));

        queue.claim("t1", "a1").unwrap();
        queue.complete("t1", "a1", StateValue::Null).unwrap();
        queue.begin_settlement("t1").unwrap();
        let err = queue.begin_settlement("t1").unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTaskTransition { ref from, .. } if from == "SETTLING"));

        queue.finish_settlement("t1", "0xabc".into()).unwrap();
        queue.abort_settlement("t1").unwrap();
        let settled = queue.get("t1").unwrap().settlement.clone().unwrap();
        assert_eq!(settled.tx_hash(), Some("0xabc"));
        assert!(queue.begin_settlement("t1").is_err());
    }

    #[test]
    fn test_aborted_settlement_can_retry() {
        let mut queue = queue_with(&["t1"]);
        queue.claim("t1", "a1").unwrap();
        queue.complete("t1", "a1", StateValue::Null).unwrap();
        queue.begin_settlement("t1").unwrap();
        queue.abort_settlement("t1").unwrap();
        assert!(queue.get("t1").unwrap().settlement.is_none());
        assert!(queue.begin_settlement("t1").is_ok());
    }

    #[test]
    fn test_duplicate_id_is_internal_fault() {
        let mut queue = queue_with(&["t1"]);
        let err = queue.allocate("t1".into(), StateValue::Null).unwrap_err();
        assert!(err.to_string().contains("already allocated"));
    }

    #[test]
    fn test_unknown_task() {
        let mut queue = TaskQueue::new();
        assert!(matches!(
            queue.claim("t9", "a1"),
            Err(SwarmError::NotFound { kind: "Task", .. })
        ));
    }

    #[test]
    fn test_from_tasks_recounts() {
        let mut queue = queue_with(&["t1", "t2", "t3"]);
        queue.claim("t2", "a1").unwrap();
        let rebuilt = TaskQueue::from_tasks(queue.tasks().to_vec());
        assert_eq!(rebuilt.stats(), queue.stats());
        assert_eq!(rebuilt.get("t2").unwrap().status, TaskStatus::Claimed);
    }
}
