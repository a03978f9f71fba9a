//! Pluggable leader election
//!
//! A policy picks one member deterministically from the current member
//! list. The swarm writes the result to the `leader_id` shared-state key.

use crate::{membership::Member, types::AgentId};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc};

/// Deterministic leader selection rule
pub trait ElectionPolicy: Send + Sync + Debug {
    /// Policy name recorded in election events
    fn name(&self) -> &str;

    /// Pick a leader, `None` only for an empty member list
    fn select(&self, members: &[Member]) -> Option<AgentId>;
}

/// Lexicographically smallest agent id
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestIdPolicy;

impl ElectionPolicy for LowestIdPolicy {
    fn name(&self) -> &str {
        "lowest_id"
    }

    fn select(&self, members: &[Member]) -> Option<AgentId> {
        members
            .iter()
            .map(|m| &m.agent_id)
            .min()
            .cloned()
    }
}

/// Longest-standing member, ties broken by lowest id
#[derive(Debug, Clone, Copy, Default)]
pub struct EarliestJoinPolicy;

impl ElectionPolicy for EarliestJoinPolicy {
    fn name(&self) -> &str {
        "earliest_join"
    }

    fn select(&self, members: &[Member]) -> Option<AgentId> {
        members
            .iter()
            .min_by(|a, b| {
                a.join_seq
                    .cmp(&b.join_seq)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            })
            .map(|m| m.agent_id.clone())
    }
}

/// Built-in policies selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStrategy {
    #[default]
    LowestId,
    EarliestJoin,
}

impl ElectionStrategy {
    pub fn policy(&self) -> Arc<dyn ElectionPolicy> {
        match self {
            ElectionStrategy::LowestId => Arc::new(LowestIdPolicy),
            ElectionStrategy::EarliestJoin => Arc::new(EarliestJoinPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member(id: &str, seq: u64) -> Member {
        Member {
            agent_id: id.to_string(),
            joined_at: Utc::now(),
            join_seq: seq,
        }
    }

    #[test]
    fn test_lowest_id() {
        let members = vec![member("b", 0), member("a", 1), member("c", 2)];
        assert_eq!(LowestIdPolicy.select(&members), Some("a".to_string()));
    }

    #[test]
    fn test_earliest_join_with_tie_break() {
        let members = vec![member("b", 0), member("a", 1)];
        assert_eq!(EarliestJoinPolicy.select(&members), Some("b".to_string()));

        // restored snapshots may reuse sequence numbers
        let members = vec![member("z", 3), member("m", 3)];
        assert_eq!(EarliestJoinPolicy.select(&members), Some("m".to_string()));
    }

    #[test]
    fn test_empty_members() {
        assert_eq!(LowestIdPolicy.select(&[]), None);
        assert_eq!(ElectionStrategy::EarliestJoin.policy().select(&[]), None);
    }
}
