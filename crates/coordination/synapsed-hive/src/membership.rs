//! Ordered member set of a swarm

use crate::types::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A member and when it joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Agent id
    pub agent_id: AgentId,
    /// Wall-clock join time
    pub joined_at: DateTime<Utc>,
    /// Monotonic join sequence within the swarm
    pub join_seq: u64,
}

/// Members in join order, no duplicates
///
/// `version` increases on every change so derived views such as routing
/// tables can tell when they are stale.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    members: Vec<Member>,
    next_seq: u64,
    version: u64,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from an ordered id list, keeping the order as join order
    pub fn from_ids(ids: &[AgentId]) -> Self {
        let mut membership = Self::new();
        for id in ids {
            membership.insert(id.clone());
        }
        membership
    }

    /// Insert if absent; returns false when already present
    pub fn insert(&mut self, agent_id: AgentId) -> bool {
        if self.contains(&agent_id) {
            return false;
        }
        self.members.push(Member {
            agent_id,
            joined_at: Utc::now(),
            join_seq: self.next_seq,
        });
        self.next_seq += 1;
        self.version += 1;
        true
    }

    /// Remove if present
    pub fn remove(&mut self, agent_id: &str) -> Option<Member> {
        let pos = self.members.iter().position(|m| m.agent_id == agent_id)?;
        self.version += 1;
        Some(self.members.remove(pos))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.members.iter().any(|m| m.agent_id == agent_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Member ids in join order
    pub fn ids(&self) -> Vec<AgentId> {
        self.members.iter().map(|m| m.agent_id.clone()).collect()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the member list, bumping the version past both histories
    pub(crate) fn replace_with(&mut self, other: Membership) {
        let version = self.version.max(other.version) + 1;
        *self = other;
        self.version = version;
    }
}
