//! Per-swarm shared state store

use crate::{types::AgentId, value::StateValue};
use std::collections::BTreeMap;

/// Reserved key holding the current leader id
pub const LEADER_KEY: &str = "leader_id";

/// Key to value map shared by the members of one swarm
///
/// Last writer wins per key. There are no cross-key transactions; callers
/// that need atomic multi-key updates keep the data under one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedState {
    entries: BTreeMap<String, StateValue>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    /// Replace the value for `key`, returning the previous one
    pub fn set(&mut self, key: impl Into<String>, value: StateValue) -> Option<StateValue> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current leader, if the slot holds an id
    pub fn leader(&self) -> Option<&str> {
        self.entries.get(LEADER_KEY).and_then(StateValue::as_str)
    }

    pub(crate) fn set_leader(&mut self, agent_id: &AgentId) {
        self.entries
            .insert(LEADER_KEY.to_string(), StateValue::String(agent_id.clone()));
    }

    /// Null out the leader slot, returning the previous leader
    pub(crate) fn clear_leader(&mut self) -> Option<AgentId> {
        let previous = self.leader().map(str::to_string);
        if previous.is_some() {
            self.entries.insert(LEADER_KEY.to_string(), StateValue::Null);
        }
        previous
    }

    pub fn entries(&self) -> &BTreeMap<String, StateValue> {
        &self.entries
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, StateValue>) -> Self {
        Self { entries }
    }
}
