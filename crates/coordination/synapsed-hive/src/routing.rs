//! Topology-aware message routing
//!
//! A [`RoutingTable`] is derived from a [`Topology`] and the swarm's member
//! order. For `Hierarchical { levels, branching_factor }` members are laid
//! out as a complete k-ary tree in join order:
//!
//! ```text
//!             m0                level 0
//!        /    |    \
//!      m1     m2    m3          level 1   (branching_factor = 3)
//!     / | \  / | \  / | \
//!    m4 ...                     level 2
//! ```
//!
//! Members that do not fit in `levels` levels are kept as `unrouted`; they
//! receive broadcasts and direct messages but have no tree position.
//!
//! Delivery fans out to every next hop concurrently, each under its own
//! timeout. A failed branch is reported, never retried, and does not hold
//! up the others.

use crate::{
    config::RoutingConfig,
    crypto::MessageEnvelope,
    error::{SwarmError, SwarmResult},
    registry::SwarmRegistry,
    security::SecurityManager,
    swarm::Swarm,
    telemetry::names,
    types::{AgentId, SwarmEvent, SwarmId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routing descriptor for a swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    /// Complete k-ary tree over member order
    Hierarchical { levels: u32, branching_factor: u32 },
    /// First member is the hub, everyone else a spoke
    Star,
    /// Each member links to its predecessor and successor
    Ring,
    /// Every member links to every other member
    Mesh,
}

impl Default for Topology {
    fn default() -> Self {
        Topology::Hierarchical {
            levels: 3,
            branching_factor: 3,
        }
    }
}

impl Topology {
    pub fn hierarchical(levels: u32, branching_factor: u32) -> Self {
        Topology::Hierarchical { levels, branching_factor }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Topology::Hierarchical { .. } => "hierarchical",
            Topology::Star => "star",
            Topology::Ring => "ring",
            Topology::Mesh => "mesh",
        }
    }

    pub fn validate(&self) -> SwarmResult<()> {
        if let Topology::Hierarchical { levels, branching_factor } = self {
            if *levels == 0 {
                return Err(SwarmError::Configuration("hierarchical levels must be at least 1".into()));
            }
            if *branching_factor == 0 {
                return Err(SwarmError::Configuration(
                    "hierarchical branching_factor must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// Members a hierarchical layout can place, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        let Topology::Hierarchical { levels, branching_factor } = *self else {
            return None;
        };
        let mut total: usize = 0;
        let mut width: usize = 1;
        for _ in 0..levels {
            total = total.saturating_add(width);
            width = width.saturating_mul(branching_factor as usize);
        }
        Some(total)
    }
}

impl FromStr for Topology {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hierarchical" => Ok(Topology::default()),
            "star" => Ok(Topology::Star),
            "ring" => Ok(Topology::Ring),
            "mesh" => Ok(Topology::Mesh),
            other => Err(SwarmError::Configuration(format!("unknown topology: {other}"))),
        }
    }
}

/// Direction of a message relative to the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Direct children only
    Down,
    /// Parent only
    Up,
    /// Other children of the same parent
    Siblings,
    /// Every other member
    Broadcast,
    /// A single named member
    Direct(AgentId),
}

/// Next-hop structure derived from a topology and member order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingTable {
    topology: Topology,
    order: Vec<AgentId>,
    parents: HashMap<AgentId, AgentId>,
    children: HashMap<AgentId, Vec<AgentId>>,
    levels: HashMap<AgentId, u32>,
    unrouted: Vec<AgentId>,
    membership_version: u64,
}

impl RoutingTable {
    pub fn build(topology: Topology, members: &[AgentId], membership_version: u64) -> Self {
        let mut table = Self {
            topology,
            order: members.to_vec(),
            parents: HashMap::new(),
            children: HashMap::new(),
            levels: HashMap::new(),
            unrouted: Vec::new(),
            membership_version,
        };

        match topology {
            Topology::Hierarchical { branching_factor, .. } => {
                let placed = topology.capacity().unwrap_or(usize::MAX).min(members.len());
                let k = branching_factor as usize;
                for (i, agent) in members.iter().enumerate().take(placed) {
                    if i == 0 {
                        table.levels.insert(agent.clone(), 0);
                        continue;
                    }
                    let parent = &members[(i - 1) / k];
                    let level = table.levels.get(parent).copied().unwrap_or(0) + 1;
                    table.link(parent, agent, level);
                }
                table.unrouted = members[placed..].to_vec();
            }
            Topology::Star => {
                if let Some((hub, spokes)) = members.split_first() {
                    table.levels.insert(hub.clone(), 0);
                    for spoke in spokes {
                        table.link(hub, spoke, 1);
                    }
                }
            }
            Topology::Ring | Topology::Mesh => {
                for agent in members {
                    table.levels.insert(agent.clone(), 0);
                }
            }
        }
        table
    }

    fn link(&mut self, parent: &AgentId, child: &AgentId, level: u32) {
        self.parents.insert(child.clone(), parent.clone());
        self.children
            .entry(parent.clone())
            .or_default()
            .push(child.clone());
        self.levels.insert(child.clone(), level);
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn membership_version(&self) -> u64 {
        self.membership_version
    }

    pub fn parent(&self, agent_id: &str) -> Option<&AgentId> {
        self.parents.get(agent_id)
    }

    pub fn children(&self, agent_id: &str) -> &[AgentId] {
        self.children.get(agent_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn level(&self, agent_id: &str) -> Option<u32> {
        self.levels.get(agent_id).copied()
    }

    /// Members beyond the hierarchical capacity
    pub fn unrouted(&self) -> &[AgentId] {
        &self.unrouted
    }

    /// Recipients of a message sent by `from` along `route`
    pub fn next_hops(&self, from: &str, route: &Route) -> SwarmResult<Vec<AgentId>> {
        let Some(pos) = self.order.iter().position(|a| a == from) else {
            return Err(SwarmError::agent_not_found(from));
        };
        let others = || -> Vec<AgentId> {
            self.order.iter().filter(|a| *a != from).cloned().collect()
        };

        let hops = match route {
            Route::Broadcast => others(),
            Route::Direct(to) => {
                if !self.order.contains(to) {
                    return Err(SwarmError::agent_not_found(to.as_str()));
                }
                vec![to.clone()]
            }
            Route::Down => match self.topology {
                Topology::Mesh => others(),
                Topology::Ring => self.ring_neighbour(pos, 1).into_iter().collect(),
                _ => self.children(from).to_vec(),
            },
            Route::Up => match self.topology {
                Topology::Mesh => Vec::new(),
                Topology::Ring => self.ring_neighbour(pos, self.order.len() - 1).into_iter().collect(),
                _ => self.parent(from).cloned().into_iter().collect(),
            },
            Route::Siblings => match self.topology {
                Topology::Mesh => others(),
                Topology::Ring => {
                    let mut seen = HashSet::new();
                    [self.ring_neighbour(pos, self.order.len() - 1), self.ring_neighbour(pos, 1)]
                        .into_iter()
                        .flatten()
                        .filter(|a| seen.insert(a.clone()))
                        .collect()
                }
                _ => match self.parent(from) {
                    Some(parent) => self
                        .children(parent)
                        .iter()
                        .filter(|a| *a != from)
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                },
            },
        };
        Ok(hops)
    }

    fn ring_neighbour(&self, pos: usize, offset: usize) -> Option<AgentId> {
        let n = self.order.len();
        if n < 2 {
            return None;
        }
        Some(self.order[(pos + offset) % n].clone())
    }
}

/// A message in flight to one next hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub id: Uuid,
    pub swarm_id: SwarmId,
    pub from: AgentId,
    pub route: Route,
    pub envelope: MessageEnvelope,
    pub sent_at: DateTime<Utc>,
}

/// Delivery of routed messages to agents
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn deliver(&self, to: &AgentId, message: RoutedMessage) -> SwarmResult<()>;
}

/// In-process mailboxes keyed by swarm and agent
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    mailboxes: DashMap<(SwarmId, AgentId), Vec<RoutedMessage>>,
    unreachable: DashMap<AgentId, ()>,
    delays: DashMap<AgentId, Duration>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain an agent's mailbox
    pub fn take(&self, swarm_id: &str, agent_id: &str) -> Vec<RoutedMessage> {
        self.mailboxes
            .remove(&(swarm_id.to_string(), agent_id.to_string()))
            .map(|(_, messages)| messages)
            .unwrap_or_default()
    }

    pub fn pending(&self, swarm_id: &str, agent_id: &str) -> usize {
        self.mailboxes
            .get(&(swarm_id.to_string(), agent_id.to_string()))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Make deliveries to an agent fail
    pub fn set_unreachable(&self, agent_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(agent_id.to_string(), ());
        } else {
            self.unreachable.remove(agent_id);
        }
    }

    /// Delay deliveries to an agent
    pub fn set_delay(&self, agent_id: &str, delay: Duration) {
        self.delays.insert(agent_id.to_string(), delay);
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn deliver(&self, to: &AgentId, message: RoutedMessage) -> SwarmResult<()> {
        let delay = self.delays.get(to).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains_key(to) {
            return Err(SwarmError::Communication(format!("agent {to} unreachable")));
        }
        self.mailboxes
            .entry((message.swarm_id.clone(), to.clone()))
            .or_default()
            .push(message);
        Ok(())
    }
}

/// Per-hop outcome of a send
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    pub route: Route,
    /// Hops the message was addressed to
    pub next_hops: Vec<AgentId>,
    pub delivered: Vec<AgentId>,
    /// Hops that failed, with the reason
    pub failed: Vec<(AgentId, String)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Topology-aware delivery over current membership
pub struct CommunicationRouter {
    registry: Arc<SwarmRegistry>,
    transport: Arc<dyn MessageTransport>,
    security: Option<Arc<SecurityManager>>,
    patterns: DashMap<SwarmId, RoutingTable>,
    config: RoutingConfig,
}

impl CommunicationRouter {
    pub fn new(
        registry: Arc<SwarmRegistry>,
        transport: Arc<dyn MessageTransport>,
        config: RoutingConfig,
    ) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            transport,
            security: None,
            patterns: DashMap::new(),
            config,
        })
    }

    /// Refuse plaintext envelopes where a swarm requires encryption
    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    /// Compute and store a routing table for `topology` over current membership
    pub async fn setup_communication_pattern(
        &self,
        swarm_id: &str,
        topology: Topology,
    ) -> SwarmResult<RoutingTable> {
        topology.validate()?;
        let swarm = self.registry.get_swarm(swarm_id)?;
        let (members, version) = swarm.membership_view().await;
        let table = RoutingTable::build(topology, &members, version);

        if !table.unrouted().is_empty() {
            warn!(
                "Swarm {}: {} members exceed {} capacity and are unrouted",
                swarm_id,
                table.unrouted().len(),
                topology.name()
            );
        }
        info!(
            "Communication pattern {} set up for swarm {} over {} members",
            topology.name(),
            swarm_id,
            members.len()
        );
        self.patterns.insert(swarm_id.to_string(), table.clone());
        Ok(table)
    }

    /// Stored routing table, if a pattern was set up or used
    pub fn routing_table(&self, swarm_id: &str) -> Option<RoutingTable> {
        self.patterns.get(swarm_id).map(|t| t.clone())
    }

    pub fn remove_pattern(&self, swarm_id: &str) -> bool {
        self.patterns.remove(swarm_id).is_some()
    }

    /// Deliver `envelope` from `from` to the next hops of `route`
    pub async fn send_message(
        &self,
        swarm_id: &str,
        from: &str,
        envelope: MessageEnvelope,
        route: Route,
    ) -> SwarmResult<DeliveryReport> {
        let swarm = self.registry.get_swarm(swarm_id)?;
        if let Some(security) = &self.security {
            security.check_envelope(&swarm, &envelope).await?;
        }

        let table = self.current_table(&swarm).await;
        let next_hops = table.next_hops(from, &route)?;

        let message = RoutedMessage {
            id: Uuid::new_v4(),
            swarm_id: swarm_id.to_string(),
            from: from.to_string(),
            route: route.clone(),
            envelope,
            sent_at: Utc::now(),
        };

        let per_hop = self.config.delivery_timeout();
        let outcomes = join_all(next_hops.iter().map(|to| {
            let message = message.clone();
            async move {
                let outcome = match timeout(per_hop, self.transport.deliver(to, message)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("delivery timed out after {}ms", per_hop.as_millis())),
                };
                (to.clone(), outcome)
            }
        }))
        .await;

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for (to, outcome) in outcomes {
            match outcome {
                Ok(()) => delivered.push(to),
                Err(reason) => {
                    warn!("Delivery of {} to {} in swarm {} failed: {}", message.id, to, swarm_id, reason);
                    failed.push((to, reason));
                }
            }
        }

        counter!(names::MESSAGES_DELIVERED, "swarm" => swarm_id.to_string())
            .increment(delivered.len() as u64);
        counter!(names::MESSAGES_FAILED, "swarm" => swarm_id.to_string())
            .increment(failed.len() as u64);
        debug!(
            "Message {} from {} in swarm {}: {} delivered, {} failed",
            message.id,
            from,
            swarm_id,
            delivered.len(),
            failed.len()
        );
        swarm.record_event(SwarmEvent::MessageRouted {
            from: from.to_string(),
            delivered: delivered.len(),
            failed: failed.len(),
            timestamp: Utc::now(),
        });

        Ok(DeliveryReport {
            message_id: message.id,
            route,
            next_hops,
            delivered,
            failed,
        })
    }

    /// Routing table for the current membership, rebuilt when stale
    async fn current_table(&self, swarm: &Swarm) -> RoutingTable {
        let (members, version) = swarm.membership_view().await;
        if let Some(table) = self.patterns.get(swarm.id()) {
            if table.membership_version() == version {
                return table.clone();
            }
        }

        let topology = self
            .patterns
            .get(swarm.id())
            .map(|t| t.topology())
            .unwrap_or(swarm.config().topology);
        let table = RoutingTable::build(topology, &members, version);
        debug!("Rebuilt {} routing table for swarm {} at version {}", topology.name(), swarm.id(), version);
        self.patterns.insert(swarm.id().to_string(), table.clone());
        table
    }
}
