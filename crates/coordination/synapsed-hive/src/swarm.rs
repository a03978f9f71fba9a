//! The swarm aggregate
//!
//! A [`Swarm`] owns its membership, shared state and task queue behind a
//! single `RwLock`. Every mutation takes the write lock for the whole
//! check-then-write step, so readers only ever see complete transitions.
//! Nothing is awaited while the lock is held except the lock itself.
//!
//! A running swarm also owns a background execution loop driven by a
//! ticker and a `watch` stop signal.

use crate::{
    config::{DuplicateMemberPolicy, LeaderReelection, SwarmConfig},
    election::ElectionPolicy,
    error::{SwarmContext, SwarmError, SwarmResult},
    membership::{Member, Membership},
    security::SecurityContext,
    state::{SharedState, LEADER_KEY},
    tasks::{Task, TaskQueue},
    telemetry::names,
    types::{AgentId, SwarmEvent, SwarmId, SwarmMetrics, SwarmStatus, TaskId},
    value::StateValue,
};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch, RwLock},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Capacity of the live event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Serializable view of the recoverable parts of a swarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSnapshot {
    /// Member ids in join order
    pub members: Vec<AgentId>,
    /// Shared state entries
    pub shared_state: BTreeMap<String, StateValue>,
    /// Tasks in queue order
    pub task_queue: Vec<Task>,
}

/// Liveness of the background execution loop
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    /// Ticks completed since creation
    pub ticks: u64,
    /// Time of the most recent tick
    pub last_tick: Option<Instant>,
    /// Whether the loop task is still alive
    pub loop_active: bool,
}

/// Failures inside a sliding window
#[derive(Debug, Default)]
struct FailureWindow {
    recent: VecDeque<Instant>,
    total: u64,
}

impl FailureWindow {
    fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.prune(now, window);
        self.recent.push_back(now);
        self.total += 1;
        self.recent.len()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset(&mut self) {
        self.recent.clear();
    }
}

/// Mutable state guarded by the per-swarm lock
#[derive(Debug)]
struct SwarmState {
    status: SwarmStatus,
    membership: Membership,
    shared_state: SharedState,
    tasks: TaskQueue,
    next_task_seq: u64,
    failures: FailureWindow,
    last_checkpoint_at: Option<DateTime<Utc>>,
}

struct ExecutionHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// A named collection of cooperating agents
pub struct Swarm {
    id: SwarmId,
    config: SwarmConfig,
    created_at: DateTime<Utc>,
    election: Arc<dyn ElectionPolicy>,
    state: RwLock<SwarmState>,
    security: RwLock<Option<SecurityContext>>,
    checkpoint_guard: tokio::sync::Mutex<()>,
    execution: Mutex<Option<ExecutionHandle>>,
    ticks: AtomicU64,
    last_tick: Mutex<Option<Instant>>,
    checkpoints_taken: AtomicU64,
    history: Mutex<VecDeque<SwarmEvent>>,
    events: broadcast::Sender<SwarmEvent>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("election", &self.election.name())
            .finish_non_exhaustive()
    }
}

impl Swarm {
    pub(crate) fn new(id: SwarmId, config: SwarmConfig, election: Arc<dyn ElectionPolicy>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let swarm = Self {
            id,
            config,
            created_at: Utc::now(),
            election,
            state: RwLock::new(SwarmState {
                status: SwarmStatus::Created,
                membership: Membership::new(),
                shared_state: SharedState::new(),
                tasks: TaskQueue::new(),
                next_task_seq: 1,
                failures: FailureWindow::default(),
                last_checkpoint_at: None,
            }),
            security: RwLock::new(None),
            checkpoint_guard: tokio::sync::Mutex::new(()),
            execution: Mutex::new(None),
            ticks: AtomicU64::new(0),
            last_tick: Mutex::new(None),
            checkpoints_taken: AtomicU64::new(0),
            history: Mutex::new(VecDeque::new()),
            events,
        };
        swarm.record_event(SwarmEvent::Created {
            name: swarm.config.name.clone(),
            timestamp: Utc::now(),
        });
        swarm
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn election_policy(&self) -> &Arc<dyn ElectionPolicy> {
        &self.election
    }

    pub async fn status(&self) -> SwarmStatus {
        self.state.read().await.status
    }

    // ---- lifecycle ----

    /// CREATED | STOPPED -> RUNNING, spawning the execution loop
    pub async fn start(self: &Arc<Self>) -> SwarmResult<()> {
        let mut state = self.state.write().await;
        match state.status {
            SwarmStatus::Created | SwarmStatus::Stopped => {}
            status => return Err(self.invalid_state(status, "start")),
        }
        state.status = SwarmStatus::Running;
        self.spawn_execution_loop();
        drop(state);

        self.record_event(SwarmEvent::Started { timestamp: Utc::now() });
        info!("Swarm {} started", self.id);
        Ok(())
    }

    /// RUNNING -> STOPPED; returns false when already stopped
    pub async fn stop(&self) -> SwarmResult<bool> {
        let handle = {
            let mut state = self.state.write().await;
            match state.status {
                SwarmStatus::Running => {}
                SwarmStatus::Stopped => return Ok(false),
                status => return Err(self.invalid_state(status, "stop")),
            }
            state.status = SwarmStatus::Stopped;
            self.execution.lock().take()
        };

        halt_execution(&self.id, handle).await;
        self.record_event(SwarmEvent::Stopped { timestamp: Utc::now() });
        info!("Swarm {} stopped", self.id);
        Ok(true)
    }

    fn spawn_execution_loop(self: &Arc<Self>) {
        let mut slot = self.execution.lock();
        if slot.as_ref().is_some_and(|h| !h.join.is_finished()) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_execution_loop(
            Arc::downgrade(self),
            stop_rx,
            self.config.tick_interval(),
        ));
        *slot = Some(ExecutionHandle { stop_tx, join });
    }

    /// One coordination tick of the execution loop
    async fn coordination_tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_tick.lock() = Some(Instant::now());

        if self.config.reelection != LeaderReelection::OnTick {
            return;
        }
        {
            let state = self.state.read().await;
            if state.status != SwarmStatus::Running
                || state.membership.is_empty()
                || state.shared_state.leader().is_some()
            {
                return;
            }
        }

        let mut state = self.state.write().await;
        if state.status == SwarmStatus::Running && state.shared_state.leader().is_none() {
            if let Some(leader) = self.elect_locked(&mut state) {
                debug!("Swarm {} re-elected {} on tick {}", self.id, leader, tick);
            }
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let loop_active = self
            .execution
            .lock()
            .as_ref()
            .is_some_and(|h| !h.join.is_finished());
        Heartbeat {
            ticks: self.ticks.load(Ordering::SeqCst),
            last_tick: *self.last_tick.lock(),
            loop_active,
        }
    }

    // ---- membership ----

    /// Insert an agent; returns false when an ignored duplicate
    pub async fn add_member(&self, agent_id: AgentId) -> SwarmResult<bool> {
        let mut state = self.state.write().await;
        if state.membership.contains(&agent_id) {
            return match self.config.duplicate_policy {
                DuplicateMemberPolicy::Reject => Err(SwarmError::DuplicateMember {
                    swarm_id: self.id.clone(),
                    agent_id,
                }),
                DuplicateMemberPolicy::Ignore => Ok(false),
            };
        }
        if state.membership.len() >= self.config.max_agents {
            return Err(SwarmError::SwarmSizeLimitExceeded {
                current: state.membership.len(),
                max: self.config.max_agents,
            });
        }

        state.membership.insert(agent_id.clone());
        let count = state.membership.len();
        drop(state);

        gauge!(names::SWARM_MEMBERS, "swarm" => self.id.clone()).set(count as f64);
        info!("Agent {} joined swarm {}", agent_id, self.id);
        self.record_event(SwarmEvent::AgentJoined { agent_id, timestamp: Utc::now() });
        Ok(true)
    }

    /// Remove an agent, clearing the leader slot if it held it
    pub async fn remove_member(&self, agent_id: &str) -> SwarmResult<()> {
        let mut state = self.state.write().await;
        if state.membership.remove(agent_id).is_none() {
            return Err(SwarmError::agent_not_found(agent_id));
        }
        let cleared = if state.shared_state.leader() == Some(agent_id) {
            state.shared_state.clear_leader()
        } else {
            None
        };
        let count = state.membership.len();
        drop(state);

        gauge!(names::SWARM_MEMBERS, "swarm" => self.id.clone()).set(count as f64);
        info!("Agent {} left swarm {}", agent_id, self.id);
        self.record_event(SwarmEvent::AgentLeft {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        if let Some(previous) = cleared {
            info!("Leader {} of swarm {} removed, leader slot cleared", previous, self.id);
            self.record_event(SwarmEvent::LeaderCleared { previous, timestamp: Utc::now() });
        }
        Ok(())
    }

    pub async fn members(&self) -> Vec<Member> {
        self.state.read().await.membership.members().to_vec()
    }

    pub async fn is_member(&self, agent_id: &str) -> bool {
        self.state.read().await.membership.contains(agent_id)
    }

    /// Member ids with the membership version they were read at
    pub async fn membership_view(&self) -> (Vec<AgentId>, u64) {
        let state = self.state.read().await;
        (state.membership.ids(), state.membership.version())
    }

    // ---- shared state ----

    /// Replace the value for `key`
    ///
    /// `leader_id` only accepts null or a current member id.
    pub async fn set_shared(&self, key: &str, value: StateValue) -> SwarmResult<()> {
        value.ensure_finite(key)?;
        let mut state = self.state.write().await;
        if key == LEADER_KEY {
            match &value {
                StateValue::Null => {}
                StateValue::String(id) if state.membership.contains(id) => {}
                StateValue::String(id) => return Err(SwarmError::agent_not_found(id.as_str())),
                other => {
                    return Err(SwarmError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("expected null or an agent id, got {}", other.kind()),
                    })
                }
            }
        }
        state.shared_state.set(key, value);
        drop(state);

        debug!("Swarm {} shared state key {} updated", self.id, key);
        self.record_event(SwarmEvent::SharedStateUpdated {
            key: key.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn get_shared(&self, key: &str) -> Option<StateValue> {
        self.state.read().await.shared_state.get(key).cloned()
    }

    pub async fn shared_keys(&self) -> Vec<String> {
        self.state.read().await.shared_state.keys()
    }

    pub async fn leader(&self) -> Option<AgentId> {
        self.state
            .read()
            .await
            .shared_state
            .leader()
            .map(str::to_string)
    }

    // ---- election ----

    /// Select a leader with the swarm's policy and record it
    pub async fn elect_leader(&self) -> SwarmResult<AgentId> {
        let mut state = self.state.write().await;
        self.elect_locked(&mut state)
            .ok_or_else(|| SwarmError::EmptySwarm(self.id.clone()))
    }

    fn elect_locked(&self, state: &mut SwarmState) -> Option<AgentId> {
        let leader = self.election.select(state.membership.members())?;
        state.shared_state.set_leader(&leader);
        info!(
            "Swarm {} elected leader {} using {}",
            self.id,
            leader,
            self.election.name()
        );
        self.record_event(SwarmEvent::LeaderElected {
            agent_id: leader.clone(),
            policy: self.election.name().to_string(),
            timestamp: Utc::now(),
        });
        Some(leader)
    }

    // ---- tasks ----

    /// Append a PENDING task with the next sequential id
    pub async fn allocate_task(&self, payload: StateValue) -> SwarmResult<Task> {
        payload.ensure_finite("payload")?;
        let mut state = self.state.write().await;
        if state.status == SwarmStatus::Failed {
            return Err(self.invalid_state(state.status, "allocate tasks"));
        }
        let id: TaskId = format!("t{}", state.next_task_seq);
        let task = state
            .tasks
            .allocate(id, payload)
            .swarm_context(&self.id)?
            .clone();
        state.next_task_seq += 1;
        drop(state);

        debug!("Swarm {} allocated task {}", self.id, task.id);
        self.record_event(SwarmEvent::TaskAllocated {
            task_id: task.id.clone(),
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// PENDING -> CLAIMED; exactly one concurrent caller wins
    pub async fn claim_task(&self, task_id: &str, agent_id: &str) -> SwarmResult<Task> {
        let mut state = self.state.write().await;
        if state.status == SwarmStatus::Failed {
            return Err(self.invalid_state(state.status, "claim tasks"));
        }
        if !state.membership.contains(agent_id) {
            return Err(SwarmError::agent_not_found(agent_id));
        }
        let task = match state.tasks.claim(task_id, agent_id) {
            Ok(task) => task.clone(),
            Err(e) => {
                if matches!(e, SwarmError::AlreadyClaimed { .. }) {
                    counter!(names::CLAIM_CONFLICTS, "swarm" => self.id.clone()).increment(1);
                }
                return Err(e);
            }
        };
        drop(state);

        counter!(names::TASKS_CLAIMED, "swarm" => self.id.clone()).increment(1);
        debug!("Task {} claimed by {} in swarm {}", task_id, agent_id, self.id);
        self.record_event(SwarmEvent::TaskClaimed {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// CLAIMED -> COMPLETED by the recorded claimant
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: StateValue,
    ) -> SwarmResult<Task> {
        result.ensure_finite("result")?;
        let task = self
            .state
            .write()
            .await
            .tasks
            .complete(task_id, agent_id, result)?
            .clone();

        info!("Task {} completed by {} in swarm {}", task_id, agent_id, self.id);
        self.record_event(SwarmEvent::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// CLAIMED -> FAILED by the recorded claimant
    pub async fn fail_task(&self, task_id: &str, agent_id: &str, reason: &str) -> SwarmResult<Task> {
        let task = self
            .state
            .write()
            .await
            .tasks
            .fail(task_id, agent_id, reason.to_string())?
            .clone();

        warn!("Task {} failed by {} in swarm {}: {}", task_id, agent_id, self.id, reason);
        self.record_event(SwarmEvent::TaskFailed {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(task)
    }

    /// Take the settlement mark of a COMPLETED task
    pub async fn begin_settlement(&self, task_id: &str) -> SwarmResult<Task> {
        Ok(self
            .state
            .write()
            .await
            .tasks
            .begin_settlement(task_id)?
            .clone())
    }

    pub async fn finish_settlement(&self, task_id: &str, tx_hash: String) -> SwarmResult<Task> {
        Ok(self
            .state
            .write()
            .await
            .tasks
            .finish_settlement(task_id, tx_hash)?
            .clone())
    }

    pub async fn abort_settlement(&self, task_id: &str) -> SwarmResult<()> {
        self.state.write().await.tasks.abort_settlement(task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> SwarmResult<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| SwarmError::task_not_found(task_id))
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.state.read().await.tasks.tasks().to_vec()
    }

    // ---- metrics and events ----

    pub async fn metrics(&self) -> SwarmMetrics {
        let state = self.state.read().await;
        SwarmMetrics {
            swarm_id: self.id.clone(),
            status: state.status,
            member_count: state.membership.len(),
            leader_id: state.shared_state.leader().map(str::to_string),
            task_stats: state.tasks.stats(),
            failures_in_window: state.failures.recent.len(),
            total_failures: state.failures.total,
            checkpoints_taken: self.checkpoints_taken.load(Ordering::SeqCst),
            last_checkpoint_at: state.last_checkpoint_at,
            coordination_ticks: self.ticks.load(Ordering::SeqCst),
            events_recorded: self.history.lock().len(),
            created_at: self.created_at,
        }
    }

    /// Live event feed
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Recorded history, oldest first
    pub fn events(&self) -> Vec<SwarmEvent> {
        self.history.lock().iter().cloned().collect()
    }

    pub(crate) fn record_event(&self, event: SwarmEvent) {
        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.config.max_events {
                history.pop_front();
            }
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ---- fault tolerance hooks ----

    /// Consistent copy of the recoverable state
    pub async fn snapshot(&self) -> SwarmSnapshot {
        let state = self.state.read().await;
        SwarmSnapshot {
            members: state.membership.ids(),
            shared_state: state.shared_state.entries().clone(),
            task_queue: state.tasks.tasks().to_vec(),
        }
    }

    pub(crate) fn checkpoint_guard(&self) -> &tokio::sync::Mutex<()> {
        &self.checkpoint_guard
    }

    pub(crate) async fn mark_checkpointed(&self, at: DateTime<Utc>) {
        self.checkpoints_taken.fetch_add(1, Ordering::SeqCst);
        self.state.write().await.last_checkpoint_at = Some(at);
    }

    /// Count a failure; escalates RUNNING -> FAILED past `max_failures`
    pub(crate) async fn register_failure(
        &self,
        reason: &str,
        window: Duration,
        max_failures: u32,
    ) -> SwarmStatus {
        let (count, status, handle) = {
            let mut state = self.state.write().await;
            let count = state.failures.record(Instant::now(), window);
            let mut handle = None;
            if count > max_failures as usize && state.status == SwarmStatus::Running {
                state.status = SwarmStatus::Failed;
                handle = self.execution.lock().take();
            }
            (count, state.status, handle)
        };

        counter!(names::FAILURES, "swarm" => self.id.clone()).increment(1);
        warn!(
            "Swarm {} failure {}/{} in window: {}",
            self.id, count, max_failures, reason
        );
        self.record_event(SwarmEvent::FailureRecorded {
            reason: reason.to_string(),
            failures_in_window: count,
            timestamp: Utc::now(),
        });

        if handle.is_some() {
            halt_execution(&self.id, handle).await;
            warn!("Swarm {} escalated to FAILED after {} failures", self.id, count);
            self.record_event(SwarmEvent::Failed {
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        status
    }

    /// Replace members, shared state and tasks, reset failures and run again
    pub(crate) async fn restore(self: &Arc<Self>, snapshot: SwarmSnapshot, artifact_id: &str) {
        let mut state = self.state.write().await;

        state.membership.replace_with(Membership::from_ids(&snapshot.members));
        state.shared_state = SharedState::from_entries(snapshot.shared_state);
        let stale_leader = state
            .shared_state
            .leader()
            .is_some_and(|leader| !state.membership.contains(leader));
        if stale_leader {
            state.shared_state.clear_leader();
        }

        let highest = snapshot
            .task_queue
            .iter()
            .filter_map(|t| t.id.strip_prefix('t').and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0);
        state.next_task_seq = state.next_task_seq.max(highest + 1);
        state.tasks = TaskQueue::from_tasks(snapshot.task_queue);
        state.failures.reset();
        state.status = SwarmStatus::Running;
        self.spawn_execution_loop();
        let count = state.membership.len();
        drop(state);

        gauge!(names::SWARM_MEMBERS, "swarm" => self.id.clone()).set(count as f64);
        self.record_event(SwarmEvent::Recovered {
            artifact_id: artifact_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    // ---- security hook ----

    pub(crate) fn security(&self) -> &RwLock<Option<SecurityContext>> {
        &self.security
    }

    fn invalid_state(&self, status: SwarmStatus, operation: &'static str) -> SwarmError {
        SwarmError::InvalidState {
            swarm_id: self.id.clone(),
            status: status.to_string(),
            operation,
        }
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        if let Some(handle) = self.execution.get_mut().take() {
            let _ = handle.stop_tx.send(true);
        }
    }
}

/// Signal the loop to stop and wait for it to finish its current tick
async fn halt_execution(swarm_id: &str, handle: Option<ExecutionHandle>) {
    let Some(handle) = handle else {
        return;
    };
    let _ = handle.stop_tx.send(true);
    if let Err(e) = handle.join.await {
        warn!("Execution loop of swarm {} ended abnormally: {}", swarm_id, e);
    }
}

async fn run_execution_loop(
    swarm: Weak<Swarm>,
    mut stop_rx: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(swarm) = swarm.upgrade() else {
                    break;
                };
                swarm.coordination_tick().await;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}
