//! Contracts for external collaborators
//!
//! The hive never implements optimization math or chain connectivity. It
//! parses requests out of task payloads and results, and drives whatever
//! [`OptimizationStrategy`] or [`ChainClient`] the caller supplies.

use crate::{
    config::TuningLimits,
    error::{SwarmError, SwarmResult},
    types::TaskId,
    value::StateValue,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload `type` that marks a parameter tuning task
pub const TUNING_TASK_TYPE: &str = "optimize";

/// Result key holding an on-chain action
pub const CHAIN_ACTION_KEY: &str = "chain_action";

const DEFAULT_POPULATION_SIZE: usize = 30;
const DEFAULT_ITERATIONS: usize = 100;

/// Population-based optimizer used to tune trading parameters
pub trait OptimizationStrategy: Send {
    fn name(&self) -> &str;

    /// Seed a population inside `bounds`, one `(low, high)` per dimension
    fn initialize(
        &mut self,
        population_size: usize,
        dimensions: usize,
        bounds: &[(f64, f64)],
    ) -> SwarmResult<()>;

    /// Advance one iteration against the objective (lower is better)
    fn update(&mut self, objective: &dyn Fn(&[f64]) -> f64) -> SwarmResult<()>;

    fn best_position(&self) -> Vec<f64>;

    fn best_fitness(&self) -> f64;

    fn convergence_history(&self) -> Vec<f64>;
}

/// Tuning parameters read from a task payload
///
/// ```text
/// { type: "optimize", population_size: 30, dimensions: 2,
///   bounds: [[-5, 5], [0, 1]], iterations: 100 }
/// ```
///
/// A single bounds pair applies to every dimension. Counts above the swarm's
/// [`TuningLimits`] are rejected before the strategy is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterTuningRequest {
    pub population_size: usize,
    pub dimensions: usize,
    pub bounds: Vec<(f64, f64)>,
    pub iterations: usize,
}

impl ParameterTuningRequest {
    /// Whether the payload asks for parameter tuning
    pub fn is_tuning_payload(payload: &StateValue) -> bool {
        payload.get("type").and_then(StateValue::as_str) == Some(TUNING_TASK_TYPE)
    }

    pub fn from_payload(payload: &StateValue, limits: &TuningLimits) -> SwarmResult<Self> {
        if !Self::is_tuning_payload(payload) {
            return Err(invalid("type", format!("expected \"{TUNING_TASK_TYPE}\"")));
        }

        let population_size = count_field(
            payload,
            "population_size",
            DEFAULT_POPULATION_SIZE.min(limits.max_population_size),
            limits.max_population_size,
        )?;
        let iterations = count_field(
            payload,
            "iterations",
            DEFAULT_ITERATIONS.min(limits.max_iterations),
            limits.max_iterations,
        )?;

        let mut bounds = payload
            .get("bounds")
            .and_then(StateValue::as_sequence)
            .ok_or_else(|| invalid("bounds", "expected a sequence of [low, high] pairs".into()))?
            .iter()
            .map(bound_pair)
            .collect::<SwarmResult<Vec<_>>>()?;

        let dimensions = match payload.get("dimensions") {
            Some(_) => count_field(payload, "dimensions", 0, limits.max_dimensions)?,
            None => bounds.len(),
        };
        if dimensions == 0 {
            return Err(invalid("dimensions", "must be at least 1".into()));
        }
        if dimensions > limits.max_dimensions {
            return Err(invalid(
                "dimensions",
                format!("{} exceeds the limit of {}", dimensions, limits.max_dimensions),
            ));
        }
        if bounds.len() == 1 && dimensions > 1 {
            bounds = vec![bounds[0]; dimensions];
        }
        if bounds.len() != dimensions {
            return Err(invalid(
                "bounds",
                format!("{} pairs given for {} dimensions", bounds.len(), dimensions),
            ));
        }

        Ok(Self {
            population_size,
            dimensions,
            bounds,
            iterations,
        })
    }

    /// Initialize the strategy and run every iteration
    pub fn run(
        &self,
        strategy: &mut dyn OptimizationStrategy,
        objective: &dyn Fn(&[f64]) -> f64,
    ) -> SwarmResult<TuningOutcome> {
        strategy.initialize(self.population_size, self.dimensions, &self.bounds)?;
        for _ in 0..self.iterations {
            strategy.update(objective)?;
        }
        Ok(TuningOutcome {
            strategy: strategy.name().to_string(),
            best_position: strategy.best_position(),
            best_fitness: strategy.best_fitness(),
            convergence_history: strategy.convergence_history(),
            iterations: self.iterations,
        })
    }
}

fn invalid(key: &str, reason: String) -> SwarmError {
    SwarmError::InvalidValue {
        key: key.to_string(),
        reason,
    }
}

fn count_field(payload: &StateValue, key: &str, default: usize, max: usize) -> SwarmResult<usize> {
    let Some(value) = payload.get(key) else {
        return Ok(default);
    };
    match value.as_i64() {
        Some(n) if n >= 1 => match usize::try_from(n) {
            Ok(n) if n <= max => Ok(n),
            _ => Err(invalid(key, format!("{n} exceeds the limit of {max}"))),
        },
        _ => Err(invalid(key, format!("expected a positive integer, got {}", value.kind()))),
    }
}

fn bound_pair(value: &StateValue) -> SwarmResult<(f64, f64)> {
    let pair = value.as_sequence().unwrap_or_default();
    match pair {
        [low, high] => match (low.as_f64(), high.as_f64()) {
            (Some(low), Some(high)) if low.is_finite() && high.is_finite() && low <= high => {
                Ok((low, high))
            }
            _ => Err(invalid("bounds", "each pair must be finite with low <= high".into())),
        },
        _ => Err(invalid("bounds", "each bound must be a [low, high] pair".into())),
    }
}

/// What a tuning run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningOutcome {
    pub strategy: String,
    pub best_position: Vec<f64>,
    pub best_fitness: f64,
    pub convergence_history: Vec<f64>,
    pub iterations: usize,
}

impl TuningOutcome {
    /// Task result recorded on completion
    pub fn into_result(self) -> StateValue {
        StateValue::map([
            ("strategy", StateValue::from(self.strategy)),
            ("best_position", StateValue::from(self.best_position)),
            ("best_fitness", StateValue::from(self.best_fitness)),
            ("convergence_history", StateValue::from(self.convergence_history)),
            ("iterations", StateValue::from(self.iterations as i64)),
        ])
    }
}

/// Transaction handed to a [`ChainClient`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub chain: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub memo: Option<String>,
}

impl ChainTransaction {
    /// Read the `chain_action` entry of a completed task's result
    ///
    /// Returns `None` when the result carries no action.
    pub fn from_result(result: &StateValue) -> SwarmResult<Option<Self>> {
        let Some(action) = result.get(CHAIN_ACTION_KEY) else {
            return Ok(None);
        };
        if action.is_null() {
            return Ok(None);
        }

        let text = |field: &str| -> SwarmResult<String> {
            action
                .get(field)
                .and_then(StateValue::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| invalid(CHAIN_ACTION_KEY, format!("missing string field {field}")))
        };
        let amount = action
            .get("amount")
            .and_then(StateValue::as_i64)
            .filter(|n| *n >= 0)
            .ok_or_else(|| invalid(CHAIN_ACTION_KEY, "amount must be a non-negative integer".into()))?;

        Ok(Some(Self {
            chain: text("chain")?,
            from: text("from")?,
            to: text("to")?,
            amount: amount as u64,
            memo: action.get("memo").and_then(StateValue::as_str).map(str::to_string),
        }))
    }
}

/// Blockchain or bridge connectivity
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn connect(&self, chain: &str) -> SwarmResult<()>;

    async fn get_balance(&self, address: &str) -> SwarmResult<u64>;

    /// Submit a transaction, returning its hash
    async fn send_transaction(&self, tx: &ChainTransaction) -> SwarmResult<String>;
}

/// Record of a forwarded chain action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub task_id: TaskId,
    pub transaction: ChainTransaction,
    pub tx_hash: String,
    pub balance_before: u64,
}

impl SettlementReceipt {
    pub fn to_value(&self) -> StateValue {
        let mut map = BTreeMap::new();
        map.insert("task_id".to_string(), StateValue::from(self.task_id.as_str()));
        map.insert("chain".to_string(), StateValue::from(self.transaction.chain.as_str()));
        map.insert("tx_hash".to_string(), StateValue::from(self.tx_hash.as_str()));
        map.insert("amount".to_string(), StateValue::from(self.transaction.amount as i64));
        StateValue::Map(map)
    }
}

/// Connect, check the sender's balance and submit
pub(crate) async fn forward_chain_action(
    task_id: &str,
    tx: ChainTransaction,
    client: &dyn ChainClient,
) -> SwarmResult<SettlementReceipt> {
    client.connect(&tx.chain).await?;
    let balance_before = client.get_balance(&tx.from).await?;
    if balance_before < tx.amount {
        return Err(invalid(
            CHAIN_ACTION_KEY,
            format!("balance {} of {} is below {}", balance_before, tx.from, tx.amount),
        ));
    }
    let tx_hash = client.send_transaction(&tx).await?;
    Ok(SettlementReceipt {
        task_id: task_id.to_string(),
        transaction: tx,
        tx_hash,
        balance_before,
    })
}
