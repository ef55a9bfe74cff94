//! Load-balancing strategies.
//!
//! A strategy picks one instance out of the current candidate set. Strategies
//! are looked up by name through a [`BalancerRegistry`]; the consumer owns one
//! and custom strategies can be added to it next to the built-in ones.

mod random;
mod round_robin;
mod shuffle;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub use random::RandomBalance;
pub use round_robin::RoundRobinBalance;
pub use shuffle::ShuffleBalance;

use crate::registry::Instance;

pub const RANDOM: &str = "random";
pub const ROUND_ROBIN: &str = "roundrobin";
pub const SHUFFLE: &str = "shuffle";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("no instance found")]
    NoInstance,

    #[error("un found balance type: {0}")]
    UnknownType(String),
}

pub trait Balance: Send + Sync {
    /// Pick one of `candidates`. Implementations may reorder the slice.
    fn select(&self, candidates: &mut [Instance]) -> Result<Instance, BalanceError>;
}

/// Name to strategy table.
pub struct BalancerRegistry {
    balances: RwLock<HashMap<String, Arc<dyn Balance>>>,
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BalancerRegistry {
    /// A registry holding the built-in strategies.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(RANDOM, Arc::new(RandomBalance));
        registry.register(ROUND_ROBIN, Arc::new(RoundRobinBalance::new()));
        registry.register(SHUFFLE, Arc::new(ShuffleBalance));
        registry
    }

    pub fn empty() -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace the strategy registered under `name`.
    pub fn register(&self, name: impl Into<String>, balance: Arc<dyn Balance>) {
        self.balances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), balance);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Balance>, BalanceError> {
        self.balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BalanceError::UnknownType(name.to_string()))
    }

    pub fn select(&self, name: &str, candidates: &mut [Instance]) -> Result<Instance, BalanceError> {
        self.get(name)?.select(candidates)
    }
}

#[cfg(test)]
pub(crate) fn instances(n: usize) -> Vec<Instance> {
    (0..n)
        .map(|i| Instance::new(format!("svc-10.0.0.{i}:8888"), format!("10.0.0.{i}"), 8888))
        .collect()
}
