use std::sync::{Mutex, PoisonError};

use super::{Balance, BalanceError};
use crate::registry::Instance;

/// Cycles through the candidates in order.
///
/// The cursor wraps modulo the current candidate count and resets to zero
/// when the set has shrunk below it.
#[derive(Debug, Default)]
pub struct RoundRobinBalance {
    cursor: Mutex<usize>,
}

impl RoundRobinBalance {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balance for RoundRobinBalance {
    fn select(&self, candidates: &mut [Instance]) -> Result<Instance, BalanceError> {
        if candidates.is_empty() {
            return Err(BalanceError::NoInstance);
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if *cursor >= candidates.len() {
            *cursor = 0;
        }
        let picked = candidates[*cursor].clone();
        *cursor = (*cursor + 1) % candidates.len();
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalance::instances;

    #[test]
    fn test_empty() {
        let rr = RoundRobinBalance::new();
        assert_eq!(rr.select(&mut []), Err(BalanceError::NoInstance));
    }

    #[test]
    fn test_cycles_each_once() {
        let rr = RoundRobinBalance::new();
        let mut candidates = instances(3);

        let picks: Vec<Instance> = (0..3).map(|_| rr.select(&mut candidates).unwrap()).collect();
        assert_eq!(picks, candidates);

        let fourth = rr.select(&mut candidates).unwrap();
        assert_eq!(fourth, picks[0]);
    }

    #[test]
    fn test_stale_cursor_resets() {
        let rr = RoundRobinBalance::new();
        let mut five = instances(5);
        for _ in 0..4 {
            rr.select(&mut five).unwrap();
        }

        // Cursor is at 4, past the end of a two-element set.
        let mut two = instances(2);
        assert_eq!(rr.select(&mut two).unwrap(), two[0]);
        assert_eq!(rr.select(&mut two).unwrap(), two[1]);
    }
}
