use rand::Rng;

use super::{Balance, BalanceError};
use crate::registry::Instance;

/// Performs `n / 2` random swaps over the candidates and picks the first.
///
/// This is a partial shuffle; the pick is not uniformly distributed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShuffleBalance;

impl Balance for ShuffleBalance {
    fn select(&self, candidates: &mut [Instance]) -> Result<Instance, BalanceError> {
        if candidates.is_empty() {
            return Err(BalanceError::NoInstance);
        }

        let mut rng = rand::rng();
        let n = candidates.len();
        for _ in 0..n / 2 {
            let i = rng.random_range(0..n);
            let j = rng.random_range(0..n);
            candidates.swap(i, j);
        }
        Ok(candidates[0].clone())
    }
}
