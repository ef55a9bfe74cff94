use rand::Rng;

use super::{Balance, BalanceError};
use crate::registry::Instance;

/// Uniform pick among the candidates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalance;

impl Balance for RandomBalance {
    fn select(&self, candidates: &mut [Instance]) -> Result<Instance, BalanceError> {
        if candidates.is_empty() {
            return Err(BalanceError::NoInstance);
        }
        let idx = rand::rng().random_range(0..candidates.len());
        Ok(candidates[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalance::instances;

    #[test]
    fn test_empty() {
        assert_eq!(RandomBalance.select(&mut []), Err(BalanceError::NoInstance));
    }

    #[test]
    fn test_returns_member() {
        let mut candidates = instances(4);
        for _ in 0..50 {
            let picked = RandomBalance.select(&mut candidates).unwrap();
            assert!(candidates.contains(&picked));
        }
    }
}
