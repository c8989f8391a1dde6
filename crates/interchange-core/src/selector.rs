//! Pluggable ordering of eligible Managers for dispatch (`spec.md` §4.4).

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::registry::{ManagerId, ManagerRegistry};

/// A deterministic-given-its-inputs, non-mutating ordering policy.
///
/// `select` returns a *stack*: the event loop pops from the end, so the
/// last element of the returned `Vec` is tried first.
pub trait ManagerSelector: Send + Sync {
    fn select(&self, registry: &ManagerRegistry, interesting: &[ManagerId]) -> Vec<ManagerId>;
}

/// The default policy: an unbiased random permutation of the interesting
/// set, seedable for reproducible tests.
pub struct RandomManagerSelector {
    rng: Mutex<StdRng>,
}

impl RandomManagerSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Seeded from the OS entropy source, for production use.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }
}

impl ManagerSelector for RandomManagerSelector {
    fn select(&self, _registry: &ManagerRegistry, interesting: &[ManagerId]) -> Vec<ManagerId> {
        let mut stack: Vec<ManagerId> = interesting.to_vec();
        let mut rng = self.rng.lock().expect("selector rng poisoned");
        stack.shuffle(&mut *rng);
        stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_is_a_permutation_of_the_interesting_set() {
        let selector = RandomManagerSelector::new(42);
        let registry = ManagerRegistry::new();
        let interesting: Vec<ManagerId> = (0..10).map(|i| ManagerId(vec![i])).collect();

        let stack = selector.select(&registry, &interesting);
        let mut sorted_stack = stack.clone();
        sorted_stack.sort_by(|a, b| a.0.cmp(&b.0));
        let mut sorted_interesting = interesting.clone();
        sorted_interesting.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(sorted_stack, sorted_interesting);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let registry = ManagerRegistry::new();
        let interesting: Vec<ManagerId> = (0..20).map(|i| ManagerId(vec![i])).collect();

        let a = RandomManagerSelector::new(7).select(&registry, &interesting);
        let b = RandomManagerSelector::new(7).select(&registry, &interesting);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_interesting_set_yields_empty_stack() {
        let selector = RandomManagerSelector::new(1);
        let registry = ManagerRegistry::new();
        assert!(selector.select(&registry, &[]).is_empty());
    }
}
