//! Seeded predicates for column, row, block, and partition sampling
//!
//! A [`Selector`] is a pure function of `(seed, base_id, key)`; the
//! same triple answers identically on every machine, which keeps
//! sampling decisions consistent across partitions and retries.

use crate::deterministic::{hash_parts, unit_interval};
use serde::{Deserialize, Serialize};

/// Deterministic sampling predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    /// Keep everything.
    True,
    /// Keep `(base, key)` when its seeded hash lands under `rate`.
    Hash { seed: u64, rate: f64 },
    /// Intersection of two selectors.
    Union(Box<Selector>, Box<Selector>),
}

impl Selector {
    /// Hash selector; a rate of 1 or more collapses to [`Selector::True`].
    pub fn hash(seed: u64, rate: f64) -> Self {
        if rate >= 1.0 {
            Selector::True
        } else {
            Selector::Hash { seed, rate }
        }
    }

    /// Intersect two selectors, flattening trivial cases.
    pub fn union(a: Selector, b: Selector) -> Self {
        match (a, b) {
            (Selector::True, b) => b,
            (a, Selector::True) => a,
            (a, b) => Selector::Union(Box::new(a), Box::new(b)),
        }
    }

    /// Whether base model `base_id` samples `key`.
    pub fn contains(&self, base_id: usize, key: u64) -> bool {
        match self {
            Selector::True => true,
            Selector::Hash { seed, rate } => {
                unit_interval(hash_parts(*seed, &[base_id as u64, key])) < *rate
            }
            Selector::Union(a, b) => a.contains(base_id, key) && b.contains(base_id, key),
        }
    }

    /// Base models among `0..num_base` that sample `key`.
    pub fn index(&self, key: u64, num_base: usize) -> Vec<usize> {
        (0..num_base).filter(|&b| self.contains(b, key)).collect()
    }
}
