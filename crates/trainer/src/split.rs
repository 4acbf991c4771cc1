//! Split finding over node histograms
//!
//! Numeric and ranking columns scan bins in ascending order with a
//! prefix sum; categorical columns either brute-force every
//! bipartition (few active bins) or scan bins sorted by their
//! gradient-to-hessian ratio. The zero/missing bucket is tried on both
//! sides wherever it carries mass. Ties break on `(col, data,
//! missing)` so results survive shuffling.

use crate::histogram::Histogram;
use serde::{Deserialize, Serialize};
use thicket_core::{AccFloat, BinSet, BoostConfig, ColKind, SplitData, SplitKind};

/// Active-bin cap under which categorical bipartitions are enumerated
/// exhaustively.
pub const MAX_BRUTE_BINS: usize = 10;

/// L1 shrinkage of a gradient sum.
pub fn soft_threshold(g: f64, alpha: f64) -> f64 {
    g.signum() * (g.abs() - alpha).max(0.0)
}

/// Structure score of a node holding `(g, h)`.
pub fn score(g: f64, h: f64, alpha: f64, lambda: f64) -> f64 {
    let s = soft_threshold(g, alpha);
    s * s / (h + lambda)
}

/// Optimal leaf weight of a node holding `(g, h)`.
pub fn leaf_weight(g: f64, h: f64, alpha: f64, lambda: f64) -> f64 {
    -soft_threshold(g, alpha) / (h + lambda)
}

/// Regularization and gating knobs lifted from [`BoostConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitParams {
    pub alpha: f64,
    pub lambda: f64,
    pub min_gain: f64,
    pub min_node_hess: f64,
}

impl From<&BoostConfig> for SplitParams {
    fn from(config: &BoostConfig) -> Self {
        Self {
            alpha: config.reg_alpha,
            lambda: config.reg_lambda,
            min_gain: config.min_gain,
            min_node_hess: config.min_node_hess,
        }
    }
}

/// A chosen split for one node, carrying the child mass it implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub col: u32,
    pub kind: SplitKind,
    pub data: SplitData,
    pub missing_left: bool,
    pub gain: f64,
    pub left_grad: f64,
    pub left_hess: f64,
    pub right_grad: f64,
    pub right_hess: f64,
}

impl Split {
    /// Route a bin of the split column to the left or right child.
    pub fn goes_left(&self, bin: u16) -> bool {
        if bin == 0 {
            return self.missing_left;
        }
        match &self.data {
            SplitData::Threshold(t) => bin <= *t,
            SplitData::Set(set) => set.contains(bin),
        }
    }

    pub fn left_weight(&self, p: &SplitParams) -> f64 {
        leaf_weight(self.left_grad, self.left_hess, p.alpha, p.lambda)
    }

    pub fn right_weight(&self, p: &SplitParams) -> f64 {
        leaf_weight(self.right_grad, self.right_hess, p.alpha, p.lambda)
    }

    /// Whether this split wins over `other`: larger gain, then the
    /// deterministic `(col, data, missing)` order.
    pub fn better_than(&self, other: &Split) -> bool {
        if self.gain != other.gain {
            return self.gain > other.gain;
        }
        let a = (self.col, &self.data, !self.missing_left);
        let b = (other.col, &other.data, !other.missing_left);
        a < b
    }
}

/// Pick the winner of two optional split candidates.
pub fn better_of(a: Option<Split>, b: Option<Split>) -> Option<Split> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.better_than(&b) {
                Some(a)
            } else {
                Some(b)
            }
        }
        (a, None) => a,
        (None, b) => b,
    }
}

struct Candidate {
    data: SplitData,
    left_grad: f64,
    left_hess: f64,
}

/// Best split of one column's histogram, if any candidate passes the
/// hessian and gain gates.
pub fn find_col_split<H: AccFloat>(
    col: u32,
    kind: ColKind,
    hist: &Histogram<H>,
    p: &SplitParams,
) -> Option<Split> {
    let bins = hist.bins();
    let (zero_g, zero_h) = bins
        .first()
        .filter(|(b, _, _)| *b == 0)
        .map(|(_, g, h)| (*g, *h))
        .unwrap_or((0.0, 0.0));
    let nonzero: Vec<(u16, f64, f64)> = bins.into_iter().filter(|(b, _, _)| *b != 0).collect();
    if nonzero.is_empty() {
        return None;
    }

    let total_g: f64 = zero_g + nonzero.iter().map(|(_, g, _)| g).sum::<f64>();
    let total_h: f64 = zero_h + nonzero.iter().map(|(_, _, h)| h).sum::<f64>();
    if total_h <= 0.0 {
        return None;
    }
    let parent = score(total_g, total_h, p.alpha, p.lambda);
    let has_zero_mass = zero_g != 0.0 || zero_h != 0.0;

    let candidates: Vec<Candidate> = match kind {
        ColKind::Numeric | ColKind::Ranking => ordered_candidates(&nonzero),
        ColKind::Categorical => {
            if nonzero.len() <= MAX_BRUTE_BINS {
                brute_candidates(&nonzero)
            } else {
                sorted_candidates(&nonzero, p)
            }
        }
    };

    let split_kind = match kind {
        ColKind::Numeric => SplitKind::Numeric,
        ColKind::Categorical => SplitKind::Categorical,
        ColKind::Ranking => SplitKind::Ranking,
    };

    let mut best: Option<Split> = None;
    for cand in candidates {
        // With no missing mass the direction is irrelevant; fix it to
        // keep candidates canonical.
        let directions: &[bool] = if has_zero_mass { &[true, false] } else { &[true] };
        for &missing_left in directions {
            let (lg, lh) = if missing_left {
                (cand.left_grad + zero_g, cand.left_hess + zero_h)
            } else {
                (cand.left_grad, cand.left_hess)
            };
            let (rg, rh) = (total_g - lg, total_h - lh);
            if lh < p.min_node_hess || rh < p.min_node_hess {
                continue;
            }
            let gain =
                score(lg, lh, p.alpha, p.lambda) + score(rg, rh, p.alpha, p.lambda) - parent;
            if gain <= 0.0 || gain < p.min_gain {
                continue;
            }
            let split = Split {
                col,
                kind: split_kind,
                data: cand.data.clone(),
                missing_left,
                gain,
                left_grad: lg,
                left_hess: lh,
                right_grad: rg,
                right_hess: rh,
            };
            best = better_of(best, Some(split));
        }
    }
    best
}

/// Prefix-scan candidates over bins in ascending order.
fn ordered_candidates(nonzero: &[(u16, f64, f64)]) -> Vec<Candidate> {
    let mut out = Vec::with_capacity(nonzero.len().saturating_sub(1));
    let mut prefix_g = 0.0;
    let mut prefix_h = 0.0;
    for k in 0..nonzero.len().saturating_sub(1) {
        let (bin, g, h) = nonzero[k];
        prefix_g += g;
        prefix_h += h;
        out.push(Candidate {
            data: SplitData::Threshold(bin),
            left_grad: prefix_g,
            left_hess: prefix_h,
        });
    }
    out
}

/// Exhaustive bipartitions of few active bins. The last bin is pinned
/// to the right side, which enumerates each unordered bipartition once.
fn brute_candidates(nonzero: &[(u16, f64, f64)]) -> Vec<Candidate> {
    let k = nonzero.len();
    if k < 2 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity((1usize << (k - 1)) - 1);
    for mask in 1u32..(1u32 << (k - 1)) {
        let mut set = BinSet::new();
        let mut lg = 0.0;
        let mut lh = 0.0;
        for (i, &(bin, g, h)) in nonzero.iter().take(k - 1).enumerate() {
            if mask & (1 << i) != 0 {
                set.insert(bin);
                lg += g;
                lh += h;
            }
        }
        out.push(Candidate {
            data: SplitData::Set(set),
            left_grad: lg,
            left_hess: lh,
        });
    }
    out
}

/// Linear scan over bins sorted by `g / (h + lambda)`; the chosen
/// prefix becomes an explicit left-bin set.
fn sorted_candidates(nonzero: &[(u16, f64, f64)], p: &SplitParams) -> Vec<Candidate> {
    let mut order: Vec<usize> = (0..nonzero.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = nonzero[a].1 / (nonzero[a].2 + p.lambda);
        let rb = nonzero[b].1 / (nonzero[b].2 + p.lambda);
        ra.partial_cmp(&rb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(nonzero[a].0.cmp(&nonzero[b].0))
    });

    let mut out = Vec::with_capacity(nonzero.len().saturating_sub(1));
    let mut set = BinSet::new();
    let mut lg = 0.0;
    let mut lh = 0.0;
    for k in 0..order.len().saturating_sub(1) {
        let (bin, g, h) = nonzero[order[k]];
        set.insert(bin);
        lg += g;
        lh += h;
        out.push(Candidate {
            data: SplitData::Set(set.clone()),
            left_grad: lg,
            left_hess: lh,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist_from(bins: &[(u16, f64, f64)], num_bins: usize) -> Histogram<f64> {
        let mut dense = vec![0.0f64; 2 * num_bins];
        for &(b, g, h) in bins {
            dense[2 * b as usize] = g;
            dense[2 * b as usize + 1] = h;
        }
        Histogram::from_dense(&dense)
    }

    fn params() -> SplitParams {
        SplitParams {
            alpha: 0.0,
            lambda: 1.0,
            min_gain: 0.0,
            min_node_hess: 1.0,
        }
    }

    #[test]
    fn test_numeric_split_separates_signs() {
        // Bins 1-2 pull negative, bins 3-4 pull positive.
        let hist = hist_from(
            &[(1, -4.0, 2.0), (2, -3.0, 2.0), (3, 3.0, 2.0), (4, 4.0, 2.0)],
            6,
        );
        let split = find_col_split(0, ColKind::Numeric, &hist, &params()).unwrap();
        assert_eq!(split.data, SplitData::Threshold(2));
        assert!(split.gain > 0.0);
        assert_eq!(split.left_grad, -7.0);
        assert_eq!(split.right_grad, 7.0);
        assert!(split.left_weight(&params()) > 0.0);
        assert!(split.right_weight(&params()) < 0.0);
    }

    #[test]
    fn test_missing_direction_tried_both_ways() {
        // Zero bucket pulls the same way as the high bins.
        let hist = hist_from(&[(0, 5.0, 3.0), (1, -5.0, 3.0), (2, 6.0, 3.0)], 4);
        let split = find_col_split(0, ColKind::Numeric, &hist, &params()).unwrap();
        assert!(!split.missing_left);
        assert_eq!(split.left_grad, -5.0);
    }

    #[test]
    fn test_hessian_gate_rejects() {
        let hist = hist_from(&[(1, -1.0, 0.4), (2, 1.0, 0.4)], 4);
        assert!(find_col_split(0, ColKind::Numeric, &hist, &params()).is_none());
    }

    #[test]
    fn test_categorical_brute_finds_nonordered_partition() {
        // Bins 1 and 3 pull together; an ordered threshold cannot
        // separate them from bin 2.
        let hist = hist_from(
            &[(1, -4.0, 2.0), (2, 5.0, 2.0), (3, -4.0, 2.0)],
            5,
        );
        let split = find_col_split(0, ColKind::Categorical, &hist, &params()).unwrap();
        match &split.data {
            // The winning bipartition is {1, 3} vs {2}; the enumerator
            // pins the last bin right, so the left set is {2}.
            SplitData::Set(set) => {
                assert_eq!(set.iter().collect::<Vec<_>>(), vec![2]);
            }
            other => panic!("expected set split, got {other:?}"),
        }
        assert_eq!(split.left_grad, 5.0);
        assert_eq!(split.right_grad, -8.0);
    }

    #[test]
    fn test_categorical_sorted_path() {
        // 12 active bins forces the sorted-scan path.
        let bins: Vec<(u16, f64, f64)> = (1..=12)
            .map(|b| {
                let g = if b % 2 == 0 { 2.0 } else { -2.0 };
                (b as u16, g, 1.5)
            })
            .collect();
        let hist = hist_from(&bins, 16);
        let split = find_col_split(0, ColKind::Categorical, &hist, &params()).unwrap();
        match &split.data {
            SplitData::Set(set) => {
                // The ratio ordering groups all negative-gradient bins.
                let left: Vec<u16> = set.iter().collect();
                assert_eq!(left, vec![1, 3, 5, 7, 9, 11]);
            }
            other => panic!("expected set split, got {other:?}"),
        }
    }

    #[test]
    fn test_tie_break_prefers_smaller_column() {
        let hist = hist_from(&[(1, -2.0, 2.0), (2, 2.0, 2.0)], 4);
        let a = find_col_split(3, ColKind::Numeric, &hist, &params()).unwrap();
        let b = find_col_split(1, ColKind::Numeric, &hist, &params()).unwrap();
        assert_eq!(a.gain, b.gain);
        let winner = better_of(Some(a), Some(b.clone())).unwrap();
        assert_eq!(winner.col, 1);
        let winner = better_of(Some(b), None).unwrap();
        assert_eq!(winner.col, 1);
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }
}
