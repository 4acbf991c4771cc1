//! Sparse gradient/hessian histograms keyed by (tree, node, column)
//!
//! Slot `2b` holds the gradient sum of bin `b`, slot `2b + 1` the
//! hessian sum. Slots 0 and 1 are the zero/missing bucket, fixed up
//! from node totals after the row pass. Sparse storage keeps slot ids
//! sorted, which fixes the accumulation order of every merge.

use serde::{Deserialize, Serialize};
use thicket_core::{AccFloat, IdPrim};

/// Histogram key: one tree, one growing node, one column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HistKey<T, N> {
    pub tree: T,
    pub node: N,
    pub col: u32,
}

impl<T: IdPrim, N: IdPrim> HistKey<T, N> {
    pub fn new(tree: T, node: N, col: u32) -> Self {
        Self { tree, node, col }
    }
}

/// Sparse histogram over `2 * num_bins` slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram<H> {
    slots: Vec<u32>,
    values: Vec<H>,
}

impl<H: AccFloat> Histogram<H> {
    pub fn empty() -> Self {
        Self {
            slots: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Compress a dense slot array, dropping exact zeros.
    pub fn from_dense(dense: &[H]) -> Self {
        let mut slots = Vec::new();
        let mut values = Vec::new();
        for (slot, &v) in dense.iter().enumerate() {
            if v.to_f64() != 0.0 {
                slots.push(slot as u32);
                values.push(v);
            }
        }
        Self { slots, values }
    }

    pub fn get(&self, slot: u32) -> H {
        match self.slots.binary_search(&slot) {
            Ok(i) => self.values[i],
            Err(_) => H::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stored (non-zero) slot count.
    pub fn nnz(&self) -> usize {
        self.slots.len()
    }

    /// Element-wise sum; sorted-slot merge keeps accumulation order
    /// canonical.
    pub fn plus(&self, other: &Self) -> Self {
        self.combine(other, false)
    }

    /// Element-wise difference (`self - other`), used to derive a left
    /// child from parent and right sibling.
    pub fn minus(&self, other: &Self) -> Self {
        self.combine(other, true)
    }

    fn combine(&self, other: &Self, negate: bool) -> Self {
        let mut slots = Vec::with_capacity(self.slots.len().max(other.slots.len()));
        let mut values = Vec::with_capacity(slots.capacity());
        let (mut i, mut j) = (0usize, 0usize);
        let sign = |v: H| if negate { H::from_f64(-v.to_f64()) } else { v };
        while i < self.slots.len() || j < other.slots.len() {
            let (slot, value) = if j >= other.slots.len()
                || (i < self.slots.len() && self.slots[i] < other.slots[j])
            {
                let out = (self.slots[i], self.values[i]);
                i += 1;
                out
            } else if i >= self.slots.len() || other.slots[j] < self.slots[i] {
                let out = (other.slots[j], sign(other.values[j]));
                j += 1;
                out
            } else {
                let out = (self.slots[i], self.values[i].add(sign(other.values[j])));
                i += 1;
                j += 1;
                out
            };
            if value.to_f64() != 0.0 {
                slots.push(slot);
                values.push(value);
            }
        }
        Self { slots, values }
    }

    /// Total gradient over all bins.
    pub fn total_grad(&self) -> f64 {
        self.slots
            .iter()
            .zip(self.values.iter())
            .filter(|(s, _)| *s % 2 == 0)
            .map(|(_, v)| v.to_f64())
            .sum()
    }

    /// Total hessian over all bins.
    pub fn total_hess(&self) -> f64 {
        self.slots
            .iter()
            .zip(self.values.iter())
            .filter(|(s, _)| *s % 2 == 1)
            .map(|(_, v)| v.to_f64())
            .sum()
    }

    /// Distinct bins carrying any mass.
    pub fn num_active_bins(&self) -> usize {
        let mut count = 0usize;
        let mut last_bin = u32::MAX;
        for &slot in &self.slots {
            let bin = slot / 2;
            if bin != last_bin {
                count += 1;
                last_bin = bin;
            }
        }
        count
    }

    /// Iterate `(bin, grad, hess)` in ascending bin order.
    pub fn bins(&self) -> Vec<(u16, f64, f64)> {
        let mut out: Vec<(u16, f64, f64)> = Vec::with_capacity(self.slots.len() / 2 + 1);
        for (&slot, &v) in self.slots.iter().zip(self.values.iter()) {
            let bin = (slot / 2) as u16;
            if out.last().map(|(b, _, _)| *b) != Some(bin) {
                out.push((bin, 0.0, 0.0));
            }
            let entry = out.last_mut().unwrap();
            if slot % 2 == 0 {
                entry.1 = v.to_f64();
            } else {
                entry.2 = v.to_f64();
            }
        }
        out
    }
}

/// Dense accumulation buffer used during the local row pass, compressed
/// into a sparse [`Histogram`] once the pass finishes.
#[derive(Debug, Clone)]
pub struct HistAccumulator<H> {
    dense: Vec<H>,
}

impl<H: AccFloat> HistAccumulator<H> {
    pub fn new(num_bins: usize) -> Self {
        Self {
            dense: vec![H::zero(); 2 * num_bins],
        }
    }

    /// Accumulate a row's contribution into bin `bin`.
    pub fn add(&mut self, bin: u16, grad: H, hess: H) {
        let slot = 2 * bin as usize;
        self.dense[slot] = self.dense[slot].add(grad);
        self.dense[slot + 1] = self.dense[slot + 1].add(hess);
    }

    /// Accumulate node totals into the zero bucket; the final fixup in
    /// [`finish`](Self::finish) turns it into zero/missing mass.
    pub fn add_total(&mut self, grad: H, hess: H) {
        self.dense[0] = self.dense[0].add(grad);
        self.dense[1] = self.dense[1].add(hess);
    }

    /// Subtract the non-zero-bin sums from the totals parked in slots
    /// 0/1, leaving the zero/missing bucket, then compress.
    pub fn finish(mut self) -> Histogram<H> {
        let mut grad_rest = H::zero();
        let mut hess_rest = H::zero();
        for bin in 1..self.dense.len() / 2 {
            grad_rest = grad_rest.add(self.dense[2 * bin]);
            hess_rest = hess_rest.add(self.dense[2 * bin + 1]);
        }
        self.dense[0] = self.dense[0].sub(grad_rest);
        self.dense[1] = self.dense[1].sub(hess_rest);
        Histogram::from_dense(&self.dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(entries: &[(u32, f64)]) -> Histogram<f64> {
        let mut dense = vec![0.0f64; 16];
        for &(slot, v) in entries {
            dense[slot as usize] = v;
        }
        Histogram::from_dense(&dense)
    }

    #[test]
    fn test_plus_minus_round_trip() {
        let a = hist(&[(0, 1.0), (1, 2.0), (4, 3.0), (5, 1.0)]);
        let b = hist(&[(4, 1.0), (5, 0.5), (6, 2.0), (7, 1.0)]);
        let sum = a.plus(&b);
        assert_eq!(sum.get(4), 4.0);
        assert_eq!(sum.get(6), 2.0);
        let back = sum.minus(&b);
        assert_eq!(back, a);
    }

    #[test]
    fn test_totals() {
        let h = hist(&[(0, 1.0), (1, 2.0), (2, -0.5), (3, 1.5)]);
        assert_eq!(h.total_grad(), 0.5);
        assert_eq!(h.total_hess(), 3.5);
    }

    #[test]
    fn test_accumulator_zero_bucket_fixup() {
        let mut acc = HistAccumulator::<f64>::new(4);
        acc.add(1, 1.0, 1.0);
        acc.add(2, 2.0, 1.0);
        // Totals include a row that stayed in the zero bin.
        acc.add_total(4.0, 3.0);
        let hist = acc.finish();
        // Zero bucket = totals minus non-zero-bin sums.
        assert_eq!(hist.get(0), 1.0);
        assert_eq!(hist.get(1), 1.0);
        // Mass conservation.
        assert_eq!(hist.total_grad(), 4.0);
        assert_eq!(hist.total_hess(), 3.0);
    }

    #[test]
    fn test_active_bins_and_iteration() {
        let h = hist(&[(0, 1.0), (1, 1.0), (6, 2.0), (7, 0.5)]);
        assert_eq!(h.num_active_bins(), 2);
        assert_eq!(h.bins(), vec![(0, 1.0, 1.0), (3, 2.0, 0.5)]);
    }
}
