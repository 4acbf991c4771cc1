//! Engine-side block bundles
//!
//! Training data travels through the executor as bundles of aligned
//! blocks: the binned rows, their labels and weights, the effective
//! raw predictions of the current iteration, the per-row tree
//! memberships, and the gradient pairs the trees are fit to.

use crate::deterministic::hash_parts;
use serde::{Deserialize, Serialize};
use thicket_core::{AccFloat, ArrayBlock, CompactArray, IdPrim, JaggedBlock, KVMatrix};

/// Immutable training block materialized once from the discretizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBlock {
    pub bins: KVMatrix,
    pub labels: ArrayBlock<f64>,
    pub weights: CompactArray<f64>,
}

impl DataBlock {
    pub fn num_rows(&self) -> usize {
        self.bins.num_rows()
    }
}

/// Per-iteration sampled block with tree memberships and gradients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBlock<T, H> {
    pub bins: KVMatrix,
    pub labels: ArrayBlock<f64>,
    pub weights: CompactArray<f64>,
    /// Effective raw predictions this iteration's gradients derive from
    pub raw: ArrayBlock<f64>,
    /// Base trees each row contributes to this round
    pub tree_ids: JaggedBlock<T>,
    /// Interleaved `(grad, hess)` pairs, one per raw output
    pub grads: ArrayBlock<H>,
}

impl<T: IdPrim, H: AccFloat> SampleBlock<T, H> {
    pub fn num_rows(&self) -> usize {
        self.bins.num_rows()
    }
}

/// Deterministic sampling key of one block.
pub fn block_key(partition: usize, block: usize) -> u64 {
    hash_parts(0x626c_6f63_6b, &[partition as u64, block as u64])
}

/// Deterministic sampling key of one row.
pub fn row_key(partition: usize, block: usize, row: usize) -> u64 {
    hash_parts(0x726f_77, &[partition as u64, block as u64, row as u64])
}
