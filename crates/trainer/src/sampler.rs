//! Instance samplers: none, partition, block, row, and Goss
//!
//! Every sampler turns the materialized training blocks plus the
//! iteration's effective raw predictions into sampled blocks carrying
//! per-row tree memberships and the gradient pairs trees are fit to.
//! Goss keeps high-gradient rows outright and subsamples the rest with
//! compensating re-weighting.

use crate::data::{block_key, row_key, DataBlock, SampleBlock};
use crate::deterministic::hash_parts;
use crate::exec::dataset::PartDataset;
use crate::selector::Selector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thicket_core::{
    AccFloat, ArrayBlock, BinSlice, BoostConfig, CompactArray, IdPrim, JaggedBlock, KVMatrix,
    ObjFunc, SubSampleType,
};

/// Fixed capacity of the per-partition quantile summaries merged to
/// find the Goss threshold.
const SUMMARY_CAPACITY: usize = 256;

/// Mergeable approximate quantile summary over weighted value runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantileSummary {
    /// `(upper value, count)` runs in ascending value order
    entries: Vec<(f64, u64)>,
}

impl QuantileSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from unsorted values, compressing to capacity.
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.retain(|v| v.is_finite());
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut summary = Self {
            entries: values.into_iter().map(|v| (v, 1)).collect(),
        };
        summary.compress();
        summary
    }

    /// Merge two summaries, keeping the result at capacity.
    pub fn merge(mut self, other: Self) -> Self {
        self.entries.extend(other.entries);
        self.entries
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        self.compress();
        self
    }

    fn compress(&mut self) {
        if self.entries.len() <= SUMMARY_CAPACITY {
            return;
        }
        let total: u64 = self.entries.iter().map(|(_, c)| c).sum();
        let per_bucket = total.div_ceil(SUMMARY_CAPACITY as u64).max(1);
        let mut compressed: Vec<(f64, u64)> = Vec::with_capacity(SUMMARY_CAPACITY);
        for &(value, count) in &self.entries {
            match compressed.last_mut() {
                Some((v, c)) if *c + count <= per_bucket => {
                    *v = value;
                    *c += count;
                }
                _ => compressed.push((value, count)),
            }
        }
        self.entries = compressed;
    }

    /// Smallest summarized value whose cumulative count reaches the
    /// `q`-quantile.
    pub fn query(&self, q: f64) -> f64 {
        let total: u64 = self.entries.iter().map(|(_, c)| c).sum();
        if total == 0 {
            return 0.0;
        }
        let target = (q.clamp(0.0, 1.0) * total as f64).ceil() as u64;
        let mut cum = 0u64;
        for &(value, count) in &self.entries {
            cum += count;
            if cum >= target {
                return value;
            }
        }
        self.entries.last().map(|(v, _)| *v).unwrap_or(0.0)
    }
}

/// Weighted `(grad, hess)` pairs of one row.
fn row_grads<H: AccFloat>(
    obj: &Arc<dyn ObjFunc>,
    label: &[f64],
    raw: &[f64],
    weight: f64,
    scratch: &mut Vec<f64>,
) -> Vec<H> {
    let raw_size = raw.len();
    scratch.resize(2 * raw_size, 0.0);
    obj.compute(label, raw, scratch);
    scratch.iter().map(|&v| H::from_f64(weight * v)).collect()
}

/// Incrementally packs sampled rows back into `block_size` blocks.
struct BlockBuilder<T, H> {
    block_size: usize,
    num_cols: u32,
    raw_size: usize,
    bins: KVMatrix,
    labels: ArrayBlock<f64>,
    weights: Vec<f64>,
    raw: ArrayBlock<f64>,
    tree_ids: JaggedBlock<T>,
    grads: ArrayBlock<H>,
    done: Vec<SampleBlock<T, H>>,
}

impl<T: IdPrim, H: AccFloat> BlockBuilder<T, H> {
    fn new(block_size: usize, num_cols: u32, label_width: usize, raw_size: usize) -> Self {
        Self {
            block_size,
            num_cols,
            raw_size,
            bins: KVMatrix::new(num_cols),
            labels: ArrayBlock::new(label_width),
            weights: Vec::new(),
            raw: ArrayBlock::new(raw_size),
            tree_ids: JaggedBlock::new(),
            grads: ArrayBlock::new(2 * raw_size),
            done: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        bins: BinSlice<'_>,
        label: &[f64],
        weight: f64,
        raw: &[f64],
        trees: &[T],
        grads: &[H],
    ) {
        self.bins.push_row(bins);
        self.labels.push_row(label);
        self.weights.push(weight);
        self.raw.push_row(raw);
        self.tree_ids.push_row(trees);
        self.grads.push_row(grads);
        if self.bins.num_rows() >= self.block_size {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.bins.num_rows() == 0 {
            return;
        }
        let label_width = self.labels.width();
        let block = SampleBlock {
            bins: std::mem::replace(&mut self.bins, KVMatrix::new(self.num_cols)),
            labels: std::mem::replace(&mut self.labels, ArrayBlock::new(label_width)),
            weights: CompactArray::from_vec(std::mem::take(&mut self.weights)),
            raw: std::mem::replace(&mut self.raw, ArrayBlock::new(self.raw_size)),
            tree_ids: std::mem::take(&mut self.tree_ids),
            grads: std::mem::replace(&mut self.grads, ArrayBlock::new(2 * self.raw_size)),
        };
        self.done.push(block);
    }

    fn finish(mut self) -> Vec<SampleBlock<T, H>> {
        self.flush();
        self.done
    }
}

/// Produce this iteration's sampled dataset.
pub fn sample_iteration<T: IdPrim, H: AccFloat>(
    data: &PartDataset<DataBlock>,
    raw_eff: &PartDataset<ArrayBlock<f64>>,
    objective: &Arc<dyn ObjFunc>,
    config: &BoostConfig,
    iteration: usize,
    num_trees: usize,
) -> PartDataset<SampleBlock<T, H>> {
    let raw_size = objective.num_outputs();
    let all_trees: Vec<T> = (0..num_trees).map(T::from_usize).collect();
    let seed = hash_parts(config.base_seed(), &[iteration as u64, 0x73616d70]);

    if config.sub_sample_type == SubSampleType::Goss {
        return goss_sample(data, raw_eff, objective, config, seed, num_trees, &all_trees);
    }

    // Full rate degenerates to the no-sampling path.
    let full = config.sub_sample_rate_by_tree >= 1.0;
    let selector = Selector::hash(seed, config.sub_sample_rate_by_tree);

    data.zip_map_partitions(raw_eff, |p, blocks, raws| {
        let part_owners: Option<Vec<T>> = match (full, config.sub_sample_type) {
            (false, SubSampleType::Partition) => Some(
                selector
                    .index(p as u64, num_trees)
                    .into_iter()
                    .map(T::from_usize)
                    .collect(),
            ),
            _ => None,
        };
        if let Some(owners) = &part_owners {
            if owners.is_empty() {
                return Vec::new();
            }
        }

        let mut scratch = Vec::new();
        let mut builder: BlockBuilder<T, H> = BlockBuilder::new(
            config.block_size,
            blocks.first().map(|b| b.bins.num_cols()).unwrap_or(0),
            blocks.first().map(|b| b.labels.width()).unwrap_or(1),
            raw_size,
        );
        for (b, (block, raw_block)) in blocks.iter().zip(raws.iter()).enumerate() {
            let block_owners: Option<Vec<T>> = match (full, config.sub_sample_type) {
                (false, SubSampleType::Block) => Some(
                    selector
                        .index(block_key(p, b), num_trees)
                        .into_iter()
                        .map(T::from_usize)
                        .collect(),
                ),
                _ => None,
            };
            if let Some(owners) = &block_owners {
                if owners.is_empty() {
                    continue;
                }
            }
            for i in 0..block.num_rows() {
                let owners: Vec<T> = if full {
                    all_trees.clone()
                } else {
                    match config.sub_sample_type {
                        SubSampleType::Partition => part_owners.clone().unwrap_or_default(),
                        SubSampleType::Block => block_owners.clone().unwrap_or_default(),
                        SubSampleType::Row => selector
                            .index(row_key(p, b, i), num_trees)
                            .into_iter()
                            .map(T::from_usize)
                            .collect(),
                        SubSampleType::Goss => unreachable!("goss handled above"),
                    }
                };
                if owners.is_empty() {
                    continue;
                }
                let weight = block.weights.get(i);
                let raw = raw_block.row(i);
                let grads =
                    row_grads::<H>(objective, block.labels.row(i), raw, weight, &mut scratch);
                builder.push(
                    block.bins.row(i),
                    block.labels.row(i),
                    weight,
                    raw,
                    &owners,
                    &grads,
                );
            }
        }
        builder.finish()
    })
}

#[allow(clippy::too_many_arguments)]
fn goss_sample<T: IdPrim, H: AccFloat>(
    data: &PartDataset<DataBlock>,
    raw_eff: &PartDataset<ArrayBlock<f64>>,
    objective: &Arc<dyn ObjFunc>,
    config: &BoostConfig,
    seed: u64,
    num_trees: usize,
    all_trees: &[T],
) -> PartDataset<SampleBlock<T, H>> {
    let raw_size = objective.num_outputs();

    // Gradient norms per row, summarized per partition and merged with
    // a tree reduce to find the top-rate threshold.
    let norms = data.zip_map_partitions(raw_eff, |_, blocks, raws| {
        let mut scratch = Vec::new();
        let mut values = Vec::new();
        for (block, raw_block) in blocks.iter().zip(raws.iter()) {
            for i in 0..block.num_rows() {
                let grads = row_grads::<f64>(
                    objective,
                    block.labels.row(i),
                    raw_block.row(i),
                    block.weights.get(i),
                    &mut scratch,
                );
                let norm: f64 = grads.iter().step_by(2).map(|g| g * g).sum();
                values.push(norm);
            }
        }
        vec![QuantileSummary::from_values(values)]
    });
    let summary = norms.tree_aggregate(
        QuantileSummary::empty(),
        |acc, s| acc.merge(s.clone()),
        |a, b| a.merge(b),
    );
    let threshold = summary.query(1.0 - config.top_rate);

    let other_rate = config.other_rate / (1.0 - config.top_rate);
    let amplify = (1.0 - config.top_rate) / config.other_rate;
    let selector = Selector::hash(hash_parts(seed, &[0x676f_7373]), other_rate);

    data.zip_map_partitions(raw_eff, |p, blocks, raws| {
        let mut scratch = Vec::new();
        let mut builder: BlockBuilder<T, H> = BlockBuilder::new(
            config.block_size,
            blocks.first().map(|b| b.bins.num_cols()).unwrap_or(0),
            blocks.first().map(|b| b.labels.width()).unwrap_or(1),
            raw_size,
        );
        for (b, (block, raw_block)) in blocks.iter().zip(raws.iter()).enumerate() {
            for i in 0..block.num_rows() {
                let weight = block.weights.get(i);
                let raw = raw_block.row(i);
                let grads =
                    row_grads::<f64>(objective, block.labels.row(i), raw, weight, &mut scratch);
                let norm: f64 = grads.iter().step_by(2).map(|g| g * g).sum();

                if norm >= threshold {
                    let grads: Vec<H> = grads.iter().map(|&v| H::from_f64(v)).collect();
                    builder.push(
                        block.bins.row(i),
                        block.labels.row(i),
                        weight,
                        raw,
                        all_trees,
                        &grads,
                    );
                } else {
                    let owners: Vec<T> = selector
                        .index(row_key(p, b, i), num_trees)
                        .into_iter()
                        .map(T::from_usize)
                        .collect();
                    if owners.is_empty() {
                        continue;
                    }
                    // Compensate the thinning by amplifying the weight,
                    // which scales grad and hess together.
                    let grads: Vec<H> =
                        grads.iter().map(|&v| H::from_f64(amplify * v)).collect();
                    builder.push(
                        block.bins.row(i),
                        block.labels.row(i),
                        amplify * weight,
                        raw,
                        &owners,
                        &grads,
                    );
                }
            }
        }
        builder.finish()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_quantile_exact_on_small_input() {
        let summary = QuantileSummary::from_values((1..=100).map(|i| i as f64).collect());
        assert_eq!(summary.query(0.5), 50.0);
        assert_eq!(summary.query(0.9), 90.0);
        assert_eq!(summary.query(1.0), 100.0);
    }

    #[test]
    fn test_summary_merge_approximates() {
        let a = QuantileSummary::from_values((0..500).map(|i| i as f64).collect());
        let b = QuantileSummary::from_values((500..1000).map(|i| i as f64).collect());
        let merged = a.merge(b);
        let q = merged.query(0.8);
        assert!((780.0..=820.0).contains(&q), "q80 was {q}");
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(QuantileSummary::empty().query(0.5), 0.0);
    }
}
