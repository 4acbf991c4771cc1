//! Histogram construction and aggregation strategies
//!
//! All three strategies share one local build: a sequential pass over
//! each partition's rows that accumulates per-`(tree, node, column)`
//! bin mass plus node totals, then fixes up the zero/missing bucket.
//! `basic` reshuffles and merges everything per depth, `subtract`
//! builds only right children and derives left siblings from retained
//! parents, and `vote` cuts the shuffle down to columns that win a
//! per-worker top-K election.

use crate::data::{row_key, SampleBlock};
use crate::exec::broadcast::Broadcast;
use crate::exec::checkpoint::Checkpointer;
use crate::exec::dataset::{PartDataset, SpillDir};
use crate::exec::partitioner::{select_partitioner, HistPartitioner};
use crate::histogram::{HistAccumulator, HistKey, Histogram};
use crate::selector::Selector;
use crate::split::{find_col_split, SplitParams};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thicket_core::{
    AccFloat, ColKind, HistogramType, IdPrim, JaggedBlock, Result,
};

/// Everything the local build needs for one depth.
pub struct HistContext<'a, T, N, H> {
    pub data: &'a PartDataset<SampleBlock<T, H>>,
    pub node_ids: &'a PartDataset<JaggedBlock<N>>,
    pub raw_size: usize,
    pub num_bins: usize,
    pub num_cols: u32,
    pub num_trees: usize,
    pub col_selector: Selector,
    pub row_selector: Selector,
    pub col_kinds: Arc<Vec<ColKind>>,
    pub params: SplitParams,
    pub num_partitions: usize,
    pub col_rate_tree: f64,
    pub col_rate_node: f64,
    pub min_node_hess: f64,
}

type HistDataset<T, N, H> = PartDataset<(HistKey<T, N>, Histogram<H>)>;

/// Per-partition histogram build over rows passing `node_filter`.
fn local_histograms<T: IdPrim, N: IdPrim, H: AccFloat>(
    ctx: &HistContext<'_, T, N, H>,
    node_filter: impl Fn(u64) -> bool + Sync,
) -> HistDataset<T, N, H> {
    let num_bins = ctx.num_bins;
    let num_cols = ctx.num_cols;
    let num_trees = ctx.num_trees;
    let raw_size = ctx.raw_size;
    let col_selector = ctx.col_selector.clone();
    let row_selector = ctx.row_selector.clone();

    ctx.data.zip_map_partitions(ctx.node_ids, move |p, blocks, nodes| {
        // Column sampling is per base tree; resolve it once.
        let col_mask: Vec<Vec<bool>> = (0..num_trees)
            .map(|t| {
                (0..num_cols)
                    .map(|c| col_selector.contains(t, c as u64))
                    .collect()
            })
            .collect();
        let col_list: Vec<Vec<u32>> = col_mask
            .iter()
            .map(|mask| {
                mask.iter()
                    .enumerate()
                    .filter(|(_, &m)| m)
                    .map(|(c, _)| c as u32)
                    .collect()
            })
            .collect();

        let mut acc: BTreeMap<HistKey<T, N>, HistAccumulator<H>> = BTreeMap::new();
        let mut totals: BTreeMap<(T, N), (H, H)> = BTreeMap::new();

        for (b, (block, node_block)) in blocks.iter().zip(nodes.iter()).enumerate() {
            for i in 0..block.num_rows() {
                let trees = block.tree_ids.row(i);
                let row_nodes = node_block.row(i);
                let grads = block.grads.row(i);
                let bins = block.bins.row(i);
                for (j, &tree) in trees.iter().enumerate() {
                    let node = row_nodes[j];
                    if !node_filter(node.to_usize() as u64) {
                        continue;
                    }
                    let t = tree.to_usize();
                    if !row_selector.contains(t, row_key(p, b, i)) {
                        continue;
                    }
                    let g = grads[2 * (t % raw_size)];
                    let h = grads[2 * (t % raw_size) + 1];
                    let entry = totals.entry((tree, node)).or_insert((H::zero(), H::zero()));
                    entry.0 = entry.0.add(g);
                    entry.1 = entry.1.add(h);
                    for (col, bin) in bins.active_iter() {
                        if !col_mask[t][col as usize] {
                            continue;
                        }
                        acc.entry(HistKey::new(tree, node, col))
                            .or_insert_with(|| HistAccumulator::new(num_bins))
                            .add(bin, g, h);
                    }
                }
            }
        }

        // Node totals flow into every selected column so the zero
        // bucket can be recovered by the finish fixup.
        for (&(tree, node), &(g, h)) in &totals {
            for &col in &col_list[tree.to_usize()] {
                acc.entry(HistKey::new(tree, node, col))
                    .or_insert_with(|| HistAccumulator::new(num_bins))
                    .add_total(g, h);
            }
        }

        acc.into_iter().map(|(k, a)| (k, a.finish())).collect()
    })
}

/// Drop histograms that cannot split further: nodes whose hessian mass
/// cannot cover two children, or columns with at most one active bin.
fn prune<T: IdPrim, N: IdPrim, H: AccFloat>(
    hists: &HistDataset<T, N, H>,
    min_node_hess: f64,
) -> HistDataset<T, N, H> {
    let floor = 2.0 * min_node_hess;
    hists.map_partitions(move |_, items| {
        items
            .iter()
            .filter(|(_, h)| h.total_hess() >= floor && h.nnz() > 2)
            .cloned()
            .collect()
    })
}

/// Histogram computation driver; owns the retained parent level under
/// the subtract strategy.
pub struct HistogramComputer<T: IdPrim, N: IdPrim, H: AccFloat> {
    strategy: HistogramType,
    vote_top_k: usize,
    spill: Arc<SpillDir>,
    checkpointer: Checkpointer,
    parents: Option<(HistDataset<T, N, H>, HistPartitioner<T, N>)>,
}

impl<T: IdPrim, N: IdPrim, H: AccFloat> HistogramComputer<T, N, H> {
    pub fn new(strategy: HistogramType, vote_top_k: usize, spill: Arc<SpillDir>) -> Self {
        Self {
            strategy,
            vote_top_k,
            spill,
            checkpointer: Checkpointer::new(1, 1),
            parents: None,
        }
    }

    /// Histograms for every `(tree, node)` in `growable` at `depth`.
    pub fn compute(
        &mut self,
        ctx: &HistContext<'_, T, N, H>,
        depth: u32,
        growable: &[(T, N)],
    ) -> Result<HistDataset<T, N, H>> {
        let mut trees: Vec<T> = growable.iter().map(|(t, _)| *t).collect();
        trees.sort_unstable();
        trees.dedup();
        let partitioner = select_partitioner::<T, N>(
            ctx.num_partitions,
            depth,
            trees,
            ctx.num_cols,
            ctx.col_rate_tree,
            ctx.col_rate_node,
        );

        match self.strategy {
            HistogramType::Basic => {
                let level_floor = 1u64 << depth;
                let local = local_histograms(ctx, move |n| n >= level_floor);
                Ok(reduce(local, &partitioner))
            }
            HistogramType::Subtract => self.compute_subtract(ctx, depth, growable, partitioner),
            HistogramType::Vote => self.compute_vote(ctx, depth, growable, partitioner),
        }
    }

    fn compute_subtract(
        &mut self,
        ctx: &HistContext<'_, T, N, H>,
        depth: u32,
        growable: &[(T, N)],
        partitioner: HistPartitioner<T, N>,
    ) -> Result<HistDataset<T, N, H>> {
        // Subtraction joins parents with right children partition-wise,
        // so the partitioner must ignore the node id (or fold it onto a
        // shallower ancestor). A full-key hash would scatter siblings.
        let partitioner = match partitioner {
            HistPartitioner::Hash { num_partitions } => {
                let mut trees: Vec<T> = growable.iter().map(|(t, _)| *t).collect();
                trees.sort_unstable();
                trees.dedup();
                HistPartitioner::SkipNode {
                    num_partitions,
                    num_cols: ctx.num_cols,
                    trees,
                }
            }
            other => other,
        };
        if depth == 0 {
            let local = local_histograms(ctx, |n| n == 1);
            let roots = prune(&reduce(local, &partitioner), ctx.min_node_hess);
            self.retain_parents(roots.clone(), partitioner, depth)?;
            return Ok(roots);
        }

        // Build right children only; left siblings come from parents.
        let level_floor = 1u64 << depth;
        let local = local_histograms(ctx, move |n| n >= level_floor && n % 2 == 1);
        let rights = reduce(local, &partitioner);

        let (parents, parent_partitioner) = self
            .parents
            .take()
            .ok_or_else(|| thicket_core::GbmError::Internal("subtract lost parent level".into()))?;
        // Keys keep their placement when the partitioner is unchanged;
        // otherwise the parent level reshuffles once.
        let parents = if parent_partitioner == partitioner {
            parents
        } else {
            reduce(parents, &partitioner)
        };

        let wanted: HashSet<(T, N)> = growable.iter().copied().collect();
        let derived = parents.zip_map_partitions(&rights, move |_, parent_items, right_items| {
            let right_map: HashMap<&HistKey<T, N>, &Histogram<H>> =
                right_items.iter().map(|(k, h)| (k, h)).collect();
            let mut out: Vec<(HistKey<T, N>, Histogram<H>)> = Vec::new();
            for (pkey, phist) in parent_items {
                let parent_node = pkey.node.to_usize();
                let left = N::from_usize(2 * parent_node);
                let right = N::from_usize(2 * parent_node + 1);
                let right_key = HistKey::new(pkey.tree, right, pkey.col);
                let right_hist = right_map
                    .get(&right_key)
                    .map(|h| (*h).clone())
                    .unwrap_or_else(Histogram::empty);
                if wanted.contains(&(pkey.tree, left)) {
                    out.push((
                        HistKey::new(pkey.tree, left, pkey.col),
                        phist.minus(&right_hist),
                    ));
                }
                if wanted.contains(&(pkey.tree, right)) {
                    out.push((right_key, right_hist));
                }
            }
            out.sort_by(|a, b| a.0.cmp(&b.0));
            out
        });

        let level = prune(&derived, ctx.min_node_hess);
        self.retain_parents(level.clone(), partitioner, depth)?;
        Ok(level)
    }

    fn retain_parents(
        &mut self,
        level: HistDataset<T, N, H>,
        partitioner: HistPartitioner<T, N>,
        depth: u32,
    ) -> Result<()> {
        let retained = self
            .checkpointer
            .update(&level, depth as usize, &self.spill)?
            .unwrap_or(level);
        self.parents = Some((retained, partitioner));
        Ok(())
    }

    fn compute_vote(
        &mut self,
        ctx: &HistContext<'_, T, N, H>,
        depth: u32,
        growable: &[(T, N)],
        fallback: HistPartitioner<T, N>,
    ) -> Result<HistDataset<T, N, H>> {
        let level_floor = 1u64 << depth;
        let local = local_histograms(ctx, move |n| n >= level_floor);

        // Round one: each worker elects its top-K columns per node.
        let top_k = self.vote_top_k;
        let params = ctx.params;
        let col_kinds = Arc::clone(&ctx.col_kinds);
        let ballots = local.map_partitions(move |_, items| {
            let mut by_node: BTreeMap<(T, N), Vec<(f64, u32)>> = BTreeMap::new();
            for (key, hist) in items {
                let gain = find_col_split(key.col, col_kinds[key.col as usize], hist, &params)
                    .map(|s| s.gain)
                    .unwrap_or(f64::NEG_INFINITY);
                by_node
                    .entry((key.tree, key.node))
                    .or_default()
                    .push((gain, key.col));
            }
            by_node
                .into_iter()
                .map(|(node, mut gains)| {
                    gains.sort_by(|a, b| {
                        b.0.partial_cmp(&a.0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.1.cmp(&b.1))
                    });
                    let cols: Vec<u32> = gains.into_iter().take(top_k).map(|(_, c)| c).collect();
                    (node, cols)
                })
                .collect()
        });

        // Round two: one vote per worker per column, top 2K survive.
        let mut counts: BTreeMap<(T, N), BTreeMap<u32, u32>> = BTreeMap::new();
        for (node, cols) in ballots.collect() {
            let entry = counts.entry(node).or_default();
            for col in cols {
                *entry.entry(col).or_insert(0) += 1;
            }
        }
        let winners: HashMap<(T, N), HashSet<u32>> = counts
            .into_iter()
            .map(|(node, votes)| {
                let mut ranked: Vec<(u32, u32)> = votes.into_iter().collect();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                let keep: HashSet<u32> =
                    ranked.into_iter().take(2 * top_k).map(|(c, _)| c).collect();
                (node, keep)
            })
            .collect();
        let winners = Broadcast::new(winners);

        // Only surviving keys are globally reduced, under a range
        // partitioner over the known active node set.
        let filtered = {
            let winners = winners.clone();
            local.map_partitions(move |_, items| {
                items
                    .iter()
                    .filter(|(key, _)| {
                        winners
                            .get(&(key.tree, key.node))
                            .is_some_and(|cols| cols.contains(&key.col))
                    })
                    .cloned()
                    .collect()
            })
        };
        let mut keys: Vec<(T, N)> = growable.to_vec();
        keys.sort_unstable();
        let partitioner = HistPartitioner::Range {
            num_partitions: fallback.num_partitions(),
            num_cols: ctx.num_cols,
            keys,
        };
        Ok(reduce(filtered, &partitioner))
    }

    /// Release retained parent checkpoints.
    pub fn clear(&mut self, blocking: bool) -> Result<()> {
        self.parents = None;
        self.checkpointer.clear(blocking)
    }
}

fn reduce<T: IdPrim, N: IdPrim, H: AccFloat>(
    hists: HistDataset<T, N, H>,
    partitioner: &HistPartitioner<T, N>,
) -> HistDataset<T, N, H> {
    hists.reduce_by_key(
        partitioner.num_partitions(),
        |key| partitioner.partition(key),
        |a, b| a.plus(&b),
    )
}
