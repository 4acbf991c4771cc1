//! Level-wise tree growing
//!
//! Each round grows `forest_size * raw_size` trees together through a
//! breadth-first level loop: refresh per-row node ids, compute the
//! level's histograms, pick splits, and adopt them subject to the
//! leaf budget. Node ids follow `root = 1, left = 2n, right = 2n + 1`.

use crate::data::SampleBlock;
use crate::deterministic::hash_parts;
use crate::exec::broadcast::Broadcast;
use crate::exec::dataset::{PartDataset, SpillDir};
use crate::hist_compute::{HistContext, HistogramComputer};
use crate::selector::Selector;
use crate::split::{better_of, find_col_split, Split, SplitParams};
use std::collections::BTreeMap;
use std::sync::Arc;
use thicket_core::{
    AccFloat, ArrayBlock, BoostConfig, ColKind, HistogramType, IdPrim, JaggedBlock, ObjFunc,
    Result, TreeModel, TreeNode,
};
use tracing::debug;

/// Shared environment of one growing round.
pub struct GrowEnv {
    pub config: BoostConfig,
    pub objective: Arc<dyn ObjFunc>,
    pub col_kinds: Arc<Vec<ColKind>>,
    pub num_cols: u32,
    pub num_bins: usize,
    pub num_partitions: usize,
    pub spill: Arc<SpillDir>,
}

#[derive(Debug, Clone)]
struct LearnNode {
    weight: f64,
    split: Option<Split>,
}

#[derive(Debug, Clone)]
struct TreeState {
    nodes: BTreeMap<u32, LearnNode>,
    num_leaves: u32,
}

impl TreeState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            1,
            LearnNode {
                weight: 0.0,
                split: None,
            },
        );
        Self {
            nodes,
            num_leaves: 1,
        }
    }
}

/// Grow one round of trees over the sampled dataset.
pub fn grow_trees<T: IdPrim, N: IdPrim, H: AccFloat>(
    env: &GrowEnv,
    iteration: usize,
    num_trees: usize,
    data: &PartDataset<SampleBlock<T, H>>,
) -> Result<Vec<TreeModel>> {
    let config = &env.config;
    let params = SplitParams::from(config);
    let raw_size = env.objective.num_outputs();
    let seed = hash_parts(config.base_seed(), &[iteration as u64, 0x67726f77]);

    let mut node_ids: PartDataset<JaggedBlock<N>> = data.map(|block| {
        let mut ids = JaggedBlock::new();
        let root = N::from_usize(1);
        for i in 0..block.num_rows() {
            ids.push_row(&vec![root; block.tree_ids.row(i).len()]);
        }
        ids
    });
    let mut data = data.clone();

    let mut trees: Vec<TreeState> = (0..num_trees).map(|_| TreeState::new()).collect();
    let mut active: Vec<(T, N)> = (0..num_trees)
        .map(|t| (T::from_usize(t), N::from_usize(1)))
        .collect();

    let mut computer: HistogramComputer<T, N, H> = HistogramComputer::new(
        config.histogram_type,
        config.vote_top_k,
        Arc::clone(&env.spill),
    );

    let tree_col_selector = Selector::hash(
        hash_parts(seed, &[0x636f_6c74]),
        config.col_sample_rate_by_tree,
    );

    for depth in 0..config.max_depth {
        if active.is_empty() {
            break;
        }

        let col_selector = Selector::union(
            tree_col_selector.clone(),
            Selector::hash(
                hash_parts(seed, &[0x636f_6c6e, depth as u64]),
                config.col_sample_rate_by_node,
            ),
        );
        // Subtraction derives left children from parent histograms, so
        // the node-level row subset must not change between depths.
        let row_depth = if config.histogram_type == HistogramType::Subtract {
            0
        } else {
            depth as u64
        };
        let row_selector = Selector::hash(
            hash_parts(seed, &[0x726f_776e, row_depth]),
            config.sub_sample_rate_by_node,
        );

        let ctx = HistContext {
            data: &data,
            node_ids: &node_ids,
            raw_size,
            num_bins: env.num_bins,
            num_cols: env.num_cols,
            num_trees,
            col_selector,
            row_selector,
            col_kinds: Arc::clone(&env.col_kinds),
            params,
            num_partitions: env.num_partitions,
            col_rate_tree: config.col_sample_rate_by_tree,
            col_rate_node: config.col_sample_rate_by_node,
            min_node_hess: config.min_node_hess,
        };
        let hists = computer.compute(&ctx, depth, &active)?;

        // Per-column splits reduce to the best split per node; the
        // deterministic tie-break keeps the winner shuffle-invariant.
        let col_kinds = Arc::clone(&env.col_kinds);
        let candidates = hists.map_partitions(move |_, items| {
            items
                .iter()
                .filter_map(|(key, hist)| {
                    find_col_split(key.col, col_kinds[key.col as usize], hist, &params)
                        .map(|s| ((key.tree, key.node), Some(s)))
                })
                .collect::<Vec<_>>()
        });
        let reduced = candidates.reduce_by_key(
            env.num_partitions,
            |(t, n)| hash_parts(0x6e6f_6465, &[t.to_usize() as u64, n.to_usize() as u64]) as usize,
            better_of,
        );
        let splits: BTreeMap<(T, N), Split> = reduced
            .collect()
            .into_iter()
            .filter_map(|(k, s)| s.map(|s| (k, s)))
            .collect();

        // Adopt splits in key order, bounded by the leaf budget.
        let mut routes: BTreeMap<(u32, u32), Split> = BTreeMap::new();
        let mut next_active: Vec<(T, N)> = Vec::new();
        for &(t, n) in &active {
            let Some(split) = splits.get(&(t, n)) else {
                continue;
            };
            let state = &mut trees[t.to_usize()];
            if state.num_leaves + 1 > config.max_leaves {
                continue;
            }
            let id = n.to_usize() as u32;
            let left_weight = split.left_weight(&params);
            let right_weight = split.right_weight(&params);
            if let Some(node) = state.nodes.get_mut(&id) {
                node.split = Some(split.clone());
            }
            state.nodes.insert(
                2 * id,
                LearnNode {
                    weight: left_weight,
                    split: None,
                },
            );
            state.nodes.insert(
                2 * id + 1,
                LearnNode {
                    weight: right_weight,
                    split: None,
                },
            );
            state.num_leaves += 1;
            routes.insert((t.to_usize() as u32, id), split.clone());
            next_active.push((t, N::from_usize(2 * id as usize)));
            next_active.push((t, N::from_usize(2 * id as usize + 1)));
        }
        debug!(
            iteration,
            depth,
            adopted = routes.len(),
            active = active.len(),
            "level expansion"
        );
        if routes.is_empty() {
            break;
        }

        // Route every row to its child node under the adopted splits.
        let routes = Broadcast::new(routes);
        node_ids = data.zip_map_partitions(&node_ids, move |_, blocks, nodes| {
            blocks
                .iter()
                .zip(nodes.iter())
                .map(|(block, node_block)| {
                    let mut updated = JaggedBlock::new();
                    for i in 0..block.num_rows() {
                        let bins = block.bins.row(i);
                        let row: Vec<N> = block
                            .tree_ids
                            .row(i)
                            .iter()
                            .zip(node_block.row(i).iter())
                            .map(|(&t, &n)| {
                                let id = n.to_usize() as u32;
                                match routes.get(&(t.to_usize() as u32, id)) {
                                    Some(split) => {
                                        let bin = bins.get(split.col);
                                        if split.goes_left(bin) {
                                            N::from_usize(2 * id as usize)
                                        } else {
                                            N::from_usize(2 * id as usize + 1)
                                        }
                                    }
                                    None => n,
                                }
                            })
                            .collect();
                        updated.push_row(&row);
                    }
                    updated
                })
                .collect()
        });

        if config.leaf_boosting {
            data = refit_gradients(env, &trees, &data, &node_ids, raw_size);
        }

        active = next_active;
    }

    if let Err(e) = computer.clear(false) {
        debug!(error = %e, "histogram scratch cleanup failed");
    }

    Ok(trees.iter().map(tree_to_model).collect())
}

/// Newton re-fit of the gradients at a level boundary: gradients are
/// recomputed against the raw predictions plus the partial output of
/// the trees grown so far this round.
fn refit_gradients<T: IdPrim, N: IdPrim, H: AccFloat>(
    env: &GrowEnv,
    trees: &[TreeState],
    data: &PartDataset<SampleBlock<T, H>>,
    node_ids: &PartDataset<JaggedBlock<N>>,
    raw_size: usize,
) -> PartDataset<SampleBlock<T, H>> {
    let step = env.config.step_size;
    let objective = Arc::clone(&env.objective);
    let weights: Broadcast<BTreeMap<(u32, u32), f64>> = Broadcast::new(
        trees
            .iter()
            .enumerate()
            .flat_map(|(t, state)| {
                state
                    .nodes
                    .iter()
                    .map(move |(&id, node)| ((t as u32, id), node.weight))
            })
            .collect(),
    );

    data.zip_map_partitions(node_ids, move |_, blocks, nodes| {
        let mut scratch = vec![0.0f64; 2 * raw_size];
        blocks
            .iter()
            .zip(nodes.iter())
            .map(|(block, node_block)| {
                let mut refit = block.clone();
                let mut grads = ArrayBlock::new(2 * raw_size);
                for i in 0..block.num_rows() {
                    let mut raw = block.raw.row(i).to_vec();
                    for (&t, &n) in block.tree_ids.row(i).iter().zip(node_block.row(i).iter()) {
                        let key = (t.to_usize() as u32, n.to_usize() as u32);
                        if let Some(w) = weights.get(&key) {
                            raw[t.to_usize() % raw_size] += step * w;
                        }
                    }
                    objective.compute(block.labels.row(i), &raw, &mut scratch);
                    let weight = block.weights.get(i);
                    let row: Vec<H> =
                        scratch.iter().map(|&v| H::from_f64(weight * v)).collect();
                    grads.push_row(&row);
                }
                refit.grads = grads;
                refit
            })
            .collect()
    })
}

/// Convert the learned node map into a pre-order arena model.
fn tree_to_model(state: &TreeState) -> TreeModel {
    fn emit(state: &TreeState, id: u32, out: &mut Vec<TreeNode>) -> u32 {
        let idx = out.len() as u32;
        let node = &state.nodes[&id];
        match &node.split {
            Some(split) => {
                out.push(TreeNode::Internal {
                    col: split.col,
                    kind: split.kind,
                    data: split.data.clone(),
                    missing_left: split.missing_left,
                    left: 0,
                    right: 0,
                });
                let left = emit(state, 2 * id, out);
                let right = emit(state, 2 * id + 1, out);
                if let TreeNode::Internal {
                    left: l, right: r, ..
                } = &mut out[idx as usize]
                {
                    *l = left;
                    *r = right;
                }
            }
            None => out.push(TreeNode::Leaf {
                weight: node.weight,
            }),
        }
        idx
    }

    let mut nodes = Vec::with_capacity(state.nodes.len());
    emit(state, 1, &mut nodes);
    TreeModel::new(nodes)
}
