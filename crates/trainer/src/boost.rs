//! The boosting loop
//!
//! Composes sampled data, the grower, and the raw-prediction state
//! across iterations. Raw predictions are cumulative per row for
//! `gbtree`; under `dart` each tree's unweighted output is kept
//! separately so dropped contributions subtract without re-predicting.

use crate::data::DataBlock;
use crate::deterministic::{hash_parts, LcgRng};
use crate::exec::broadcast::ResourceCleaner;
use crate::exec::checkpoint::Checkpointer;
use crate::exec::dataset::{PartDataset, SpillDir};
use crate::grower::{grow_trees, GrowEnv};
use crate::sampler::sample_iteration;
use std::collections::BTreeMap;
use std::sync::Arc;
use thicket_core::{
    AccFloat, ArrayBlock, BoostConfig, BoostType, ColKind, Discretizer, EvalFunc, GbmModel,
    IdPrim, JaggedBlock, ObjFunc, Result, StorageLevel, TreeModel,
};
use tracing::{debug, info};

/// Width-independent inputs assembled before dispatch.
pub struct FitContext {
    pub config: BoostConfig,
    pub objective: Arc<dyn ObjFunc>,
    pub evals: Vec<Arc<dyn EvalFunc>>,
    pub discretizer: Discretizer,
    pub raw_base: Vec<f64>,
    pub col_kinds: Arc<Vec<ColKind>>,
    pub train: PartDataset<DataBlock>,
    pub valid: Option<PartDataset<DataBlock>>,
    pub num_partitions: usize,
    pub spill: Arc<SpillDir>,
}

/// Outcome of one callback invocation.
#[derive(Debug, Default)]
pub struct CallbackAction {
    pub stop: bool,
    /// Replacement hyperparameters taking effect next iteration
    pub config: Option<BoostConfig>,
}

/// Per-iteration observer; sees deep-copied snapshots only.
pub trait Callback: Send {
    fn after_iteration(&mut self, ctx: &IterationContext<'_>) -> CallbackAction;
}

/// Snapshot handed to callbacks after each iteration.
pub struct IterationContext<'a> {
    pub iteration: usize,
    pub config: &'a BoostConfig,
    pub model: &'a GbmModel,
    pub train_metrics: &'a [BTreeMap<String, f64>],
    pub valid_metrics: &'a [BTreeMap<String, f64>],
}

/// Per-tree raw outputs, cumulative (`gbtree`) or separated (`dart`).
enum RawState {
    Agg(PartDataset<ArrayBlock<f64>>),
    PerTree(PartDataset<JaggedBlock<f64>>),
}

/// DART dropout: which existing trees sit out this iteration.
fn dart_drop(config: &BoostConfig, num_existing: usize, iteration: usize) -> Vec<usize> {
    if config.boost_type != BoostType::Dart || num_existing == 0 {
        return Vec::new();
    }
    let mut rng = LcgRng::new(hash_parts(
        config.base_seed(),
        &[iteration as u64, 0x6461_7274],
    ));
    if rng.next_unit() < config.drop_skip {
        return Vec::new();
    }
    let hit = (0..num_existing)
        .filter(|_| rng.next_unit() < config.drop_rate)
        .count();
    let cap = config.max_drop.min(num_existing);
    if cap == 0 {
        return Vec::new();
    }
    let k = hit.clamp(config.min_drop.min(cap), cap).max(1);
    rng.choose(num_existing, k)
}

/// The generic boosting loop, instantiated per id/float width.
pub fn boost_loop<T: IdPrim, N: IdPrim, H: AccFloat>(
    ctx: &FitContext,
    callbacks: &mut [Box<dyn Callback>],
) -> Result<GbmModel> {
    let mut config = ctx.config.clone();
    let objective = Arc::clone(&ctx.objective);
    let raw_size = objective.num_outputs();
    let dart = config.boost_type == BoostType::Dart;

    let mut trees: Vec<TreeModel> = Vec::new();
    let mut weights: Vec<f64> = Vec::new();
    let mut train_metrics: Vec<BTreeMap<String, f64>> = Vec::new();
    let mut valid_metrics: Vec<BTreeMap<String, f64>> = Vec::new();

    let raw_base = Arc::new(ctx.raw_base.clone());
    let mut train_raw = init_raw(&ctx.train, &raw_base, dart);
    let mut valid_raw = ctx.valid.as_ref().map(|v| init_raw(v, &raw_base, dart));

    let cleaner = ResourceCleaner::new();
    let mut checkpointer = Checkpointer::new(config.checkpoint_interval, 2);
    let mut train_raw_files: Vec<std::path::PathBuf> = Vec::new();
    let mut valid_raw_files: Vec<std::path::PathBuf> = Vec::new();

    let mut best_metric: Option<f64> = None;
    let mut since_best = 0usize;

    let result = (|| -> Result<()> {
        for iteration in 0..config.max_iter {
            let num_trees_round = config.num_trees_per_round(raw_size);

            // DART: gradients come from the ensemble minus the dropped
            // trees; gbtree folds everything in.
            let dropped = dart_drop(&config, trees.len(), iteration);
            let k = dropped.len();
            let raw_eff = effective_raw(&train_raw, &raw_base, &weights, &dropped, raw_size);

            let sampled = sample_iteration::<T, H>(
                &ctx.train,
                &raw_eff,
                &objective,
                &config,
                iteration,
                num_trees_round,
            );
            let sampled = sampled.persist(config.storage_level1, &ctx.spill)?;
            cleaner.register_files(sampled.spill_files());

            let env = GrowEnv {
                config: config.clone(),
                objective: Arc::clone(&objective),
                col_kinds: Arc::clone(&ctx.col_kinds),
                num_cols: ctx.discretizer.num_cols(),
                num_bins: config.max_bins as usize,
                num_partitions: ctx.num_partitions,
                spill: Arc::clone(&ctx.spill),
            };
            let new_trees = grow_trees::<T, N, H>(&env, iteration, num_trees_round, &sampled)?;

            if new_trees.iter().all(|t| !t.has_splits()) {
                info!(iteration, "no tree split its root; finishing early");
                break;
            }

            // Empty trees stay as zero-weight leaves so the tree-index
            // to output mapping survives.
            let new_weight = if k > 0 {
                let scale = k as f64 / (k + 1) as f64;
                for &d in &dropped {
                    weights[d] *= scale;
                }
                config.step_size / (k + 1) as f64
            } else {
                config.step_size
            };
            let new_trees = Arc::new(new_trees);
            let added: Vec<f64> = vec![new_weight; new_trees.len()];

            train_raw = append_raw(&train_raw, &ctx.train, &new_trees, &added, raw_size);
            train_raw = persist_raw(
                &train_raw,
                config.storage_level2,
                &ctx.spill,
                &cleaner,
                &mut train_raw_files,
            )?;
            if let (Some(raw), Some(valid)) = (&valid_raw, &ctx.valid) {
                let appended = append_raw(raw, valid, &new_trees, &added, raw_size);
                valid_raw = Some(persist_raw(
                    &appended,
                    config.storage_level3,
                    &ctx.spill,
                    &cleaner,
                    &mut valid_raw_files,
                )?);
            }

            trees.extend(new_trees.iter().cloned());
            weights.extend(added);

            // Metric histories over the full ensemble.
            let train_m = evaluate(
                &ctx.train,
                &full_raw(&train_raw, &raw_base, &weights, raw_size),
                &objective,
                &ctx.evals,
            );
            info!(
                iteration,
                trees = trees.len(),
                dropped = k,
                metrics = ?train_m,
                "boosting iteration complete"
            );
            train_metrics.push(train_m);
            if let (Some(raw), Some(valid)) = (&valid_raw, &ctx.valid) {
                valid_metrics.push(evaluate(
                    valid,
                    &full_raw(raw, &raw_base, &weights, raw_size),
                    &objective,
                    &ctx.evals,
                ));
            }

            // Callbacks observe deep copies and may stop or republish
            // the configuration for the next iteration.
            let snapshot = GbmModel::new(
                objective.name().to_string(),
                ctx.raw_base.clone(),
                ctx.discretizer.clone(),
                trees.clone(),
                weights.clone(),
                iteration + 1,
            );
            let mut stop = false;
            for callback in callbacks.iter_mut() {
                let action = callback.after_iteration(&IterationContext {
                    iteration,
                    config: &config,
                    model: &snapshot,
                    train_metrics: &train_metrics,
                    valid_metrics: &valid_metrics,
                });
                stop |= action.stop;
                if let Some(next) = action.config {
                    next.validate()?;
                    config = next;
                }
            }
            if stop {
                info!(iteration, "stopped by callback");
                break;
            }

            if early_stop_hit(
                &config,
                &ctx.evals,
                &valid_metrics,
                &mut best_metric,
                &mut since_best,
            ) {
                info!(iteration, "early stopping triggered");
                break;
            }

            checkpoint_raw(&mut train_raw, &mut checkpointer, iteration, &ctx.spill)?;
            cleaner.clear(false)?;
        }
        Ok(())
    })();

    // Release everything registered this fit, on every exit path.
    if let Err(e) = cleaner.clear(false) {
        debug!(error = %e, "cleaner shutdown failed");
    }
    if let Err(e) = checkpointer.clear(false) {
        debug!(error = %e, "checkpointer shutdown failed");
    }
    result?;

    Ok(GbmModel::new(
        objective.name().to_string(),
        ctx.raw_base.clone(),
        ctx.discretizer.clone(),
        trees,
        weights,
        train_metrics.len(),
    ))
}

fn init_raw(data: &PartDataset<DataBlock>, base: &Arc<Vec<f64>>, dart: bool) -> RawState {
    if dart {
        RawState::PerTree(data.map(|block| {
            let mut rows = JaggedBlock::new();
            for _ in 0..block.num_rows() {
                rows.push_row(&[]);
            }
            rows
        }))
    } else {
        let base = Arc::clone(base);
        RawState::Agg(data.map(move |block| {
            let mut rows = ArrayBlock::new(base.len());
            for _ in 0..block.num_rows() {
                rows.push_row(&base);
            }
            rows
        }))
    }
}

/// Effective raw predictions the gradients derive from: everything
/// minus the dropped trees.
fn effective_raw(
    raw: &RawState,
    base: &Arc<Vec<f64>>,
    weights: &[f64],
    dropped: &[usize],
    raw_size: usize,
) -> PartDataset<ArrayBlock<f64>> {
    match raw {
        RawState::Agg(agg) => agg.clone(),
        RawState::PerTree(per_tree) => {
            let base = Arc::clone(base);
            let weights = weights.to_vec();
            let dropped: Vec<bool> = {
                let mut mask = vec![false; weights.len()];
                for &d in dropped {
                    mask[d] = true;
                }
                mask
            };
            per_tree.map(move |rows| {
                let mut out = ArrayBlock::new(raw_size);
                for i in 0..rows.num_rows() {
                    let mut agg = base.as_ref().clone();
                    for (t, &contribution) in rows.row(i).iter().enumerate() {
                        if !dropped[t] {
                            agg[t % raw_size] += weights[t] * contribution;
                        }
                    }
                    out.push_row(&agg);
                }
                out
            })
        }
    }
}

/// Raw predictions of the whole ensemble, dropped trees included.
fn full_raw(
    raw: &RawState,
    base: &Arc<Vec<f64>>,
    weights: &[f64],
    raw_size: usize,
) -> PartDataset<ArrayBlock<f64>> {
    effective_raw(raw, base, weights, &[], raw_size)
}

/// Fold the new round of trees into the raw state:
/// `R <- R + step * weight * tree(x)` per row for the cumulative form,
/// or appended unweighted outputs for the per-tree form.
fn append_raw(
    raw: &RawState,
    data: &PartDataset<DataBlock>,
    new_trees: &Arc<Vec<TreeModel>>,
    added_weights: &[f64],
    raw_size: usize,
) -> RawState {
    match raw {
        RawState::Agg(agg) => {
            let new_trees = Arc::clone(new_trees);
            let added = added_weights.to_vec();
            RawState::Agg(data.zip_map(agg, move |block, rows| {
                let mut out = ArrayBlock::new(rows.width());
                for i in 0..block.num_rows() {
                    let mut row = rows.row(i).to_vec();
                    let bins = block.bins.row(i);
                    for (j, tree) in new_trees.iter().enumerate() {
                        row[j % raw_size] += added[j] * tree.predict(&bins);
                    }
                    out.push_row(&row);
                }
                out
            }))
        }
        RawState::PerTree(per_tree) => {
            let new_trees = Arc::clone(new_trees);
            RawState::PerTree(data.zip_map(per_tree, move |block, rows| {
                let mut out = JaggedBlock::new();
                for i in 0..block.num_rows() {
                    let bins = block.bins.row(i);
                    let mut row = rows.row(i).to_vec();
                    for tree in new_trees.iter() {
                        row.push(tree.predict(&bins));
                    }
                    out.push_row(&row);
                }
                out
            }))
        }
    }
}

/// Persist a regenerated raw dataset and hand the files of the
/// superseded generation to the cleaner. The live generation's files
/// must outlive the iteration, so only `prev_files` are released.
fn persist_raw(
    raw: &RawState,
    level: StorageLevel,
    spill: &SpillDir,
    cleaner: &ResourceCleaner,
    prev_files: &mut Vec<std::path::PathBuf>,
) -> Result<RawState> {
    let persisted = match raw {
        RawState::Agg(ds) => RawState::Agg(ds.persist(level, spill)?),
        RawState::PerTree(ds) => RawState::PerTree(ds.persist(level, spill)?),
    };
    let files = match &persisted {
        RawState::Agg(ds) => ds.spill_files(),
        RawState::PerTree(ds) => ds.spill_files(),
    };
    cleaner.register_files(std::mem::replace(prev_files, files));
    Ok(persisted)
}

fn checkpoint_raw(
    raw: &mut RawState,
    checkpointer: &mut Checkpointer,
    iteration: usize,
    spill: &SpillDir,
) -> Result<()> {
    match raw {
        RawState::Agg(ds) => {
            if let Some(checkpointed) = checkpointer.update(ds, iteration, spill)? {
                *ds = checkpointed;
            }
        }
        RawState::PerTree(ds) => {
            if let Some(checkpointed) = checkpointer.update(ds, iteration, spill)? {
                *ds = checkpointed;
            }
        }
    }
    Ok(())
}

/// Weighted metric sweep over `(label, transformed prediction)` rows.
fn evaluate(
    data: &PartDataset<DataBlock>,
    raw: &PartDataset<ArrayBlock<f64>>,
    objective: &Arc<dyn ObjFunc>,
    evals: &[Arc<dyn EvalFunc>],
) -> BTreeMap<String, f64> {
    if evals.is_empty() {
        return BTreeMap::new();
    }
    let objective = Arc::clone(objective);
    let evals_owned: Vec<Arc<dyn EvalFunc>> = evals.to_vec();
    let partials = data.zip_map_partitions(raw, move |_, blocks, raws| {
        let mut sums = vec![(0.0f64, 0.0f64); evals_owned.len()];
        for (block, raw_block) in blocks.iter().zip(raws.iter()) {
            let mut pred = vec![0.0; raw_block.width()];
            for i in 0..block.num_rows() {
                objective.transform(raw_block.row(i), &mut pred);
                for (e, eval) in evals_owned.iter().enumerate() {
                    let (v, w) = eval.accumulate(block.weights.get(i), block.labels.row(i), &pred);
                    sums[e].0 += v;
                    sums[e].1 += w;
                }
            }
        }
        vec![sums]
    });
    let mut totals = vec![(0.0f64, 0.0f64); evals.len()];
    for sums in partials.collect() {
        for (t, s) in totals.iter_mut().zip(sums.iter()) {
            t.0 += s.0;
            t.1 += s.1;
        }
    }
    evals
        .iter()
        .zip(totals.iter())
        .map(|(eval, &(sum, weight))| (eval.name().to_string(), eval.finalize(sum, weight)))
        .collect()
}

/// Track the designated validation metric; true when it has not
/// improved for `early_stop_iters` iterations.
fn early_stop_hit(
    config: &BoostConfig,
    evals: &[Arc<dyn EvalFunc>],
    valid_metrics: &[BTreeMap<String, f64>],
    best: &mut Option<f64>,
    since_best: &mut usize,
) -> bool {
    if config.early_stop_iters < 1 || evals.is_empty() {
        return false;
    }
    let Some(latest) = valid_metrics.last() else {
        return false;
    };
    let eval = &evals[0];
    let Some(&value) = latest.get(eval.name()) else {
        return false;
    };
    let improved = match *best {
        None => true,
        Some(b) => {
            if eval.is_larger_better() {
                value > b
            } else {
                value < b
            }
        }
    };
    if improved {
        *best = Some(value);
        *since_best = 0;
        false
    } else {
        *since_best += 1;
        *since_best >= config.early_stop_iters as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dart_drop_skip_disables() {
        let config = BoostConfig {
            boost_type: BoostType::Dart,
            drop_skip: 1.0,
            drop_rate: 0.5,
            ..BoostConfig::default()
        };
        for i in 0..20 {
            assert!(dart_drop(&config, 10, i).is_empty());
        }
    }

    #[test]
    fn test_dart_drop_bounds() {
        let config = BoostConfig {
            boost_type: BoostType::Dart,
            drop_skip: 0.0,
            drop_rate: 0.5,
            min_drop: 1,
            max_drop: 3,
            ..BoostConfig::default()
        };
        for i in 0..20 {
            let dropped = dart_drop(&config, 10, i);
            assert!(!dropped.is_empty() && dropped.len() <= 3);
            assert!(dropped.windows(2).all(|w| w[0] < w[1]));
            assert!(dropped.iter().all(|&d| d < 10));
        }
    }

    #[test]
    fn test_dart_drop_gbtree_never_drops() {
        let config = BoostConfig {
            drop_skip: 0.0,
            drop_rate: 1.0,
            ..BoostConfig::default()
        };
        assert!(dart_drop(&config, 10, 0).is_empty());
    }
}
