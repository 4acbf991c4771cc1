//! Goss sampling properties
//!
//! The re-weighting of subsampled low-gradient rows must keep the
//! gradient sum an (approximately) unbiased estimate of the full sum.

use proptest::prelude::*;
use thicket_core::{ArrayBlock, BinVector, BoostConfig, CompactArray, KVMatrix, SubSampleType};
use thicket_trainer::data::DataBlock;
use thicket_trainer::exec::dataset::PartDataset;
use thicket_trainer::sampler::sample_iteration;
use thicket_trainer::Selector;

const ROWS: usize = 5000;

fn goss_inputs() -> (PartDataset<DataBlock>, PartDataset<ArrayBlock<f64>>, f64) {
    let mut blocks = Vec::new();
    let mut raws = Vec::new();
    let mut full_grad_sum = 0.0;
    for chunk in (0..ROWS).collect::<Vec<_>>().chunks(1024) {
        let mut bins = KVMatrix::new(1);
        let mut labels = ArrayBlock::new(1);
        let mut weights = Vec::new();
        let mut raw = ArrayBlock::new(1);
        for &i in chunk {
            // Square loss at raw 0 gives grad = -label.
            let label = 1.0 + (i % 100) as f64 / 100.0;
            full_grad_sum += -label;
            bins.push_row(BinVector::from_dense(&[1 + (i % 7) as u16]).as_slice());
            labels.push_row(&[label]);
            weights.push(1.0);
            raw.push_row(&[0.0]);
        }
        blocks.push(DataBlock {
            bins,
            labels,
            weights: CompactArray::from_vec(weights),
        });
        raws.push(raw);
    }
    (
        PartDataset::from_items(blocks, 3),
        PartDataset::from_items(raws, 3),
        full_grad_sum,
    )
}

fn goss_config(seed: i64) -> BoostConfig {
    BoostConfig {
        sub_sample_type: SubSampleType::Goss,
        top_rate: 0.1,
        other_rate: 0.1,
        seed,
        ..BoostConfig::default()
    }
}

fn sampled_grad_sum(seed: i64) -> f64 {
    let (data, raw, _) = goss_inputs();
    let objective = thicket_core::objective_by_name("square").unwrap();
    let sampled =
        sample_iteration::<u8, f64>(&data, &raw, &objective, &goss_config(seed), 0, 1);
    let mut sum = 0.0;
    for block in sampled.collect() {
        for i in 0..block.num_rows() {
            if !block.tree_ids.row(i).is_empty() {
                sum += block.grads.row(i)[0];
            }
        }
    }
    sum
}

#[test]
fn test_goss_estimate_unbiased_on_average() {
    let (_, _, full) = goss_inputs();
    let mut total_rel_err = 0.0;
    for seed in 0..20 {
        let est = sampled_grad_sum(seed);
        total_rel_err += ((est - full) / full).abs();
    }
    let mean_rel_err = total_rel_err / 20.0;
    assert!(
        mean_rel_err < 0.05,
        "mean relative error {mean_rel_err} across 20 seeds"
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_goss_estimate_stays_close(seed in 0i64..1000) {
        let (_, _, full) = goss_inputs();
        let est = sampled_grad_sum(seed);
        let rel_err = ((est - full) / full).abs();
        prop_assert!(rel_err < 0.15, "seed {}: relative error {}", seed, rel_err);
    }

    #[test]
    fn prop_selector_is_pure(seed in any::<u64>(), key in any::<u64>(), base in 0usize..8) {
        let a = Selector::hash(seed, 0.37);
        let b = Selector::hash(seed, 0.37);
        prop_assert_eq!(a.contains(base, key), b.contains(base, key));
        prop_assert_eq!(a.contains(base, key), a.contains(base, key));
    }
}
