//! Persisted GBDT ensemble
//!
//! A [`GbmModel`] bundles the fitted discretizer, the tree arena, the
//! per-tree ensemble weights (step size folded in at append time), and
//! the raw base score. Serialization is canonical JSON hashed with
//! blake3 so identical training runs produce identical artifacts.

use crate::bin::BinSlice;
use crate::discretizer::Discretizer;
use crate::errors::{GbmError, Result};
use crate::objective::objective_by_name;
use crate::serde_canon::{hash_canonical_hex, to_canonical_json};
use crate::tree::TreeModel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Auxiliary model facts kept alongside the ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub num_cols: u32,
    pub trained_iters: usize,
}

/// A trained gradient-boosted ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbmModel {
    /// Model format version (1)
    pub version: u32,

    /// Name of the training objective, resolvable via
    /// [`objective_by_name`](crate::objective::objective_by_name)
    pub objective: String,

    /// Base score in raw (pre-link) space, one entry per output
    pub raw_base: Vec<f64>,

    /// Fitted column discretizer
    pub discretizer: Discretizer,

    /// Trees in training order; tree `i` contributes to output
    /// `i % raw_base.len()`
    pub trees: Vec<TreeModel>,

    /// Ensemble weight per tree (step size and DART weight folded)
    pub weights: Vec<f64>,

    pub metadata: ModelMeta,
}

impl GbmModel {
    pub fn new(
        objective: String,
        raw_base: Vec<f64>,
        discretizer: Discretizer,
        trees: Vec<TreeModel>,
        weights: Vec<f64>,
        trained_iters: usize,
    ) -> Self {
        let num_cols = discretizer.num_cols();
        Self {
            version: 1,
            objective,
            raw_base,
            discretizer,
            trees,
            weights,
            metadata: ModelMeta {
                num_cols,
                trained_iters,
            },
        }
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Raw outputs per instance.
    pub fn raw_size(&self) -> usize {
        self.raw_base.len()
    }

    /// Raw (pre-link) prediction from an already-binned row.
    pub fn predict_raw_bins(&self, bins: &BinSlice<'_>) -> Vec<f64> {
        let raw_size = self.raw_size();
        let mut out = self.raw_base.clone();
        for (i, (tree, &w)) in self.trees.iter().zip(self.weights.iter()).enumerate() {
            out[i % raw_size] += w * tree.predict(bins);
        }
        out
    }

    /// Raw (pre-link) prediction from a raw feature row.
    pub fn predict_raw(&self, features: &[f64]) -> Result<Vec<f64>> {
        let bins = self.discretizer.transform(features)?;
        Ok(self.predict_raw_bins(&bins.as_slice()))
    }

    /// Transformed prediction from a raw feature row.
    pub fn predict(&self, features: &[f64]) -> Result<Vec<f64>> {
        let obj = objective_by_name(&self.objective)?;
        let raw = self.predict_raw(features)?;
        let mut out = vec![0.0; raw.len()];
        obj.transform(&raw, &mut out);
        Ok(out)
    }

    /// Per-tree leaf indices for a raw feature row.
    pub fn predict_leaves(&self, features: &[f64]) -> Result<Vec<u32>> {
        let bins = self.discretizer.transform(features)?;
        let slice = bins.as_slice();
        Ok(self.trees.iter().map(|t| t.leaf_index(&slice)).collect())
    }

    /// One-hot leaf encoding: one block of `num_nodes` slots per tree
    /// with a single 1.0 at the reached leaf's arena index.
    pub fn predict_leaves_one_hot(&self, features: &[f64]) -> Result<Vec<f64>> {
        let leaves = self.predict_leaves(features)?;
        let total: usize = self.trees.iter().map(|t| t.num_nodes()).sum();
        let mut out = vec![0.0; total];
        let mut offset = 0usize;
        for (tree, &leaf) in self.trees.iter().zip(leaves.iter()) {
            out[offset + leaf as usize] = 1.0;
            offset += tree.num_nodes();
        }
        Ok(out)
    }

    /// Validate model structure and plug-in bindings.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(GbmError::InvalidModel(format!(
                "unsupported model version {}",
                self.version
            )));
        }
        objective_by_name(&self.objective)?;
        if self.raw_base.is_empty() || self.raw_base.iter().any(|v| !v.is_finite()) {
            return Err(GbmError::InvalidModel(
                "raw base score must be non-empty and finite".into(),
            ));
        }
        if self.trees.len() != self.weights.len() {
            return Err(GbmError::InvalidModel(format!(
                "{} trees but {} weights",
                self.trees.len(),
                self.weights.len()
            )));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate()
                .map_err(|e| GbmError::InvalidModel(format!("tree {i}: {e}")))?;
        }
        Ok(())
    }

    /// Serialize to canonical JSON.
    pub fn to_canonical_json(&self) -> Result<String> {
        to_canonical_json(self)
    }

    /// Blake3 hash of the canonical JSON representation, hex encoded.
    pub fn hash_hex(&self) -> Result<String> {
        hash_canonical_hex(self)
    }

    /// Save as canonical JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_canonical_json()?)?;
        Ok(())
    }

    /// Load and validate.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let model: GbmModel = serde_json::from_str(&json)?;
        model.validate()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretizer::ColKind;
    use crate::tree::{SplitData, SplitKind, TreeNode};

    fn fitted_discretizer() -> Discretizer {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Numeric],
            8,
            false,
            false,
        )
        .unwrap()
    }

    fn sample_model() -> GbmModel {
        let tree = TreeModel::new(vec![
            TreeNode::Internal {
                col: 0,
                kind: SplitKind::Numeric,
                data: SplitData::Threshold(3),
                missing_left: true,
                left: 1,
                right: 2,
            },
            TreeNode::Leaf { weight: -1.0 },
            TreeNode::Leaf { weight: 1.0 },
        ]);
        GbmModel::new(
            "square".into(),
            vec![5.0],
            fitted_discretizer(),
            vec![tree],
            vec![0.5],
            1,
        )
    }

    #[test]
    fn test_predict_adds_weighted_trees() {
        let model = sample_model();
        let low = model.predict(&[0.0]).unwrap();
        let high = model.predict(&[9.0]).unwrap();
        assert_eq!(low, vec![5.0 - 0.5]);
        assert_eq!(high, vec![5.0 + 0.5]);
    }

    #[test]
    fn test_leaf_indices() {
        let model = sample_model();
        assert_eq!(model.predict_leaves(&[0.0]).unwrap(), vec![1]);
        assert_eq!(model.predict_leaves(&[9.0]).unwrap(), vec![2]);
        let hot = model.predict_leaves_one_hot(&[9.0]).unwrap();
        assert_eq!(hot, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_save_load_round_trip() {
        use tempfile::NamedTempFile;

        let model = sample_model();
        let file = NamedTempFile::new().unwrap();
        model.save_json(file.path()).unwrap();
        let loaded = GbmModel::load_json(file.path()).unwrap();
        assert_eq!(model, loaded);
        assert_eq!(model.hash_hex().unwrap(), loaded.hash_hex().unwrap());
        assert_eq!(
            model.predict(&[7.0]).unwrap(),
            loaded.predict(&[7.0]).unwrap()
        );
    }

    #[test]
    fn test_validate_catches_weight_mismatch() {
        let mut model = sample_model();
        model.weights.push(1.0);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_unknown_objective_rejected() {
        let mut model = sample_model();
        model.objective = "poisson".into();
        assert!(model.validate().is_err());
    }
}
