//! Public training surface
//!
//! A [`GbmTrainer`] pairs a validated [`BoostConfig`] with an
//! objective, optional evaluation functions, and callbacks, and fits a
//! [`GbmModel`] from driver-side datasets. Everything width-dependent
//! happens behind the dispatch table.

use crate::boost::{Callback, FitContext};
use crate::data::DataBlock;
use crate::dispatch::dispatch_fit;
use crate::exec::dataset::{PartDataset, SpillDir};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thicket_core::{
    ArrayBlock, BoostConfig, ColKind, CompactArray, Discretizer, EvalFunc, GbmError, GbmModel,
    KVMatrix, ObjFunc, Result,
};
use tracing::info;

/// Driver-side training data: raw feature rows, labels, and optional
/// instance weights.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<Vec<f64>>,
    pub weights: Option<Vec<f64>>,
    pub col_kinds: Vec<ColKind>,
}

impl Dataset {
    pub fn new(
        features: Vec<Vec<f64>>,
        labels: Vec<Vec<f64>>,
        weights: Option<Vec<f64>>,
        col_kinds: Vec<ColKind>,
    ) -> Self {
        Self {
            features,
            labels,
            weights,
            col_kinds,
        }
    }

    /// All-numeric regression data with scalar labels.
    pub fn regression(features: Vec<Vec<f64>>, labels: Vec<f64>) -> Self {
        let num_cols = features.first().map(|r| r.len()).unwrap_or(0);
        Self {
            features,
            labels: labels.into_iter().map(|l| vec![l]).collect(),
            weights: None,
            col_kinds: vec![ColKind::Numeric; num_cols],
        }
    }

    /// Load `feature,...,label` rows from a CSV file; every column is
    /// treated as numeric.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut features = Vec::new();
        let mut labels = Vec::new();
        let mut num_cols = 0usize;
        for (line_idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let values: Vec<f64> = line
                .split(',')
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|_| {
                        GbmError::InvalidData(format!(
                            "line {}: `{}` is not a number",
                            line_idx + 1,
                            s.trim()
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            if values.len() < 2 {
                return Err(GbmError::InvalidData(format!(
                    "line {}: expected at least 2 columns",
                    line_idx + 1
                )));
            }
            if num_cols == 0 {
                num_cols = values.len() - 1;
            } else if values.len() - 1 != num_cols {
                return Err(GbmError::InvalidData(format!(
                    "line {}: expected {} features, got {}",
                    line_idx + 1,
                    num_cols,
                    values.len() - 1
                )));
            }
            labels.push(values[num_cols]);
            features.push(values[..num_cols].to_vec());
        }
        if features.is_empty() {
            return Err(GbmError::InvalidData("dataset is empty".into()));
        }
        Ok(Self::regression(features, labels))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    fn validate(&self, label_width: usize) -> Result<()> {
        if self.is_empty() {
            return Err(GbmError::InvalidData("dataset is empty".into()));
        }
        if self.labels.len() != self.features.len() {
            return Err(GbmError::InvalidData(format!(
                "{} feature rows but {} labels",
                self.features.len(),
                self.labels.len()
            )));
        }
        let num_cols = self.col_kinds.len();
        for (i, row) in self.features.iter().enumerate() {
            if row.len() != num_cols {
                return Err(GbmError::InvalidData(format!(
                    "row {i}: feature dimension mismatch, expected {num_cols}, got {}",
                    row.len()
                )));
            }
        }
        for (i, label) in self.labels.iter().enumerate() {
            if label.len() != label_width {
                return Err(GbmError::InvalidData(format!(
                    "row {i}: label width {}, objective expects {label_width}",
                    label.len()
                )));
            }
            if label.iter().any(|v| !v.is_finite()) {
                return Err(GbmError::InvalidData(format!(
                    "row {i}: label is not finite"
                )));
            }
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.features.len() {
                return Err(GbmError::InvalidData(format!(
                    "{} feature rows but {} weights",
                    self.features.len(),
                    weights.len()
                )));
            }
            if let Some(i) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
                return Err(GbmError::InvalidData(format!(
                    "row {i}: weight must be finite and non-negative"
                )));
            }
        }
        Ok(())
    }
}

/// Engine-level knobs that are not model hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub num_partitions: usize,
    /// Scratch directory for spills and checkpoints; a temporary
    /// directory is created when unset
    pub work_dir: Option<PathBuf>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            num_partitions: rayon::current_num_threads().max(1),
            work_dir: None,
        }
    }
}

/// Gradient-boosting trainer front-end.
pub struct GbmTrainer {
    config: BoostConfig,
    options: TrainOptions,
    objective: Arc<dyn ObjFunc>,
    evals: Vec<Arc<dyn EvalFunc>>,
    callbacks: Vec<Box<dyn Callback>>,
}

impl GbmTrainer {
    pub fn new(config: BoostConfig, objective: Arc<dyn ObjFunc>) -> Self {
        Self {
            config,
            options: TrainOptions::default(),
            objective,
            evals: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: TrainOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an evaluation function; the first one registered is
    /// the early-stopping metric.
    pub fn with_eval(mut self, eval: Arc<dyn EvalFunc>) -> Self {
        self.evals.push(eval);
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Fit an ensemble, optionally tracking a validation set.
    pub fn fit(&mut self, train: &Dataset, valid: Option<&Dataset>) -> Result<GbmModel> {
        self.config.validate()?;
        let raw_size = self.objective.num_outputs();
        train.validate(raw_size)?;
        if let Some(valid) = valid {
            valid.validate(raw_size)?;
            if valid.col_kinds.len() != train.col_kinds.len() {
                return Err(GbmError::InvalidData(
                    "validation set has a different column count".into(),
                ));
            }
        }

        let round = self.config.discretization_round()?;
        let discretizer = Discretizer::fit(
            train.features.iter().map(|r| r.as_slice()),
            &train.col_kinds,
            self.config.max_bins.min(u16::MAX as u32) as u16,
            self.config.zero_as_missing,
            round,
        )?;
        let raw_base = base_score(train, &self.objective);
        info!(
            rows = train.len(),
            cols = train.col_kinds.len(),
            raw_base = ?raw_base,
            "training data discretized"
        );

        // Scratch space lives for the duration of this fit.
        let scratch = match &self.options.work_dir {
            Some(dir) => tempfile::Builder::new()
                .prefix("thicket-fit")
                .tempdir_in(dir),
            None => tempfile::Builder::new().prefix("thicket-fit").tempdir(),
        }
        .map_err(|e| GbmError::Checkpoint(format!("scratch dir: {e}")))?;
        let spill = Arc::new(SpillDir::new(scratch.path().to_path_buf())?);

        let num_partitions = self.options.num_partitions.max(1);
        let ctx = FitContext {
            config: self.config.clone(),
            objective: Arc::clone(&self.objective),
            evals: self.evals.clone(),
            discretizer: discretizer.clone(),
            raw_base,
            col_kinds: Arc::new(train.col_kinds.clone()),
            train: make_blocks(train, &discretizer, self.config.block_size, num_partitions)?,
            valid: valid
                .map(|v| make_blocks(v, &discretizer, self.config.block_size, num_partitions))
                .transpose()?,
            num_partitions,
            spill,
        };

        let model = dispatch_fit(&ctx, &mut self.callbacks)?;
        model.validate()?;
        info!(
            trees = model.num_trees(),
            iterations = model.metadata.trained_iters,
            "fit complete"
        );
        Ok(model)
    }
}

/// Raw-space base score: the inverse link of the weighted mean label.
fn base_score(train: &Dataset, objective: &Arc<dyn ObjFunc>) -> Vec<f64> {
    let width = objective.num_outputs();
    let mut mean = vec![0.0; width];
    let mut total = 0.0;
    for (i, label) in train.labels.iter().enumerate() {
        let w = train.weights.as_ref().map(|w| w[i]).unwrap_or(1.0);
        for (m, &l) in mean.iter_mut().zip(label.iter()) {
            *m += w * l;
        }
        total += w;
    }
    if total > 0.0 {
        for m in &mut mean {
            *m /= total;
        }
    }
    let mut raw = vec![0.0; width];
    objective.inverse_transform(&mean, &mut raw);
    raw
}

/// Discretize rows and pack them into distributed blocks.
fn make_blocks(
    ds: &Dataset,
    discretizer: &Discretizer,
    block_size: usize,
    num_partitions: usize,
) -> Result<PartDataset<DataBlock>> {
    let num_cols = discretizer.num_cols();
    let label_width = ds.labels.first().map(|l| l.len()).unwrap_or(1);
    let mut blocks = Vec::new();
    let mut bins = KVMatrix::new(num_cols);
    let mut labels = ArrayBlock::new(label_width);
    let mut weights = Vec::new();
    for (i, row) in ds.features.iter().enumerate() {
        let binned = discretizer.transform(row)?;
        bins.push_row(binned.as_slice());
        labels.push_row(&ds.labels[i]);
        weights.push(ds.weights.as_ref().map(|w| w[i]).unwrap_or(1.0));
        if bins.num_rows() >= block_size {
            blocks.push(DataBlock {
                bins: std::mem::replace(&mut bins, KVMatrix::new(num_cols)),
                labels: std::mem::replace(&mut labels, ArrayBlock::new(label_width)),
                weights: CompactArray::from_vec(std::mem::take(&mut weights)),
            });
        }
    }
    if bins.num_rows() > 0 {
        blocks.push(DataBlock {
            bins,
            labels,
            weights: CompactArray::from_vec(weights),
        });
    }
    Ok(PartDataset::from_items(blocks, num_partitions))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_validation() {
        let mut ds = Dataset::regression(vec![vec![1.0], vec![2.0]], vec![1.0, 2.0]);
        assert!(ds.validate(1).is_ok());
        ds.labels[1][0] = f64::NAN;
        assert!(ds.validate(1).is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut ds = Dataset::regression(vec![vec![1.0], vec![2.0]], vec![1.0, 2.0]);
        ds.weights = Some(vec![1.0, -0.5]);
        let err = ds.validate(1).unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let ds = Dataset::new(
            vec![vec![1.0, 2.0], vec![3.0]],
            vec![vec![0.0], vec![1.0]],
            None,
            vec![ColKind::Numeric, ColKind::Numeric],
        );
        assert!(ds.validate(1).is_err());
    }

    #[test]
    fn test_csv_round_trip() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header comment").unwrap();
        writeln!(file, "1.0,2.0,3.0").unwrap();
        writeln!(file, "4.0,5.0,9.0").unwrap();
        file.flush().unwrap();

        let ds = Dataset::from_csv(file.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.col_kinds.len(), 2);
        assert_eq!(ds.labels[1], vec![9.0]);
    }

    #[test]
    fn test_base_score_weighted_mean() {
        let mut ds = Dataset::regression(vec![vec![0.0], vec![0.0]], vec![2.0, 6.0]);
        ds.weights = Some(vec![3.0, 1.0]);
        let obj = thicket_core::objective_by_name("square").unwrap();
        let base = base_score(&ds, &obj);
        assert_eq!(base, vec![3.0]);
    }
}
