//! Boosting configuration
//!
//! [`BoostConfig`] is the immutable per-iteration snapshot of every
//! hyperparameter. Validation runs once at fit start and names the
//! offending parameter together with its constraint; callbacks may
//! publish a replacement snapshot that takes effect from the next
//! iteration.

use crate::errors::{GbmError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Boosting regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoostType {
    GbTree,
    Dart,
}

/// Histogram computation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistogramType {
    Basic,
    Subtract,
    Vote,
}

/// Instance sampling granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubSampleType {
    Row,
    Block,
    Partition,
    Goss,
}

/// Histogram accumulator width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloatType {
    Float,
    Double,
}

/// Persistence level for cached datasets. `NONE` is invalid everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLevel {
    MemoryAndDisk,
    MemoryAndDiskSer,
    DiskOnly,
}

impl FromStr for StorageLevel {
    type Err = GbmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MEM+DISK" | "MEMORY_AND_DISK" => Ok(StorageLevel::MemoryAndDisk),
            "MEM+DISK_SER" | "MEMORY_AND_DISK_SER" => Ok(StorageLevel::MemoryAndDiskSer),
            "DISK_ONLY" => Ok(StorageLevel::DiskOnly),
            other => Err(GbmError::param(
                "storage_level",
                "one of MEM+DISK, MEM+DISK_SER, DISK_ONLY (NONE is invalid)",
                other,
            )),
        }
    }
}

/// Immutable hyperparameter snapshot for one boosting iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostConfig {
    pub boost_type: BoostType,
    pub max_iter: usize,
    pub max_depth: u32,
    pub max_leaves: u32,
    pub max_bins: u32,
    pub step_size: f64,
    pub reg_alpha: f64,
    pub reg_lambda: f64,
    pub min_gain: f64,
    pub min_node_hess: f64,
    pub sub_sample_rate_by_tree: f64,
    pub sub_sample_rate_by_node: f64,
    pub col_sample_rate_by_tree: f64,
    pub col_sample_rate_by_node: f64,
    pub sub_sample_type: SubSampleType,
    pub top_rate: f64,
    pub other_rate: f64,
    pub histogram_type: HistogramType,
    pub vote_top_k: usize,
    pub drop_rate: f64,
    pub drop_skip: f64,
    pub min_drop: usize,
    pub max_drop: usize,
    pub block_size: usize,
    pub forest_size: usize,
    pub float_type: FloatType,
    pub zero_as_missing: bool,
    pub discretization_type: String,
    pub seed: i64,
    pub checkpoint_interval: i32,
    pub storage_level1: StorageLevel,
    pub storage_level2: StorageLevel,
    pub storage_level3: StorageLevel,
    pub early_stop_iters: i32,
    pub leaf_boosting: bool,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            boost_type: BoostType::GbTree,
            max_iter: 20,
            max_depth: 5,
            max_leaves: 1000,
            max_bins: 256,
            step_size: 0.1,
            reg_alpha: 0.0,
            reg_lambda: 1.0,
            min_gain: 0.0,
            min_node_hess: 1.0,
            sub_sample_rate_by_tree: 1.0,
            sub_sample_rate_by_node: 1.0,
            col_sample_rate_by_tree: 1.0,
            col_sample_rate_by_node: 1.0,
            sub_sample_type: SubSampleType::Block,
            top_rate: 0.2,
            other_rate: 0.1,
            histogram_type: HistogramType::Basic,
            vote_top_k: 20,
            drop_rate: 0.0,
            drop_skip: 0.5,
            min_drop: 0,
            max_drop: 50,
            block_size: 4096,
            forest_size: 1,
            float_type: FloatType::Float,
            zero_as_missing: false,
            discretization_type: "width:round".to_string(),
            seed: -1,
            checkpoint_interval: 10,
            storage_level1: StorageLevel::MemoryAndDisk,
            storage_level2: StorageLevel::MemoryAndDiskSer,
            storage_level3: StorageLevel::DiskOnly,
            early_stop_iters: -1,
            leaf_boosting: false,
        }
    }
}

fn check(ok: bool, name: &'static str, constraint: &'static str, value: impl ToString) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(GbmError::param(name, constraint, value))
    }
}

impl BoostConfig {
    /// Validate every hyperparameter; called once at fit start.
    pub fn validate(&self) -> Result<()> {
        check(
            (1..=30).contains(&self.max_depth),
            "max_depth",
            "must be in [1, 30]",
            self.max_depth,
        )?;
        check(
            self.max_leaves >= 2,
            "max_leaves",
            "must be >= 2",
            self.max_leaves,
        )?;
        check(
            (4..=65_535).contains(&self.max_bins),
            "max_bins",
            "must be in [4, 65535]",
            self.max_bins,
        )?;
        check(
            self.step_size > 0.0,
            "step_size",
            "must be > 0",
            self.step_size,
        )?;
        check(
            self.reg_alpha >= 0.0,
            "reg_alpha",
            "must be >= 0",
            self.reg_alpha,
        )?;
        check(
            self.reg_lambda >= 0.0,
            "reg_lambda",
            "must be >= 0",
            self.reg_lambda,
        )?;
        check(
            self.min_gain >= 0.0,
            "min_gain",
            "must be >= 0",
            self.min_gain,
        )?;
        check(
            self.min_node_hess >= 0.0,
            "min_node_hess",
            "must be >= 0",
            self.min_node_hess,
        )?;
        for (name, rate) in [
            (
                "sub_sample_rate_by_tree" as &'static str,
                self.sub_sample_rate_by_tree,
            ),
            ("sub_sample_rate_by_node", self.sub_sample_rate_by_node),
            ("col_sample_rate_by_tree", self.col_sample_rate_by_tree),
            ("col_sample_rate_by_node", self.col_sample_rate_by_node),
        ] {
            check(rate > 0.0 && rate <= 1.0, name, "must be in (0, 1]", rate)?;
        }
        if self.sub_sample_type == SubSampleType::Goss {
            check(
                self.top_rate > 0.0 && self.top_rate < 1.0,
                "top_rate",
                "must be in (0, 1)",
                self.top_rate,
            )?;
            check(
                self.other_rate > 0.0 && self.other_rate < 1.0,
                "other_rate",
                "must be in (0, 1)",
                self.other_rate,
            )?;
            check(
                self.top_rate + self.other_rate < 1.0,
                "other_rate",
                "top_rate + other_rate must be < 1",
                self.top_rate + self.other_rate,
            )?;
        }
        check(
            self.vote_top_k >= 1,
            "vote_top_k",
            "must be >= 1",
            self.vote_top_k,
        )?;
        check(
            (0.0..=1.0).contains(&self.drop_rate),
            "drop_rate",
            "must be in [0, 1]",
            self.drop_rate,
        )?;
        check(
            (0.0..=1.0).contains(&self.drop_skip),
            "drop_skip",
            "must be in [0, 1]",
            self.drop_skip,
        )?;
        check(
            self.min_drop <= self.max_drop,
            "min_drop",
            "must be <= max_drop",
            self.min_drop,
        )?;
        check(
            self.block_size > 0,
            "block_size",
            "must be > 0",
            self.block_size,
        )?;
        check(
            self.forest_size > 0,
            "forest_size",
            "must be > 0",
            self.forest_size,
        )?;
        check(
            self.checkpoint_interval == -1 || self.checkpoint_interval >= 1,
            "checkpoint_interval",
            "must be -1 or >= 1",
            self.checkpoint_interval,
        )?;
        check(
            self.early_stop_iters == -1 || self.early_stop_iters >= 1,
            "early_stop_iters",
            "must be -1 or >= 1",
            self.early_stop_iters,
        )?;
        self.discretization_round()?;
        Ok(())
    }

    /// Whether `width:round` discretization is selected; rejects any
    /// type outside the supported `width` family.
    pub fn discretization_round(&self) -> Result<bool> {
        match self.discretization_type.as_str() {
            "width" => Ok(false),
            "width:round" => Ok(true),
            other => Err(GbmError::param(
                "discretization_type",
                "one of width, width:round",
                other,
            )),
        }
    }

    /// Trees grown per boosting round.
    pub fn num_trees_per_round(&self, raw_size: usize) -> usize {
        self.forest_size * raw_size
    }

    /// Effective base seed; negative seeds are folded to a fixed
    /// default so derived streams stay well-defined.
    pub fn base_seed(&self) -> u64 {
        if self.seed < 0 {
            0x7468_6963_6b65_74 // arbitrary fixed default
        } else {
            self.seed as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BoostConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_depth() {
        let mut config = BoostConfig::default();
        config.max_depth = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_depth"));
        config.max_depth = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_goss_rate_rule() {
        let mut config = BoostConfig {
            sub_sample_type: SubSampleType::Goss,
            ..BoostConfig::default()
        };
        assert!(config.validate().is_ok());
        config.top_rate = 0.6;
        config.other_rate = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("top_rate + other_rate"));
    }

    #[test]
    fn test_storage_level_parse() {
        assert_eq!(
            "MEM+DISK".parse::<StorageLevel>().unwrap(),
            StorageLevel::MemoryAndDisk
        );
        assert_eq!(
            "DISK_ONLY".parse::<StorageLevel>().unwrap(),
            StorageLevel::DiskOnly
        );
        assert!("NONE".parse::<StorageLevel>().is_err());
    }

    #[test]
    fn test_discretization_type() {
        let mut config = BoostConfig::default();
        assert!(config.discretization_round().unwrap());
        config.discretization_type = "depth".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_seed_folds() {
        let config = BoostConfig::default();
        assert_eq!(config.seed, -1);
        let folded = config.base_seed();
        assert_eq!(folded, BoostConfig::default().base_seed());
    }
}
