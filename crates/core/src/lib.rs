//! Thicket core - model format and numeric plug-ins for gradient boosting
//!
//! Provides the shared vocabulary of the Thicket GBDT library: binned
//! feature vectors and blocks, tree and ensemble model types with
//! canonical serialization, objective and evaluation plug-ins, the
//! column discretizer, and validated boosting configuration.

pub mod bin;
pub mod config;
pub mod discretizer;
pub mod errors;
pub mod model;
pub mod objective;
pub mod serde_canon;
pub mod tree;
pub mod width;

pub use bin::{ArrayBlock, BinSlice, BinVector, CompactArray, JaggedBlock, KVMatrix};
pub use config::{BoostConfig, BoostType, FloatType, HistogramType, StorageLevel, SubSampleType};
pub use discretizer::{ColKind, Discretizer};
pub use errors::{GbmError, Result};
pub use model::GbmModel;
pub use objective::{eval_by_name, objective_by_name, EvalFunc, ObjFunc};
pub use tree::{BinSet, SplitData, SplitKind, TreeModel, TreeNode};
pub use width::{width_for, AccFloat, IdPrim, IdWidth};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
