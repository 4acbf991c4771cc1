//! Thicket trainer - distributed histogram-based GBDT training engine
//!
//! Learns additive ensembles of regression trees over pre-binned
//! features: per-depth tree growing on a partitioned dataset,
//! histogram aggregation (basic, subtract, vote), split finding for
//! numeric, categorical, and ranking columns, instance sampling
//! (row/block/partition/Goss), and a boosting loop with DART dropout,
//! early stopping, and checkpointing.

pub mod boost;
pub mod data;
pub mod deterministic;
mod dispatch;
pub mod exec;
pub mod grower;
pub mod hist_compute;
pub mod histogram;
pub mod sampler;
pub mod selector;
pub mod split;
pub mod trainer;

pub use boost::{Callback, CallbackAction, IterationContext};
pub use selector::Selector;
pub use split::Split;
pub use trainer::{Dataset, GbmTrainer, TrainOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
