//! In-process execution layer for the coarse-grained data-parallel model
//!
//! Training is expressed as a lineage of transformations over
//! partitioned immutable datasets; rayon schedules partitions across
//! worker threads. Within a partition all work is sequential, and
//! every cross-partition aggregation folds in a canonical order so
//! float accumulation is reproducible.

pub mod broadcast;
pub mod checkpoint;
pub mod dataset;
pub mod partitioner;

pub use broadcast::{Broadcast, ResourceCleaner};
pub use checkpoint::Checkpointer;
pub use dataset::{PartDataset, SpillDir};
pub use partitioner::HistPartitioner;
