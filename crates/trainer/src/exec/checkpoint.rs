//! Interval-gated checkpointing of large per-iteration datasets

use crate::exec::dataset::{PartDataset, SpillDir};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use thicket_core::Result;
use tracing::warn;

/// Keeps the last `keep` checkpointed dataset generations per role;
/// older generations are evicted as new ones land.
#[derive(Debug)]
pub struct Checkpointer {
    interval: i32,
    keep: usize,
    retained: VecDeque<Vec<PathBuf>>,
}

impl Checkpointer {
    pub fn new(interval: i32, keep: usize) -> Self {
        Self {
            interval,
            keep: keep.max(1),
            retained: VecDeque::new(),
        }
    }

    /// Checkpoint `dataset` when `iteration` hits the interval. Write
    /// failures are fatal; eviction failures are logged and swallowed.
    pub fn update<T>(
        &mut self,
        dataset: &PartDataset<T>,
        iteration: usize,
        spill: &SpillDir,
    ) -> Result<Option<PartDataset<T>>>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        if self.interval < 1 || (iteration + 1) % self.interval as usize != 0 {
            return Ok(None);
        }
        let checkpointed = dataset.checkpoint(spill)?;
        self.retained.push_back(checkpointed.spill_files());
        while self.retained.len() > self.keep {
            if let Some(old) = self.retained.pop_front() {
                remove_files(old);
            }
        }
        Ok(Some(checkpointed))
    }

    /// Drop every retained generation.
    pub fn clear(&mut self, blocking: bool) -> Result<()> {
        while let Some(files) = self.retained.pop_front() {
            if blocking {
                for path in files {
                    fs::remove_file(&path).map_err(|e| {
                        thicket_core::GbmError::Checkpoint(format!(
                            "remove {}: {e}",
                            path.display()
                        ))
                    })?;
                }
            } else {
                remove_files(files);
            }
        }
        Ok(())
    }
}

fn remove_files(files: Vec<PathBuf>) {
    for path in files {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "checkpoint eviction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_gating() {
        let tmp = tempfile::tempdir().unwrap();
        let spill = SpillDir::new(tmp.path().to_path_buf()).unwrap();
        let ds = PartDataset::from_items((0..20).collect::<Vec<i64>>(), 2);
        let mut ckpt = Checkpointer::new(3, 1);

        assert!(ckpt.update(&ds, 0, &spill).unwrap().is_none());
        assert!(ckpt.update(&ds, 1, &spill).unwrap().is_none());
        let hit = ckpt.update(&ds, 2, &spill).unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().collect(), ds.collect());
    }

    #[test]
    fn test_eviction_keeps_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let spill = SpillDir::new(tmp.path().to_path_buf()).unwrap();
        let ds = PartDataset::from_items((0..8).collect::<Vec<i64>>(), 2);
        let mut ckpt = Checkpointer::new(1, 1);

        let first = ckpt.update(&ds, 0, &spill).unwrap().unwrap();
        let first_files = first.spill_files();
        let _second = ckpt.update(&ds, 1, &spill).unwrap().unwrap();
        assert!(first_files.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_disabled_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let spill = SpillDir::new(tmp.path().to_path_buf()).unwrap();
        let ds = PartDataset::from_items(vec![1i64], 1);
        let mut ckpt = Checkpointer::new(-1, 2);
        for i in 0..5 {
            assert!(ckpt.update(&ds, i, &spill).unwrap().is_none());
        }
    }
}
