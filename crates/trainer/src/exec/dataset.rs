//! Partitioned immutable datasets over a rayon executor
//!
//! A [`PartDataset`] is a fixed list of immutable partitions, each
//! either memory-resident or spilled to disk as a bincode blob.
//! Transformations run partition-parallel; aggregations combine
//! partition results in index order (or pairwise rounds for the tree
//! variant), never in scheduler completion order.

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thicket_core::{GbmError, Result, StorageLevel};

/// Allocator of unique spill file paths under one scratch directory.
#[derive(Debug)]
pub struct SpillDir {
    dir: PathBuf,
    counter: AtomicU64,
}

impl SpillDir {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.dir
    }

    fn next_path(&self, tag: &str) -> PathBuf {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{tag}-{id}.bin"))
    }
}

#[derive(Debug, Clone)]
enum Part<T> {
    Mem(Arc<Vec<T>>),
    Disk { path: PathBuf, len: usize },
}

/// Partitioned immutable collection.
#[derive(Debug, Clone)]
pub struct PartDataset<T> {
    parts: Vec<Part<T>>,
}

impl<T: Clone + Send + Sync + 'static> PartDataset<T> {
    pub fn from_partitions(parts: Vec<Vec<T>>) -> Self {
        Self {
            parts: parts.into_iter().map(|p| Part::Mem(Arc::new(p))).collect(),
        }
    }

    /// Split `items` into `num_partitions` contiguous chunks.
    pub fn from_items(items: Vec<T>, num_partitions: usize) -> Self {
        let num_partitions = num_partitions.max(1);
        let n = items.len();
        let chunk = n.div_ceil(num_partitions).max(1);
        let mut parts: Vec<Vec<T>> = Vec::with_capacity(num_partitions);
        let mut iter = items.into_iter();
        for _ in 0..num_partitions {
            parts.push(iter.by_ref().take(chunk).collect());
        }
        Self::from_partitions(parts)
    }

    pub fn num_partitions(&self) -> usize {
        self.parts.len()
    }

    pub fn count(&self) -> usize {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Mem(v) => v.len(),
                Part::Disk { len, .. } => *len,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Materialize one partition.
    pub fn partition(&self, i: usize) -> Arc<Vec<T>>
    where
        T: DeserializeOwned,
    {
        match &self.parts[i] {
            Part::Mem(v) => Arc::clone(v),
            Part::Disk { path, .. } => {
                // A lost or corrupt spill file is an executor fault and
                // must surface as task failure, not as silent data loss.
                let bytes = fs::read(path)
                    .unwrap_or_else(|e| panic!("spill read {}: {e}", path.display()));
                Arc::new(
                    bincode::deserialize(&bytes)
                        .unwrap_or_else(|e| panic!("spill decode {}: {e}", path.display())),
                )
            }
        }
    }

    pub fn collect(&self) -> Vec<T>
    where
        T: DeserializeOwned,
    {
        (0..self.num_partitions())
            .flat_map(|i| self.partition(i).as_ref().clone())
            .collect()
    }

    /// Transform each partition; `f` receives the partition index.
    pub fn map_partitions<U, F>(&self, f: F) -> PartDataset<U>
    where
        T: DeserializeOwned,
        U: Clone + Send + Sync + 'static,
        F: Fn(usize, &[T]) -> Vec<U> + Sync,
    {
        let parts: Vec<Part<U>> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| Part::Mem(Arc::new(f(i, &self.partition(i)))))
            .collect();
        PartDataset { parts }
    }

    pub fn map<U, F>(&self, f: F) -> PartDataset<U>
    where
        T: DeserializeOwned,
        U: Clone + Send + Sync + 'static,
        F: Fn(&T) -> U + Sync,
    {
        self.map_partitions(|_, items| items.iter().map(&f).collect())
    }

    /// Partition-wise zip of two aligned datasets; `f` sees both
    /// partitions whole plus the partition index.
    pub fn zip_map_partitions<U, V, F>(&self, other: &PartDataset<U>, f: F) -> PartDataset<V>
    where
        T: DeserializeOwned,
        U: Clone + Send + Sync + DeserializeOwned + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(usize, &[T], &[U]) -> Vec<V> + Sync,
    {
        assert_eq!(self.num_partitions(), other.num_partitions());
        let parts: Vec<Part<V>> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| {
                let left = self.partition(i);
                let right = other.partition(i);
                Part::Mem(Arc::new(f(i, &left, &right)))
            })
            .collect();
        PartDataset { parts }
    }

    /// Element-wise zip of two aligned datasets.
    pub fn zip_map<U, V, F>(&self, other: &PartDataset<U>, f: F) -> PartDataset<V>
    where
        T: DeserializeOwned,
        U: Clone + Send + Sync + DeserializeOwned + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(&T, &U) -> V + Sync,
    {
        assert_eq!(self.num_partitions(), other.num_partitions());
        let parts: Vec<Part<V>> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| {
                let left = self.partition(i);
                let right = other.partition(i);
                debug_assert_eq!(left.len(), right.len());
                Part::Mem(Arc::new(
                    left.iter().zip(right.iter()).map(|(a, b)| f(a, b)).collect(),
                ))
            })
            .collect();
        PartDataset { parts }
    }

    /// Fold every partition, then combine partition results in index
    /// order. Deterministic for associative `comb`.
    pub fn fold<A, S, C>(&self, init: A, seq: S, comb: C) -> A
    where
        T: DeserializeOwned,
        A: Clone + Send + Sync,
        S: Fn(A, &T) -> A + Sync,
        C: Fn(A, A) -> A + Sync,
    {
        let partials: Vec<A> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| self.partition(i).iter().fold(init.clone(), |a, t| seq(a, t)))
            .collect();
        partials.into_iter().fold(init, comb)
    }

    /// Fold with pairwise combination rounds (depth-limited reduce
    /// tree); the combination order is fixed by partition index.
    pub fn tree_aggregate<A, S, C>(&self, init: A, seq: S, comb: C) -> A
    where
        T: DeserializeOwned,
        A: Clone + Send + Sync,
        S: Fn(A, &T) -> A + Sync,
        C: Fn(A, A) -> A + Sync,
    {
        let mut level: Vec<A> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| self.partition(i).iter().fold(init.clone(), |a, t| seq(a, t)))
            .collect();
        while level.len() > 1 {
            level = level
                .par_chunks(2)
                .map(|pair| {
                    if pair.len() == 2 {
                        comb(pair[0].clone(), pair[1].clone())
                    } else {
                        pair[0].clone()
                    }
                })
                .collect();
        }
        level.into_iter().next().unwrap_or(init)
    }
}

impl<T> PartDataset<T>
where
    T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Apply a storage level. Memory-backed levels stay resident in
    /// this in-process executor; disk-only spills every partition.
    pub fn persist(&self, level: StorageLevel, spill: &SpillDir) -> Result<Self> {
        match level {
            StorageLevel::MemoryAndDisk | StorageLevel::MemoryAndDiskSer => Ok(self.clone()),
            StorageLevel::DiskOnly => self.spill(spill, "persist"),
        }
    }

    /// Materialize every partition to stable storage; failures are
    /// fatal.
    pub fn checkpoint(&self, spill: &SpillDir) -> Result<Self> {
        self.spill(spill, "checkpoint")
    }

    fn spill(&self, spill: &SpillDir, tag: &str) -> Result<Self> {
        let parts = (0..self.num_partitions())
            .map(|i| {
                let data = self.partition(i);
                let bytes = bincode::serialize(data.as_ref())
                    .map_err(|e| GbmError::Checkpoint(e.to_string()))?;
                let path = spill.next_path(tag);
                fs::write(&path, bytes).map_err(|e| {
                    GbmError::Checkpoint(format!("write {}: {e}", path.display()))
                })?;
                Ok(Part::Disk {
                    path,
                    len: data.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { parts })
    }

    /// Spill files backing this dataset, if any.
    pub fn spill_files(&self) -> Vec<PathBuf> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Mem(_) => None,
                Part::Disk { path, .. } => Some(path.clone()),
            })
            .collect()
    }
}

impl<K, V> PartDataset<(K, V)>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Shuffle pairs under `part_fn` and merge values per key.
    ///
    /// Each target partition is sorted by key before merging, and
    /// pairs arriving from different source partitions keep source
    /// order under the stable sort, so float merges accumulate in one
    /// canonical order regardless of scheduling.
    pub fn reduce_by_key<P, M>(
        &self,
        num_partitions: usize,
        part_fn: P,
        merge: M,
    ) -> PartDataset<(K, V)>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
        P: Fn(&K) -> usize + Sync,
        M: Fn(V, V) -> V + Sync,
    {
        let num_partitions = num_partitions.max(1);

        // Bucket every source partition by target.
        let bucketed: Vec<Vec<Vec<(K, V)>>> = (0..self.num_partitions())
            .into_par_iter()
            .map(|i| {
                let mut buckets: Vec<Vec<(K, V)>> = (0..num_partitions).map(|_| Vec::new()).collect();
                for pair in self.partition(i).iter() {
                    let target = part_fn(&pair.0) % num_partitions;
                    buckets[target].push(pair.clone());
                }
                buckets
            })
            .collect();

        // Concatenate per target in source order, sort, merge runs.
        let parts: Vec<Part<(K, V)>> = (0..num_partitions)
            .into_par_iter()
            .map(|target| {
                let mut pairs: Vec<(K, V)> = Vec::new();
                for source in &bucketed {
                    pairs.extend_from_slice(&source[target]);
                }
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                let mut merged: Vec<(K, V)> = Vec::new();
                for (k, v) in pairs {
                    match merged.last_mut() {
                        Some((lk, lv)) if *lk == k => {
                            let prev = lv.clone();
                            *lv = merge(prev, v);
                        }
                        _ => merged.push((k, v)),
                    }
                }
                Part::Mem(Arc::new(merged))
            })
            .collect();
        PartDataset { parts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_items_partitioning() {
        let ds = PartDataset::from_items((0..10).collect::<Vec<i64>>(), 3);
        assert_eq!(ds.num_partitions(), 3);
        assert_eq!(ds.count(), 10);
        assert_eq!(ds.collect(), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_map_and_zip() {
        let a = PartDataset::from_items(vec![1i64, 2, 3, 4], 2);
        let b = a.map(|x| x * 10);
        let sum = a.zip_map(&b, |x, y| x + y);
        assert_eq!(sum.collect(), vec![11, 22, 33, 44]);
    }

    #[test]
    fn test_fold_deterministic() {
        let ds = PartDataset::from_items((1..=100).collect::<Vec<i64>>(), 7);
        let total = ds.fold(0i64, |a, &x| a + x, |a, b| a + b);
        assert_eq!(total, 5050);
        let tree_total = ds.tree_aggregate(0i64, |a, &x| a + x, |a, b| a + b);
        assert_eq!(tree_total, 5050);
    }

    #[test]
    fn test_reduce_by_key_merges() {
        let pairs: Vec<(u32, i64)> = vec![(1, 1), (2, 10), (1, 2), (3, 5), (2, 20), (1, 4)];
        let ds = PartDataset::from_items(pairs, 3);
        let reduced = ds.reduce_by_key(2, |k| *k as usize, |a, b| a + b);
        let mut out = reduced.collect();
        out.sort();
        assert_eq!(out, vec![(1, 7), (2, 30), (3, 5)]);
    }

    #[test]
    fn test_spill_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let spill = SpillDir::new(tmp.path().to_path_buf()).unwrap();
        let ds = PartDataset::from_items((0..50).collect::<Vec<i64>>(), 4);
        let spilled = ds.persist(StorageLevel::DiskOnly, &spill).unwrap();
        assert_eq!(spilled.collect(), ds.collect());
        assert_eq!(spilled.spill_files().len(), 4);
        let ckpt = ds.checkpoint(&spill).unwrap();
        assert_eq!(ckpt.count(), 50);
    }
}
