//! Key-space partitioners for histogram shuffles
//!
//! The choice of partitioner controls shuffle locality across depths:
//! `SkipNode` ignores the node id entirely so keys stay put when the
//! level advances (histogram subtraction without a reshuffle), `Depth`
//! folds nodes onto their ancestor at a fixed depth, and `Range`
//! binary-searches a known ordered key set. Equal partitioners always
//! produce equal placements.

use crate::deterministic::hash_parts;
use crate::histogram::HistKey;
use thicket_core::IdPrim;

/// Depth of node `id` under the `root = 1, left = 2n, right = 2n + 1`
/// scheme.
pub fn node_depth(id: u64) -> u32 {
    debug_assert!(id >= 1);
    63 - id.leading_zeros()
}

/// Partitioner over `(tree, node, col)` histogram keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistPartitioner<T, N> {
    /// Partition by tree-sorted index and column, ignoring the node.
    SkipNode {
        num_partitions: usize,
        num_cols: u32,
        trees: Vec<T>,
    },
    /// Fold each node onto its ancestor at `depth`, then partition by
    /// `(tree index, ancestor, col)`.
    Depth {
        num_partitions: usize,
        num_cols: u32,
        trees: Vec<T>,
        depth: u32,
    },
    /// Binary search over a known ordered `(tree, node)` set.
    Range {
        num_partitions: usize,
        num_cols: u32,
        keys: Vec<(T, N)>,
    },
    /// Plain hash of the full key.
    Hash { num_partitions: usize },
}

impl<T: IdPrim, N: IdPrim> HistPartitioner<T, N> {
    pub fn num_partitions(&self) -> usize {
        match self {
            HistPartitioner::SkipNode { num_partitions, .. }
            | HistPartitioner::Depth { num_partitions, .. }
            | HistPartitioner::Range { num_partitions, .. }
            | HistPartitioner::Hash { num_partitions } => *num_partitions,
        }
    }

    pub fn partition(&self, key: &HistKey<T, N>) -> usize {
        match self {
            HistPartitioner::SkipNode {
                num_partitions,
                num_cols,
                trees,
            } => {
                let ti = trees.binary_search(&key.tree).unwrap_or(0) as u64;
                ((ti * *num_cols as u64 + key.col as u64) % *num_partitions as u64) as usize
            }
            HistPartitioner::Depth {
                num_partitions,
                num_cols,
                trees,
                depth,
            } => {
                let ti = trees.binary_search(&key.tree).unwrap_or(0) as u64;
                let node = key.node.to_usize() as u64;
                let ancestor = if node_depth(node) > *depth {
                    node >> (node_depth(node) - *depth)
                } else {
                    node
                };
                let level_base = 1u64 << *depth;
                let slot = ti * level_base + ancestor.saturating_sub(level_base);
                ((slot * *num_cols as u64 + key.col as u64) % *num_partitions as u64) as usize
            }
            HistPartitioner::Range {
                num_partitions,
                num_cols,
                keys,
            } => {
                let i = keys
                    .binary_search(&(key.tree, key.node))
                    .unwrap_or_else(|i| i) as u64;
                ((i * *num_cols as u64 + key.col as u64) % *num_partitions as u64) as usize
            }
            HistPartitioner::Hash { num_partitions } => {
                let h = hash_parts(
                    0x6869_7374,
                    &[
                        key.tree.to_usize() as u64,
                        key.node.to_usize() as u64,
                        key.col as u64,
                    ],
                );
                (h % *num_partitions as u64) as usize
            }
        }
    }
}

/// Pick a partitioner for one depth following the expected-key-count
/// rule: with `E` surviving keys and `P` partitions, `SkipNode` wins
/// when `E >= 8P`, `Depth(d - 1)` when the ancestor folding still
/// leaves enough keys, and a plain hash otherwise.
pub fn select_partitioner<T: IdPrim, N: IdPrim>(
    num_partitions: usize,
    depth: u32,
    trees: Vec<T>,
    num_cols: u32,
    col_rate_tree: f64,
    col_rate_node: f64,
) -> HistPartitioner<T, N> {
    let expected =
        trees.len() as f64 * num_cols as f64 * col_rate_tree * col_rate_node;
    let threshold = 8.0 * num_partitions as f64;
    if expected >= threshold {
        HistPartitioner::SkipNode {
            num_partitions,
            num_cols,
            trees,
        }
    } else if depth > 2 && expected * (1u64 << (depth - 1)) as f64 >= threshold {
        HistPartitioner::Depth {
            num_partitions,
            num_cols,
            trees,
            depth: depth - 1,
        }
    } else {
        HistPartitioner::Hash { num_partitions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tree: u8, node: u16, col: u32) -> HistKey<u8, u16> {
        HistKey::new(tree, node, col)
    }

    #[test]
    fn test_node_depth() {
        assert_eq!(node_depth(1), 0);
        assert_eq!(node_depth(2), 1);
        assert_eq!(node_depth(3), 1);
        assert_eq!(node_depth(4), 2);
        assert_eq!(node_depth(7), 2);
    }

    #[test]
    fn test_skip_node_ignores_node() {
        let p: HistPartitioner<u8, u16> = HistPartitioner::SkipNode {
            num_partitions: 7,
            num_cols: 13,
            trees: vec![0, 1, 2],
        };
        for col in 0..13 {
            let parent = p.partition(&key(1, 5, col));
            assert_eq!(parent, p.partition(&key(1, 10, col)));
            assert_eq!(parent, p.partition(&key(1, 11, col)));
        }
    }

    #[test]
    fn test_depth_folds_descendants_together() {
        let p: HistPartitioner<u8, u16> = HistPartitioner::Depth {
            num_partitions: 5,
            num_cols: 4,
            trees: vec![0],
            depth: 1,
        };
        // Nodes 4 and 5 both fold onto ancestor 2; node 6 onto 3.
        assert_eq!(p.partition(&key(0, 4, 2)), p.partition(&key(0, 5, 2)));
        assert_eq!(p.partition(&key(0, 4, 2)), p.partition(&key(0, 2, 2)));
    }

    #[test]
    fn test_range_partitioner_spreads_keys() {
        let p: HistPartitioner<u8, u16> = HistPartitioner::Range {
            num_partitions: 3,
            num_cols: 2,
            keys: vec![(0, 4), (0, 5), (1, 4)],
        };
        assert_eq!(p.partition(&key(0, 4, 0)), 0);
        assert_eq!(p.partition(&key(0, 4, 1)), 1);
        assert_eq!(p.partition(&key(0, 5, 0)), 2);
    }

    #[test]
    fn test_selection_rule() {
        // Plenty of expected keys: SkipNode.
        let p = select_partitioner::<u8, u16>(2, 0, vec![0, 1], 100, 1.0, 1.0);
        assert!(matches!(p, HistPartitioner::SkipNode { .. }));
        // Few keys at a shallow depth: hash.
        let p = select_partitioner::<u8, u16>(64, 1, vec![0], 4, 1.0, 1.0);
        assert!(matches!(p, HistPartitioner::Hash { .. }));
        // Few keys but deep enough for ancestor folding.
        let p = select_partitioner::<u8, u16>(16, 6, vec![0], 8, 1.0, 1.0);
        assert!(matches!(p, HistPartitioner::Depth { depth: 5, .. }));
    }

    #[test]
    fn test_equal_partitioners_agree() {
        let a: HistPartitioner<u8, u16> = HistPartitioner::SkipNode {
            num_partitions: 4,
            num_cols: 9,
            trees: vec![0, 2],
        };
        let b = a.clone();
        assert_eq!(a, b);
        for col in 0..9 {
            assert_eq!(a.partition(&key(2, 3, col)), b.partition(&key(2, 3, col)));
        }
    }
}
