//! Binned feature vectors and packed row blocks
//!
//! Bin 0 is reserved for the zero/missing bucket and is never stored;
//! a `BinVector` keeps only the non-zero bins in column order. Blocks
//! pack many rows into one unit of persistence and shuffling.

use serde::{Deserialize, Serialize};

/// Sparse vector of `column -> bin` with bin 0 implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinVector {
    cols: Vec<u32>,
    bins: Vec<u16>,
    num_cols: u32,
}

/// Borrowed view of one row inside a [`KVMatrix`].
#[derive(Debug, Clone, Copy)]
pub struct BinSlice<'a> {
    cols: &'a [u32],
    bins: &'a [u16],
    num_cols: u32,
}

impl BinVector {
    /// Build from a dense bin row, dropping zero bins.
    pub fn from_dense(row: &[u16]) -> Self {
        let mut cols = Vec::new();
        let mut bins = Vec::new();
        for (c, &b) in row.iter().enumerate() {
            if b != 0 {
                cols.push(c as u32);
                bins.push(b);
            }
        }
        Self {
            cols,
            bins,
            num_cols: row.len() as u32,
        }
    }

    /// Build from column-sorted `(col, bin)` pairs with non-zero bins.
    pub fn from_pairs(pairs: Vec<(u32, u16)>, num_cols: u32) -> Self {
        debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
        debug_assert!(pairs.iter().all(|&(c, b)| b != 0 && c < num_cols));
        let (cols, bins) = pairs.into_iter().unzip();
        Self {
            cols,
            bins,
            num_cols,
        }
    }

    pub fn as_slice(&self) -> BinSlice<'_> {
        BinSlice {
            cols: &self.cols,
            bins: &self.bins,
            num_cols: self.num_cols,
        }
    }

    pub fn get(&self, col: u32) -> u16 {
        self.as_slice().get(col)
    }

    /// Iterate over the stored (non-zero) entries in column order.
    pub fn active_iter(&self) -> impl Iterator<Item = (u32, u16)> + '_ {
        self.cols.iter().copied().zip(self.bins.iter().copied())
    }

    /// Number of stored (non-zero) bins.
    pub fn nnz(&self) -> usize {
        self.cols.len()
    }

    /// Dense length of the vector.
    pub fn num_cols(&self) -> u32 {
        self.num_cols
    }

    /// Restrict to a sorted column subset, renumbering columns to the
    /// positions within `subset`.
    pub fn slice(&self, subset: &[u32]) -> BinVector {
        debug_assert!(subset.windows(2).all(|w| w[0] < w[1]));
        let mut cols = Vec::new();
        let mut bins = Vec::new();
        let mut si = 0usize;
        for (&c, &b) in self.cols.iter().zip(self.bins.iter()) {
            while si < subset.len() && subset[si] < c {
                si += 1;
            }
            if si == subset.len() {
                break;
            }
            if subset[si] == c {
                cols.push(si as u32);
                bins.push(b);
            }
        }
        BinVector {
            cols,
            bins,
            num_cols: subset.len() as u32,
        }
    }
}

impl<'a> BinSlice<'a> {
    pub fn get(&self, col: u32) -> u16 {
        match self.cols.binary_search(&col) {
            Ok(i) => self.bins[i],
            Err(_) => 0,
        }
    }

    pub fn active_iter(&self) -> impl Iterator<Item = (u32, u16)> + 'a {
        self.cols.iter().copied().zip(self.bins.iter().copied())
    }

    pub fn nnz(&self) -> usize {
        self.cols.len()
    }

    pub fn num_cols(&self) -> u32 {
        self.num_cols
    }

    pub fn to_owned(&self) -> BinVector {
        BinVector {
            cols: self.cols.to_vec(),
            bins: self.bins.to_vec(),
            num_cols: self.num_cols,
        }
    }
}

/// Packed block of binned rows, the unit of persistence and shuffling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KVMatrix {
    cols: Vec<u32>,
    bins: Vec<u16>,
    offsets: Vec<u32>,
    num_cols: u32,
}

impl KVMatrix {
    pub fn new(num_cols: u32) -> Self {
        Self {
            cols: Vec::new(),
            bins: Vec::new(),
            offsets: vec![0],
            num_cols,
        }
    }

    pub fn from_rows<'a>(rows: impl Iterator<Item = BinSlice<'a>>, num_cols: u32) -> Self {
        let mut block = Self::new(num_cols);
        for row in rows {
            block.push_row(row);
        }
        block
    }

    pub fn push_row(&mut self, row: BinSlice<'_>) {
        debug_assert_eq!(row.num_cols(), self.num_cols);
        for (c, b) in row.active_iter() {
            self.cols.push(c);
            self.bins.push(b);
        }
        self.offsets.push(self.cols.len() as u32);
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn num_cols(&self) -> u32 {
        self.num_cols
    }

    pub fn row(&self, i: usize) -> BinSlice<'_> {
        let lo = self.offsets[i] as usize;
        let hi = self.offsets[i + 1] as usize;
        BinSlice {
            cols: &self.cols[lo..hi],
            bins: &self.bins[lo..hi],
            num_cols: self.num_cols,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = BinSlice<'_>> {
        (0..self.num_rows()).map(move |i| self.row(i))
    }
}

/// Packed array of fixed-width rows (labels, grad-hess pairs, tree and
/// node ids).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayBlock<T> {
    values: Vec<T>,
    width: usize,
}

impl<T: Copy> ArrayBlock<T> {
    pub fn new(width: usize) -> Self {
        debug_assert!(width > 0);
        Self {
            values: Vec::new(),
            width,
        }
    }

    pub fn from_flat(values: Vec<T>, width: usize) -> Self {
        debug_assert!(width > 0 && values.len() % width == 0);
        Self { values, width }
    }

    pub fn push_row(&mut self, row: &[T]) {
        debug_assert_eq!(row.len(), self.width);
        self.values.extend_from_slice(row);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_rows(&self) -> usize {
        self.values.len() / self.width
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.values[i * self.width..(i + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.values.chunks_exact(self.width)
    }

    pub fn as_flat(&self) -> &[T] {
        &self.values
    }
}

/// Variable-width counterpart of [`ArrayBlock`] for per-row id lists
/// whose length differs row to row (tree memberships under sampling).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JaggedBlock<T> {
    values: Vec<T>,
    offsets: Vec<u32>,
}

impl<T: Copy> JaggedBlock<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            offsets: vec![0],
        }
    }

    pub fn push_row(&mut self, row: &[T]) {
        self.values.extend_from_slice(row);
        self.offsets.push(self.values.len() as u32);
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.values[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        (0..self.num_rows()).map(move |i| self.row(i))
    }
}

impl<T: Copy> Default for JaggedBlock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Packed array of scalar values (weights, raw-prediction scalars).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactArray<T> {
    values: Vec<T>,
}

impl<T: Copy> CompactArray<T> {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        Self { values }
    }

    pub fn push(&mut self, value: T) {
        self.values.push(value);
    }

    pub fn get(&self, i: usize) -> T {
        self.values[i]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.values.iter().copied()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

impl<T: Copy> Default for CompactArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_vector_from_dense_drops_zeros() {
        let v = BinVector::from_dense(&[0, 3, 0, 1, 0]);
        assert_eq!(v.nnz(), 2);
        assert_eq!(v.num_cols(), 5);
        assert_eq!(v.get(1), 3);
        assert_eq!(v.get(2), 0);
        assert_eq!(v.get(3), 1);
        let active: Vec<_> = v.active_iter().collect();
        assert_eq!(active, vec![(1, 3), (3, 1)]);
    }

    #[test]
    fn test_bin_vector_slice_renumbers() {
        let v = BinVector::from_dense(&[5, 0, 7, 0, 9]);
        let s = v.slice(&[0, 3, 4]);
        assert_eq!(s.num_cols(), 3);
        assert_eq!(s.get(0), 5);
        assert_eq!(s.get(1), 0); // original column 3 was zero
        assert_eq!(s.get(2), 9);
    }

    #[test]
    fn test_kv_matrix_round_trip() {
        let rows = vec![
            BinVector::from_dense(&[1, 0, 2]),
            BinVector::from_dense(&[0, 0, 0]),
            BinVector::from_dense(&[0, 4, 0]),
        ];
        let block = KVMatrix::from_rows(rows.iter().map(|r| r.as_slice()), 3);
        assert_eq!(block.num_rows(), 3);
        assert_eq!(block.row(0).get(2), 2);
        assert_eq!(block.row(1).nnz(), 0);
        assert_eq!(block.row(2).get(1), 4);
    }

    #[test]
    fn test_array_block_rows() {
        let mut block = ArrayBlock::new(2);
        block.push_row(&[1.0, 2.0]);
        block.push_row(&[3.0, 4.0]);
        assert_eq!(block.num_rows(), 2);
        assert_eq!(block.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn test_jagged_block_rows() {
        let mut block = JaggedBlock::new();
        block.push_row(&[1u8, 2, 3]);
        block.push_row(&[]);
        block.push_row(&[7u8]);
        assert_eq!(block.num_rows(), 3);
        assert_eq!(block.row(0), &[1, 2, 3]);
        assert!(block.row(1).is_empty());
        assert_eq!(block.row(2), &[7]);
    }
}
