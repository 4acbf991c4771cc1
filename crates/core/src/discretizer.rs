//! Column discretizer mapping raw feature vectors to bin vectors
//!
//! Numeric columns use equal-width binning over the observed range;
//! categorical and ranking columns pass their non-negative integer
//! values through shifted by one. Bin 0 always means zero/missing.
//! The fitted discretizer is serialized inside the model so training
//! and prediction bin identically.

use crate::bin::BinVector;
use crate::errors::{GbmError, Result};
use serde::{Deserialize, Serialize};

/// Declared column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColKind {
    Numeric,
    Categorical,
    Ranking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum ColMapping {
    /// Equal-width bins over `[min, min + step * (num_bins - 2)]`
    Width { min: f64, step: f64, num_bins: u16 },
    /// Category value `v` maps to bin `v + 1`
    Category { num_bins: u16 },
    /// Rank value `v` maps to bin `v + 1`, bins stay ordered
    Rank { num_bins: u16 },
}

/// Fitted per-column discretizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discretizer {
    cols: Vec<ColMapping>,
    zero_as_missing: bool,
    round: bool,
}

impl Discretizer {
    /// Fit column mappings from one pass over the training rows.
    ///
    /// `kinds` declares the family of every column; `max_bins` caps the
    /// slot count per column including the reserved zero bin. With
    /// `round`, numeric values are rounded to the nearest integer
    /// before range estimation and binning (the `width:round` mode).
    pub fn fit<'a, I>(
        rows: I,
        kinds: &[ColKind],
        max_bins: u16,
        zero_as_missing: bool,
        round: bool,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let num_cols = kinds.len();
        let mut min = vec![f64::INFINITY; num_cols];
        let mut max = vec![f64::NEG_INFINITY; num_cols];
        let mut max_cat = vec![0u64; num_cols];
        let mut any = false;

        for row in rows {
            if row.len() != num_cols {
                return Err(GbmError::InvalidData(format!(
                    "feature dimension mismatch: expected {num_cols}, got {}",
                    row.len()
                )));
            }
            any = true;
            for (c, &v) in row.iter().enumerate() {
                if !v.is_finite() {
                    continue;
                }
                match kinds[c] {
                    ColKind::Numeric => {
                        let v = if round { v.round() } else { v };
                        if v == 0.0 && zero_as_missing {
                            continue;
                        }
                        min[c] = min[c].min(v);
                        max[c] = max[c].max(v);
                    }
                    ColKind::Categorical | ColKind::Ranking => {
                        if v < 0.0 || v.fract() != 0.0 {
                            return Err(GbmError::InvalidData(format!(
                                "column {c}: categorical/ranking value {v} is not a non-negative integer"
                            )));
                        }
                        max_cat[c] = max_cat[c].max(v as u64);
                    }
                }
            }
        }
        if !any {
            return Err(GbmError::InvalidData("empty dataset".into()));
        }

        let mut cols = Vec::with_capacity(num_cols);
        for c in 0..num_cols {
            let mapping = match kinds[c] {
                ColKind::Numeric => {
                    // Constant or all-missing columns collapse to one bin.
                    let (lo, hi) = if min[c] <= max[c] {
                        (min[c], max[c])
                    } else {
                        (0.0, 0.0)
                    };
                    let span = hi - lo;
                    let interior = (max_bins - 1) as f64;
                    let step = if span > 0.0 { span / interior } else { 0.0 };
                    ColMapping::Width {
                        min: lo,
                        step,
                        num_bins: max_bins,
                    }
                }
                ColKind::Categorical | ColKind::Ranking => {
                    let needed = max_cat[c] + 2; // categories 0..=max plus the zero bin
                    if needed > max_bins as u64 + 1 {
                        return Err(GbmError::param(
                            "max_bins",
                            "must cover the number of categories per categorical column",
                            format!("column {c} needs {needed} bins, max_bins {max_bins}"),
                        ));
                    }
                    let num_bins = needed as u16;
                    if kinds[c] == ColKind::Categorical {
                        ColMapping::Category { num_bins }
                    } else {
                        ColMapping::Rank { num_bins }
                    }
                }
            };
            cols.push(mapping);
        }

        Ok(Self {
            cols,
            zero_as_missing,
            round,
        })
    }

    pub fn num_cols(&self) -> u32 {
        self.cols.len() as u32
    }

    /// Column family of `col`.
    pub fn kind(&self, col: u32) -> ColKind {
        match self.cols[col as usize] {
            ColMapping::Width { .. } => ColKind::Numeric,
            ColMapping::Category { .. } => ColKind::Categorical,
            ColMapping::Rank { .. } => ColKind::Ranking,
        }
    }

    /// Slot count of `col`, including the reserved zero bin.
    pub fn col_bins(&self, col: u32) -> u16 {
        match self.cols[col as usize] {
            ColMapping::Width { num_bins, .. }
            | ColMapping::Category { num_bins }
            | ColMapping::Rank { num_bins } => num_bins,
        }
    }

    fn bin_of(&self, col: usize, v: f64) -> u16 {
        if !v.is_finite() {
            return 0;
        }
        match self.cols[col] {
            ColMapping::Width {
                min,
                step,
                num_bins,
            } => {
                let v = if self.round { v.round() } else { v };
                if v == 0.0 && self.zero_as_missing {
                    return 0;
                }
                if step == 0.0 {
                    return 1;
                }
                let idx = ((v - min) / step).floor();
                let capped = idx.clamp(0.0, (num_bins - 2) as f64) as u16;
                capped + 1
            }
            ColMapping::Category { num_bins } | ColMapping::Rank { num_bins } => {
                if v < 0.0 || v.fract() != 0.0 {
                    return 0;
                }
                let bin = v as u64 + 1;
                if bin >= num_bins as u64 {
                    0 // unseen category routes with the missing bucket
                } else {
                    bin as u16
                }
            }
        }
    }

    /// Map one raw feature row to its bin vector.
    pub fn transform(&self, row: &[f64]) -> Result<BinVector> {
        if row.len() != self.cols.len() {
            return Err(GbmError::InvalidData(format!(
                "feature dimension mismatch: expected {}, got {}",
                self.cols.len(),
                row.len()
            )));
        }
        let mut pairs = Vec::new();
        for (c, &v) in row.iter().enumerate() {
            let bin = self.bin_of(c, v);
            if bin != 0 {
                pairs.push((c as u32, bin));
            }
        }
        Ok(BinVector::from_pairs(pairs, self.cols.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_width_binning() {
        let rows: Vec<Vec<f64>> = (0..=10).map(|i| vec![i as f64]).collect();
        let disc = Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Numeric],
            6,
            false,
            false,
        )
        .unwrap();
        assert_eq!(disc.col_bins(0), 6);
        let low = disc.transform(&[0.0]).unwrap();
        let high = disc.transform(&[10.0]).unwrap();
        assert_eq!(low.get(0), 1);
        assert_eq!(high.get(0), 5);
        // Out-of-range values clamp to the edge bins.
        assert_eq!(disc.transform(&[-5.0]).unwrap().get(0), 1);
        assert_eq!(disc.transform(&[99.0]).unwrap().get(0), 5);
    }

    #[test]
    fn test_zero_as_missing() {
        let rows: Vec<Vec<f64>> = vec![vec![0.0], vec![2.0], vec![4.0]];
        let disc = Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Numeric],
            8,
            true,
            false,
        )
        .unwrap();
        assert_eq!(disc.transform(&[0.0]).unwrap().get(0), 0);
        assert_ne!(disc.transform(&[2.0]).unwrap().get(0), 0);
    }

    #[test]
    fn test_categorical_binning() {
        let rows: Vec<Vec<f64>> = vec![vec![0.0], vec![1.0], vec![2.0]];
        let disc = Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Categorical],
            8,
            false,
            false,
        )
        .unwrap();
        assert_eq!(disc.col_bins(0), 4);
        assert_eq!(disc.transform(&[0.0]).unwrap().get(0), 1);
        assert_eq!(disc.transform(&[2.0]).unwrap().get(0), 3);
        // Unseen category falls back to the missing bucket.
        assert_eq!(disc.transform(&[7.0]).unwrap().get(0), 0);
    }

    #[test]
    fn test_too_many_categories_rejected() {
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let err = Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Categorical],
            4,
            false,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_nan_maps_to_missing() {
        let rows: Vec<Vec<f64>> = vec![vec![1.0], vec![2.0]];
        let disc = Discretizer::fit(
            rows.iter().map(|r| r.as_slice()),
            &[ColKind::Numeric],
            4,
            false,
            false,
        )
        .unwrap();
        assert_eq!(disc.transform(&[f64::NAN]).unwrap().get(0), 0);
    }
}
