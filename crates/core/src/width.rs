//! Integer-width selection for tree, node, column, and bin identifiers
//!
//! The training engine is generic over the narrowest unsigned widths
//! that cover the id ranges fixed at fit start; the runtime dispatch
//! table in the trainer crate picks the instantiation.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Storage width of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub enum IdWidth {
    U8,
    U16,
    U32,
}

impl IdWidth {
    /// Bytes per stored id at this width
    pub fn bytes(self) -> usize {
        match self {
            IdWidth::U8 => 1,
            IdWidth::U16 => 2,
            IdWidth::U32 => 4,
        }
    }
}

/// Narrowest width whose range covers `max_value` inclusively.
pub fn width_for(max_value: u64) -> IdWidth {
    if max_value <= u8::MAX as u64 {
        IdWidth::U8
    } else if max_value <= u16::MAX as u64 {
        IdWidth::U16
    } else {
        IdWidth::U32
    }
}

/// Unsigned primitive usable as a packed identifier.
///
/// Conversions are infallible by construction: widths are selected from
/// the validated configuration before any id is produced.
pub trait IdPrim:
    Copy + Eq + Ord + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const WIDTH: IdWidth;

    fn from_usize(v: usize) -> Self;
    fn to_usize(self) -> usize;
}

impl IdPrim for u8 {
    const WIDTH: IdWidth = IdWidth::U8;

    fn from_usize(v: usize) -> Self {
        debug_assert!(v <= u8::MAX as usize);
        v as u8
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

impl IdPrim for u16 {
    const WIDTH: IdWidth = IdWidth::U16;

    fn from_usize(v: usize) -> Self {
        debug_assert!(v <= u16::MAX as usize);
        v as u16
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

impl IdPrim for u32 {
    const WIDTH: IdWidth = IdWidth::U32;

    fn from_usize(v: usize) -> Self {
        debug_assert!(v <= u32::MAX as usize);
        v as u32
    }

    fn to_usize(self) -> usize {
        self as usize
    }
}

/// Float primitive used for histogram and gradient accumulation.
pub trait AccFloat:
    Copy + PartialOrd + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn zero() -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    fn add(self, other: Self) -> Self {
        Self::from_f64(self.to_f64() + other.to_f64())
    }

    fn sub(self, other: Self) -> Self {
        Self::from_f64(self.to_f64() - other.to_f64())
    }
}

impl AccFloat for f32 {
    fn zero() -> Self {
        0.0
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl AccFloat for f64 {
    fn zero() -> Self {
        0.0
    }

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_selection() {
        assert_eq!(width_for(0), IdWidth::U8);
        assert_eq!(width_for(255), IdWidth::U8);
        assert_eq!(width_for(256), IdWidth::U16);
        assert_eq!(width_for(65_535), IdWidth::U16);
        assert_eq!(width_for(65_536), IdWidth::U32);
    }

    #[test]
    fn test_id_round_trip() {
        assert_eq!(u8::from_usize(200).to_usize(), 200);
        assert_eq!(u16::from_usize(60_000).to_usize(), 60_000);
        assert_eq!(u32::from_usize(1 << 20).to_usize(), 1 << 20);
    }

    #[test]
    fn test_f32_accumulation_matches_native() {
        let a = 0.1f32;
        let b = 0.2f32;
        assert_eq!(AccFloat::add(a, b), a + b);
        assert_eq!(AccFloat::sub(a, b), a - b);
    }
}
