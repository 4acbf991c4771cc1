//! Runtime width dispatch
//!
//! Sizes are known once the configuration is validated: the per-round
//! tree count fixes `T`, the maximum node id fixes `N`, and the float
//! type picks the accumulator. Each of the nine `(T, N)` combinations
//! instantiates the generic loop explicitly.

use crate::boost::{boost_loop, Callback, FitContext};
use thicket_core::{width_for, FloatType, GbmModel, IdWidth, Result};

/// Instantiate and run the boosting loop at the narrowest widths that
/// cover the configured ranges.
pub fn dispatch_fit(ctx: &FitContext, callbacks: &mut [Box<dyn Callback>]) -> Result<GbmModel> {
    let raw_size = ctx.objective.num_outputs();
    let trees_per_round = ctx.config.num_trees_per_round(raw_size);
    let tree_width = width_for(trees_per_round.saturating_sub(1) as u64);
    // Leaves of a depth-d tree carry ids up to 2^(d+1) - 1.
    let node_width = width_for((1u64 << (ctx.config.max_depth + 1)) - 1);
    let float = ctx.config.float_type;

    macro_rules! with_float {
        ($t:ty, $n:ty) => {
            match float {
                FloatType::Float => boost_loop::<$t, $n, f32>(ctx, callbacks),
                FloatType::Double => boost_loop::<$t, $n, f64>(ctx, callbacks),
            }
        };
    }

    match (tree_width, node_width) {
        (IdWidth::U8, IdWidth::U8) => with_float!(u8, u8),
        (IdWidth::U8, IdWidth::U16) => with_float!(u8, u16),
        (IdWidth::U8, IdWidth::U32) => with_float!(u8, u32),
        (IdWidth::U16, IdWidth::U8) => with_float!(u16, u8),
        (IdWidth::U16, IdWidth::U16) => with_float!(u16, u16),
        (IdWidth::U16, IdWidth::U32) => with_float!(u16, u32),
        (IdWidth::U32, IdWidth::U8) => with_float!(u32, u8),
        (IdWidth::U32, IdWidth::U16) => with_float!(u32, u16),
        (IdWidth::U32, IdWidth::U32) => with_float!(u32, u32),
    }
}

#[cfg(test)]
mod tests {
    use thicket_core::{width_for, IdWidth};

    #[test]
    fn test_width_choices_cover_ranges() {
        // forest_size * raw_size trees per round.
        assert_eq!(width_for(0), IdWidth::U8);
        assert_eq!(width_for(300), IdWidth::U16);
        // max_depth = 5 -> leaf ids below 64.
        assert_eq!(width_for((1 << 6) - 1), IdWidth::U8);
        // max_depth = 20 -> node ids need 32 bits.
        assert_eq!(width_for((1u64 << 21) - 1), IdWidth::U32);
    }
}
