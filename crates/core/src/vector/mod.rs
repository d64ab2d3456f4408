//! Distance functions over dense vectors
//!
//! The index is generic over a [`Distance`] functor. Because tree pivots are
//! arithmetic means of member points, a distance must be a true vector-space
//! distance for the index to be meaningful, since averaged centroids live in
//! the same space the distance measures.
//!
//! # Provided distances
//!
//! - [`SquaredEuclidean`]: squared L2, the default. SIMD-accelerated with
//!   runtime CPU detection.
//! - [`Manhattan`]: L1 distance, scalar.
//!
//! # Usage
//!
//! ```
//! use bramble_core::vector::{Distance, SquaredEuclidean};
//!
//! let d = SquaredEuclidean;
//! assert_eq!(d.distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
//! ```

pub mod ops;
pub mod simd;

// Re-export commonly used functions
pub use ops::{approx_equal, manhattan_distance, squared_euclidean};
pub use simd::squared_euclidean_simd;

/// Distance functor over `f32` vectors
///
/// Implementations must return an ordered, non-negative value and must be
/// compatible with componentwise averaging (see the module docs). Both
/// arguments are always the same length when called by the index.
pub trait Distance {
    /// Distance between `a` and `b`
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// Short human-readable name, used in storage metadata
    fn name(&self) -> &'static str;
}

/// Squared Euclidean (L2²) distance
///
/// The standard metric for k-means clustering. Skipping the square root
/// preserves ordering and keeps the hot path cheap.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredEuclidean;

impl Distance for SquaredEuclidean {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        simd::squared_euclidean_simd(a, b)
    }

    fn name(&self) -> &'static str {
        "squared_euclidean"
    }
}

/// Manhattan (L1) distance
#[derive(Debug, Clone, Copy, Default)]
pub struct Manhattan;

impl Distance for Manhattan {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        ops::manhattan_distance(a, b)
    }

    fn name(&self) -> &'static str {
        "manhattan"
    }
}
