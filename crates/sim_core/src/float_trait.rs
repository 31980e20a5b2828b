//! Float trait abstraction for f32/f64 support.
//!
//! Images and spectra are generic over the sample precision. Scalar
//! parameters (frequencies, phases, modulation depths, filter settings) are
//! always carried as `f64` and converted at the array boundary.

use num_traits::{Float, FromPrimitive, NumAssign};
use rustfft::FftNum;
use std::fmt::Debug;
use std::iter::Sum;

/// Trait alias for floating point types supported by the reconstruction.
///
/// Bounds and conversions the crate relies on:
/// - `Float` and `NumAssign` for per-sample arithmetic on OTF grids,
///   denominators and spectra
/// - `FftNum` so `rustfft` plans can be built for the type
/// - `Send + Sync` for rayon-parallel stages
/// - `from_f64_c` to bring `f64` parameters into the array precision
/// - `usize_as` for FFT normalisation by the grid size
/// - `as_f64` to accumulate correlations and report scalars in `f64`
pub trait SimFloat:
    Float + FftNum + FromPrimitive + NumAssign + Sum + Debug + Send + Sync + 'static
{
    /// Create a value from an f64 constant.
    fn from_f64_c(val: f64) -> Self;

    /// Create a value from a usize constant.
    fn usize_as(val: usize) -> Self;

    /// Widen to f64 for parameter arithmetic.
    fn as_f64(self) -> f64;
}

impl SimFloat for f32 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val as f32
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl SimFloat for f64 {
    #[inline]
    fn from_f64_c(val: f64) -> Self {
        val
    }

    #[inline]
    fn usize_as(val: usize) -> Self {
        val as f64
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
