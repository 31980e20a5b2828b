//! Full-frame 2D Fourier transforms, spectrum resampling and sub-pixel
//! Fourier shifts.
//!
//! Spectra use the unshifted layout produced by rustfft: DC at `[[0, 0]]`,
//! negative frequencies in the upper half of each axis. Frequencies are
//! expressed in bins (cycles per field of view), which is the same unit on
//! the raw and on the enlarged output grid.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use crate::float_trait::SimFloat;

/// Pre-computed forward and inverse plans for one square frame size.
///
/// Plans are created once and shared by every frame, band and slice of a
/// run; rustfft plans are `Send + Sync`.
#[derive(Clone)]
pub struct FftPlans2d<F: SimFloat> {
    size: usize,
    forward: Arc<dyn Fft<F>>,
    inverse: Arc<dyn Fft<F>>,
}

impl<F: SimFloat> FftPlans2d<F> {
    /// Create plans for `size × size` frames.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::<F>::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    /// Edge length the plans were built for.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<F: SimFloat> std::fmt::Debug for FftPlans2d<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftPlans2d").field("size", &self.size).finish()
    }
}

/// Run one 1D transform over every lane of `data` along `lane_axis`.
fn transform_lanes<F: SimFloat>(data: &mut Array2<Complex<F>>, plan: &Arc<dyn Fft<F>>, lane_axis: Axis) {
    let iter_axis = if lane_axis == Axis(1) { Axis(0) } else { Axis(1) };
    let len = data.len_of(lane_axis);
    let scratch_len = plan.get_inplace_scratch_len();
    let zero = Complex::new(F::zero(), F::zero());

    data.axis_iter_mut(iter_axis).into_par_iter().for_each_init(
        || (vec![zero; len], vec![zero; scratch_len]),
        |(buffer, scratch), mut lane| {
            for (dst, src) in buffer.iter_mut().zip(lane.iter()) {
                *dst = *src;
            }
            plan.process_with_scratch(buffer, scratch);
            for (dst, src) in lane.iter_mut().zip(buffer.iter()) {
                *dst = *src;
            }
        },
    );
}

/// In-place unnormalized forward 2D FFT.
pub fn fft2d_inplace<F: SimFloat>(data: &mut Array2<Complex<F>>, plans: &FftPlans2d<F>) {
    debug_assert_eq!(data.dim(), (plans.size, plans.size));
    transform_lanes(data, &plans.forward, Axis(1));
    transform_lanes(data, &plans.forward, Axis(0));
}

/// In-place inverse 2D FFT, normalized by 1/(rows*cols).
pub fn ifft2d_inplace<F: SimFloat>(data: &mut Array2<Complex<F>>, plans: &FftPlans2d<F>) {
    debug_assert_eq!(data.dim(), (plans.size, plans.size));
    transform_lanes(data, &plans.inverse, Axis(0));
    transform_lanes(data, &plans.inverse, Axis(1));
    let norm = F::one() / F::usize_as(plans.size * plans.size);
    data.mapv_inplace(|v| v * norm);
}

/// Forward 2D FFT of a real image.
pub fn fft2d<F: SimFloat>(input: ArrayView2<F>, plans: &FftPlans2d<F>) -> Array2<Complex<F>> {
    let mut data = input.mapv(|v| Complex::new(v, F::zero()));
    fft2d_inplace(&mut data, plans);
    data
}

/// Inverse 2D FFT keeping the real part.
pub fn ifft2d_real<F: SimFloat>(input: &Array2<Complex<F>>, plans: &FftPlans2d<F>) -> Array2<F> {
    let mut data = input.clone();
    ifft2d_inplace(&mut data, plans);
    data.mapv(|v| v.re)
}

/// Signed frequency (in bins) of array index `index` on an axis of length `n`.
#[inline]
pub fn signed_frequency(index: usize, n: usize) -> isize {
    if index < (n + 1) / 2 {
        index as isize
    } else {
        index as isize - n as isize
    }
}

/// Array index holding signed frequency `freq` on an axis of length `n`.
#[inline]
pub fn frequency_index(freq: isize, n: usize) -> usize {
    freq.rem_euclid(n as isize) as usize
}

/// Signed frequencies of every index of an axis of length `n`.
pub fn frequency_axis(n: usize) -> Vec<f64> {
    (0..n).map(|i| signed_frequency(i, n) as f64).collect()
}

/// Zero-pad a spectrum onto a larger grid, keeping every bin at its signed
/// frequency.
pub fn paste_spectrum<F: SimFloat>(src: &Array2<Complex<F>>, target: usize) -> Array2<Complex<F>> {
    let (n, _) = src.dim();
    debug_assert!(target >= n);
    let mut out = Array2::<Complex<F>>::zeros((target, target));
    for ((y, x), &v) in src.indexed_iter() {
        let ty = frequency_index(signed_frequency(y, n), target);
        let tx = frequency_index(signed_frequency(x, n), target);
        out[[ty, tx]] = v;
    }
    out
}

/// Keep the central `target × target` frequencies of a spectrum.
pub fn crop_spectrum<F: SimFloat>(src: &Array2<Complex<F>>, target: usize) -> Array2<Complex<F>> {
    let (n, _) = src.dim();
    debug_assert!(target <= n);
    Array2::from_shape_fn((target, target), |(y, x)| {
        let sy = frequency_index(signed_frequency(y, target), n);
        let sx = frequency_index(signed_frequency(x, target), n);
        src[[sy, sx]]
    })
}

/// Multiply a real-space field by `exp(i 2π (kx·x + ky·y) / n)`.
///
/// After a forward FFT this moves spectral content from `k` to `k + shift`.
pub fn apply_phase_ramp<F: SimFloat>(data: &mut Array2<Complex<F>>, shift: [f64; 2]) {
    let (rows, cols) = data.dim();
    let two_pi = 2.0 * std::f64::consts::PI;
    let col_factor: Vec<Complex<F>> = (0..cols)
        .map(|x| {
            let phase = two_pi * shift[0] * x as f64 / cols as f64;
            Complex::new(F::from_f64_c(phase.cos()), F::from_f64_c(phase.sin()))
        })
        .collect();
    let row_factor: Vec<Complex<F>> = (0..rows)
        .map(|y| {
            let phase = two_pi * shift[1] * y as f64 / rows as f64;
            Complex::new(F::from_f64_c(phase.cos()), F::from_f64_c(phase.sin()))
        })
        .collect();

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(row_factor.par_iter())
        .for_each(|(mut row, &ry)| {
            for (v, &cx) in row.iter_mut().zip(col_factor.iter()) {
                *v = *v * ry * cx;
            }
        });
}

/// Move a spectrum by a (sub-pixel) shift given in bins: `out(k) = in(k - shift)`.
///
/// Implemented as inverse FFT, real-space phase ramp and forward FFT.
pub fn fourier_shift_inplace<F: SimFloat>(
    spectrum: &mut Array2<Complex<F>>,
    shift: [f64; 2],
    plans: &FftPlans2d<F>,
) {
    if shift[0] == 0.0 && shift[1] == 0.0 {
        return;
    }
    ifft2d_inplace(spectrum, plans);
    apply_phase_ramp(spectrum, shift);
    fft2d_inplace(spectrum, plans);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_matrix_f64(size: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((size, size), |_| rng.gen::<f64>() * 2.0 - 1.0)
    }

    fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    // ==================== FFT Tests ====================

    #[test]
    fn test_fft2d_roundtrip_various_sizes() {
        for size in [4usize, 8, 15, 32, 64] {
            let input = random_matrix_f64(size, size as u64 * 31);
            let plans = FftPlans2d::new(size);
            let freq = fft2d(input.view(), &plans);
            let output = ifft2d_real(&freq, &plans);
            assert!(
                max_abs_diff(&input, &output) < 1e-12,
                "roundtrip failed for {}x{}",
                size,
                size
            );
        }
    }

    #[test]
    fn test_fft2d_matches_direct_dft() {
        let size = 6;
        let input = random_matrix_f64(size, 7);
        let plans = FftPlans2d::new(size);
        let freq = fft2d(input.view(), &plans);

        let two_pi = 2.0 * std::f64::consts::PI;
        for ky in 0..size {
            for kx in 0..size {
                let mut acc = Complex::new(0.0, 0.0);
                for y in 0..size {
                    for x in 0..size {
                        let phase = -two_pi * ((kx * x) as f64 + (ky * y) as f64) / size as f64;
                        acc += Complex::from_polar(input[[y, x]], phase);
                    }
                }
                assert!((acc - freq[[ky, kx]]).norm() < 1e-10);
            }
        }
    }

    #[test]
    fn test_fft2d_f32_roundtrip() {
        let size = 16;
        let input = random_matrix_f64(size, 99).mapv(|v| v as f32);
        let plans = FftPlans2d::<f32>::new(size);
        let output = ifft2d_real(&fft2d(input.view(), &plans), &plans);
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    // ==================== Frequency Index Tests ====================

    #[test]
    fn test_signed_frequency_even_and_odd() {
        assert_eq!(signed_frequency(0, 8), 0);
        assert_eq!(signed_frequency(3, 8), 3);
        assert_eq!(signed_frequency(4, 8), -4);
        assert_eq!(signed_frequency(7, 8), -1);
        assert_eq!(signed_frequency(2, 5), 2);
        assert_eq!(signed_frequency(3, 5), -2);
        for n in [5usize, 8] {
            for i in 0..n {
                assert_eq!(frequency_index(signed_frequency(i, n), n), i);
            }
        }
    }

    // ==================== Resampling Tests ====================

    #[test]
    fn test_paste_then_crop_is_identity() {
        let size = 8;
        let input = random_matrix_f64(size, 3);
        let plans = FftPlans2d::new(size);
        let spectrum = fft2d(input.view(), &plans);
        let padded = paste_spectrum(&spectrum, 16);
        let back = crop_spectrum(&padded, size);
        for (a, b) in spectrum.iter().zip(back.iter()) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn test_paste_spectrum_upsamples_smooth_image() {
        // A single cosine is reproduced on the finer grid (scaled by the area ratio).
        let size = 16;
        let input = Array2::from_shape_fn((size, size), |(_, x)| {
            (2.0 * std::f64::consts::PI * 2.0 * x as f64 / size as f64).cos()
        });
        let plans = FftPlans2d::new(size);
        let big_plans = FftPlans2d::new(32);
        let padded = paste_spectrum(&fft2d(input.view(), &plans), 32);
        let up = ifft2d_real(&padded, &big_plans).mapv(|v| v * 4.0);
        for x in 0..32 {
            let expected = (2.0 * std::f64::consts::PI * 2.0 * x as f64 / 32.0).cos();
            assert!((up[[5, x]] - expected).abs() < 1e-10);
        }
    }

    // ==================== Shift Tests ====================

    #[test]
    fn test_integer_fourier_shift_moves_bins() {
        let size = 16;
        let input = random_matrix_f64(size, 11);
        let plans = FftPlans2d::new(size);
        let spectrum = fft2d(input.view(), &plans);
        let mut shifted = spectrum.clone();
        fourier_shift_inplace(&mut shifted, [3.0, -2.0], &plans);

        for y in 0..size {
            for x in 0..size {
                let src_y = frequency_index(signed_frequency(y, size) + 2, size);
                let src_x = frequency_index(signed_frequency(x, size) - 3, size);
                assert!((shifted[[y, x]] - spectrum[[src_y, src_x]]).norm() < 1e-9);
            }
        }
    }

    #[test]
    fn test_fourier_shift_roundtrip_subpixel() {
        let size = 32;
        let input = random_matrix_f64(size, 5);
        let plans = FftPlans2d::new(size);
        let spectrum = fft2d(input.view(), &plans);
        let mut shifted = spectrum.clone();
        fourier_shift_inplace(&mut shifted, [1.37, -0.42], &plans);
        fourier_shift_inplace(&mut shifted, [-1.37, 0.42], &plans);
        for (a, b) in spectrum.iter().zip(shifted.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }
}
