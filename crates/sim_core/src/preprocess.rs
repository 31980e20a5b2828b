//! Raw frame preprocessing: validation, background subtraction, optional
//! border fade and forward transform.

use std::time::Instant;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::float_trait::SimFloat;
use crate::params::SimGeometry;
use crate::transforms::{fft2d_inplace, FftPlans2d};

/// Clipped-pixel fraction above which a warning is logged.
const CLIPPED_WARN_FRACTION: f64 = 0.1;

/// Preprocessing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Constant camera background subtracted from every pixel.
    pub background: f64,
    /// Width in pixels of the cosine border fade; `None` disables it.
    pub fade_border: Option<usize>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            background: 0.0,
            fade_border: None,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self, geometry: &SimGeometry) -> Result<()> {
        if !self.background.is_finite() {
            return Err(SimError::config("background must be finite"));
        }
        if let Some(width) = self.fade_border {
            if width == 0 || 2 * width > geometry.image_size {
                return Err(SimError::config(format!(
                    "fade_border width {width} must be in 1..={}",
                    geometry.image_size / 2
                )));
            }
        }
        Ok(())
    }
}

/// Spectra of one slice plus per-frame diagnostics.
#[derive(Debug, Clone)]
pub struct PreprocessedFrames<F: SimFloat> {
    /// Forward transforms, in input order.
    pub spectra: Vec<Array2<Complex<F>>>,
    /// Fraction of pixels clipped to zero by background subtraction.
    pub clipped_fractions: Vec<f64>,
}

/// Subtract a constant background and clip negatives to zero.
///
/// Returns the fraction of pixels that were clipped.
pub fn subtract_background<F: SimFloat>(frame: &mut Array2<F>, background: f64) -> f64 {
    let bg = F::from_f64_c(background);
    let mut clipped = 0usize;
    frame.mapv_inplace(|v| {
        let r = v - bg;
        if r < F::zero() {
            clipped += 1;
            F::zero()
        } else {
            r
        }
    });
    let fraction = clipped as f64 / frame.len().max(1) as f64;
    if fraction > CLIPPED_WARN_FRACTION {
        log::warn!(
            "background {background} clipped {:.1}% of pixels",
            fraction * 100.0
        );
    }
    fraction
}

/// Taper the outer `width` pixels of a frame with a raised cosine.
pub fn fade_border_cos<F: SimFloat>(frame: &mut Array2<F>, width: usize) {
    if width == 0 {
        return;
    }
    let weights = |n: usize| -> Vec<F> {
        (0..n)
            .map(|i| {
                let d = i.min(n - 1 - i);
                if d >= width {
                    F::one()
                } else {
                    let t = (d as f64 + 0.5) / width as f64;
                    F::from_f64_c(0.5 - 0.5 * (std::f64::consts::PI * t).cos())
                }
            })
            .collect()
    };
    let (rows, cols) = frame.dim();
    let wy = weights(rows);
    let wx = weights(cols);
    for ((y, x), v) in frame.indexed_iter_mut() {
        *v *= wy[y] * wx[x];
    }
}

/// Check that every frame is square and matches the configured image size.
pub fn validate_frames<F: SimFloat>(frames: &[ArrayView2<'_, F>], geometry: &SimGeometry) -> Result<()> {
    let expected = (geometry.image_size, geometry.image_size);
    for (i, f) in frames.iter().enumerate() {
        if f.dim() != expected {
            return Err(SimError::shape(format!("raw frame {i}"), expected, f.dim()));
        }
    }
    Ok(())
}

/// Validate, background-correct, fade and transform the frames of one slice.
///
/// All frames are checked before any transform runs. Frames are then
/// processed in parallel.
pub fn preprocess_frames<F: SimFloat>(
    frames: &[ArrayView2<'_, F>],
    config: &PreprocessConfig,
    geometry: &SimGeometry,
    plans: &FftPlans2d<F>,
) -> Result<PreprocessedFrames<F>> {
    if frames.len() != geometry.frames_per_slice() {
        return Err(SimError::shape(
            "frames per slice",
            (geometry.frames_per_slice(), 1),
            (frames.len(), 1),
        ));
    }
    validate_frames(frames, geometry)?;
    if plans.size() != geometry.image_size {
        return Err(SimError::shape(
            "FFT plan size",
            (geometry.image_size, geometry.image_size),
            (plans.size(), plans.size()),
        ));
    }
    config.validate(geometry)?;

    let started = Instant::now();
    let (spectra, clipped_fractions): (Vec<_>, Vec<_>) = frames
        .par_iter()
        .map(|frame| {
            let mut img = frame.to_owned();
            let clipped = subtract_background(&mut img, config.background);
            if let Some(width) = config.fade_border {
                fade_border_cos(&mut img, width);
            }
            let mut spectrum = img.mapv(|v| Complex::new(v, F::zero()));
            fft2d_inplace(&mut spectrum, plans);
            (spectrum, clipped)
        })
        .unzip();
    log::debug!(
        "preprocessed {} frames in {:.1} ms",
        frames.len(),
        started.elapsed().as_secs_f64() * 1e3
    );

    Ok(PreprocessedFrames {
        spectra,
        clipped_fractions,
    })
}
