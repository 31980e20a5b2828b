//! Wiener-filtered SIM reconstruction.
//!
//! One slice moves through fixed stages, each a method consuming the
//! previous stage's value:
//!
//! ```text
//! PreprocessedSlice -> SeparatedSlice -> FilteredSlice -> CombinedSpectrum -> image
//! ```
//!
//! Everything that depends only on the OTF and the parameter set (FFT
//! plans, the Wiener denominator, the apodization window, separation
//! matrices) is computed once in [`ReconstructionEngine::new`] and shared
//! read-only by every slice.

use std::time::Instant;

use ndarray::{Array2, ArrayView2, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::band_separation::{component_band, separate_bands, SeparationMatrix};
use crate::error::{Result, SimError};
use crate::feedback::{Feedback, SliceStage, StageEvent, StageObserver, Verbosity};
use crate::float_trait::SimFloat;
use crate::otf::{ideal_otf, OtfModel};
use crate::params::{DirectionParams, IlluminationParams, WienerFilterParams};
use crate::preprocess::{preprocess_frames, PreprocessConfig};
use crate::transforms::{fourier_shift_inplace, ifft2d_inplace, paste_spectrum, signed_frequency, FftPlans2d};

// =============================================================================
// Constants
// =============================================================================

/// Default output grid enlargement.
pub const DEFAULT_UPSAMPLING: usize = 2;

/// Upper end of the display range used by [`OutputRange::ClipAndScale`].
pub const DISPLAY_MAX: f64 = 255.0;

// =============================================================================
// Configuration
// =============================================================================

/// Post-processing of the real-space result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputRange {
    /// Keep negative values.
    #[default]
    Unclipped,
    /// Clip negative values to zero.
    ClipNegative,
    /// Clip negatives and rescale the maximum to [`DISPLAY_MAX`].
    ClipAndScale,
}

/// Reconstruction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Multiply bands by the OTF before moving them (otherwise after).
    pub otf_before_shift: bool,
    /// Include the OTF attenuation notch in filtering.
    pub use_attenuation: bool,
    pub output_range: OutputRange,
    /// Output grid size relative to the raw frames.
    pub upsampling: usize,
    /// Amount of intermediate output sent to an observer.
    pub verbosity: Verbosity,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            otf_before_shift: true,
            use_attenuation: false,
            output_range: OutputRange::Unclipped,
            upsampling: DEFAULT_UPSAMPLING,
            verbosity: Verbosity::Off,
        }
    }
}

impl ReconstructionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.upsampling == 0 {
            return Err(SimError::config("upsampling must be >= 1"));
        }
        Ok(())
    }
}

// =============================================================================
// Slice stages
// =============================================================================

/// Forward-transformed frames of one slice, `[direction][phase]` order.
#[derive(Debug, Clone)]
pub struct PreprocessedSlice<F: SimFloat> {
    spectra: Vec<Array2<Complex<F>>>,
    clipped_fractions: Vec<f64>,
}

impl<F: SimFloat> PreprocessedSlice<F> {
    pub fn spectra(&self) -> &[Array2<Complex<F>>] {
        &self.spectra
    }

    pub fn clipped_fractions(&self) -> &[f64] {
        &self.clipped_fractions
    }
}

/// Separated components per direction, `[0, +1, -1, ...]` order.
#[derive(Debug, Clone)]
pub struct SeparatedSlice<F: SimFloat> {
    bands: Vec<Vec<Array2<Complex<F>>>>,
}

impl<F: SimFloat> SeparatedSlice<F> {
    pub fn bands(&self, direction: usize) -> &[Array2<Complex<F>>] {
        &self.bands[direction]
    }
}

/// Shifted, OTF-weighted numerator of every direction on the output grid.
#[derive(Debug, Clone)]
pub struct FilteredSlice<F: SimFloat> {
    contributions: Vec<Array2<Complex<F>>>,
}

impl<F: SimFloat> FilteredSlice<F> {
    pub fn contributions(&self) -> &[Array2<Complex<F>>] {
        &self.contributions
    }
}

/// Wiener-filtered, apodized spectrum on the output grid.
#[derive(Debug, Clone)]
pub struct CombinedSpectrum<F: SimFloat> {
    spectrum: Array2<Complex<F>>,
}

impl<F: SimFloat> CombinedSpectrum<F> {
    pub fn spectrum(&self) -> &Array2<Complex<F>> {
        &self.spectrum
    }

    pub fn into_spectrum(self) -> Array2<Complex<F>> {
        self.spectrum
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Radial apodization `A(k) = ideal_otf(|k| / (apo_cutoff · cutoff))^apo_bend`
/// on an unshifted `size × size` grid.
///
/// `cutoff` is the OTF cutoff in cycles/µm.
pub fn apodization_window<F: SimFloat>(
    size: usize,
    cycles_per_micron: f64,
    cutoff: f64,
    filter: &WienerFilterParams,
) -> Array2<F> {
    let limit = filter.apo_cutoff * cutoff;
    let mut window = Array2::<F>::zeros((size, size));
    Zip::indexed(&mut window).par_for_each(|(y, x), v| {
        let kx = signed_frequency(x, size) as f64 * cycles_per_micron;
        let ky = signed_frequency(y, size) as f64 * cycles_per_micron;
        let d = kx.hypot(ky) / limit;
        *v = F::from_f64_c(ideal_otf(d).powf(filter.apo_bend));
    });
    window
}

/// Shift (bins) that moves component `sign · band` to its true position.
///
/// Component `+b` holds `m_b · OTF(k) · S(k − b·k₀)`, so object frequency
/// `q` sits at `q + b·k₀` and the component moves by `−b·k₀`. Its OTF is
/// then centred at `−b·k₀` as well.
fn component_shift(dir: &DirectionParams, band: usize, sign: i8) -> [f64; 2] {
    let f = dir.band_frequency(band);
    let s = -(sign as f64);
    [f[0] * s, f[1] * s]
}

// =============================================================================
// Engine
// =============================================================================

/// Reconstruction engine for one parameter set.
pub struct ReconstructionEngine<F: SimFloat> {
    otf: OtfModel,
    params: IlluminationParams,
    config: ReconstructionConfig,
    raw_plans: FftPlans2d<F>,
    out_plans: FftPlans2d<F>,
    matrices: Vec<SeparationMatrix>,
    /// Unshifted OTF (with attenuation when enabled) per band, output grid.
    band_otf: Vec<Array2<F>>,
    denominator: Array2<F>,
    apodization: Array2<F>,
}

impl<F: SimFloat> std::fmt::Debug for ReconstructionEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconstructionEngine")
            .field("geometry", self.params.geometry())
            .field("config", &self.config)
            .finish()
    }
}

impl<F: SimFloat> ReconstructionEngine<F> {
    /// Validate inputs and precompute the data-independent filters.
    pub fn new(otf: OtfModel, params: IlluminationParams, config: ReconstructionConfig) -> Result<Self> {
        otf.validate()?;
        params.validate()?;
        config.validate()?;
        let started = Instant::now();

        let geometry = params.geometry().clone();
        let n = geometry.image_size;
        let m = n * config.upsampling;
        let cpm = geometry.cycles_per_micron();
        let attenuate = config.use_attenuation;
        if attenuate && otf.attenuation_settings().is_none() {
            log::warn!("use_attenuation is set but the OTF carries no attenuation settings");
        }

        let matrices = params
            .directions()
            .iter()
            .map(|d| SeparationMatrix::for_direction(&geometry, d))
            .collect::<Result<Vec<_>>>()?;

        for (i, dir) in params.directions().iter().enumerate() {
            let top = dir.band_frequency(geometry.nr_bands - 1);
            let reach = top[0].hypot(top[1]) + otf.cutoff(geometry.nr_bands - 1) / cpm;
            if reach >= m as f64 / 2.0 {
                log::warn!(
                    "direction {i}: shifted support reaches {reach:.1} bins, beyond the output Nyquist {}",
                    m / 2
                );
            }
        }

        let band_otf: Vec<Array2<F>> = (0..geometry.nr_bands)
            .map(|b| otf.sample_grid(m, cpm, b, [0.0, 0.0], attenuate))
            .collect();

        let w = params.filter().wiener;
        let mut denominator = Array2::<F>::from_elem((m, m), F::from_f64_c(w * w));
        for dir in params.directions() {
            let weights: Vec<(F, Array2<F>)> = (0..geometry.nr_components())
                .into_par_iter()
                .map(|c| {
                    let (band, sign) = component_band(c);
                    let mb = dir.modulation(band);
                    let shift = component_shift(dir, band, sign);
                    (
                        F::from_f64_c(mb * mb),
                        otf.sample_grid(m, cpm, band, shift, attenuate),
                    )
                })
                .collect();
            for (m2, grid) in &weights {
                Zip::from(&mut denominator)
                    .and(grid)
                    .for_each(|d, &o| *d += *m2 * o * o);
            }
        }

        let apodization = apodization_window(m, cpm, otf.cutoff(0), params.filter());

        log::debug!(
            "reconstruction engine for {n}x{n} -> {m}x{m} prepared in {:.1} ms",
            started.elapsed().as_secs_f64() * 1e3
        );

        Ok(Self {
            otf,
            raw_plans: FftPlans2d::new(n),
            out_plans: FftPlans2d::new(m),
            params,
            config,
            matrices,
            band_otf,
            denominator,
            apodization,
        })
    }

    pub fn params(&self) -> &IlluminationParams {
        &self.params
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn otf(&self) -> &OtfModel {
        &self.otf
    }

    /// Plans for the raw frame size.
    pub fn raw_plans(&self) -> &FftPlans2d<F> {
        &self.raw_plans
    }

    /// Edge length of the reconstructed image.
    pub fn output_size(&self) -> usize {
        self.out_plans.size()
    }

    /// `Σ m²·|OTF(k − s)|² + w²` on the output grid.
    pub fn wiener_denominator(&self) -> &Array2<F> {
        &self.denominator
    }

    pub fn apodization(&self) -> &Array2<F> {
        &self.apodization
    }

    /// Feedback handle using this engine's verbosity.
    pub fn feedback<'a>(&self, observer: Option<&'a dyn StageObserver<F>>, slice: usize) -> Feedback<'a, F> {
        Feedback::new(observer, self.config.verbosity, slice)
    }

    // ==================== Stages ====================

    /// Background-correct and transform raw frames (`[direction][phase]` order).
    pub fn preprocess(
        &self,
        frames: &[ArrayView2<'_, F>],
        config: &PreprocessConfig,
        feedback: Feedback<'_, F>,
    ) -> Result<PreprocessedSlice<F>> {
        let out = preprocess_frames(frames, config, self.params.geometry(), &self.raw_plans)?;
        for (frame, &clipped_fraction) in out.clipped_fractions.iter().enumerate() {
            feedback.emit(
                SliceStage::Preprocessed,
                StageEvent::Preprocessed {
                    frame,
                    clipped_fraction,
                },
            );
        }
        Ok(PreprocessedSlice {
            spectra: out.spectra,
            clipped_fractions: out.clipped_fractions,
        })
    }

    /// Wrap spectra that were transformed elsewhere, checking count and shape.
    pub fn from_spectra(&self, spectra: Vec<Array2<Complex<F>>>) -> Result<PreprocessedSlice<F>> {
        let geometry = self.params.geometry();
        if spectra.len() != geometry.frames_per_slice() {
            return Err(SimError::shape(
                "spectra per slice",
                (geometry.frames_per_slice(), 1),
                (spectra.len(), 1),
            ));
        }
        let expected = (geometry.image_size, geometry.image_size);
        for (i, s) in spectra.iter().enumerate() {
            if s.dim() != expected {
                return Err(SimError::shape(format!("spectrum {i}"), expected, s.dim()));
            }
        }
        let clipped_fractions = vec![0.0; spectra.len()];
        Ok(PreprocessedSlice {
            spectra,
            clipped_fractions,
        })
    }

    /// Separate each direction's phase-stepped spectra into components.
    pub fn separate(&self, slice: PreprocessedSlice<F>, feedback: Feedback<'_, F>) -> Result<SeparatedSlice<F>> {
        let p = self.params.geometry().nr_phases;
        let bands = self
            .matrices
            .par_iter()
            .enumerate()
            .map(|(d, matrix)| separate_bands(&slice.spectra[d * p..(d + 1) * p], matrix))
            .collect::<Result<Vec<_>>>()?;
        for (direction, comps) in bands.iter().enumerate() {
            feedback.emit(
                SliceStage::BandSeparated,
                StageEvent::BandsSeparated {
                    direction,
                    bands: comps,
                },
            );
        }
        Ok(SeparatedSlice { bands })
    }

    /// Move every component to its position on the output grid, weighted by
    /// `m_b · OTF` at its original sampling.
    pub fn shift_and_filter(&self, slice: SeparatedSlice<F>) -> FilteredSlice<F> {
        let started = Instant::now();
        let contributions = slice
            .bands
            .into_par_iter()
            .zip(self.params.directions().par_iter())
            .map(|(bands, dir)| self.filter_direction(&bands, dir))
            .collect();
        log::debug!(
            "shift and filter: {:.1} ms",
            started.elapsed().as_secs_f64() * 1e3
        );
        FilteredSlice { contributions }
    }

    fn filter_direction(&self, bands: &[Array2<Complex<F>>], dir: &DirectionParams) -> Array2<Complex<F>> {
        let m = self.output_size();
        let cpm = self.params.geometry().cycles_per_micron();
        let mut acc = Array2::<Complex<F>>::zeros((m, m));
        for (c, band) in bands.iter().enumerate() {
            let (b, sign) = component_band(c);
            let shift = component_shift(dir, b, sign);
            let mb = F::from_f64_c(dir.modulation(b));
            let mut field = paste_spectrum(band, m);
            if self.config.otf_before_shift {
                Zip::from(&mut field)
                    .and(&self.band_otf[b])
                    .for_each(|v, &o| *v = *v * (o * mb));
                fourier_shift_inplace(&mut field, shift, &self.out_plans);
            } else {
                fourier_shift_inplace(&mut field, shift, &self.out_plans);
                let weight: Array2<F> = self
                    .otf
                    .sample_grid(m, cpm, b, shift, self.config.use_attenuation);
                Zip::from(&mut field)
                    .and(&weight)
                    .for_each(|v, &o| *v = *v * (o * mb));
            }
            acc += &field;
        }
        acc
    }

    /// Sum all directions, divide by the Wiener denominator and apodize.
    pub fn combine(&self, slice: FilteredSlice<F>, feedback: Feedback<'_, F>) -> CombinedSpectrum<F> {
        let m = self.output_size();
        let mut spectrum = Array2::<Complex<F>>::zeros((m, m));
        for contribution in &slice.contributions {
            spectrum += contribution;
        }
        Zip::from(&mut spectrum)
            .and(&self.denominator)
            .and(&self.apodization)
            .par_for_each(|v, &den, &apo| {
                *v = if den > F::zero() {
                    *v * (apo / den)
                } else {
                    Complex::new(F::zero(), F::zero())
                };
            });
        feedback.emit(SliceStage::Combined, StageEvent::Combined { spectrum: &spectrum });
        CombinedSpectrum { spectrum }
    }

    /// Inverse transform and apply the output range policy.
    pub fn finish(&self, combined: CombinedSpectrum<F>, feedback: Feedback<'_, F>) -> Array2<F> {
        let mut field = combined.spectrum;
        ifft2d_inplace(&mut field, &self.out_plans);
        let n = self.params.geometry().image_size as f64;
        let scale = F::from_f64_c((self.output_size() as f64 / n).powi(2));
        let mut image = field.mapv(|v| v.re * scale);
        apply_output_range(&mut image, self.config.output_range);
        feedback.emit(SliceStage::Reconstructed, StageEvent::Reconstructed { image: &image });
        image
    }

    /// Run every stage on an already transformed slice.
    pub fn reconstruct(&self, slice: PreprocessedSlice<F>, feedback: Feedback<'_, F>) -> Result<Array2<F>> {
        let started = Instant::now();
        let separated = self.separate(slice, feedback)?;
        let filtered = self.shift_and_filter(separated);
        let combined = self.combine(filtered, feedback);
        let image = self.finish(combined, feedback);
        log::debug!(
            "slice {} reconstructed in {:.1} ms",
            feedback.slice(),
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(image)
    }

    /// Preprocess raw frames and reconstruct them.
    pub fn reconstruct_frames(
        &self,
        frames: &[ArrayView2<'_, F>],
        preprocess: &PreprocessConfig,
        feedback: Feedback<'_, F>,
    ) -> Result<Array2<F>> {
        let slice = self.preprocess(frames, preprocess, feedback)?;
        self.reconstruct(slice, feedback)
    }
}

/// Apply an output range policy in place.
pub fn apply_output_range<F: SimFloat>(image: &mut Array2<F>, range: OutputRange) {
    match range {
        OutputRange::Unclipped => {}
        OutputRange::ClipNegative => image.mapv_inplace(|v| v.max(F::zero())),
        OutputRange::ClipAndScale => {
            image.mapv_inplace(|v| v.max(F::zero()));
            let max = image.iter().fold(F::zero(), |a, &b| a.max(b));
            if max > F::zero() {
                let s = F::from_f64_c(DISPLAY_MAX) / max;
                image.mapv_inplace(|v| v * s);
            }
        }
    }
}
