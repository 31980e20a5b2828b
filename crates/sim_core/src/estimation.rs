//! Illumination parameter estimation.
//!
//! For every direction the phase-stepped spectra are separated with an
//! assumed zero phase offset, so component `+b` carries
//! `m_b · e^{i b φ} · OTF(k) · S(k − b·k₀)`. Shifting it back by `b·k₀` and
//! correlating with band 0 over the common OTF support gives a complex
//! ratio `m_b · e^{i b φ}` whose magnitude is the modulation depth and whose
//! argument is the phase.
//!
//! The peak search runs in two stages:
//! 1. Coarse: FFT correlation maps over integer shifts, normalised by the
//!    band powers over each shift's common OTF support and restricted to an
//!    annulus inside the OTF cutoff.
//! 2. Fine: a 5×5 integer grid around the coarse peak (or a supplied start),
//!    then 3×3 sub-pixel refinement with a halving step.

use std::cmp::Ordering;
use std::time::Instant;

use ndarray::{Array2, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::band_separation::{component_index, separate_bands, SeparationMatrix};
use crate::error::{Result, SimError};
use crate::feedback::{Feedback, SliceStage, StageEvent};
use crate::float_trait::SimFloat;
use crate::otf::OtfModel;
use crate::params::{DirectionParams, IlluminationParams, ParameterSetBuilder, SimGeometry};
use crate::transforms::{
    apply_phase_ramp, crop_spectrum, fft2d_inplace, fourier_shift_inplace, ifft2d_inplace, paste_spectrum,
    signed_frequency, FftPlans2d,
};

// =============================================================================
// Constants
// =============================================================================

/// Default central exclusion radius of the coarse search, relative to the OTF cutoff.
pub const DEFAULT_EXCLUDE_FRACTION: f64 = 0.6;

/// Default minimum normalised correlation a fit must reach.
pub const DEFAULT_MIN_CORRELATION: f64 = 0.1;

/// Default number of sub-pixel refinement rounds.
pub const DEFAULT_REFINE_ITERATIONS: usize = 12;

/// Half width (bins) of the integer grid searched around the start.
const FINE_RADIUS: i32 = 2;

/// Shifts whose overlap power falls below this fraction of the largest are
/// left out of the coarse map.
const MIN_OVERLAP_FRACTION: f64 = 1e-3;

/// First sub-pixel refinement step (bins).
const REFINE_START_STEP: f64 = 0.5;

/// Modulation below which a warning is logged.
const WEAK_MODULATION: f64 = 0.05;

// =============================================================================
// Configuration
// =============================================================================

/// How the pattern frequency is searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrequencySearch {
    /// Full correlation map over the annulus
    /// `exclude_fraction · cutoff ≤ |k| ≤ cutoff`, followed by fine refinement.
    Coarse { exclude_fraction: f64 },
    /// Fine refinement only, within ±2 bins of the supplied fundamental
    /// frequency of each direction.
    FineOnly { start: Vec<[f64; 2]> },
}

impl Default for FrequencySearch {
    fn default() -> Self {
        FrequencySearch::Coarse {
            exclude_fraction: DEFAULT_EXCLUDE_FRACTION,
        }
    }
}

/// Parameter estimation options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfig {
    /// Band whose peak is fitted; `None` uses the highest band.
    pub fit_band: Option<usize>,
    pub search: FrequencySearch,
    /// Minimum normalised correlation coefficient of the fitted peak.
    pub min_correlation: f64,
    /// Rounds of 3×3 sub-pixel refinement.
    pub refine_iterations: usize,
    /// Measure the phase of every frame by spectral auto-correlation and
    /// separate with least squares instead of assuming equidistant steps.
    pub refine_phases: bool,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            fit_band: None,
            search: FrequencySearch::default(),
            min_correlation: DEFAULT_MIN_CORRELATION,
            refine_iterations: DEFAULT_REFINE_ITERATIONS,
            refine_phases: false,
        }
    }
}

impl EstimationConfig {
    /// Fit band resolved against the geometry.
    pub fn resolved_fit_band(&self, geometry: &SimGeometry) -> usize {
        self.fit_band.unwrap_or(geometry.nr_bands.saturating_sub(1))
    }

    pub fn validate(&self, geometry: &SimGeometry) -> Result<()> {
        if geometry.nr_bands < 2 {
            return Err(SimError::config("estimation needs at least two bands"));
        }
        let fb = self.resolved_fit_band(geometry);
        if fb == 0 || fb >= geometry.nr_bands {
            return Err(SimError::config(format!(
                "fit_band {fb} must be in 1..{}",
                geometry.nr_bands
            )));
        }
        match &self.search {
            FrequencySearch::Coarse { exclude_fraction } => {
                if !(0.0..1.0).contains(exclude_fraction) {
                    return Err(SimError::config(format!(
                        "exclude_fraction must be in [0, 1), got {exclude_fraction}"
                    )));
                }
            }
            FrequencySearch::FineOnly { start } => {
                if start.len() != geometry.nr_dirs {
                    return Err(SimError::config(format!(
                        "fine-only search needs {} start frequencies, got {}",
                        geometry.nr_dirs,
                        start.len()
                    )));
                }
                if start.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(SimError::config("fine-only start frequencies must be finite"));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.min_correlation) {
            return Err(SimError::config(format!(
                "min_correlation must be in [0, 1], got {}",
                self.min_correlation
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Correlation of band 0 with a shifted band at one candidate shift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationSample {
    /// `Σ conj(x)·y` over the common support.
    pub value: Complex<f64>,
    /// `Σ |x|²`, the band-0 power over the common support.
    pub band0_power: f64,
    /// `|value| / √(Σ|x|² Σ|y|²)`, in [0, 1].
    pub coefficient: f64,
}

impl CorrelationSample {
    /// `value / band0_power`: `m_b · e^{i b φ}` at the true shift.
    pub fn ratio(&self) -> Complex<f64> {
        if self.band0_power > 0.0 {
            self.value / self.band0_power
        } else {
            Complex::new(0.0, 0.0)
        }
    }
}

/// Correlates band 0 against one separated component at arbitrary shifts.
pub struct BandCorrelator<'a, F: SimFloat> {
    band0: &'a Array2<Complex<F>>,
    band: &'a Array2<Complex<F>>,
    /// Inverse transform of `band`, ready for a phase ramp.
    band_real: Array2<Complex<F>>,
    /// OTF of band 0 on the unshifted grid.
    otf0: Array2<F>,
    /// OTF of the correlated band on the unshifted grid.
    otf_b: Array2<F>,
    otf: &'a OtfModel,
    otf_band: usize,
    cycles_per_micron: f64,
    plans: &'a FftPlans2d<F>,
}

impl<'a, F: SimFloat> BandCorrelator<'a, F> {
    pub fn new(
        band0: &'a Array2<Complex<F>>,
        band: &'a Array2<Complex<F>>,
        otf_band: usize,
        otf: &'a OtfModel,
        geometry: &SimGeometry,
        plans: &'a FftPlans2d<F>,
    ) -> Self {
        let n = plans.size();
        let cpm = geometry.cycles_per_micron();
        let mut band_real = band.clone();
        ifft2d_inplace(&mut band_real, plans);
        Self {
            band0,
            band,
            band_real,
            otf0: otf.sample_grid(n, cpm, 0, [0.0, 0.0], false),
            otf_b: otf.sample_grid(n, cpm, otf_band, [0.0, 0.0], false),
            otf,
            otf_band,
            cycles_per_micron: cpm,
            plans,
        }
    }

    /// Correlation with the band moved by `-shift`, i.e. `y(k) = C_b(k + shift)`.
    pub fn evaluate(&self, shift: [f64; 2]) -> CorrelationSample {
        let n = self.plans.size();
        let back = [-shift[0], -shift[1]];
        let mut moved = self.band_real.clone();
        apply_phase_ramp(&mut moved, back);
        fft2d_inplace(&mut moved, self.plans);
        let otf_shifted: Array2<F> =
            self.otf
                .sample_grid(n, self.cycles_per_micron, self.otf_band, back, false);

        let mut value = Complex::new(0.0, 0.0);
        let mut p0 = 0.0;
        let mut p1 = 0.0;
        Zip::from(self.band0)
            .and(&moved)
            .and(&self.otf0)
            .and(&otf_shifted)
            .for_each(|&c0, &cb, &o0, &os| {
                if o0 <= F::zero() || os <= F::zero() {
                    return;
                }
                let x = c0 * os;
                let y = cb * o0;
                let x = Complex::new(x.re.as_f64(), x.im.as_f64());
                let y = Complex::new(y.re.as_f64(), y.im.as_f64());
                value += x.conj() * y;
                p0 += x.norm_sqr();
                p1 += y.norm_sqr();
            });

        let denom = (p0 * p1).sqrt();
        CorrelationSample {
            value,
            band0_power: p0,
            coefficient: if denom > 0.0 { value.norm() / denom } else { 0.0 },
        }
    }

    /// Integer-shift correlation map `Σ_k conj(a(k))·b(k + s)` of the
    /// OTF-weighted bands, indexed by `s` in the unshifted layout.
    ///
    /// At integer `s` this is the `value` that [`evaluate`](Self::evaluate)
    /// returns, up to a constant factor.
    pub fn correlation_map(&self) -> Array2<Complex<F>> {
        self.correlation_map_with(&self.padded_plans())
    }

    fn correlation_map_with(&self, padded: &FftPlans2d<F>) -> Array2<Complex<F>> {
        let a = Zip::from(self.band0)
            .and(&self.otf0)
            .map_collect(|&c, &o| c * o);
        let b = Zip::from(self.band)
            .and(&self.otf_b)
            .map_collect(|&c, &o| c * o);
        correlate(&a, &b, padded)
    }

    fn padded_plans(&self) -> FftPlans2d<F> {
        FftPlans2d::new(2 * self.plans.size())
    }

    /// Normalised correlation coefficient at every integer shift, indexed
    /// like [`correlation_map`](Self::correlation_map).
    ///
    /// Both powers are restricted to the common support of the moved OTFs,
    /// so a shift is not favoured just because the supports overlap more.
    pub fn coefficient_map(&self) -> Array2<f64> {
        let real = |v: F| Complex::new(v, F::zero());
        let masked_power = |band: &Array2<Complex<F>>, support: &Array2<F>| {
            Zip::from(band).and(support).map_collect(|&c, &o| {
                if o > F::zero() {
                    real(c.norm_sqr())
                } else {
                    real(F::zero())
                }
            })
        };
        let squared = |otf: &Array2<F>| otf.mapv(|o| real(o * o));

        let padded = self.padded_plans();
        let numerator = self.correlation_map_with(&padded);
        // Σ_k |c₀(k)|²·OTF_b(k + s)² and Σ_k OTF₀(k)²·|C_b(k + s)|².
        let p0 = correlate(&masked_power(self.band0, &self.otf0), &squared(&self.otf_b), &padded);
        let p1 = correlate(&squared(&self.otf0), &masked_power(self.band, &self.otf_b), &padded);

        let denominator = Zip::from(&p0)
            .and(&p1)
            .map_collect(|a, b| (a.re.as_f64().max(0.0) * b.re.as_f64().max(0.0)).sqrt());
        let floor = denominator.iter().fold(0.0f64, |m, &d| m.max(d)) * MIN_OVERLAP_FRACTION;
        Zip::from(&numerator)
            .and(&denominator)
            .map_collect(|v, &d| {
                if d > floor {
                    (v.norm().as_f64() / d).min(1.0)
                } else {
                    0.0
                }
            })
    }
}

/// Linear correlation `Σ_k conj(a(k))·b(k + s)` for every integer shift
/// representable on the `n × n` grid of the inputs.
///
/// Both spectra are zero-padded onto `padded` (twice the size) so shifted
/// supports never wrap around.
fn correlate<F: SimFloat>(
    a: &Array2<Complex<F>>,
    b: &Array2<Complex<F>>,
    padded: &FftPlans2d<F>,
) -> Array2<Complex<F>> {
    let n = a.nrows();
    let mut a = paste_spectrum(a, padded.size());
    let mut b = paste_spectrum(b, padded.size());
    ifft2d_inplace(&mut a, padded);
    ifft2d_inplace(&mut b, padded);
    let mut map = Zip::from(&a).and(&b).map_collect(|&x, &y| x.conj() * y);
    fft2d_inplace(&mut map, padded);
    crop_spectrum(&map, n)
}

// =============================================================================
// Candidate ordering
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Candidate {
    shift: [f64; 2],
    score: f64,
}

/// Total order: higher score, then closer to `centre`, then smaller `(ky, kx)`.
fn compare_candidates(a: &Candidate, b: &Candidate, centre: [f64; 2]) -> Ordering {
    let dist = |c: &Candidate| (c.shift[0] - centre[0]).hypot(c.shift[1] - centre[1]);
    let score = |c: &Candidate| if c.score.is_nan() { f64::NEG_INFINITY } else { c.score };
    score(a)
        .total_cmp(&score(b))
        .then_with(|| dist(b).total_cmp(&dist(a)))
        .then_with(|| b.shift[1].total_cmp(&a.shift[1]))
        .then_with(|| b.shift[0].total_cmp(&a.shift[0]))
}

fn best_of(candidates: Vec<Candidate>, centre: [f64; 2]) -> Option<Candidate> {
    candidates
        .into_par_iter()
        .reduce_with(|a, b| match compare_candidates(&a, &b, centre) {
            Ordering::Less => b,
            _ => a,
        })
}

/// Strongest integer peak of the coefficient map inside the annulus (bins).
fn coarse_peak(map: &Array2<f64>, inner: f64, outer: f64) -> Option<Candidate> {
    let n = map.nrows();
    let candidates: Vec<Candidate> = map
        .indexed_iter()
        .filter_map(|((y, x), v)| {
            let shift = [signed_frequency(x, n) as f64, signed_frequency(y, n) as f64];
            let r = shift[0].hypot(shift[1]);
            (r >= inner && r <= outer).then(|| Candidate {
                shift,
                score: *v,
            })
        })
        .collect();
    best_of(candidates, [0.0, 0.0])
}

/// Integer grid around `centre`, then 3×3 refinement with halving step,
/// never leaving the ±2-bin box.
fn refine_peak<F: SimFloat>(
    correlator: &BandCorrelator<'_, F>,
    centre: [f64; 2],
    iterations: usize,
) -> Option<(Candidate, CorrelationSample)> {
    let radius = FINE_RADIUS as f64;
    let inside = |s: &[f64; 2]| (s[0] - centre[0]).abs() <= radius && (s[1] - centre[1]).abs() <= radius;

    let score = |shift: [f64; 2]| Candidate {
        shift,
        score: correlator.evaluate(shift).coefficient,
    };

    let grid: Vec<[f64; 2]> = (-FINE_RADIUS..=FINE_RADIUS)
        .flat_map(|dy| (-FINE_RADIUS..=FINE_RADIUS).map(move |dx| [centre[0] + dx as f64, centre[1] + dy as f64]))
        .collect();
    let mut best = best_of(grid.into_par_iter().map(score).collect(), centre)?;

    let mut step = REFINE_START_STEP;
    for _ in 0..iterations {
        let neighbours: Vec<[f64; 2]> = [-1.0f64, 0.0, 1.0]
            .into_iter()
            .flat_map(|dy| [-1.0f64, 0.0, 1.0].into_iter().map(move |dx| (dx, dy)))
            .filter(|&(dx, dy)| dx != 0.0 || dy != 0.0)
            .map(|(dx, dy)| [best.shift[0] + dx * step, best.shift[1] + dy * step])
            .filter(inside)
            .collect();
        let mut round: Vec<Candidate> = neighbours.into_par_iter().map(score).collect();
        round.push(best);
        if let Some(c) = best_of(round, centre) {
            best = c;
        }
        step /= 2.0;
    }
    let sample = correlator.evaluate(best.shift);
    Some((best, sample))
}

// =============================================================================
// Phase measurement
// =============================================================================

/// Absolute pattern phase of each raw spectrum from its auto-correlation at
/// the fundamental frequency: `φₙ = arg Σ conj(Dₙ(k))·Dₙ(k + k₀)`.
pub fn measure_frame_phases<F: SimFloat>(
    spectra: &[Array2<Complex<F>>],
    k0: [f64; 2],
    otf: &OtfModel,
    geometry: &SimGeometry,
    plans: &FftPlans2d<F>,
) -> Vec<f64> {
    let n = plans.size();
    let cpm = geometry.cycles_per_micron();
    let otf0: Array2<F> = otf.sample_grid(n, cpm, 0, [0.0, 0.0], false);
    let back = [-k0[0], -k0[1]];
    let otf_shifted: Array2<F> = otf.sample_grid(n, cpm, 1, back, false);

    spectra
        .par_iter()
        .map(|spectrum| {
            let mut moved = spectrum.clone();
            fourier_shift_inplace(&mut moved, back, plans);
            let mut acc = Complex::new(0.0, 0.0);
            Zip::from(spectrum)
                .and(&moved)
                .and(&otf0)
                .and(&otf_shifted)
                .for_each(|&d, &ds, &o0, &os| {
                    if o0 <= F::zero() || os <= F::zero() {
                        return;
                    }
                    let p = d.conj() * ds * os * o0;
                    acc += Complex::new(p.re.as_f64(), p.im.as_f64());
                });
            acc.arg()
        })
        .collect()
}

// =============================================================================
// Estimation
// =============================================================================

/// Outcome of estimating every direction of one slice.
#[derive(Debug, Clone)]
pub struct EstimationReport {
    directions: Vec<Result<DirectionParams>>,
}

impl EstimationReport {
    pub fn directions(&self) -> &[Result<DirectionParams>] {
        &self.directions
    }

    pub fn all_succeeded(&self) -> bool {
        self.directions.iter().all(|d| d.is_ok())
    }

    /// Write every direction into `builder` and freeze the snapshot.
    ///
    /// A failed direction becomes a `ReconstructionPrecondition` error.
    pub fn into_params(self, mut builder: ParameterSetBuilder) -> Result<IlluminationParams> {
        for (i, dir) in self.directions.into_iter().enumerate() {
            match dir {
                Ok(params) => {
                    builder.set_direction(i, params)?;
                }
                Err(e) => {
                    return Err(SimError::ReconstructionPrecondition(format!(
                        "direction {i} has no usable parameters: {e}"
                    )))
                }
            }
        }
        builder.build()
    }
}

/// Estimate pattern frequency, modulation and phase for every direction.
///
/// `spectra` are the forward transforms of one slice's frames in
/// `[direction][phase]` order. Shape and configuration problems are returned
/// as errors; a direction without a convincing peak is reported inside the
/// [`EstimationReport`].
pub fn estimate_parameters<F: SimFloat>(
    spectra: &[Array2<Complex<F>>],
    otf: &OtfModel,
    geometry: &SimGeometry,
    config: &EstimationConfig,
    plans: &FftPlans2d<F>,
    feedback: Feedback<'_, F>,
) -> Result<EstimationReport> {
    geometry.validate()?;
    config.validate(geometry)?;
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
    if plans.size() != geometry.image_size {
        return Err(SimError::shape(
            "FFT plan size",
            expected,
            (plans.size(), plans.size()),
        ));
    }

    let started = Instant::now();
    let directions = (0..geometry.nr_dirs)
        .into_par_iter()
        .map(|d| {
            let frames = &spectra[d * geometry.nr_phases..(d + 1) * geometry.nr_phases];
            estimate_direction(d, frames, otf, geometry, config, plans, feedback)
        })
        .collect();
    log::debug!(
        "estimated {} directions in {:.1} ms",
        geometry.nr_dirs,
        started.elapsed().as_secs_f64() * 1e3
    );
    Ok(EstimationReport { directions })
}

fn estimate_direction<F: SimFloat>(
    direction: usize,
    frames: &[Array2<Complex<F>>],
    otf: &OtfModel,
    geometry: &SimGeometry,
    config: &EstimationConfig,
    plans: &FftPlans2d<F>,
    feedback: Feedback<'_, F>,
) -> Result<DirectionParams> {
    let fit_band = config.resolved_fit_band(geometry);
    let matrix = SeparationMatrix::equidistant(geometry.nr_bands, geometry.nr_phases, 0.0)?;
    let bands = separate_bands(frames, &matrix)?;

    let fit_component = &bands[component_index(fit_band, true)];
    let correlator = BandCorrelator::new(&bands[0], fit_component, fit_band, otf, geometry, plans);
    let cutoff_bins = otf.cutoff(fit_band) / geometry.cycles_per_micron();

    let centre = match &config.search {
        FrequencySearch::Coarse { exclude_fraction } => {
            let map = correlator.coefficient_map();
            match coarse_peak(&map, exclude_fraction * cutoff_bins, cutoff_bins) {
                Some(c) => c.shift,
                None => {
                    return Err(SimError::EstimationFailure {
                        direction,
                        best_correlation: 0.0,
                        threshold: config.min_correlation,
                    })
                }
            }
        }
        FrequencySearch::FineOnly { start } => {
            let k = start[direction];
            [k[0] * fit_band as f64, k[1] * fit_band as f64]
        }
    };
    log::debug!("direction {direction}: search centre ({:.2}, {:.2})", centre[0], centre[1]);

    let Some((best, fit_sample)) = refine_peak(&correlator, centre, config.refine_iterations) else {
        return Err(SimError::EstimationFailure {
            direction,
            best_correlation: 0.0,
            threshold: config.min_correlation,
        });
    };
    feedback.emit(
        SliceStage::ParametersEstimated,
        StageEvent::PeakFitted {
            direction,
            k: best.shift,
            coefficient: fit_sample.coefficient,
        },
    );
    if !(fit_sample.coefficient >= config.min_correlation) {
        log::warn!(
            "direction {direction}: best correlation {:.4} below {:.4}",
            fit_sample.coefficient,
            config.min_correlation
        );
        return Err(SimError::EstimationFailure {
            direction,
            best_correlation: fit_sample.coefficient,
            threshold: config.min_correlation,
        });
    }

    let k = [best.shift[0] / fit_band as f64, best.shift[1] / fit_band as f64];

    let mut ratios = vec![Complex::new(1.0, 0.0); geometry.nr_bands];
    for (b, ratio) in ratios.iter_mut().enumerate().skip(1) {
        *ratio = if b == fit_band {
            fit_sample.ratio()
        } else {
            let comp = &bands[component_index(b, true)];
            BandCorrelator::new(&bands[0], comp, b, otf, geometry, plans)
                .evaluate([k[0] * b as f64, k[1] * b as f64])
                .ratio()
        };
    }
    let modulations: Vec<f64> = ratios
        .iter()
        .enumerate()
        .map(|(b, r)| if b == 0 { 1.0 } else { r.norm() })
        .collect();
    for (b, m) in modulations.iter().enumerate().skip(1) {
        if *m < WEAK_MODULATION {
            log::warn!("direction {direction}: weak modulation {m:.4} in band {b}");
        }
    }

    let mut params = DirectionParams::new(k, modulations, ratios[1].arg());
    params.correlation = Some(fit_sample.coefficient);

    if config.refine_phases {
        let phases = measure_frame_phases(frames, k, otf, geometry, plans);
        let offset = phases[0];
        params.phase_offset = offset;
        params.phase_steps = Some(phases.iter().map(|p| p - offset).collect());
    }

    log::info!(
        "direction {direction}: k = ({:.3}, {:.3}) bins, phase {:.4} rad, modulations {:?}, correlation {:.4}",
        params.k[0],
        params.k[1],
        params.phase_offset,
        params.modulations,
        fit_sample.coefficient
    );
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{render_frame_spectra, SyntheticScene};
    use std::f64::consts::PI;

    fn wrap(phase: f64) -> f64 {
        (phase + PI).rem_euclid(2.0 * PI) - PI
    }

    fn setup(size: usize, k: [f64; 2], phase: f64) -> (SimGeometry, OtfModel, Vec<Array2<Complex<f64>>>) {
        let geometry = SimGeometry::new(3, 1, 5, size, 0.08).unwrap();
        let otf = OtfModel::from_estimate(1.4, 525.0, 0.3).unwrap();
        let scene = SyntheticScene::new(&geometry, 2, 11);
        let dir = DirectionParams::new(k, vec![1.0, 0.8, 0.6], phase);
        let plans = FftPlans2d::new(size);
        let spectra = render_frame_spectra(&scene, &[dir], &otf, &geometry, &plans);
        (geometry, otf, spectra)
    }

    // ==================== Config Tests ====================

    #[test]
    fn test_config_defaults() {
        let c = EstimationConfig::default();
        assert_eq!(c.min_correlation, 0.1);
        assert_eq!(c.refine_iterations, 12);
        assert!(!c.refine_phases);
        assert_eq!(
            c.search,
            FrequencySearch::Coarse {
                exclude_fraction: 0.6
            }
        );
        assert_eq!(c.resolved_fit_band(&SimGeometry::default()), 2);
    }

    #[test]
    fn test_config_validation() {
        let g = SimGeometry::default();
        let bad_band = EstimationConfig {
            fit_band: Some(3),
            ..Default::default()
        };
        assert!(bad_band.validate(&g).is_err());
        let zero_band = EstimationConfig {
            fit_band: Some(0),
            ..Default::default()
        };
        assert!(zero_band.validate(&g).is_err());
        let wrong_starts = EstimationConfig {
            search: FrequencySearch::FineOnly {
                start: vec![[1.0, 1.0]],
            },
            ..Default::default()
        };
        assert!(wrong_starts.validate(&g).is_err());
        let single_band = SimGeometry::new(1, 3, 1, 64, 0.08).unwrap();
        assert!(EstimationConfig::default().validate(&single_band).is_err());
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_tie_break_prefers_centre_then_lexicographic() {
        let centre = [0.0, 0.0];
        let near = Candidate {
            shift: [1.0, 0.0],
            score: 0.5,
        };
        let far = Candidate {
            shift: [3.0, 0.0],
            score: 0.5,
        };
        assert_eq!(compare_candidates(&near, &far, centre), Ordering::Greater);

        let a = Candidate {
            shift: [0.0, -1.0],
            score: 0.5,
        };
        let b = Candidate {
            shift: [-1.0, 0.0],
            score: 0.5,
        };
        assert_eq!(compare_candidates(&a, &b, centre), Ordering::Greater);

        let strong = Candidate {
            shift: [9.0, 9.0],
            score: 0.6,
        };
        assert_eq!(compare_candidates(&strong, &near, centre), Ordering::Greater);
    }

    #[test]
    fn test_best_of_is_order_independent() {
        let mut cands: Vec<Candidate> = (0..20)
            .map(|i| Candidate {
                shift: [(i % 5) as f64 - 2.0, (i / 5) as f64 - 2.0],
                score: if i % 7 == 0 { 1.0 } else { 0.3 },
            })
            .collect();
        let first = best_of(cands.clone(), [0.0, 0.0]).unwrap();
        cands.reverse();
        let second = best_of(cands, [0.0, 0.0]).unwrap();
        assert_eq!(first.shift, second.shift);
    }

    // ==================== Correlation Tests ====================

    #[test]
    fn test_correlation_peaks_at_true_shift() {
        let (geometry, otf, spectra) = setup(128, [20.0, 9.0], 0.4);
        let plans = FftPlans2d::new(128);
        let matrix = SeparationMatrix::equidistant(3, 5, 0.0).unwrap();
        let bands = separate_bands(&spectra, &matrix).unwrap();
        let corr = BandCorrelator::new(&bands[0], &bands[3], 2, &otf, &geometry, &plans);
        let at_peak = corr.evaluate([40.0, 18.0]);
        let off_peak = corr.evaluate([37.0, 18.0]);
        assert!(at_peak.coefficient > 0.99);
        assert!(off_peak.coefficient < at_peak.coefficient);
        assert!((at_peak.ratio().norm() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_estimation_recovers_parameters() {
        let (geometry, otf, spectra) = setup(128, [20.0, -9.0], 1.1);
        let plans = FftPlans2d::new(128);
        let report = estimate_parameters(
            &spectra,
            &otf,
            &geometry,
            &EstimationConfig::default(),
            &plans,
            Feedback::none(),
        )
        .unwrap();
        let dir = report.directions()[0].as_ref().unwrap();
        assert!((dir.k[0] - 20.0).abs() < 0.1, "kx = {}", dir.k[0]);
        assert!((dir.k[1] + 9.0).abs() < 0.1, "ky = {}", dir.k[1]);
        assert!(wrap(dir.phase_offset - 1.1).abs() < 1e-3);
        assert!((dir.modulations[1] - 0.8).abs() < 1e-3);
        assert!((dir.modulations[2] - 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_fine_only_search() {
        let (geometry, otf, spectra) = setup(128, [18.0, 12.0], -0.7);
        let plans = FftPlans2d::new(128);
        let config = EstimationConfig {
            search: FrequencySearch::FineOnly {
                start: vec![[17.6, 12.7]],
            },
            ..Default::default()
        };
        let report = estimate_parameters(&spectra, &otf, &geometry, &config, &plans, Feedback::none()).unwrap();
        let dir = report.directions()[0].as_ref().unwrap();
        assert!((dir.k[0] - 18.0).abs() < 0.1);
        assert!((dir.k[1] - 12.0).abs() < 0.1);
    }

    #[test]
    fn test_noise_only_reports_failure() {
        use rand::prelude::*;
        use rand_distr::Normal;
        let geometry = SimGeometry::new(3, 1, 5, 64, 0.08).unwrap();
        let otf = OtfModel::from_estimate(1.4, 525.0, 0.3).unwrap();
        let plans = FftPlans2d::new(64);
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let spectra: Vec<Array2<Complex<f64>>> = (0..5)
            .map(|_| {
                let img = Array2::from_shape_fn((64, 64), |_| normal.sample(&mut rng));
                crate::transforms::fft2d(img.view(), &plans)
            })
            .collect();
        let config = EstimationConfig {
            min_correlation: 0.5,
            ..Default::default()
        };
        let report = estimate_parameters(&spectra, &otf, &geometry, &config, &plans, Feedback::none()).unwrap();
        assert!(!report.all_succeeded());
        assert!(matches!(
            report.directions()[0],
            Err(SimError::EstimationFailure { direction: 0, .. })
        ));
        let builder = ParameterSetBuilder::new(geometry, Default::default()).unwrap();
        assert!(matches!(
            report.into_params(builder),
            Err(SimError::ReconstructionPrecondition(_))
        ));
    }

    #[test]
    fn test_refined_phases_follow_steps() {
        // DC plus one cosine off the pattern axis: the only spectral pairs
        // one fundamental apart are the phase-carrying ones.
        let geometry = SimGeometry::new(3, 1, 5, 128, 0.08).unwrap();
        let otf = OtfModel::from_estimate(1.4, 525.0, 0.3).unwrap();
        let two_pi = 2.0 * PI;
        let object = Array2::from_shape_fn((256, 256), |(y, x)| {
            1.0 + 0.3 * (two_pi * (3.0 * x as f64 + 17.0 * y as f64) / 256.0).cos()
        });
        let scene = SyntheticScene::from_object(object, 2);
        let dir = DirectionParams::new([20.0, 9.0], vec![1.0, 0.8, 0.6], 0.3);
        let plans = FftPlans2d::new(128);
        let spectra = render_frame_spectra(&scene, &[dir], &otf, &geometry, &plans);

        let config = EstimationConfig {
            refine_phases: true,
            ..Default::default()
        };
        let report = estimate_parameters(&spectra, &otf, &geometry, &config, &plans, Feedback::none()).unwrap();
        let dir = report.directions()[0].as_ref().unwrap();
        assert!((dir.k[0] - 20.0).abs() < 1e-6 && (dir.k[1] - 9.0).abs() < 1e-6, "k = {:?}", dir.k);
        let steps = dir.phase_steps.as_ref().unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0], 0.0);
        for (n, s) in steps.iter().enumerate().skip(1) {
            let expected = 2.0 * PI * n as f64 / 5.0;
            assert!(wrap(s - expected).abs() < 1e-6, "step {n}: {s}");
        }
    }

    #[test]
    fn test_refined_phases_on_textured_object() {
        let (geometry, otf, spectra) = setup(128, [20.0, 9.0], 0.3);
        let plans = FftPlans2d::new(128);
        let config = EstimationConfig {
            refine_phases: true,
            ..Default::default()
        };
        let report = estimate_parameters(&spectra, &otf, &geometry, &config, &plans, Feedback::none()).unwrap();
        let steps = report.directions()[0].as_ref().unwrap().phase_steps.clone().unwrap();
        for (n, s) in steps.iter().enumerate().skip(1) {
            let expected = 2.0 * PI * n as f64 / 5.0;
            assert!(wrap(s - expected).abs() < 0.3, "step {n}: {s}");
        }
    }

    // ==================== Coarse Search Tests ====================

    #[test]
    fn test_coefficient_map_matches_evaluate() {
        let (geometry, otf, spectra) = setup(128, [17.0, -17.0], 0.5);
        let plans = FftPlans2d::new(128);
        let matrix = SeparationMatrix::equidistant(3, 5, 0.0).unwrap();
        let bands = separate_bands(&spectra, &matrix).unwrap();
        let corr = BandCorrelator::new(&bands[0], &bands[3], 2, &otf, &geometry, &plans);
        let map = corr.coefficient_map();
        for shift in [[34.0, -34.0], [23.0, -25.0], [-5.0, 40.0]] {
            let x = (shift[0] as i64).rem_euclid(128) as usize;
            let y = (shift[1] as i64).rem_euclid(128) as usize;
            let expected = corr.evaluate(shift).coefficient;
            assert!((map[[y, x]] - expected).abs() < 1e-6, "{shift:?}: {} vs {expected}", map[[y, x]]);
        }
    }

    #[test]
    fn test_coarse_search_finds_outer_peak() {
        // Fit-band peaks near the outer edge of the annulus, where the raw
        // correlation sum is weakest.
        for k in [[17.0, -17.0], [-6.0, -23.0]] {
            let (geometry, otf, spectra) = setup(128, k, 0.5);
            let plans = FftPlans2d::new(128);
            let matrix = SeparationMatrix::equidistant(3, 5, 0.0).unwrap();
            let bands = separate_bands(&spectra, &matrix).unwrap();
            let corr = BandCorrelator::new(&bands[0], &bands[3], 2, &otf, &geometry, &plans);
            let cutoff_bins = otf.cutoff(2) / geometry.cycles_per_micron();
            let peak = coarse_peak(&corr.coefficient_map(), 0.6 * cutoff_bins, cutoff_bins).unwrap();
            assert_eq!(peak.shift, [2.0 * k[0], 2.0 * k[1]]);
            assert!(peak.score > 0.99, "score {}", peak.score);
        }
    }

    #[test]
    fn test_shape_error_before_work() {
        let geometry = SimGeometry::new(3, 1, 5, 64, 0.08).unwrap();
        let otf = OtfModel::from_estimate(1.4, 525.0, 0.3).unwrap();
        let plans = FftPlans2d::new(64);
        let mut spectra = vec![Array2::<Complex<f64>>::zeros((64, 64)); 5];
        spectra[4] = Array2::zeros((32, 32));
        assert!(matches!(
            estimate_parameters(&spectra, &otf, &geometry, &EstimationConfig::default(), &plans, Feedback::none()),
            Err(SimError::InputShape { .. })
        ));
    }
}
