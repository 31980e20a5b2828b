//! Optical transfer function model.
//!
//! The OTF is a radially symmetric magnitude curve that falls from 1 at the
//! origin to 0 at the cutoff frequency. It is either estimated from the
//! objective's numerical aperture and the emission wavelength, or
//! materialised from sampled per-band curves handed in by whoever loaded a
//! persisted OTF. An optional attenuation notch suppresses the region around
//! each band's origin.
//!
//! All frequencies taken by this module are in cycles/µm.

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::float_trait::SimFloat;
use crate::transforms::signed_frequency;

/// Diffraction-limited incoherent OTF at normalised radius `d = |k| / cutoff`.
///
/// `(2/π)·(acos d − d·√(1−d²))`, 1 at the origin and 0 from `d = 1` on.
pub fn ideal_otf(d: f64) -> f64 {
    if d <= 0.0 {
        return 1.0;
    }
    if d >= 1.0 {
        return 0.0;
    }
    (2.0 / std::f64::consts::PI) * (d.acos() - d * (1.0 - d * d).sqrt())
}

/// Gaussian notch around a band's origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attenuation {
    /// Depth of the notch in [0, 1]; 1 removes the origin completely.
    pub strength: f64,
    /// Full width at half maximum in cycles/µm.
    pub fwhm: f64,
}

impl Attenuation {
    fn value(&self, dist: f64) -> f64 {
        let ln2 = std::f64::consts::LN_2;
        1.0 - self.strength * (-4.0 * ln2 * dist * dist / (self.fwhm * self.fwhm)).exp()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum OtfCurve {
    /// Ideal OTF damped by `correction^d`.
    Estimate { na: f64, wavelength_nm: f64, correction: f64 },
    /// Radially sampled magnitudes, one curve per band.
    Sampled { spacing: f64, bands: Vec<Vec<f64>> },
}

/// Immutable OTF model, shared read-only by estimation and reconstruction.
///
/// Deserialisation runs the same checks as the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOtfModel")]
pub struct OtfModel {
    cutoff: f64,
    curve: OtfCurve,
    attenuation: Option<Attenuation>,
}

/// Unchecked wire form of [`OtfModel`].
#[derive(Deserialize)]
struct RawOtfModel {
    cutoff: f64,
    curve: OtfCurve,
    attenuation: Option<Attenuation>,
}

impl TryFrom<RawOtfModel> for OtfModel {
    type Error = SimError;

    fn try_from(raw: RawOtfModel) -> Result<Self> {
        let model = Self {
            cutoff: raw.cutoff,
            curve: raw.curve,
            attenuation: raw.attenuation,
        };
        model.validate()?;
        Ok(model)
    }
}

fn check_estimate(na: f64, wavelength_nm: f64, correction: f64) -> Result<()> {
    if !(na.is_finite() && na > 0.0) {
        return Err(SimError::config(format!("numerical aperture must be > 0, got {na}")));
    }
    if !(wavelength_nm.is_finite() && wavelength_nm > 0.0) {
        return Err(SimError::config(format!(
            "emission wavelength must be > 0, got {wavelength_nm}"
        )));
    }
    if !(correction > 0.0 && correction <= 1.0) {
        return Err(SimError::config(format!(
            "OTF correction factor must lie in (0, 1], got {correction}"
        )));
    }
    Ok(())
}

fn check_samples(cutoff: f64, spacing: f64, bands: &[Vec<f64>]) -> Result<()> {
    if !(cutoff.is_finite() && cutoff > 0.0) {
        return Err(SimError::config(format!("OTF cutoff must be > 0, got {cutoff}")));
    }
    if !(spacing.is_finite() && spacing > 0.0) {
        return Err(SimError::config(format!(
            "OTF sample spacing must be > 0, got {spacing}"
        )));
    }
    if bands.is_empty() {
        return Err(SimError::config("sampled OTF needs at least one band curve"));
    }
    for (b, curve) in bands.iter().enumerate() {
        if curve.is_empty() {
            return Err(SimError::config(format!("OTF curve for band {b} is empty")));
        }
        if curve.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(SimError::config(format!(
                "OTF curve for band {b} has values outside [0, 1]"
            )));
        }
        if curve.windows(2).any(|w| w[1] > w[0]) {
            return Err(SimError::config(format!(
                "OTF curve for band {b} is not monotonically non-increasing"
            )));
        }
    }
    Ok(())
}

fn check_attenuation(strength: f64, fwhm: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&strength) {
        return Err(SimError::config(format!(
            "attenuation strength must lie in [0, 1], got {strength}"
        )));
    }
    if !(fwhm.is_finite() && fwhm > 0.0) {
        return Err(SimError::config(format!("attenuation FWHM must be > 0, got {fwhm}")));
    }
    Ok(())
}

fn estimated_cutoff(na: f64, wavelength_nm: f64) -> f64 {
    2.0 * na / (wavelength_nm / 1000.0)
}

impl OtfModel {
    /// Estimate the OTF from numerical aperture, emission wavelength (nm)
    /// and a correction factor in (0, 1] that damps high frequencies.
    pub fn from_estimate(na: f64, wavelength_nm: f64, correction: f64) -> Result<Self> {
        check_estimate(na, wavelength_nm, correction)?;
        let cutoff = estimated_cutoff(na, wavelength_nm);
        Ok(Self {
            cutoff,
            curve: OtfCurve::Estimate {
                na,
                wavelength_nm,
                correction,
            },
            attenuation: None,
        })
    }

    /// Build an OTF from radially sampled curves.
    ///
    /// `bands[b][i]` is the magnitude of band `b` at radius `i * spacing`
    /// (cycles/µm). Curves must be non-increasing and within [0, 1]; bands past
    /// the last curve reuse the last one.
    pub fn from_samples(cutoff: f64, spacing: f64, bands: Vec<Vec<f64>>) -> Result<Self> {
        check_samples(cutoff, spacing, &bands)?;
        Ok(Self {
            cutoff,
            curve: OtfCurve::Sampled { spacing, bands },
            attenuation: None,
        })
    }

    /// Return a copy carrying attenuation settings.
    ///
    /// Attenuation is still only applied where explicitly requested
    /// (`value_attenuated`, or `use_attenuation` in the reconstruction config).
    pub fn with_attenuation(mut self, strength: f64, fwhm: f64) -> Result<Self> {
        check_attenuation(strength, fwhm)?;
        self.attenuation = Some(Attenuation { strength, fwhm });
        Ok(self)
    }

    /// Re-check a model that did not come through a constructor.
    pub fn validate(&self) -> Result<()> {
        match &self.curve {
            OtfCurve::Estimate {
                na,
                wavelength_nm,
                correction,
            } => {
                check_estimate(*na, *wavelength_nm, *correction)?;
                let expected = estimated_cutoff(*na, *wavelength_nm);
                if (self.cutoff - expected).abs() > 1e-9 * expected {
                    return Err(SimError::config(format!(
                        "OTF cutoff {} does not match NA and wavelength ({expected})",
                        self.cutoff
                    )));
                }
            }
            OtfCurve::Sampled { spacing, bands } => check_samples(self.cutoff, *spacing, bands)?,
        }
        if let Some(att) = &self.attenuation {
            check_attenuation(att.strength, att.fwhm)?;
        }
        Ok(())
    }

    /// Configured attenuation, if any.
    pub fn attenuation_settings(&self) -> Option<Attenuation> {
        self.attenuation
    }

    /// Cutoff frequency of a band in cycles/µm.
    pub fn cutoff(&self, _band: usize) -> f64 {
        self.cutoff
    }

    /// OTF magnitude at radial distance `dist` (cycles/µm).
    pub fn radial_value(&self, dist: f64, band: usize) -> f64 {
        if dist >= self.cutoff {
            return 0.0;
        }
        match &self.curve {
            OtfCurve::Estimate { correction, .. } => {
                let d = dist / self.cutoff;
                ideal_otf(d) * correction.powf(d)
            }
            OtfCurve::Sampled { spacing, bands } => {
                let curve = &bands[band.min(bands.len() - 1)];
                let pos = dist / spacing;
                let i = pos.floor() as usize;
                if i + 1 >= curve.len() {
                    return if i + 1 == curve.len() && pos == i as f64 {
                        curve[i]
                    } else {
                        0.0
                    };
                }
                let frac = pos - i as f64;
                curve[i] * (1.0 - frac) + curve[i + 1] * frac
            }
        }
    }

    /// OTF magnitude at spatial frequency `(kx, ky)` for `band`.
    pub fn value(&self, kx: f64, ky: f64, band: usize) -> f64 {
        self.radial_value(kx.hypot(ky), band)
    }

    /// Attenuation factor at `(kx, ky)`; 1 when no attenuation is configured.
    pub fn attenuation(&self, kx: f64, ky: f64) -> f64 {
        match &self.attenuation {
            Some(att) => att.value(kx.hypot(ky)),
            None => 1.0,
        }
    }

    /// OTF magnitude multiplied by the attenuation factor.
    pub fn value_attenuated(&self, kx: f64, ky: f64, band: usize) -> f64 {
        self.value(kx, ky, band) * self.attenuation(kx, ky)
    }

    /// Sample the OTF on an unshifted `size × size` frequency grid.
    ///
    /// `center` (bins) is where the OTF origin sits, so a band shifted to
    /// `s` is sampled with `center = s`.
    pub fn sample_grid<F: SimFloat>(
        &self,
        size: usize,
        cycles_per_micron: f64,
        band: usize,
        center: [f64; 2],
        attenuate: bool,
    ) -> Array2<F> {
        let mut grid = Array2::<F>::zeros((size, size));
        Zip::indexed(&mut grid).par_for_each(|(y, x), v| {
            let kx = (signed_frequency(x, size) as f64 - center[0]) * cycles_per_micron;
            let ky = (signed_frequency(y, size) as f64 - center[1]) * cycles_per_micron;
            let val = if attenuate {
                self.value_attenuated(kx, ky, band)
            } else {
                self.value(kx, ky, band)
            };
            *v = F::from_f64_c(val);
        });
        grid
    }
}
