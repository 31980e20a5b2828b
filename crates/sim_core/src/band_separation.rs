//! Separation of phase-stepped spectra into frequency components.
//!
//! For one direction, frame `n` with absolute pattern phase `φₙ` is a linear
//! mix of `2B - 1` components:
//!
//! ```text
//! D̃ₙ(k) = C₀(k) + Σ_b ½·e^{+i b φₙ}·C₊b(k) + ½·e^{-i b φₙ}·C₋b(k)
//! ```
//!
//! Components are ordered `[0, +1, -1, +2, -2, ...]`. Separation multiplies
//! the stack of frames by the pseudo-inverse of that mixing matrix.

use nalgebra::DMatrix;
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::error::{Result, SimError};
use crate::float_trait::SimFloat;
use crate::params::{DirectionParams, SimGeometry};

/// Position of band `band` with the given sign in the component order.
#[inline]
pub fn component_index(band: usize, positive: bool) -> usize {
    match (band, positive) {
        (0, _) => 0,
        (b, true) => 2 * b - 1,
        (b, false) => 2 * b,
    }
}

/// Band and sign (+1 / -1) of a component index. Band 0 reports +1.
#[inline]
pub fn component_band(index: usize) -> (usize, i8) {
    if index == 0 {
        (0, 1)
    } else if index % 2 == 1 {
        ((index + 1) / 2, 1)
    } else {
        (index / 2, -1)
    }
}

/// Forward mixing coefficient of component `component` in frame phase `phase`.
fn mixing_coefficient(component: usize, phase: f64) -> Complex<f64> {
    let (band, sign) = component_band(component);
    if band == 0 {
        return Complex::new(1.0, 0.0);
    }
    Complex::from_polar(0.5, sign as f64 * band as f64 * phase)
}

/// Pseudo-inverse of the mixing matrix of one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationMatrix {
    nr_bands: usize,
    nr_phases: usize,
    /// Row-major `components × phases`.
    coeffs: Vec<Complex<f64>>,
}

impl SeparationMatrix {
    /// Closed-form inverse for phases `φ₀ + 2πn / nr_phases`.
    pub fn equidistant(nr_bands: usize, nr_phases: usize, phase_offset: f64) -> Result<Self> {
        check_counts(nr_bands, nr_phases)?;
        let nc = 2 * nr_bands - 1;
        let mut coeffs = Vec::with_capacity(nc * nr_phases);
        for c in 0..nc {
            let col_norm = if c == 0 {
                nr_phases as f64
            } else {
                nr_phases as f64 / 4.0
            };
            for n in 0..nr_phases {
                let phase =
                    phase_offset + 2.0 * std::f64::consts::PI * n as f64 / nr_phases as f64;
                coeffs.push(mixing_coefficient(c, phase).conj() / col_norm);
            }
        }
        Ok(Self {
            nr_bands,
            nr_phases,
            coeffs,
        })
    }

    /// Least-squares inverse `(MᴴM)⁻¹Mᴴ` for arbitrary absolute phases.
    pub fn from_phases(nr_bands: usize, phases: &[f64]) -> Result<Self> {
        let nr_phases = phases.len();
        check_counts(nr_bands, nr_phases)?;
        let nc = 2 * nr_bands - 1;

        let m = DMatrix::from_fn(nr_phases, nc, |n, c| mixing_coefficient(c, phases[n]));
        let mh = m.adjoint();
        let gram = &mh * &m;
        let inv = gram.try_inverse().ok_or_else(|| {
            SimError::config(format!("phase steps {phases:?} do not separate {nr_bands} bands"))
        })?;
        let pinv = inv * mh;

        // try_inverse accepts numerically singular systems; reject them here.
        let identity_err = (&pinv * &m - DMatrix::<Complex<f64>>::identity(nc, nc))
            .iter()
            .map(|v| v.norm())
            .fold(0.0, f64::max);
        if !(identity_err < 1e-6) {
            return Err(SimError::config(format!(
                "phase steps {phases:?} give an ill-conditioned separation (residual {identity_err:.2e})"
            )));
        }

        let mut coeffs = Vec::with_capacity(nc * nr_phases);
        for c in 0..nc {
            for n in 0..nr_phases {
                coeffs.push(pinv[(c, n)]);
            }
        }
        Ok(Self {
            nr_bands,
            nr_phases,
            coeffs,
        })
    }

    /// Matrix for a direction: least squares when per-frame phases were
    /// measured, closed form otherwise.
    pub fn for_direction(geometry: &SimGeometry, dir: &DirectionParams) -> Result<Self> {
        match &dir.phase_steps {
            Some(_) => Self::from_phases(geometry.nr_bands, &dir.absolute_phases(geometry.nr_phases)),
            None => Self::equidistant(geometry.nr_bands, geometry.nr_phases, dir.phase_offset),
        }
    }

    pub fn nr_bands(&self) -> usize {
        self.nr_bands
    }

    pub fn nr_phases(&self) -> usize {
        self.nr_phases
    }

    pub fn nr_components(&self) -> usize {
        2 * self.nr_bands - 1
    }

    /// Weight of frame `phase` in component `component`.
    pub fn coefficient(&self, component: usize, phase: usize) -> Complex<f64> {
        self.coeffs[component * self.nr_phases + phase]
    }
}

fn check_counts(nr_bands: usize, nr_phases: usize) -> Result<()> {
    if nr_bands == 0 {
        return Err(SimError::config("nr_bands must be >= 1"));
    }
    if nr_phases < 2 * nr_bands - 1 {
        return Err(SimError::config(format!(
            "nr_phases ({nr_phases}) must be >= 2*nr_bands-1 ({})",
            2 * nr_bands - 1
        )));
    }
    Ok(())
}

/// Separate the phase-stepped spectra of one direction into `2B - 1`
/// components ordered `[0, +1, -1, +2, -2, ...]`.
pub fn separate_bands<F: SimFloat>(
    spectra: &[Array2<Complex<F>>],
    matrix: &SeparationMatrix,
) -> Result<Vec<Array2<Complex<F>>>> {
    if spectra.len() != matrix.nr_phases() {
        return Err(SimError::shape(
            "band separation frame count",
            (matrix.nr_phases(), 1),
            (spectra.len(), 1),
        ));
    }
    let dim = spectra[0].dim();
    for (i, s) in spectra.iter().enumerate() {
        if s.dim() != dim {
            return Err(SimError::shape(format!("band separation frame {i}"), dim, s.dim()));
        }
    }

    let components = (0..matrix.nr_components())
        .into_par_iter()
        .map(|c| {
            let mut out = Array2::<Complex<F>>::zeros(dim);
            for (n, spectrum) in spectra.iter().enumerate() {
                let w = matrix.coefficient(c, n);
                let w = Complex::new(F::from_f64_c(w.re), F::from_f64_c(w.im));
                Zip::from(&mut out).and(spectrum).for_each(|o, &s| *o = *o + w * s);
            }
            out
        })
        .collect();
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn random_spectrum(size: usize, rng: &mut StdRng) -> Array2<Complex<f64>> {
        Array2::from_shape_fn((size, size), |_| {
            Complex::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
        })
    }

    fn mix(components: &[Array2<Complex<f64>>], phases: &[f64]) -> Vec<Array2<Complex<f64>>> {
        phases
            .iter()
            .map(|&phi| {
                let mut frame = Array2::<Complex<f64>>::zeros(components[0].dim());
                for (c, comp) in components.iter().enumerate() {
                    let w = mixing_coefficient(c, phi);
                    Zip::from(&mut frame).and(comp).for_each(|f, &v| *f += w * v);
                }
                frame
            })
            .collect()
    }

    fn max_err(a: &Array2<Complex<f64>>, b: &Array2<Complex<f64>>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
    }

    // ==================== Index Tests ====================

    #[test]
    fn test_component_order() {
        assert_eq!(component_index(0, true), 0);
        assert_eq!(component_index(1, true), 1);
        assert_eq!(component_index(1, false), 2);
        assert_eq!(component_index(2, true), 3);
        assert_eq!(component_index(2, false), 4);
        for idx in 0..7 {
            let (b, s) = component_band(idx);
            assert_eq!(component_index(b, s > 0), idx);
        }
    }

    // ==================== Matrix Tests ====================

    #[test]
    fn test_equidistant_matches_least_squares() {
        let offset = 0.37;
        let phases: Vec<f64> = (0..5)
            .map(|n| offset + 2.0 * std::f64::consts::PI * n as f64 / 5.0)
            .collect();
        let closed = SeparationMatrix::equidistant(3, 5, offset).unwrap();
        let ls = SeparationMatrix::from_phases(3, &phases).unwrap();
        for c in 0..5 {
            for n in 0..5 {
                assert!((closed.coefficient(c, n) - ls.coefficient(c, n)).norm() < 1e-10);
            }
        }
    }

    #[test]
    fn test_too_few_phases_rejected() {
        assert!(matches!(
            SeparationMatrix::equidistant(3, 4, 0.0),
            Err(SimError::Configuration(_))
        ));
        assert!(SeparationMatrix::from_phases(2, &[0.0, 1.0]).is_err());
    }

    #[test]
    fn test_duplicate_phases_rejected() {
        let res = SeparationMatrix::from_phases(2, &[0.0, 0.0, 0.0]);
        assert!(matches!(res, Err(SimError::Configuration(_))));
    }

    #[test]
    fn test_for_direction_picks_form() {
        let geometry = SimGeometry::new(2, 1, 3, 8, 0.1).unwrap();
        let mut dir = DirectionParams::new([1.0, 0.0], vec![1.0, 0.5], 0.2);
        let eq = SeparationMatrix::for_direction(&geometry, &dir).unwrap();
        dir.phase_steps = Some(vec![0.0, 2.1, 4.0]);
        let ls = SeparationMatrix::for_direction(&geometry, &dir).unwrap();
        assert!((eq.coefficient(1, 1) - ls.coefficient(1, 1)).norm() > 1e-3);
    }

    // ==================== Separation Tests ====================

    #[test]
    fn test_separation_recovers_components_equidistant() {
        let mut rng = StdRng::seed_from_u64(7);
        let components: Vec<_> = (0..5).map(|_| random_spectrum(16, &mut rng)).collect();
        let offset = -1.1;
        let phases: Vec<f64> = (0..5)
            .map(|n| offset + 2.0 * std::f64::consts::PI * n as f64 / 5.0)
            .collect();
        let frames = mix(&components, &phases);
        let matrix = SeparationMatrix::equidistant(3, 5, offset).unwrap();
        let separated = separate_bands(&frames, &matrix).unwrap();
        for (got, want) in separated.iter().zip(components.iter()) {
            assert!(max_err(got, want) < 1e-12);
        }
    }

    #[test]
    fn test_separation_recovers_components_uneven() {
        let mut rng = StdRng::seed_from_u64(11);
        let components: Vec<_> = (0..5).map(|_| random_spectrum(8, &mut rng)).collect();
        let phases = [0.1, 1.4, 2.3, 3.9, 5.2, 5.9];
        let frames = mix(&components, &phases);
        let matrix = SeparationMatrix::from_phases(3, &phases).unwrap();
        let separated = separate_bands(&frames, &matrix).unwrap();
        for (got, want) in separated.iter().zip(components.iter()) {
            assert!(max_err(got, want) < 1e-9);
        }
    }

    #[test]
    fn test_separation_shape_errors() {
        let matrix = SeparationMatrix::equidistant(2, 3, 0.0).unwrap();
        let frames = vec![Array2::<Complex<f64>>::zeros((8, 8)); 2];
        assert!(matches!(
            separate_bands(&frames, &matrix),
            Err(SimError::InputShape { .. })
        ));
        let mut frames = vec![Array2::<Complex<f64>>::zeros((8, 8)); 3];
        frames[2] = Array2::zeros((8, 4));
        assert!(matches!(
            separate_bands(&frames, &matrix),
            Err(SimError::InputShape { .. })
        ));
    }

    #[test]
    fn test_separation_f32() {
        let mut rng = StdRng::seed_from_u64(3);
        let components: Vec<_> = (0..3).map(|_| random_spectrum(8, &mut rng)).collect();
        let phases: Vec<f64> = (0..3).map(|n| 2.0 * std::f64::consts::PI * n as f64 / 3.0).collect();
        let frames: Vec<Array2<Complex<f32>>> = mix(&components, &phases)
            .iter()
            .map(|f| f.mapv(|v| Complex::new(v.re as f32, v.im as f32)))
            .collect();
        let matrix = SeparationMatrix::equidistant(2, 3, 0.0).unwrap();
        let separated = separate_bands(&frames, &matrix).unwrap();
        for (got, want) in separated.iter().zip(components.iter()) {
            for (g, w) in got.iter().zip(want.iter()) {
                assert!((g.re as f64 - w.re).abs() < 1e-5);
                assert!((g.im as f64 - w.im).abs() < 1e-5);
            }
        }
    }
}
