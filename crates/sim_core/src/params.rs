//! Illumination parameter set and acquisition geometry.
//!
//! Parameters are written exactly once through [`ParameterSetBuilder`], either
//! by the estimator or by a caller supplying known values, and then frozen
//! into an [`IlluminationParams`] snapshot that reconstruction only reads.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

// =============================================================================
// Constants
// =============================================================================

/// Default Wiener filter parameter.
pub const DEFAULT_WIENER: f64 = 0.05;

/// Default apodization cutoff, relative to the OTF cutoff.
pub const DEFAULT_APO_CUTOFF: f64 = 2.0;

/// Default apodization bend exponent.
pub const DEFAULT_APO_BEND: f64 = 0.9;

// =============================================================================
// Geometry
// =============================================================================

/// Acquisition geometry: pattern counts, frame size and pixel size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimGeometry {
    /// Number of bands, including band 0 (3 for three-beam 2D SIM).
    pub nr_bands: usize,
    /// Number of pattern directions.
    pub nr_dirs: usize,
    /// Phase steps per direction, at least `2 * nr_bands - 1`.
    pub nr_phases: usize,
    /// Width and height of every raw frame.
    pub image_size: usize,
    /// Pixel size in µm.
    pub pixel_size: f64,
}

impl Default for SimGeometry {
    fn default() -> Self {
        Self {
            nr_bands: 3,
            nr_dirs: 3,
            nr_phases: 5,
            image_size: 512,
            pixel_size: 0.08,
        }
    }
}

impl SimGeometry {
    /// Create and validate a geometry.
    pub fn new(
        nr_bands: usize,
        nr_dirs: usize,
        nr_phases: usize,
        image_size: usize,
        pixel_size: f64,
    ) -> Result<Self> {
        let geometry = Self {
            nr_bands,
            nr_dirs,
            nr_phases,
            image_size,
            pixel_size,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_bands == 0 {
            return Err(SimError::config("nr_bands must be >= 1"));
        }
        if self.nr_dirs == 0 {
            return Err(SimError::config("nr_dirs must be >= 1"));
        }
        if self.nr_phases < self.nr_components() {
            return Err(SimError::config(format!(
                "nr_phases ({}) must be >= 2*nr_bands-1 ({})",
                self.nr_phases,
                self.nr_components()
            )));
        }
        if self.image_size < 2 {
            return Err(SimError::config("image_size must be >= 2"));
        }
        if !(self.pixel_size.is_finite() && self.pixel_size > 0.0) {
            return Err(SimError::config(format!(
                "pixel_size must be > 0, got {}",
                self.pixel_size
            )));
        }
        Ok(())
    }

    /// Number of separated components per direction, `2 * nr_bands - 1`.
    pub fn nr_components(&self) -> usize {
        2 * self.nr_bands - 1
    }

    /// Raw frames per slice.
    pub fn frames_per_slice(&self) -> usize {
        self.nr_dirs * self.nr_phases
    }

    /// Size of one frequency bin in cycles/µm.
    pub fn cycles_per_micron(&self) -> f64 {
        1.0 / (self.image_size as f64 * self.pixel_size)
    }
}

// =============================================================================
// Filter parameters
// =============================================================================

/// Wiener filter and apodization settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WienerFilterParams {
    /// Wiener parameter `w`; the denominator carries `w²`.
    pub wiener: f64,
    /// Apodization reaches zero at `apo_cutoff * otf_cutoff`.
    pub apo_cutoff: f64,
    /// Exponent applied to the apodization profile.
    pub apo_bend: f64,
}

impl Default for WienerFilterParams {
    fn default() -> Self {
        Self {
            wiener: DEFAULT_WIENER,
            apo_cutoff: DEFAULT_APO_CUTOFF,
            apo_bend: DEFAULT_APO_BEND,
        }
    }
}

impl WienerFilterParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.wiener.is_finite() && self.wiener >= 0.0) {
            return Err(SimError::config(format!("wiener must be >= 0, got {}", self.wiener)));
        }
        if !(self.apo_cutoff.is_finite() && self.apo_cutoff > 0.0) {
            return Err(SimError::config(format!(
                "apo_cutoff must be > 0, got {}",
                self.apo_cutoff
            )));
        }
        if !(self.apo_bend.is_finite() && self.apo_bend > 0.0) {
            return Err(SimError::config(format!("apo_bend must be > 0, got {}", self.apo_bend)));
        }
        Ok(())
    }
}

// =============================================================================
// Per-direction parameters
// =============================================================================

/// Pattern parameters of one illumination direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionParams {
    /// Fundamental (band 1) pattern frequency in bins; band `b` sits at `b * k`.
    pub k: [f64; 2],
    /// Modulation depth per band; `modulations[0]` is 1.
    pub modulations: Vec<f64>,
    /// Phase of the first frame, radians.
    pub phase_offset: f64,
    /// Measured phase of every frame relative to `phase_offset`, when the
    /// steps are not assumed equidistant.
    #[serde(default)]
    pub phase_steps: Option<Vec<f64>>,
    /// Normalised correlation of the fit that produced these values.
    #[serde(default)]
    pub correlation: Option<f64>,
}

impl DirectionParams {
    /// Direction with equidistant phase steps.
    pub fn new(k: [f64; 2], modulations: Vec<f64>, phase_offset: f64) -> Self {
        Self {
            k,
            modulations,
            phase_offset,
            phase_steps: None,
            correlation: None,
        }
    }

    /// Absolute phase of every frame for `nr_phases` steps.
    pub fn absolute_phases(&self, nr_phases: usize) -> Vec<f64> {
        match &self.phase_steps {
            Some(steps) => steps.iter().map(|s| self.phase_offset + s).collect(),
            None => (0..nr_phases)
                .map(|n| {
                    self.phase_offset + 2.0 * std::f64::consts::PI * n as f64 / nr_phases as f64
                })
                .collect(),
        }
    }

    /// Frequency of band `band` in bins.
    pub fn band_frequency(&self, band: usize) -> [f64; 2] {
        [self.k[0] * band as f64, self.k[1] * band as f64]
    }

    /// Modulation of `band`.
    pub fn modulation(&self, band: usize) -> f64 {
        if band == 0 {
            1.0
        } else {
            self.modulations.get(band).copied().unwrap_or(0.0)
        }
    }

    fn validate(&self, index: usize, geometry: &SimGeometry) -> Result<()> {
        if !(self.k[0].is_finite() && self.k[1].is_finite()) {
            return Err(SimError::config(format!("direction {index}: non-finite frequency")));
        }
        if geometry.nr_bands > 1 && self.k == [0.0, 0.0] {
            return Err(SimError::config(format!(
                "direction {index}: zero pattern frequency"
            )));
        }
        if self.modulations.len() != geometry.nr_bands {
            return Err(SimError::config(format!(
                "direction {index}: expected {} modulations, got {}",
                geometry.nr_bands,
                self.modulations.len()
            )));
        }
        if (self.modulations[0] - 1.0).abs() > 1e-9 {
            return Err(SimError::config(format!(
                "direction {index}: band 0 modulation must be 1, got {}",
                self.modulations[0]
            )));
        }
        if self.modulations.iter().any(|m| !(m.is_finite() && *m >= 0.0)) {
            return Err(SimError::config(format!(
                "direction {index}: modulations must be finite and >= 0"
            )));
        }
        if !self.phase_offset.is_finite() {
            return Err(SimError::config(format!("direction {index}: non-finite phase offset")));
        }
        if let Some(steps) = &self.phase_steps {
            if steps.len() != geometry.nr_phases {
                return Err(SimError::config(format!(
                    "direction {index}: expected {} phase steps, got {}",
                    geometry.nr_phases,
                    steps.len()
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Builder and snapshot
// =============================================================================

/// Single writer for an [`IlluminationParams`] snapshot.
#[derive(Debug, Clone)]
pub struct ParameterSetBuilder {
    geometry: SimGeometry,
    filter: WienerFilterParams,
    directions: Vec<Option<DirectionParams>>,
}

impl ParameterSetBuilder {
    pub fn new(geometry: SimGeometry, filter: WienerFilterParams) -> Result<Self> {
        geometry.validate()?;
        filter.validate()?;
        let directions = vec![None; geometry.nr_dirs];
        Ok(Self {
            geometry,
            filter,
            directions,
        })
    }

    pub fn geometry(&self) -> &SimGeometry {
        &self.geometry
    }

    /// Write the parameters of one direction. A direction can only be set once.
    pub fn set_direction(&mut self, index: usize, params: DirectionParams) -> Result<&mut Self> {
        if index >= self.geometry.nr_dirs {
            return Err(SimError::config(format!(
                "direction index {index} out of range (nr_dirs = {})",
                self.geometry.nr_dirs
            )));
        }
        if self.directions[index].is_some() {
            return Err(SimError::config(format!("direction {index} already set")));
        }
        params.validate(index, &self.geometry)?;
        self.directions[index] = Some(params);
        Ok(self)
    }

    /// Freeze into an immutable snapshot.
    pub fn build(self) -> Result<IlluminationParams> {
        let mut directions = Vec::with_capacity(self.directions.len());
        for (i, dir) in self.directions.into_iter().enumerate() {
            match dir {
                Some(d) => directions.push(d),
                None => {
                    return Err(SimError::ReconstructionPrecondition(format!(
                        "parameters for direction {i} were never set"
                    )))
                }
            }
        }
        Ok(IlluminationParams {
            geometry: self.geometry,
            filter: self.filter,
            directions,
        })
    }
}

/// Immutable illumination parameter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IlluminationParams {
    geometry: SimGeometry,
    filter: WienerFilterParams,
    directions: Vec<DirectionParams>,
}

impl IlluminationParams {
    pub fn geometry(&self) -> &SimGeometry {
        &self.geometry
    }

    pub fn filter(&self) -> &WienerFilterParams {
        &self.filter
    }

    pub fn directions(&self) -> &[DirectionParams] {
        &self.directions
    }

    pub fn direction(&self, index: usize) -> Option<&DirectionParams> {
        self.directions.get(index)
    }

    /// Copy with different Wiener/apodization settings; pattern parameters are kept.
    pub fn with_filter(&self, filter: WienerFilterParams) -> Result<Self> {
        filter.validate()?;
        Ok(Self {
            filter,
            ..self.clone()
        })
    }

    /// Re-check every invariant, e.g. after deserialising a persisted set.
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        self.filter.validate()?;
        if self.directions.len() != self.geometry.nr_dirs {
            return Err(SimError::config(format!(
                "expected {} directions, got {}",
                self.geometry.nr_dirs,
                self.directions.len()
            )));
        }
        for (i, d) in self.directions.iter().enumerate() {
            d.validate(i, &self.geometry)?;
        }
        Ok(())
    }
}

/// Named parameter sets for known acquisitions.
pub mod presets {
    use super::*;

    /// 2D three-beam parameters of the OMX U2OS demonstration data set
    /// (512² frames, 80 nm pixels, 3 directions × 5 phases).
    ///
    /// The published values are band-2 peak positions; they are stored here
    /// as band-1 fundamentals.
    pub fn omx_u2os_2d() -> IlluminationParams {
        let band2 = [
            ([137.411, -140.922], [1.0, 0.536_570, 0.693_214], 123.8723),
            ([-52.8778, -189.522], [1.0, 0.051_488_1, 0.570_836], -58.7706),
            ([190.144, 49.9889], [1.0, 0.094_664_2, 0.601_721], -106.6750),
        ];
        let directions = band2
            .iter()
            .map(|(k2, m, pha)| {
                DirectionParams::new([k2[0] / 2.0, k2[1] / 2.0], m.to_vec(), *pha)
            })
            .collect();
        IlluminationParams {
            geometry: SimGeometry::default(),
            filter: WienerFilterParams::default(),
            directions,
        }
    }
}
