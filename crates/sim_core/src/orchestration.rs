//! Pipeline driver: slices of a raw stack through preprocessing, parameter
//! estimation and reconstruction.
//!
//! ## Parameter sources
//!
//! - **Supplied**: a known parameter set, no estimation.
//! - **EstimateOnce**: estimate on one slice, reuse for every slice.
//! - **EstimatePerSlice**: every slice estimates its own parameters.
//!
//! Layout and frame-shape problems are reported before any transform runs.
//! Once slices are running, a failure stays local to its slice.

use std::time::Instant;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::error::{Result, SimError};
use crate::estimation::{estimate_parameters, EstimationConfig, EstimationReport};
use crate::feedback::{Feedback, StageObserver};
use crate::float_trait::SimFloat;
use crate::otf::OtfModel;
use crate::params::{IlluminationParams, ParameterSetBuilder, SimGeometry, WienerFilterParams};
use crate::preprocess::{preprocess_frames, validate_frames, PreprocessConfig};
use crate::reconstruction::{PreprocessedSlice, ReconstructionConfig, ReconstructionEngine};
use crate::transforms::FftPlans2d;

// =============================================================================
// Stack layout
// =============================================================================

/// Order of raw frames in a multi-slice stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackOrder {
    /// `[slice][direction][phase]`.
    SliceMajor,
    /// `[direction][slice][phase]`.
    DirectionMajor,
    /// Stack position of every `(slice, direction, phase)`, listed in
    /// slice-major order. Must be a permutation of the stack indices.
    Explicit(Vec<usize>),
}

/// Shape and ordering of a raw frame stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLayout {
    pub nr_slices: usize,
    pub nr_dirs: usize,
    pub nr_phases: usize,
    pub order: StackOrder,
}

impl StackLayout {
    pub fn new(nr_slices: usize, geometry: &SimGeometry, order: StackOrder) -> Self {
        Self {
            nr_slices,
            nr_dirs: geometry.nr_dirs,
            nr_phases: geometry.nr_phases,
            order,
        }
    }

    /// Total number of frames.
    pub fn len(&self) -> usize {
        self.nr_slices * self.nr_dirs * self.nr_phases
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack position of one frame. Indices must be in range.
    pub fn index(&self, slice: usize, dir: usize, phase: usize) -> usize {
        let slice_major = (slice * self.nr_dirs + dir) * self.nr_phases + phase;
        match &self.order {
            StackOrder::SliceMajor => slice_major,
            StackOrder::DirectionMajor => (dir * self.nr_slices + slice) * self.nr_phases + phase,
            StackOrder::Explicit(map) => map[slice_major],
        }
    }

    /// Stack positions of one slice in `[direction][phase]` order.
    pub fn slice_indices(&self, slice: usize) -> Vec<usize> {
        (0..self.nr_dirs)
            .flat_map(|d| (0..self.nr_phases).map(move |p| (d, p)))
            .map(|(d, p)| self.index(slice, d, p))
            .collect()
    }

    /// Check the layout against a stack of `stack_len` frames.
    pub fn validate(&self, stack_len: usize) -> Result<()> {
        if self.is_empty() {
            return Err(SimError::config("stack layout has no frames"));
        }
        if stack_len != self.len() {
            return Err(SimError::shape("stack length", (self.len(), 1), (stack_len, 1)));
        }
        if let StackOrder::Explicit(map) = &self.order {
            if map.len() != self.len() {
                return Err(SimError::config(format!(
                    "explicit stack mapping has {} entries, expected {}",
                    map.len(),
                    self.len()
                )));
            }
            let mut seen = vec![false; map.len()];
            for &i in map {
                if i >= seen.len() || seen[i] {
                    return Err(SimError::config(format!(
                        "explicit stack mapping is not a permutation (index {i})"
                    )));
                }
                seen[i] = true;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Parameter source and results
// =============================================================================

/// Where the illumination parameters come from.
#[derive(Debug, Clone)]
pub enum ParameterSource {
    Supplied(IlluminationParams),
    EstimateOnce { slice: usize },
    EstimatePerSlice,
}

/// Reconstructed slice and the parameters it was built with.
#[derive(Debug, Clone)]
pub struct SliceReconstruction<F: SimFloat> {
    pub image: Array2<F>,
    pub params: IlluminationParams,
}

/// Outcome of a stack run; one entry per slice.
#[derive(Debug)]
pub struct StackReconstruction<F: SimFloat> {
    pub slices: Vec<Result<SliceReconstruction<F>>>,
}

impl<F: SimFloat> StackReconstruction<F> {
    pub fn succeeded(&self) -> usize {
        self.slices.iter().filter(|s| s.is_ok()).count()
    }

    /// Parameters used for `slice`, for reuse in later runs.
    pub fn params(&self, slice: usize) -> Option<&IlluminationParams> {
        self.slices.get(slice)?.as_ref().ok().map(|s| &s.params)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// OTF, geometry, filter and stage configurations for a run.
#[derive(Debug, Clone)]
pub struct SimPipeline {
    pub otf: OtfModel,
    pub geometry: SimGeometry,
    pub filter: WienerFilterParams,
    pub preprocess: PreprocessConfig,
    pub estimation: EstimationConfig,
    pub reconstruction: ReconstructionConfig,
}

impl SimPipeline {
    /// Pipeline with default stage configurations.
    pub fn new(otf: OtfModel, geometry: SimGeometry, filter: WienerFilterParams) -> Result<Self> {
        let pipeline = Self {
            otf,
            geometry,
            filter,
            preprocess: PreprocessConfig::default(),
            estimation: EstimationConfig::default(),
            reconstruction: ReconstructionConfig::default(),
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn with_preprocess(mut self, config: PreprocessConfig) -> Self {
        self.preprocess = config;
        self
    }

    pub fn with_estimation(mut self, config: EstimationConfig) -> Self {
        self.estimation = config;
        self
    }

    pub fn with_reconstruction(mut self, config: ReconstructionConfig) -> Self {
        self.reconstruction = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.otf.validate()?;
        self.geometry.validate()?;
        self.filter.validate()?;
        self.preprocess.validate(&self.geometry)?;
        self.reconstruction.validate()
    }

    fn check_source(&self, source: &ParameterSource) -> Result<()> {
        match source {
            ParameterSource::Supplied(params) => {
                params.validate()?;
                if params.geometry() != &self.geometry {
                    return Err(SimError::config(format!(
                        "supplied parameters were made for {:?}, pipeline uses {:?}",
                        params.geometry(),
                        self.geometry
                    )));
                }
                Ok(())
            }
            _ => self.estimation.validate(&self.geometry),
        }
    }

    fn feedback<'a, F: SimFloat>(&self, observer: Option<&'a dyn StageObserver<F>>, slice: usize) -> Feedback<'a, F> {
        Feedback::new(observer, self.reconstruction.verbosity, slice)
    }

    fn engine<F: SimFloat>(&self, params: IlluminationParams) -> Result<ReconstructionEngine<F>> {
        ReconstructionEngine::new(self.otf.clone(), params, self.reconstruction.clone())
    }

    /// Estimate every direction from already transformed spectra.
    pub fn estimate_report<F: SimFloat>(
        &self,
        spectra: &[Array2<Complex<F>>],
        plans: &FftPlans2d<F>,
        feedback: Feedback<'_, F>,
    ) -> Result<EstimationReport> {
        estimate_parameters(spectra, &self.otf, &self.geometry, &self.estimation, plans, feedback)
    }

    /// Preprocess one slice and estimate a complete parameter set.
    ///
    /// A direction without a usable peak yields `ReconstructionPrecondition`.
    pub fn estimate<F: SimFloat>(
        &self,
        frames: &[ArrayView2<'_, F>],
        observer: Option<&dyn StageObserver<F>>,
    ) -> Result<IlluminationParams> {
        self.estimation.validate(&self.geometry)?;
        let plans = FftPlans2d::new(self.geometry.image_size);
        let pre = preprocess_frames(frames, &self.preprocess, &self.geometry, &plans)?;
        let report = self.estimate_report(&pre.spectra, &plans, self.feedback(observer, 0))?;
        self.params_from(report)
    }

    fn params_from(&self, report: EstimationReport) -> Result<IlluminationParams> {
        report.into_params(ParameterSetBuilder::new(self.geometry.clone(), self.filter)?)
    }

    /// Preprocess and estimate one slice, returning the spectra for reuse.
    fn estimate_slice<F: SimFloat>(
        &self,
        frames: &[ArrayView2<'_, F>],
        feedback: Feedback<'_, F>,
    ) -> Result<(IlluminationParams, Vec<Array2<Complex<F>>>)> {
        let plans = FftPlans2d::new(self.geometry.image_size);
        let pre = preprocess_frames(frames, &self.preprocess, &self.geometry, &plans)?;
        let report = self.estimate_report(&pre.spectra, &plans, feedback)?;
        Ok((self.params_from(report)?, pre.spectra))
    }

    /// Reconstruct one slice given in `[direction][phase]` order.
    pub fn reconstruct_slice<F: SimFloat>(
        &self,
        frames: &[ArrayView2<'_, F>],
        source: &ParameterSource,
        observer: Option<&dyn StageObserver<F>>,
    ) -> Result<SliceReconstruction<F>> {
        self.check_frames(frames)?;
        self.check_source(source)?;
        self.run_slice(frames, source, self.feedback(observer, 0))
    }

    fn check_frames<F: SimFloat>(&self, frames: &[ArrayView2<'_, F>]) -> Result<()> {
        if frames.len() != self.geometry.frames_per_slice() {
            return Err(SimError::shape(
                "frames per slice",
                (self.geometry.frames_per_slice(), 1),
                (frames.len(), 1),
            ));
        }
        validate_frames(frames, &self.geometry)
    }

    fn run_slice<F: SimFloat>(
        &self,
        frames: &[ArrayView2<'_, F>],
        source: &ParameterSource,
        feedback: Feedback<'_, F>,
    ) -> Result<SliceReconstruction<F>> {
        match source {
            ParameterSource::Supplied(params) => {
                let engine = self.engine(params.clone())?;
                let image = engine.reconstruct_frames(frames, &self.preprocess, feedback)?;
                Ok(SliceReconstruction {
                    image,
                    params: params.clone(),
                })
            }
            ParameterSource::EstimateOnce { .. } | ParameterSource::EstimatePerSlice => {
                let (params, spectra) = self.estimate_slice(frames, feedback)?;
                let engine = self.engine(params.clone())?;
                let slice: PreprocessedSlice<F> = engine.from_spectra(spectra)?;
                let image = engine.reconstruct(slice, feedback)?;
                Ok(SliceReconstruction { image, params })
            }
        }
    }

    /// Reconstruct every slice of a stack.
    ///
    /// Layout, frame shapes and configuration are checked up front and
    /// returned as `Err`. After that, each slice's outcome is reported in
    /// [`StackReconstruction::slices`] without affecting the others.
    pub fn reconstruct_stack<F: SimFloat>(
        &self,
        stack: &[ArrayView2<'_, F>],
        layout: &StackLayout,
        source: &ParameterSource,
        observer: Option<&dyn StageObserver<F>>,
    ) -> Result<StackReconstruction<F>> {
        layout.validate(stack.len())?;
        if layout.nr_dirs != self.geometry.nr_dirs || layout.nr_phases != self.geometry.nr_phases {
            return Err(SimError::config(format!(
                "stack layout {}x{} does not match geometry {}x{}",
                layout.nr_dirs, layout.nr_phases, self.geometry.nr_dirs, self.geometry.nr_phases
            )));
        }
        validate_frames(stack, &self.geometry)?;
        self.check_source(source)?;
        if let ParameterSource::EstimateOnce { slice } = source {
            if *slice >= layout.nr_slices {
                return Err(SimError::config(format!(
                    "estimation slice {slice} out of range ({} slices)",
                    layout.nr_slices
                )));
            }
        }

        let started = Instant::now();
        let slice_frames = |s: usize| gather(stack, layout, s);
        let base = self.feedback(observer, 0);

        let slices: Vec<Result<SliceReconstruction<F>>> = match source {
            ParameterSource::EstimatePerSlice => (0..layout.nr_slices)
                .into_par_iter()
                .map(|s| self.run_slice(&slice_frames(s), source, base.for_slice(s)))
                .collect(),
            ParameterSource::Supplied(params) => self.run_shared(params.clone(), layout.nr_slices, &slice_frames, base),
            ParameterSource::EstimateOnce { slice } => {
                match self.estimate_slice(&slice_frames(*slice), base.for_slice(*slice)) {
                    Ok((params, _)) => self.run_shared(params, layout.nr_slices, &slice_frames, base),
                    Err(e) => {
                        log::warn!("parameter estimation on slice {slice} failed: {e}");
                        (0..layout.nr_slices).map(|_| Err(e.clone())).collect()
                    }
                }
            }
        };

        for (s, r) in slices.iter().enumerate() {
            if let Err(e) = r {
                log::warn!("slice {s} failed: {e}");
            }
        }
        log::info!(
            "reconstructed {}/{} slices in {:.1} ms",
            slices.iter().filter(|r| r.is_ok()).count(),
            layout.nr_slices,
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(StackReconstruction { slices })
    }

    /// Reconstruct every slice with one engine built from `params`.
    fn run_shared<'s, F, G>(
        &self,
        params: IlluminationParams,
        nr_slices: usize,
        slice_frames: &G,
        base: Feedback<'_, F>,
    ) -> Vec<Result<SliceReconstruction<F>>>
    where
        F: SimFloat,
        G: Fn(usize) -> Vec<ArrayView2<'s, F>> + Sync,
    {
        let engine = match self.engine::<F>(params.clone()) {
            Ok(engine) => engine,
            Err(e) => return (0..nr_slices).map(|_| Err(e.clone())).collect(),
        };
        (0..nr_slices)
            .into_par_iter()
            .map(|s| {
                let image = engine.reconstruct_frames(&slice_frames(s), &self.preprocess, base.for_slice(s))?;
                Ok(SliceReconstruction {
                    image,
                    params: params.clone(),
                })
            })
            .collect()
    }
}

/// Frames of one slice in `[direction][phase]` order.
fn gather<'s, F: SimFloat>(stack: &[ArrayView2<'s, F>], layout: &StackLayout, slice: usize) -> Vec<ArrayView2<'s, F>> {
    layout
        .slice_indices(slice)
        .into_iter()
        .map(|i| stack[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::DirectionParams;
    use crate::synthetic::{add_gaussian_noise, render_frames, SyntheticScene};

    fn geometry() -> SimGeometry {
        SimGeometry::new(2, 2, 3, 64, 0.08).unwrap()
    }

    fn otf() -> OtfModel {
        OtfModel::from_estimate(1.4, 525.0, 0.3).unwrap()
    }

    fn dirs() -> Vec<DirectionParams> {
        vec![
            DirectionParams::new([18.0, 5.0], vec![1.0, 0.8], 0.4),
            DirectionParams::new([-6.0, 17.0], vec![1.0, 0.7], -0.9),
        ]
    }

    fn supplied() -> IlluminationParams {
        let mut b = ParameterSetBuilder::new(geometry(), WienerFilterParams::default()).unwrap();
        for (i, d) in dirs().into_iter().enumerate() {
            b.set_direction(i, d).unwrap();
        }
        b.build().unwrap()
    }

    fn slice_frames(seed: u64) -> Vec<Array2<f64>> {
        let g = geometry();
        let scene = SyntheticScene::new(&g, 2, seed);
        render_frames(&scene, &dirs(), &otf(), &g, &FftPlans2d::new(64))
    }

    // ==================== Layout Tests ====================

    #[test]
    fn test_layout_orders() {
        let g = SimGeometry::new(3, 3, 5, 64, 0.08).unwrap();
        let sm = StackLayout::new(2, &g, StackOrder::SliceMajor);
        let dm = StackLayout::new(2, &g, StackOrder::DirectionMajor);
        assert_eq!(sm.len(), 30);
        assert_eq!(sm.index(1, 0, 0), 15);
        assert_eq!(sm.index(0, 2, 4), 14);
        assert_eq!(dm.index(1, 0, 0), 5);
        assert_eq!(dm.index(0, 1, 0), 10);
        assert_eq!(dm.index(1, 2, 4), 29);
    }

    #[test]
    fn test_explicit_layout_must_be_permutation() {
        let g = SimGeometry::new(2, 1, 3, 64, 0.08).unwrap();
        let ok = StackLayout::new(1, &g, StackOrder::Explicit(vec![2, 0, 1]));
        assert!(ok.validate(3).is_ok());
        assert_eq!(ok.slice_indices(0), vec![2, 0, 1]);
        let dup = StackLayout::new(1, &g, StackOrder::Explicit(vec![0, 0, 1]));
        assert!(matches!(dup.validate(3), Err(SimError::Configuration(_))));
        let short = StackLayout::new(1, &g, StackOrder::Explicit(vec![0, 1]));
        assert!(short.validate(3).is_err());
        assert!(matches!(ok.validate(4), Err(SimError::InputShape { .. })));
    }

    // ==================== Pipeline Tests ====================

    #[test]
    fn test_supplied_parameters_skip_estimation() {
        let pipeline = SimPipeline::new(otf(), geometry(), WienerFilterParams::default()).unwrap();
        let frames = slice_frames(1);
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        let out = pipeline
            .reconstruct_slice(&views, &ParameterSource::Supplied(supplied()), None)
            .unwrap();
        assert_eq!(out.image.dim(), (128, 128));
        assert_eq!(out.params, supplied());
    }

    #[test]
    fn test_supplied_geometry_mismatch() {
        let other = SimGeometry::new(2, 2, 3, 32, 0.08).unwrap();
        let pipeline = SimPipeline::new(otf(), other, WienerFilterParams::default()).unwrap();
        let frames: Vec<Array2<f64>> = vec![Array2::zeros((32, 32)); 6];
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        assert!(matches!(
            pipeline.reconstruct_slice(&views, &ParameterSource::Supplied(supplied()), None),
            Err(SimError::Configuration(_))
        ));
    }

    #[test]
    fn test_stack_direction_major_with_estimate_once() {
        let g = geometry();
        let pipeline = SimPipeline::new(otf(), g.clone(), WienerFilterParams::default()).unwrap();
        let slice_a = slice_frames(2);
        let slice_b = slice_frames(3);
        let layout = StackLayout::new(2, &g, StackOrder::DirectionMajor);
        let mut stack: Vec<Array2<f64>> = vec![Array2::zeros((64, 64)); layout.len()];
        for (s, frames) in [&slice_a, &slice_b].iter().enumerate() {
            for d in 0..2 {
                for p in 0..3 {
                    stack[layout.index(s, d, p)] = frames[d * 3 + p].clone();
                }
            }
        }
        let views: Vec<_> = stack.iter().map(|f| f.view()).collect();
        let out = pipeline
            .reconstruct_stack(&views, &layout, &ParameterSource::EstimateOnce { slice: 0 }, None)
            .unwrap();
        assert_eq!(out.succeeded(), 2);
        let p0 = out.params(0).unwrap();
        assert_eq!(p0, out.params(1).unwrap());
        let k = p0.direction(0).unwrap().k;
        assert!((k[0] - 18.0).abs() < 0.1 && (k[1] - 5.0).abs() < 0.1);
    }

    #[test]
    fn test_stack_shape_error_before_any_slice() {
        let g = geometry();
        let pipeline = SimPipeline::new(otf(), g.clone(), WienerFilterParams::default()).unwrap();
        let layout = StackLayout::new(2, &g, StackOrder::SliceMajor);
        let mut stack: Vec<Array2<f64>> = vec![Array2::zeros((64, 64)); layout.len()];
        stack[7] = Array2::zeros((64, 63));
        let views: Vec<_> = stack.iter().map(|f| f.view()).collect();
        match pipeline.reconstruct_stack(&views, &layout, &ParameterSource::EstimatePerSlice, None) {
            Err(SimError::InputShape { context, .. }) => assert!(context.contains("7")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_per_slice_failures_stay_local() {
        let g = geometry();
        let pipeline = SimPipeline::new(otf(), g.clone(), WienerFilterParams::default())
            .unwrap()
            .with_estimation(EstimationConfig {
                min_correlation: 0.5,
                ..Default::default()
            });
        let layout = StackLayout::new(2, &g, StackOrder::SliceMajor);
        let good = slice_frames(4);
        let mut stack = good.clone();
        // Second slice is pure noise: no pattern to find.
        let mut noise = vec![Array2::from_elem((64, 64), 1.0); 6];
        add_gaussian_noise(&mut noise, 0.0, 21);
        stack.extend(noise);
        let views: Vec<_> = stack.iter().map(|f| f.view()).collect();
        let out = pipeline
            .reconstruct_stack(&views, &layout, &ParameterSource::EstimatePerSlice, None)
            .unwrap();
        assert!(out.slices[0].is_ok());
        assert!(matches!(
            out.slices[1],
            Err(SimError::ReconstructionPrecondition(_))
        ));
    }
}
