//! SIM Core Reconstruction Library
//!
//! Pure Rust implementation of 2D structured illumination microscopy (SIM)
//! super-resolution: OTF modelling, illumination parameter estimation,
//! band separation and Wiener-filtered reconstruction of raw frame stacks.

pub mod band_separation;
pub mod error;
pub mod estimation;
pub mod feedback;
pub mod float_trait;
pub mod orchestration;
pub mod otf;
pub mod params;
pub mod preprocess;
pub mod reconstruction;
pub mod synthetic;
pub mod transforms;

// Re-export commonly used types at the crate root
pub use band_separation::{separate_bands, SeparationMatrix};
pub use error::{Result, SimError};
pub use estimation::{estimate_parameters, EstimationConfig, EstimationReport, FrequencySearch};
pub use feedback::{Feedback, SliceStage, StageContext, StageEvent, StageObserver, Verbosity};
pub use float_trait::SimFloat;
pub use orchestration::{
    ParameterSource, SimPipeline, SliceReconstruction, StackLayout, StackOrder, StackReconstruction,
};
pub use otf::OtfModel;
pub use params::{DirectionParams, IlluminationParams, ParameterSetBuilder, SimGeometry, WienerFilterParams};
pub use preprocess::PreprocessConfig;
pub use reconstruction::{OutputRange, ReconstructionConfig, ReconstructionEngine};
pub use transforms::{fft2d, ifft2d_real, FftPlans2d};
