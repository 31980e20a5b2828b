//! Error taxonomy shared by every stage of the reconstruction.

use thiserror::Error;

/// Errors raised by the SIM reconstruction core.
///
/// Shape and configuration errors are raised before any Fourier transform
/// runs. Estimation failures are recoverable at the caller's discretion.
/// Precondition failures abort a single slice.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// A frame or image does not have the configured dimensions.
    #[error("{context}: expected shape {expected:?}, found {found:?}")]
    InputShape {
        /// What was being checked (frame index, band, stack layout...).
        context: String,
        /// Shape required by the configuration.
        expected: (usize, usize),
        /// Shape actually supplied.
        found: (usize, usize),
    },

    /// Invalid OTF, geometry, filter or processing configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// No sufficiently strong illumination peak was found for a direction.
    #[error(
        "parameter estimation failed for direction {direction}: best correlation {best_correlation:.4} below threshold {threshold:.4}"
    )]
    EstimationFailure {
        /// Direction index.
        direction: usize,
        /// Best normalised correlation coefficient reached.
        best_correlation: f64,
        /// Threshold from the estimation configuration.
        threshold: f64,
    },

    /// Reconstruction was attempted with unset or failed parameters.
    #[error("reconstruction precondition violated: {0}")]
    ReconstructionPrecondition(String),
}

impl SimError {
    pub(crate) fn shape(context: impl Into<String>, expected: (usize, usize), found: (usize, usize)) -> Self {
        SimError::InputShape {
            context: context.into(),
            expected,
            found,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SimError::Configuration(msg.into())
    }

    /// True for errors that only affect one slice of a batch.
    pub fn is_slice_local(&self) -> bool {
        matches!(
            self,
            SimError::ReconstructionPrecondition(_)
                | SimError::EstimationFailure { .. }
                | SimError::InputShape { .. }
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message() {
        let err = SimError::shape("frame 3", (512, 512), (512, 256));
        let msg = err.to_string();
        assert!(msg.contains("frame 3"));
        assert!(msg.contains("(512, 256)"));
    }

    #[test]
    fn test_estimation_failure_message() {
        let err = SimError::EstimationFailure {
            direction: 2,
            best_correlation: 0.031,
            threshold: 0.1,
        };
        assert!(err.to_string().contains("direction 2"));
        assert!(err.is_slice_local());
    }

    #[test]
    fn test_configuration_is_not_slice_local() {
        assert!(!SimError::config("nr_phases < 2*nr_bands-1").is_slice_local());
    }
}
