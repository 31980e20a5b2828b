//! Optional observer for intermediate results.
//!
//! Nothing is emitted unless a caller passes an observer and raises the
//! verbosity; the pipeline never depends on a display being present.

use ndarray::Array2;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::float_trait::SimFloat;

/// How much intermediate output is sent to an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Verbosity {
    /// No events.
    #[default]
    Off,
    /// Scalar events only (clipping fractions, fitted peaks).
    Summary,
    /// Scalar events plus spectra and images.
    Spectra,
}

/// Pipeline stage a slice is in when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStage {
    Preprocessed,
    BandSeparated,
    ParametersEstimated,
    Combined,
    Reconstructed,
}

/// Which slice and stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    pub slice: usize,
    pub stage: SliceStage,
}

/// Intermediate result handed to a [`StageObserver`].
#[derive(Debug)]
pub enum StageEvent<'a, F: SimFloat> {
    /// One raw frame was background-corrected and transformed.
    Preprocessed {
        frame: usize,
        clipped_fraction: f64,
    },
    /// Separated components of one direction, ordered `[0, +1, -1, ...]`.
    BandsSeparated {
        direction: usize,
        bands: &'a [Array2<Complex<F>>],
    },
    /// Peak found for one direction during estimation.
    PeakFitted {
        direction: usize,
        k: [f64; 2],
        coefficient: f64,
    },
    /// Wiener-filtered, apodized spectrum on the output grid.
    Combined { spectrum: &'a Array2<Complex<F>> },
    /// Final real-space image.
    Reconstructed { image: &'a Array2<F> },
}

impl<F: SimFloat> StageEvent<'_, F> {
    /// True for events that carry arrays.
    pub fn carries_arrays(&self) -> bool {
        matches!(
            self,
            StageEvent::BandsSeparated { .. } | StageEvent::Combined { .. } | StageEvent::Reconstructed { .. }
        )
    }
}

/// Receiver for intermediate results. Must tolerate calls from worker threads.
pub trait StageObserver<F: SimFloat>: Send + Sync {
    fn observe(&self, context: StageContext, event: StageEvent<'_, F>);
}

/// Observer, verbosity and slice index threaded through one slice's stages.
#[derive(Clone, Copy)]
pub struct Feedback<'a, F: SimFloat> {
    observer: Option<&'a dyn StageObserver<F>>,
    verbosity: Verbosity,
    slice: usize,
}

impl<'a, F: SimFloat> Feedback<'a, F> {
    pub fn new(observer: Option<&'a dyn StageObserver<F>>, verbosity: Verbosity, slice: usize) -> Self {
        Self {
            observer,
            verbosity,
            slice,
        }
    }

    /// Feedback that never emits.
    pub fn none() -> Self {
        Self::new(None, Verbosity::Off, 0)
    }

    /// Same observer and verbosity for another slice.
    pub fn for_slice(self, slice: usize) -> Self {
        Self { slice, ..self }
    }

    pub fn slice(&self) -> usize {
        self.slice
    }

    /// Whether an event of this kind would reach the observer.
    pub fn wants(&self, arrays: bool) -> bool {
        if self.observer.is_none() {
            return false;
        }
        match self.verbosity {
            Verbosity::Off => false,
            Verbosity::Summary => !arrays,
            Verbosity::Spectra => true,
        }
    }

    /// Forward `event` if an observer is present and the verbosity allows it.
    pub(crate) fn emit(&self, stage: SliceStage, event: StageEvent<'_, F>) {
        if !self.wants(event.carries_arrays()) {
            return;
        }
        if let Some(obs) = self.observer {
            obs.observe(
                StageContext {
                    slice: self.slice,
                    stage,
                },
                event,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, SliceStage, bool)>>,
    }

    impl StageObserver<f64> for Recorder {
        fn observe(&self, context: StageContext, event: StageEvent<'_, f64>) {
            self.seen
                .lock()
                .unwrap()
                .push((context.slice, context.stage, event.carries_arrays()));
        }
    }

    fn fire(rec: &Recorder, verbosity: Verbosity) {
        let image = Array2::<f64>::zeros((2, 2));
        let feedback = Feedback::new(Some(rec as &dyn StageObserver<f64>), verbosity, 4);
        feedback.emit(
            SliceStage::Preprocessed,
            StageEvent::Preprocessed {
                frame: 0,
                clipped_fraction: 0.0,
            },
        );
        feedback.emit(SliceStage::Reconstructed, StageEvent::Reconstructed { image: &image });
    }

    #[test]
    fn test_verbosity_gates_events() {
        let off = Recorder::default();
        fire(&off, Verbosity::Off);
        assert!(off.seen.lock().unwrap().is_empty());

        let summary = Recorder::default();
        fire(&summary, Verbosity::Summary);
        assert_eq!(
            *summary.seen.lock().unwrap(),
            vec![(4, SliceStage::Preprocessed, false)]
        );

        let full = Recorder::default();
        fire(&full, Verbosity::Spectra);
        assert_eq!(full.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_no_observer_is_noop() {
        let feedback = Feedback::<f64>::none();
        assert!(!feedback.wants(false));
        feedback.emit(
            SliceStage::ParametersEstimated,
            StageEvent::PeakFitted {
                direction: 0,
                k: [1.0, 2.0],
                coefficient: 0.5,
            },
        );
    }

    #[test]
    fn test_for_slice_keeps_observer() {
        let rec = Recorder::default();
        let feedback = Feedback::new(Some(&rec as &dyn StageObserver<f64>), Verbosity::Summary, 0).for_slice(9);
        assert_eq!(feedback.slice(), 9);
        feedback.emit(
            SliceStage::Preprocessed,
            StageEvent::Preprocessed {
                frame: 1,
                clipped_fraction: 0.2,
            },
        );
        assert_eq!(rec.seen.lock().unwrap()[0].0, 9);
    }

    #[test]
    fn test_default_verbosity_is_off() {
        assert_eq!(Verbosity::default(), Verbosity::Off);
    }
}
