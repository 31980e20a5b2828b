//! Synthetic SIM acquisitions with a known ground truth.
//!
//! A seeded object of Gaussian blobs lives on the upsampled grid. Frames are
//! rendered by multiplying it with the illumination pattern, transforming,
//! applying the OTF and cropping the spectrum to the raw frame size, which
//! is the forward model the reconstruction inverts.

use ndarray::{Array2, ArrayView2, Zip};
use rand::prelude::*;
use rand_distr::Normal;
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use crate::otf::OtfModel;
use crate::params::{DirectionParams, SimGeometry, WienerFilterParams};
use crate::reconstruction::apodization_window;
use crate::transforms::{crop_spectrum, fft2d, ifft2d_inplace, ifft2d_real, FftPlans2d};

/// Blob width in raw-frame pixels.
const BLOB_SIGMA: f64 = 1.25;

/// Constant fluorescence under the blobs.
const OBJECT_BACKGROUND: f64 = 0.1;

/// Seeded test object on the upsampled grid.
pub struct SyntheticScene {
    object: Array2<f64>,
    upsampling: usize,
    plans: FftPlans2d<f64>,
}

impl SyntheticScene {
    /// Random blob object for `geometry`, rendered on a grid `upsampling`
    /// times finer than the raw frames.
    pub fn new(geometry: &SimGeometry, upsampling: usize, seed: u64) -> Self {
        let size = geometry.image_size * upsampling;
        let sigma = BLOB_SIGMA * upsampling as f64;
        let count = (size * size / 256).max(1);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut object = Array2::from_elem((size, size), OBJECT_BACKGROUND);
        let reach = (4.0 * sigma).ceil() as isize;
        for _ in 0..count {
            let cx = rng.gen::<f64>() * size as f64;
            let cy = rng.gen::<f64>() * size as f64;
            let amp = 0.5 + rng.gen::<f64>();
            let (ix, iy) = (cx.floor() as isize, cy.floor() as isize);
            for dy in -reach..=reach {
                for dx in -reach..=reach {
                    let px = ix + dx;
                    let py = iy + dy;
                    let rx = px as f64 - cx;
                    let ry = py as f64 - cy;
                    let v = amp * (-(rx * rx + ry * ry) / (2.0 * sigma * sigma)).exp();
                    let wy = py.rem_euclid(size as isize) as usize;
                    let wx = px.rem_euclid(size as isize) as usize;
                    object[[wy, wx]] += v;
                }
            }
        }
        Self::from_object(object, upsampling)
    }

    /// Use a caller-supplied object on the upsampled grid.
    pub fn from_object(object: Array2<f64>, upsampling: usize) -> Self {
        let plans = FftPlans2d::new(object.nrows());
        Self {
            object,
            upsampling,
            plans,
        }
    }

    pub fn object(&self) -> &Array2<f64> {
        &self.object
    }

    pub fn size(&self) -> usize {
        self.object.nrows()
    }

    pub fn upsampling(&self) -> usize {
        self.upsampling
    }

    /// Object band-limited by the reconstruction's apodization window; what
    /// an ideal reconstruction with these filter settings recovers.
    pub fn ground_truth(&self, otf: &OtfModel, filter: &WienerFilterParams, geometry: &SimGeometry) -> Array2<f64> {
        let mut spectrum = fft2d(self.object.view(), &self.plans);
        let window: Array2<f64> = apodization_window(
            self.size(),
            geometry.cycles_per_micron(),
            otf.cutoff(0),
            filter,
        );
        Zip::from(&mut spectrum).and(&window).for_each(|s, &w| *s = *s * w);
        ifft2d_real(&spectrum, &self.plans)
    }
}

/// Spectra of the raw frames of one slice, `[direction][phase]` order.
pub fn render_frame_spectra(
    scene: &SyntheticScene,
    directions: &[DirectionParams],
    otf: &OtfModel,
    geometry: &SimGeometry,
    plans: &FftPlans2d<f64>,
) -> Vec<Array2<Complex<f64>>> {
    let n = plans.size();
    let m = scene.size();
    let otf_fine: Array2<f64> = otf.sample_grid(m, geometry.cycles_per_micron(), 0, [0.0, 0.0], false);
    let scale = (n as f64 / m as f64).powi(2);

    let jobs: Vec<(&DirectionParams, f64)> = directions
        .iter()
        .flat_map(|dir| {
            dir.absolute_phases(geometry.nr_phases)
                .into_iter()
                .map(move |phase| (dir, phase))
        })
        .collect();

    jobs.into_par_iter()
        .map(|(dir, phase)| {
            let two_pi = 2.0 * std::f64::consts::PI;
            let lit = Array2::from_shape_fn((m, m), |(y, x)| {
                let theta = two_pi * (dir.k[0] * x as f64 + dir.k[1] * y as f64) / m as f64;
                let pattern: f64 = 1.0
                    + (1..geometry.nr_bands)
                        .map(|b| dir.modulation(b) * (b as f64 * (theta + phase)).cos())
                        .sum::<f64>();
                scene.object[[y, x]] * pattern
            });
            let mut spectrum = fft2d(lit.view(), &scene.plans);
            Zip::from(&mut spectrum)
                .and(&otf_fine)
                .for_each(|s, &o| *s = *s * (o * scale));
            crop_spectrum(&spectrum, n)
        })
        .collect()
}

/// Raw frames of one slice, `[direction][phase]` order.
pub fn render_frames(
    scene: &SyntheticScene,
    directions: &[DirectionParams],
    otf: &OtfModel,
    geometry: &SimGeometry,
    plans: &FftPlans2d<f64>,
) -> Vec<Array2<f64>> {
    render_frame_spectra(scene, directions, otf, geometry, plans)
        .into_iter()
        .map(|mut spectrum| {
            ifft2d_inplace(&mut spectrum, plans);
            spectrum.mapv(|v| v.re)
        })
        .collect()
}

/// Add white Gaussian noise at `snr_db` relative to each frame's mean power.
pub fn add_gaussian_noise(frames: &mut [Array2<f64>], snr_db: f64, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for frame in frames.iter_mut() {
        let power = frame.iter().map(|v| v * v).sum::<f64>() / frame.len().max(1) as f64;
        let sigma = power.sqrt() * 10f64.powf(-snr_db / 20.0);
        let Ok(normal) = Normal::new(0.0, sigma) else {
            continue;
        };
        frame.mapv_inplace(|v| v + normal.sample(&mut rng));
    }
}

/// Pearson correlation of two equally shaped images; 0 when either is flat.
///
/// # Panics
/// If the shapes differ.
pub fn normalized_cross_correlation(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> f64 {
    assert_eq!(a.dim(), b.dim(), "images must have the same shape");
    let n = a.len() as f64;
    let ma = a.sum() / n;
    let mb = b.sum() / n;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    Zip::from(&a).and(&b).for_each(|&x, &y| {
        let (dx, dy) = (x - ma, y - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    });
    let denom = (saa * sbb).sqrt();
    if denom > 0.0 {
        sab / denom
    } else {
        0.0
    }
}
