//! Interface to the measurement physics.
//!
//! Ray transforms and coil-sensitivity operators live outside this crate;
//! the sampling engine only sees forward/adjoint application and, when the
//! physics provides one, a fast approximate inverse for the initial guess.
//! The two operators defined here (identity and a diagonal sensing mask) are
//! enough for validation and for the demo pipeline.

use ndarray::Zip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{DataBatch, ImageBatch};

pub trait ForwardOperator {
    fn im_shape(&self) -> (usize, usize);
    fn obs_shape(&self) -> (usize, usize);

    /// Forward map: image -> measurement.
    fn trafo(&self, x: &ImageBatch) -> DataBatch;

    /// Adjoint map: measurement -> image.
    fn trafo_adjoint(&self, y: &DataBatch) -> ImageBatch;

    /// Fast approximate inverse (e.g. filtered back-projection), when the
    /// physics has one. Used for chain initialization, never required.
    fn fbp(&self, _y: &DataBatch) -> Option<ImageBatch> { None }
}

/// Forward-project `x` and add white noise at a level relative to the mean
/// absolute signal.
pub fn simulate(
    x: &ImageBatch,
    op: &dyn ForwardOperator,
    rel_stddev: f32,
    rng: &mut impl Rng,
) -> DataBatch {
    let mut y = op.trafo(x);
    let mean_abs = y.iter().map(|v| v.abs()).sum::<f32>() / y.len() as f32;
    let level = rel_stddev * mean_abs;
    y.map_inplace(|v| *v += level * rng.sample::<f32, _>(StandardNormal));
    y
}

// --------------------------------------------------------------------------------

/// Measurement equals the image. The degenerate but fully-observed case.
pub struct Identity {
    pub im_shape: (usize, usize),
}

impl ForwardOperator for Identity {
    fn im_shape(&self) -> (usize, usize) { self.im_shape }
    fn obs_shape(&self) -> (usize, usize) { self.im_shape }
    fn trafo(&self, x: &ImageBatch) -> DataBatch { x.clone() }
    fn trafo_adjoint(&self, y: &DataBatch) -> ImageBatch { y.clone() }
    fn fbp(&self, y: &DataBatch) -> Option<ImageBatch> { Some(y.clone()) }
}

/// Diagonal undersampling operator: keep a pixel where the mask is 1, drop
/// it where the mask is 0. Self-adjoint, and its own pseudo-inverse.
pub struct SensingMask {
    mask: ndarray::Array2<f32>,
}

impl SensingMask {
    pub fn new(mask: ndarray::Array2<f32>) -> Self { Self { mask } }

    /// Bernoulli mask keeping roughly `keep_fraction` of the pixels.
    pub fn random(shape: (usize, usize), keep_fraction: f32, rng: &mut impl Rng) -> Self {
        let mask = ndarray::Array2::from_shape_simple_fn(shape, || {
            if rng.gen::<f32>() < keep_fraction { 1.0 } else { 0.0 }
        });
        Self { mask }
    }

    fn apply(&self, x: &ImageBatch) -> ImageBatch {
        let mut out = x.clone();
        for mut image in out.outer_iter_mut() {
            for mut channel in image.outer_iter_mut() {
                Zip::from(&mut channel).and(&self.mask).for_each(|v, &m| *v *= m);
            }
        }
        out
    }
}

impl ForwardOperator for SensingMask {
    fn im_shape(&self) -> (usize, usize) { self.mask.dim() }
    fn obs_shape(&self) -> (usize, usize) { self.mask.dim() }
    fn trafo(&self, x: &ImageBatch) -> DataBatch { self.apply(x) }
    fn trafo_adjoint(&self, y: &DataBatch) -> ImageBatch { self.apply(y) }
    fn fbp(&self, y: &DataBatch) -> Option<ImageBatch> { Some(self.apply(y)) }
}
