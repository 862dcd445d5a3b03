//! Interface to the trained score/noise network.
//!
//! The network itself is an external collaborator: tensor in, tensor out,
//! given a noise level. Everything the sampling engine needs from it is
//! captured by these traits, plus an analytic Gaussian reference model that
//! stands in for a real network in tests and demos.

use crate::{ImageBatch, Sde, PredictionKind};

pub trait ScoreModel {
    /// Score (or epsilon, depending on the SDE family the model was trained
    /// for) at state `x` and time `t`. Same shape as `x`.
    fn evaluate(&self, x: &ImageBatch, t: f32) -> ImageBatch;

    /// Vector-Jacobian product of `evaluate` with respect to `x`: given a
    /// cotangent `u`, return `(d evaluate / d x)^T u`.
    ///
    /// Models without a gradient primitive return `None`; predictors that
    /// need the gradient then fall back to a closed-form adjoint-only
    /// correction which treats the model output as locally constant in `x`.
    fn vjp(&self, _x: &ImageBatch, _t: f32, _cotangent: &ImageBatch) -> Option<ImageBatch> {
        None
    }
}

/// A model whose designated parameter subset can be nudged at test time.
///
/// Which parameters move, and how, is the model's business; the sampling
/// engine only supplies the objective, evaluated on the model's raw output
/// at `(x, t)`.
pub trait AdaptiveScoreModel: ScoreModel {
    fn adapt_step(&mut self, x: &ImageBatch, t: f32, objective: &dyn Fn(&ImageBatch) -> f32);
}

// --------------------------------------------------------------------------------
//      Analytic reference model: exact score of the marginal around a
//      known clean image.

/// The true score of `marginal_prob(x0, t)` for a fixed clean image `x0`.
///
/// With this model Tweedie's formula recovers `x0` exactly, which makes it
/// the natural oracle for validating the stepping machinery end to end.
#[derive(Clone)]
pub struct GaussianScore {
    pub sde: Sde,
    pub x0: ImageBatch,
}

impl GaussianScore {
    pub fn new(sde: Sde, x0: ImageBatch) -> Self { Self { sde, x0 } }
}

impl ScoreModel for GaussianScore {
    fn evaluate(&self, x: &ImageBatch, t: f32) -> ImageBatch {
        let (mean_scale, std) = self.sde.marginal_prob(t);
        let std = std.max(1e-6);
        match self.sde.prediction_kind() {
            // score = -(x - m * x0) / std^2
            PredictionKind::Score => {
                let mut out = &self.x0 * (mean_scale / (std * std));
                out.scaled_add(-1.0 / (std * std), x);
                out
            }
            // epsilon = (x - m * x0) / std
            PredictionKind::Epsilon => {
                let mut out = x / std;
                out.scaled_add(-mean_scale / std, &self.x0);
                out
            }
        }
    }

    fn vjp(&self, _x: &ImageBatch, t: f32, cotangent: &ImageBatch) -> Option<ImageBatch> {
        let std = self.sde.marginal_prob_std(t).max(1e-6);
        let factor = match self.sde.prediction_kind() {
            PredictionKind::Score => -1.0 / (std * std),
            PredictionKind::Epsilon => 1.0 / std,
        };
        Some(cotangent * factor)
    }
}

// --------------------------------------------------------------------------------

/// Gaussian reference model carrying a single adaptable scalar bias.
///
/// The bias shifts every output value, and `adapt_step` moves it down the
/// finite-difference gradient of the supplied objective. Small enough to be
/// exact, yet it exercises the whole adaptation seam.
#[derive(Clone)]
pub struct BiasedScore {
    pub inner: GaussianScore,
    pub bias: f32,
    pub learning_rate: f32,
}

impl BiasedScore {
    pub fn new(inner: GaussianScore, bias: f32, learning_rate: f32) -> Self {
        Self { inner, bias, learning_rate }
    }
}

impl ScoreModel for BiasedScore {
    fn evaluate(&self, x: &ImageBatch, t: f32) -> ImageBatch {
        let bias = self.bias;
        self.inner.evaluate(x, t).mapv(|v| v + bias)
    }
}

impl AdaptiveScoreModel for BiasedScore {
    fn adapt_step(&mut self, x: &ImageBatch, t: f32, objective: &dyn Fn(&ImageBatch) -> f32) {
        const H: f32 = 1e-3;
        let base = self.inner.evaluate(x, t);
        let loss_at = |bias: f32| objective(&base.mapv(|v| v + bias));
        let gradient = (loss_at(self.bias + H) - loss_at(self.bias - H)) / (2.0 * H);
        self.bias -= self.learning_rate * gradient;
    }
}
