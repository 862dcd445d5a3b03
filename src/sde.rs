//! The diffusion processes a score network can be trained against.
//!
//! Time runs over `[0,1]` for the continuous families (`t = 0` is the clean
//! data distribution, `t = 1` is pure noise); the ancestral family counts
//! discrete steps `0 ..= num_steps-1` instead, with step `0` cleanest.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::ImageBatch;

/// What the trained network outputs at a given noise level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionKind {
    /// Gradient of the log-density of the noisy marginal.
    Score,
    /// The additive standard-normal noise component.
    Epsilon,
}

#[derive(Clone, Debug)]
pub enum Sde {
    /// Noise scale grows geometrically from `sigma_min` to `sigma_max`;
    /// the mean is untouched.
    VarianceExploding { sigma_min: f32, sigma_max: f32 },

    /// Linearly scheduled beta; the mean shrinks as the variance fills in.
    VariancePreserving { beta_min: f32, beta_max: f32 },

    /// Fixed number of discrete steps with precomputed per-step noise
    /// levels. The network predicts epsilon rather than the score.
    DiscreteAncestral { betas: Vec<f32>, alphas_cumprod: Vec<f32> },
}

impl Sde {
    /// Linear beta grid between `beta_min` and `beta_max`, one entry per step.
    pub fn discrete_ancestral(beta_min: f32, beta_max: f32, num_steps: usize) -> Self {
        let betas: Vec<f32> = (0..num_steps)
            .map(|k| beta_min + (beta_max - beta_min) * k as f32 / (num_steps - 1).max(1) as f32)
            .collect();
        let mut acc = 1.0;
        let alphas_cumprod = betas.iter().map(|b| { acc *= 1.0 - b; acc }).collect();
        Sde::DiscreteAncestral { betas, alphas_cumprod }
    }

    pub fn prediction_kind(&self) -> PredictionKind {
        match self {
            Sde::VarianceExploding { .. } |
            Sde::VariancePreserving { .. } => PredictionKind::Score,
            Sde::DiscreteAncestral { .. } => PredictionKind::Epsilon,
        }
    }

    /// Number of precomputed steps, for the discrete family only.
    pub fn discrete_steps(&self) -> Option<usize> {
        match self {
            Sde::DiscreteAncestral { betas, .. } => Some(betas.len()),
            _ => None,
        }
    }

    /// Closed-form mean-scale and standard deviation of the noisy marginal at
    /// time `t` (step index for the discrete family): a clean sample `x0`
    /// perturbs to `mean_scale * x0 + std * z`.
    pub fn marginal_prob(&self, t: f32) -> (f32, f32) {
        match self {
            Sde::VarianceExploding { sigma_min, sigma_max } => {
                (1.0, sigma_min * (sigma_max / sigma_min).powf(t))
            }
            Sde::VariancePreserving { beta_min, beta_max } => {
                let log_mean = -0.25 * t * t * (beta_max - beta_min) - 0.5 * t * beta_min;
                let mean = log_mean.exp();
                (mean, (1.0 - (2.0 * log_mean).exp()).max(0.0).sqrt())
            }
            Sde::DiscreteAncestral { alphas_cumprod, .. } => {
                let abar = alphas_cumprod[self.index_of(t)];
                (abar.sqrt(), (1.0 - abar).max(0.0).sqrt())
            }
        }
    }

    pub fn marginal_prob_std(&self, t: f32) -> f32 { self.marginal_prob(t).1 }

    /// Forward-time coefficients `(f, g)` at `t`, with drift `f * x` and
    /// diffusion `g`. Continuous families only; the predictors keep the
    /// discrete family away from here.
    pub fn drift_diffusion(&self, t: f32) -> (f32, f32) {
        match self {
            Sde::VarianceExploding { sigma_min, sigma_max } => {
                let sigma = sigma_min * (sigma_max / sigma_min).powf(t);
                (0.0, sigma * (2.0 * (sigma_max.ln() - sigma_min.ln())).sqrt())
            }
            Sde::VariancePreserving { beta_min, beta_max } => {
                let beta = beta_min + t * (beta_max - beta_min);
                (-0.5 * beta, beta.sqrt())
            }
            Sde::DiscreteAncestral { .. } => {
                unreachable!("ancestral schedule has no continuous-time coefficients")
            }
        }
    }

    /// Draw the pure-noise state the reverse process starts from.
    pub fn prior_sampling(
        &self,
        shape: (usize, usize, usize, usize),
        rng: &mut impl Rng,
    ) -> ImageBatch {
        let scale = match self {
            Sde::VarianceExploding { sigma_max, .. } => *sigma_max,
            _ => 1.0,
        };
        ImageBatch::from_shape_simple_fn(shape, || {
            let z: f32 = rng.sample(StandardNormal);
            z * scale
        })
    }

    /// One forward (noising) transition onto step `k`, used when a schedule
    /// revisits earlier steps. Discrete family only.
    pub fn ancestral_forward_step(
        &self,
        x: &ImageBatch,
        k: usize,
        rng: &mut impl Rng,
    ) -> ImageBatch {
        match self {
            Sde::DiscreteAncestral { betas, .. } => {
                let beta = betas[k];
                let mut next = x * (1.0 - beta).sqrt();
                next.scaled_add(beta.sqrt(), &crate::utils::randn_like(x, rng));
                next
            }
            _ => unreachable!("forward revisits only apply to the ancestral schedule"),
        }
    }

    fn index_of(&self, t: f32) -> usize {
        let n = self.discrete_steps().unwrap_or(1);
        (t.round().max(0.0) as usize).min(n - 1)
    }
}
