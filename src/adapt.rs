//! Test-time adaptation of the score model against the measurement.
//!
//! Before a step, the model's adaptable parameters are nudged to shrink the
//! measurement residual of the denoised estimate, with a total-variation
//! penalty keeping the estimate from chasing noise. How the parameters move
//! is the model's business (`AdaptiveScoreModel`); this module only builds
//! the objective and bounds the number of updates.

use crate::ImageBatch;
use crate::predictor::{StepContext, tweedy};
use crate::score::AdaptiveScoreModel;

/// Anisotropic total variation, averaged over the batch.
pub fn tv_loss(x: &ImageBatch) -> f32 {
    let (b, c, h, w) = x.dim();
    let mut total = 0.0;
    for i in 0..b {
        for j in 0..c {
            for r in 0..h {
                for s in 0..w {
                    if r + 1 < h { total += (x[(i, j, r + 1, s)] - x[(i, j, r, s)]).abs(); }
                    if s + 1 < w { total += (x[(i, j, r, s + 1)] - x[(i, j, r, s)]).abs(); }
                }
            }
        }
    }
    total / (b * c * h * w) as f32
}

/// Run `num_steps` bounded parameter updates at state `x` and time `t`.
pub fn adapt_score<S: AdaptiveScoreModel>(
    score: &mut S,
    ctx: &StepContext,
    x: &ImageBatch,
    t: f32,
    tv_penalty: f32,
    num_steps: usize,
) {
    let objective = |output: &ImageBatch| {
        let x0_hat = tweedy(ctx.sde, x, t, output);
        let residual = &ctx.op.trafo(&x0_hat) - ctx.observation;
        let data_fit = residual.iter().map(|v| v * v).sum::<f32>() / residual.len() as f32;
        data_fit + tv_penalty * tv_loss(&x0_hat)
    };
    for _ in 0..num_steps {
        score.adapt_step(x, t, &objective);
    }
}
