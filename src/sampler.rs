//! Orchestration of a full sampling run.
//!
//! `Sampler` binds the SDE, the forward operator, the measurement and a
//! validated configuration, then drives the schedule: initialize, step the
//! predictor level by level, re-noise on revisit segments, correct, and hand
//! back the final denoised batch. All failure modes are checked up front.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rand::Rng;

use crate::{BoxErr, ConfigError, DataBatch, ImageBatch, Sde};
use crate::config::sampling::{PredictorConfig, SamplingConfig};
use crate::corrector::{langevin_corrector, CorrectorOptions};
use crate::fom::psnr;
use crate::io::raw;
use crate::operator::ForwardOperator;
use crate::predictor::{adapted_ddim_step, dds_step, euler_maruyama_step, StepContext};
use crate::schedule::{descending, time_grid, with_time_travel};
use crate::score::{AdaptiveScoreModel, ScoreModel};
use crate::utils::{l2_norm, randn_like};

/// Optional progress reporting for a run. Disabled by default; when enabled,
/// residual norms (and PSNR, given a ground truth) are printed and
/// intermediate denoised estimates land in `log_dir` as raw files.
pub struct LogOptions {
    pub enabled: bool,
    pub log_dir: PathBuf,
    /// Roughly how many reports to spread over the run.
    pub num_reports: usize,
    /// Tags logged file names, so batched runs do not clobber each other.
    pub sample_index: usize,
    pub ground_truth: Option<ImageBatch>,
    /// Baseline estimate (e.g. FBP) reported alongside the running metrics.
    pub initial_guess: Option<ImageBatch>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("."),
            num_reports: 10,
            sample_index: 0,
            ground_truth: None,
            initial_guess: None,
        }
    }
}

pub struct Sampler<'a> {
    sde: Sde,
    op: &'a dyn ForwardOperator,
    observation: &'a DataBatch,
    /// Clean-image estimate (FBP or similar) for mid-chain starts.
    initial_guess: Option<&'a ImageBatch>,
    config: SamplingConfig,
}

impl<'a> Sampler<'a> {

    pub fn new(
        sde: Sde,
        op: &'a dyn ForwardOperator,
        observation: &'a DataBatch,
        initial_guess: Option<&'a ImageBatch>,
        config: SamplingConfig,
    ) -> BoxErr<Self> {
        config.validate(&sde)?;

        let (oh, ow) = op.obs_shape();
        let expected = vec![config.batch_size, 1, oh, ow];
        let got: Vec<usize> = observation.shape().to_vec();
        if got != expected {
            return Err(Box::new(ConfigError::ShapeMismatch { expected, got }));
        }
        if let Some(init) = initial_guess {
            let (ih, iw) = op.im_shape();
            let expected = vec![config.batch_size, 1, ih, iw];
            let got: Vec<usize> = init.shape().to_vec();
            if got != expected {
                return Err(Box::new(ConfigError::ShapeMismatch { expected, got }));
            }
        }
        if config.start_time_step > 0 && initial_guess.is_none() {
            return Err(Box::new(ConfigError::Invalid(
                "start_time_step > 0 needs an initial guess to diffuse from".into())));
        }
        if config.start_time_step == 0 && initial_guess.is_some() {
            return Err(Box::new(ConfigError::Invalid(
                "an initial guess needs start_time_step > 0 to be diffused in".into())));
        }
        Ok(Self { sde, op, observation, initial_guess, config })
    }

    /// Reconstruct with a fixed score model.
    pub fn sample<S: ScoreModel, R: Rng>(
        &self,
        score: &S,
        logg: &LogOptions,
        rng: &mut R,
    ) -> BoxErr<ImageBatch> {
        if matches!(self.config.predictor, PredictorConfig::AdaptedDds { .. }) {
            return Err(Box::new(ConfigError::Unsupported(
                "the adapted predictor updates the model; call sample_adapted".into())));
        }
        let corrector = self.corrector_options();
        let mut step = |ctx: &StepContext, x: &ImageBatch,
                        k: usize, k_next: Option<usize>, _i: usize, rng: &mut R| {
            let (mut next, x0_hat) = match self.config.predictor {
                PredictorConfig::Naive { penalty } =>
                    euler_maruyama_step(ctx, score, x, k, k_next, false, penalty, rng),
                PredictorConfig::Dps { penalty } =>
                    euler_maruyama_step(ctx, score, x, k, k_next, true, penalty, rng),
                PredictorConfig::Dds { eta, gamma, use_simplified_eqn, cg_iter } =>
                    dds_step(ctx, score, x, k, k_next, eta, gamma,
                             use_simplified_eqn, cg_iter, rng),
                PredictorConfig::AdaptedDds { .. } => unreachable!(),
            };
            if let (Some(options), Some(kn)) = (&corrector, k_next) {
                next = langevin_corrector(ctx, score, next, kn, options, rng);
            }
            (next, x0_hat)
        };
        self.drive(&mut step, logg, rng)
    }

    /// Reconstruct while adapting the score model to the measurement.
    pub fn sample_adapted<S: AdaptiveScoreModel, R: Rng>(
        &self,
        score: &mut S,
        logg: &LogOptions,
        rng: &mut R,
    ) -> BoxErr<ImageBatch> {
        let (eta, gamma, use_simplified_eqn, cg_iter, tv_penalty, num_optim_steps, adapt_freq) =
            match self.config.predictor {
                PredictorConfig::AdaptedDds {
                    eta, gamma, use_simplified_eqn, cg_iter,
                    tv_penalty, num_optim_steps, adapt_freq,
                } => (eta, gamma, use_simplified_eqn, cg_iter,
                      tv_penalty, num_optim_steps, adapt_freq.unwrap_or(1)),
                _ => return Err(Box::new(ConfigError::Unsupported(
                    "sample_adapted needs the adapted predictor".into()))),
            };
        let corrector = self.corrector_options();
        let mut step = |ctx: &StepContext, x: &ImageBatch,
                        k: usize, k_next: Option<usize>, i: usize, rng: &mut R| {
            let do_adapt = i % adapt_freq == 0;
            let (mut next, x0_hat) = adapted_ddim_step(
                ctx, score, x, k, k_next, eta, gamma, use_simplified_eqn,
                cg_iter, tv_penalty, num_optim_steps, do_adapt, rng);
            if let (Some(options), Some(kn)) = (&corrector, k_next) {
                next = langevin_corrector(ctx, &*score, next, kn, options, rng);
            }
            (next, x0_hat)
        };
        self.drive(&mut step, logg, rng)
    }

    fn corrector_options(&self) -> Option<CorrectorOptions> {
        self.config.corrector.as_ref().map(|c| CorrectorOptions {
            corrector_steps: c.corrector_steps,
            penalty: c.penalty,
            snr: c.snr,
        })
    }

    fn schedule(&self) -> Vec<usize> {
        match &self.config.time_travel {
            Some(tt) => with_time_travel(self.config.num_steps,
                                         tt.travel_length, tt.travel_repeat),
            None => descending(self.config.num_steps, self.config.start_time_step),
        }
    }

    /// Starting state: forward-diffused initial guess for mid-chain starts,
    /// a draw from the prior otherwise.
    fn initial_state(&self, start_level: usize, rng: &mut impl Rng) -> ImageBatch {
        let (h, w) = self.op.im_shape();
        let shape = (self.config.batch_size, 1, h, w);
        match self.initial_guess {
            Some(init) if self.config.start_time_step > 0 => {
                let times = time_grid(&self.sde, self.config.num_steps, self.config.eps);
                let (m, std) = self.sde.marginal_prob(times[start_level]);
                let mut x = init * m;
                x.scaled_add(std, &randn_like(init, rng));
                x
            }
            _ => self.sde.prior_sampling(shape, rng),
        }
    }

    fn drive<R: Rng>(
        &self,
        step: &mut dyn FnMut(&StepContext, &ImageBatch, usize, Option<usize>, usize, &mut R)
                             -> (ImageBatch, ImageBatch),
        logg: &LogOptions,
        rng: &mut R,
    ) -> BoxErr<ImageBatch> {
        let times = time_grid(&self.sde, self.config.num_steps, self.config.eps);
        let rhs = self.op.trafo_adjoint(self.observation);
        let ctx = StepContext {
            sde: &self.sde,
            op: self.op,
            observation: self.observation,
            rhs: &rhs,
            times: &times,
        };

        let schedule = self.schedule();
        let mut x = self.initial_state(schedule[0], rng);

        if logg.enabled {
            if let (Some(guess), Some(truth)) = (&logg.initial_guess, &logg.ground_truth) {
                println!("initial guess: psnr {:6.2} dB", image_psnr(guess, truth));
            }
        }

        let progress = if logg.enabled {
            let bar = ProgressBar::new(schedule.len() as u64);
            bar.set_style(ProgressStyle::with_template(
                "sampling [{bar:40}] {pos}/{len} {msg}")?);
            bar
        } else {
            ProgressBar::hidden()
        };
        let report_every = (schedule.len() / logg.num_reports.max(1)).max(1);

        let mut i = 0usize;
        for (&k, &k_next) in schedule.iter().tuple_windows() {
            if k_next > k {
                // revisit segment: diffuse one level back up the chain
                x = self.sde.ancestral_forward_step(&x, k_next, rng);
            } else {
                let (next, x0_hat) = step(&ctx, &x, k, Some(k_next), i, rng);
                x = next;
                if logg.enabled && i % report_every == 0 {
                    self.report(logg, &x0_hat, i)?;
                }
                i += 1;
            }
            progress.inc(1);
        }
        // last level: deterministic denoise, no fresh noise added
        let (x_final, _) = step(&ctx, &x, 0, None, i, rng);
        progress.inc(1);
        progress.finish();

        Ok(x_final)
    }

    fn report(&self, logg: &LogOptions, x0_hat: &ImageBatch, i: usize) -> BoxErr<()> {
        let residual = self.observation - &self.op.trafo(x0_hat);
        match &logg.ground_truth {
            Some(truth) => {
                println!("step {i}: residual {:9.4}  psnr {:6.2} dB",
                         l2_norm(&residual), image_psnr(x0_hat, truth));
            }
            None => println!("step {i}: residual {:9.4}", l2_norm(&residual)),
        }
        let name = format!("denoised_{:03}_{i:05}.raw", logg.sample_index);
        raw::write_batch(x0_hat, &logg.log_dir.join(name))?;
        Ok(())
    }
}

/// PSNR of the first image of a batch against the matching ground truth.
fn image_psnr(image: &ImageBatch, ground_truth: &ImageBatch) -> f32 {
    psnr(image.index_axis(ndarray::Axis(0), 0).index_axis(ndarray::Axis(0), 0),
         ground_truth.index_axis(ndarray::Axis(0), 0).index_axis(ndarray::Axis(0), 0))
}
