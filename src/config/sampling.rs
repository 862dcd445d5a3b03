//! Sampling run description, deserialized from a TOML file.
//!
//! All cross-option rules live in `validate`, so a bad file fails before the
//! first step rather than half-way through a reconstruction.

use std::error::Error;
use std::path::Path;

use serde::Deserialize;

use crate::{BoxErr, ConfigError, PredictionKind, Sde};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base seed; per-sample streams add the sample number.
    pub seed: Option<u64>,
    pub sde: SdeConfig,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum SdeConfig {
    Vesde { sigma_min: f32, sigma_max: f32 },
    Vpsde { beta_min: f32, beta_max: f32 },
    Ddpm  { beta_min: f32, beta_max: f32, num_steps: usize },
}

impl SdeConfig {
    pub fn build(&self) -> Sde {
        match *self {
            SdeConfig::Vesde { sigma_min, sigma_max } =>
                Sde::VarianceExploding { sigma_min, sigma_max },
            SdeConfig::Vpsde { beta_min, beta_max } =>
                Sde::VariancePreserving { beta_min, beta_max },
            SdeConfig::Ddpm { beta_min, beta_max, num_steps } =>
                Sde::discrete_ancestral(beta_min, beta_max, num_steps),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
    pub num_steps: usize,
    /// How many final steps of the schedule to run; 0 means all of them.
    #[serde(default)]
    pub start_time_step: usize,
    pub batch_size: usize,
    /// Smallest time the continuous schedules reach.
    pub eps: f32,
    pub predictor: PredictorConfig,
    pub corrector: Option<CorrectorConfig>,
    pub time_travel: Option<TimeTravelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case", deny_unknown_fields)]
pub enum PredictorConfig {
    /// Euler-Maruyama with the likelihood gradient taken at the noisy state.
    Naive { penalty: f32 },
    /// Euler-Maruyama with the likelihood gradient routed through the
    /// denoised estimate.
    Dps { penalty: f32 },
    /// DDIM recombination around a conjugate-gradient data-consistency solve.
    Dds {
        eta: f32,
        gamma: f32,
        #[serde(default)]
        use_simplified_eqn: bool,
        cg_iter: usize,
    },
    /// DDS with test-time adaptation of the score model before each solve.
    AdaptedDds {
        eta: f32,
        gamma: f32,
        #[serde(default)]
        use_simplified_eqn: bool,
        cg_iter: usize,
        tv_penalty: f32,
        num_optim_steps: usize,
        /// Adapt on every `adapt_freq`-th step; `None` means every step.
        adapt_freq: Option<usize>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrectorConfig {
    pub corrector_steps: usize,
    #[serde(default)]
    pub penalty: f32,
    #[serde(default = "default_snr")]
    pub snr: f32,
}

fn default_snr() -> f32 { 0.16 }

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeTravelConfig {
    pub travel_length: usize,
    pub travel_repeat: usize,
}

pub fn read_config_file(path: impl AsRef<Path>) -> BoxErr<Config> {
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read config file `{}`: {e}", path.as_ref().display()))?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        let sde = self.sde.build();
        self.sampling.validate(&sde)
    }
}

impl SamplingConfig {
    pub fn validate(&self, sde: &Sde) -> Result<(), Box<dyn Error>> {
        fn invalid(msg: String) -> Result<(), Box<dyn Error>> {
            Err(Box::new(ConfigError::Invalid(msg)))
        }
        fn unsupported(msg: String) -> Result<(), Box<dyn Error>> {
            Err(Box::new(ConfigError::Unsupported(msg)))
        }

        if self.num_steps < 2 {
            return invalid(format!("num_steps must be at least 2, got {}", self.num_steps));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        match sde.prediction_kind() {
            PredictionKind::Score => {
                if self.eps <= 0.0 {
                    return invalid(format!("eps must be positive, got {}", self.eps));
                }
            }
            PredictionKind::Epsilon => {
                let n = sde.discrete_steps().unwrap();
                if self.num_steps != n {
                    return invalid(format!(
                        "num_steps ({}) must match the discrete noise grid ({n})",
                        self.num_steps));
                }
            }
        }
        if self.start_time_step >= self.num_steps {
            return invalid(format!(
                "start_time_step ({}) must be below num_steps ({})",
                self.start_time_step, self.num_steps));
        }
        match &self.predictor {
            PredictorConfig::Naive { .. } | PredictorConfig::Dps { .. } => {
                if sde.prediction_kind() != PredictionKind::Score {
                    return unsupported(
                        "Euler-Maruyama predictors need a continuous (score) SDE".into());
                }
            }
            PredictorConfig::Dds { cg_iter, gamma, .. } => {
                if *gamma > 0.0 && *cg_iter == 0 {
                    return invalid("cg_iter must be positive when gamma > 0".into());
                }
            }
            PredictorConfig::AdaptedDds { cg_iter, gamma, adapt_freq, .. } => {
                if *gamma > 0.0 && *cg_iter == 0 {
                    return invalid("cg_iter must be positive when gamma > 0".into());
                }
                if *adapt_freq == Some(0) {
                    return invalid("adapt_freq must be positive".into());
                }
                if self.start_time_step != 0 {
                    return unsupported(
                        "adapted sampling cannot start from a partial schedule".into());
                }
            }
        }
        if self.corrector.is_some() && sde.prediction_kind() != PredictionKind::Score {
            return unsupported("the Langevin corrector needs a continuous (score) SDE".into());
        }
        if let Some(tt) = &self.time_travel {
            if sde.prediction_kind() != PredictionKind::Epsilon {
                return unsupported("time travel needs a discrete ancestral noise grid".into());
            }
            if tt.travel_length == 0 {
                return invalid("travel_length must be at least 1".into());
            }
            if self.start_time_step != 0 {
                return unsupported("time travel cannot start from a partial schedule".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> &'static str {
        r#"
        seed = 42

        [sde]
        type = "vesde"
        sigma_min = 0.01
        sigma_max = 10.0

        [sampling]
        num_steps = 100
        batch_size = 4
        eps = 1e-3

        [sampling.predictor]
        method = "dds"
        eta = 0.85
        gamma = 5.0
        cg_iter = 5
        "#
    }

    #[test]
    fn parses_a_complete_file() {
        let config: Config = toml::from_str(base_toml()).unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.sampling.num_steps, 100);
        assert_eq!(config.sampling.start_time_step, 0);
        match config.sampling.predictor {
            PredictorConfig::Dds { eta, gamma, use_simplified_eqn, cg_iter } => {
                assert_eq!(eta, 0.85);
                assert_eq!(gamma, 5.0);
                assert!(!use_simplified_eqn);
                assert_eq!(cg_iter, 5);
            }
            other => panic!("wrong predictor: {other:?}"),
        }
        config.validate().unwrap();
    }

    #[test]
    fn reads_the_shipped_default_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/sampling-config.toml");
        let config = read_config_file(path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sampling.batch_size, 4);
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = base_toml().replace("seed = 42", "seed = 42\nbananas = 1");
        assert!(toml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn rejects_single_step_schedules() {
        let text = base_toml().replace("num_steps = 100", "num_steps = 1");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn discrete_grid_must_match_num_steps() {
        let text = base_toml().replace(
            "type = \"vesde\"\n        sigma_min = 0.01\n        sigma_max = 10.0",
            "type = \"ddpm\"\n        beta_min = 1e-4\n        beta_max = 0.02\n        num_steps = 50");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err(), "50-level grid with 100 sampling steps");
    }

    #[test]
    fn time_travel_needs_a_discrete_grid() {
        let text = format!("{}\n[sampling.time_travel]\ntravel_length = 5\ntravel_repeat = 2\n",
                           base_toml());
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn naive_predictor_rejects_discrete_grids() {
        let text = base_toml()
            .replace("type = \"vesde\"\n        sigma_min = 0.01\n        sigma_max = 10.0",
                     "type = \"ddpm\"\n        beta_min = 1e-4\n        beta_max = 0.02\n        num_steps = 100")
            .replace("method = \"dds\"\n        eta = 0.85\n        gamma = 5.0\n        cg_iter = 5",
                     "method = \"naive\"\n        penalty = 1.0");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn adapted_sampling_rejects_partial_schedules() {
        let text = base_toml()
            .replace("batch_size = 4", "batch_size = 4\n        start_time_step = 30")
            .replace("method = \"dds\"",
                     "method = \"adapted_dds\"\n        tv_penalty = 1e-5\n        num_optim_steps = 4")
            ;
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }
}
