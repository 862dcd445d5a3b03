pub use crate::config::ConfigError;
pub use crate::sde::{Sde, PredictionKind};
pub use crate::score::{ScoreModel, AdaptiveScoreModel, GaussianScore};
pub use crate::operator::{ForwardOperator, simulate};
pub use crate::sampler::{Sampler, LogOptions};

pub type Intensityf32 = f32;

/// Batch of images being reconstructed: `[batch, channel, row, column]`.
pub type ImageBatch = ndarray::Array4<Intensityf32>;

/// Batch of observed data (sinogram / k-space); layout fixed by the operator.
pub type DataBatch = ndarray::Array4<Intensityf32>;

pub type BoxErr<T> = Result<T, Box<dyn std::error::Error>>;
