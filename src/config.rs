pub mod sampling;

use std::fmt;

/// Setup-time failures. Everything here is detected before the first step;
/// nothing inside the stepping loop raises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested combination of algorithm and schedule does not exist.
    Unsupported(String),
    /// A recognized option carries a value that cannot work.
    Invalid(String),
    /// Measurement / operator / state dimensions disagree.
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Unsupported(what) => write!(f, "unsupported configuration: {what}"),
            ConfigError::Invalid(what) => write!(f, "invalid configuration: {what}"),
            ConfigError::ShapeMismatch { expected, got } =>
                write!(f, "shape mismatch: expected {expected:?}, got {got:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}
