mod exports;
pub use exports::*;

pub mod sde;
pub mod score;
pub mod operator;
pub mod cg;
pub mod schedule;
pub mod predictor;
pub mod corrector;
pub mod adapt;
pub mod sampler;
pub mod fom;
pub mod io;
pub mod utils;
pub mod config;
