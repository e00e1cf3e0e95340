pub mod diffusion;
pub mod ema;
pub mod error;
pub mod pose;
pub mod predictor;
pub mod utils;

pub use diffusion::{diffusion_from_config, DiffusionConfig, GaussianDiffusion};
pub use error::{DiffusionError, Result};
