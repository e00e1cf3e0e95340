use serde::{Deserialize, Serialize};

use super::losses::HybridLossConfig;
use super::schedule::BetaSchedule;
use crate::error::{DiffusionError, Result};
use crate::utils::read_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub schedule: BetaSchedule,
    pub timesteps: usize,
    // A step count ("128"), per-segment counts ("10,20") or "ddimN".
    #[serde(default)]
    pub respacing: Option<String>,
    #[serde(default)]
    pub clip_denoised: bool,
    #[serde(default)]
    pub loss: HybridLossConfig,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            schedule: BetaSchedule::Linear,
            timesteps: 1024,
            respacing: None,
            clip_denoised: false,
            loss: HybridLossConfig::default(),
        }
    }
}

impl DiffusionConfig {
    /// Parse failures, an unknown schedule kind included, are
    /// [`DiffusionError::Config`].
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| DiffusionError::config(e.to_string()))
    }

    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = read_file(path)?;
        Ok(Self::from_toml_str(&file)?)
    }

    /// Same schedule, sampled over a respaced subset of its steps.
    pub fn respaced(&self, respacing: &str) -> Self {
        Self { respacing: Some(respacing.to_string()), ..self.clone() }
    }
}
