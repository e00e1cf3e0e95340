use serde::{Deserialize, Serialize};

use crate::utils::read_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Length of the conditioning vector, the four projected corners.
    pub d_cond: i64,
    /// Length of the estimated state vector.
    pub d_input: i64,
    pub d_model: i64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self { d_cond: 8, d_input: 13, d_model: 512 }
    }
}

impl PredictorConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = read_file(path)?;
        let cfg: PredictorConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_toml() {
        let cfg = PredictorConfig::from_file("src/predictor/config.default.toml").unwrap();
        assert_eq!(cfg, PredictorConfig::default());
    }
}
