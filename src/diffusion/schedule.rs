//! # Noise Schedules
//!
//! A schedule is the sequence of per-step noise variances `betas` together with
//! the cumulative products derived from it. Schedules are immutable once built
//! and can be shared freely between training and sampling runs.
use std::{f64::consts::FRAC_PI_2, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DiffusionError, Result};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetaSchedule {
    /// Linear interpolation, rescaled with the number of steps.
    Linear,
    /// Glide cosine schedule
    Cosine,
}

impl FromStr for BetaSchedule {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(BetaSchedule::Linear),
            "cosine" => Ok(BetaSchedule::Cosine),
            other => Err(DiffusionError::config(format!("unknown beta schedule: {other:?}"))),
        }
    }
}

impl fmt::Display for BetaSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetaSchedule::Linear => write!(f, "linear"),
            BetaSchedule::Cosine => write!(f, "cosine"),
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| f64::cos((t + 0.008) / 1.008 * FRAC_PI_2).powi(2);
    let n = num_diffusion_timesteps as f64;
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).clamp(0.0, max_beta)
        })
        .collect()
}

// Scaled so that schedules of any length match the 1000-step DDPM endpoints.
fn linear_betas(num_diffusion_timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / num_diffusion_timesteps as f64;
    let beta_start = scale * 1e-4;
    let beta_end = scale * 2e-2;
    if num_diffusion_timesteps == 1 {
        return vec![beta_start];
    }
    let last = (num_diffusion_timesteps - 1) as f64;
    (0..num_diffusion_timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * i as f64 / last)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    timestep_map: Option<Vec<usize>>,
}

impl NoiseSchedule {
    pub fn build(kind: BetaSchedule, num_timesteps: usize) -> Result<Self> {
        if num_timesteps < 1 {
            return Err(DiffusionError::config("timesteps must be at least 1"));
        }
        let betas = match kind {
            BetaSchedule::Linear => linear_betas(num_timesteps),
            BetaSchedule::Cosine => betas_for_alpha_bar(num_timesteps, 0.999),
        };
        let schedule = Self::from_betas(betas)?;
        info!(%kind, num_timesteps, "built noise schedule");
        Ok(schedule)
    }

    /// Builds a schedule from raw betas, each of which must lie in `(0, 1)`.
    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(DiffusionError::config("schedule needs at least one beta"));
        }
        if let Some((i, beta)) = betas.iter().enumerate().find(|(_, b)| !(**b > 0.0 && **b < 1.0)) {
            return Err(DiffusionError::config(format!(
                "beta[{i}] = {beta} is outside (0, 1), use more timesteps"
            )));
        }
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut alphas_cumprod_prev = Vec::with_capacity(alphas.len());
        let mut prod = 1.0;
        for &alpha in &alphas {
            alphas_cumprod_prev.push(prod);
            prod *= alpha;
            alphas_cumprod.push(prod);
        }
        Ok(Self { betas, alphas, alphas_cumprod, alphas_cumprod_prev, timestep_map: None })
    }

    pub(crate) fn with_timestep_map(mut self, timestep_map: Vec<usize>) -> Self {
        self.timestep_map = Some(timestep_map);
        self
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    /// Original step indices this schedule was derived from, `None` for a base schedule.
    pub fn timestep_map(&self) -> Option<&[usize]> {
        self.timestep_map.as_deref()
    }

    pub fn is_respaced(&self) -> bool {
        self.timestep_map.is_some()
    }

    /// Index in the original schedule of step `i` of this one.
    pub fn original_timestep(&self, i: usize) -> usize {
        match &self.timestep_map {
            Some(map) => map[i],
            None => i,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule_1000_steps() {
        let schedule = NoiseSchedule::build(BetaSchedule::Linear, 1000).unwrap();
        assert_eq!(schedule.len(), 1000);
        assert!((schedule.betas()[0] - 1e-4).abs() < 1e-12);
        assert!((schedule.betas()[999] - 0.02).abs() < 1e-12);
        assert_eq!(schedule.alphas_cumprod_prev()[0], 1.0);
        assert!(!schedule.is_respaced());
    }

    #[test]
    fn test_linear_schedule_is_scaled_with_length() {
        let schedule = NoiseSchedule::build(BetaSchedule::Linear, 1024).unwrap();
        let scale = 1000.0 / 1024.0;
        assert!((schedule.betas()[0] - 1e-4 * scale).abs() < 1e-15);
        assert!((schedule.betas()[1023] - 2e-2 * scale).abs() < 1e-15);
        // matches the first entry of the exported 128-step browser schedule
        assert!((schedule.betas()[0] - 9.765625e-05).abs() < 1e-12);
    }

    #[test]
    fn test_alphas_cumprod_decreasing_and_bounded() {
        for kind in [BetaSchedule::Linear, BetaSchedule::Cosine] {
            for steps in [1, 50, 100, 1024] {
                let schedule = NoiseSchedule::build(kind, steps).unwrap();
                let ac = schedule.alphas_cumprod();
                assert!(ac.iter().all(|a| *a > 0.0 && *a <= 1.0), "{kind} {steps}");
                assert!(ac.windows(2).all(|w| w[1] < w[0]), "{kind} {steps}");
                for i in 1..ac.len() {
                    assert_eq!(schedule.alphas_cumprod_prev()[i], ac[i - 1]);
                }
            }
        }
    }

    #[test]
    fn test_cosine_schedule() {
        let schedule = NoiseSchedule::build(BetaSchedule::Cosine, 100).unwrap();
        assert!(schedule.alphas_cumprod()[0] > 0.99);
        assert!(schedule.alphas_cumprod()[99] < 0.01);
        assert!(schedule.betas().iter().all(|b| *b <= 0.999));
        assert_eq!(schedule.betas()[99], 0.999);
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(matches!(
            NoiseSchedule::build(BetaSchedule::Linear, 0),
            Err(DiffusionError::Config(_))
        ));
        // beta_end passes 1 for very short linear schedules
        assert!(matches!(
            NoiseSchedule::build(BetaSchedule::Linear, 10),
            Err(DiffusionError::Config(_))
        ));
        assert!(matches!("quadratic".parse::<BetaSchedule>(), Err(DiffusionError::Config(_))));
        assert_eq!("cosine".parse::<BetaSchedule>().unwrap(), BetaSchedule::Cosine);
    }
}
