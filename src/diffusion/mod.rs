//! # Gaussian Diffusion
//!
//! The forward (noising) process of a DDPM together with the posterior
//! formulas shared by the training objective and the reverse sampler.
//!
//! Batches are tensors whose first dimension is the batch and second the
//! channel dimension. Timesteps are one integer per batch element indexing the
//! active, possibly respaced, schedule.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
//! Improved Denoising Diffusion Probabilistic Models, A. Nichol, P. Dhariwal, 2021.
//! https://arxiv.org/abs/2102.09672
use tch::{Kind, Tensor};
use tracing::info;

use crate::error::{DiffusionError, Result};

use self::losses::VarianceInterp;
use self::schedule::NoiseSchedule;

pub mod config;
pub mod losses;
pub mod respace;
pub mod sampler;
pub mod schedule;
pub mod types;

pub use self::config::DiffusionConfig;

/// Gathers `arr[t[i]]` for every batch element and reshapes the result so it
/// broadcasts against `like`.
pub(crate) fn extract(arr: &[f64], t: &Tensor, like: &Tensor) -> Tensor {
    let values = Tensor::from_slice(arr).to_kind(like.kind()).to_device(like.device());
    let idx = t.to_kind(Kind::Int64).to_device(like.device());
    let values = values.index_select(0, &idx);
    let mut shape = vec![values.size()[0]];
    shape.extend(std::iter::repeat(1).take(like.dim().saturating_sub(1)));
    values.view(shape.as_slice())
}

pub(crate) fn check_same_shape(op: &'static str, expected: &Tensor, actual: &Tensor) -> Result<()> {
    if expected.size() != actual.size() {
        return Err(DiffusionError::shape(op, format!("{:?}", expected.size()), actual.size()));
    }
    Ok(())
}

fn batch_size(xs: &Tensor) -> i64 {
    xs.size().first().copied().unwrap_or(0)
}

/// Mean over every dimension but the batch one.
pub(crate) fn mean_flat(xs: &Tensor) -> Tensor {
    xs.flatten(1, -1).mean_dim(Some([1i64].as_slice()), false, xs.kind())
}

/// Mean and variance of `q(x_{t-1} | x_t, x_0)`.
#[derive(Debug)]
pub struct Posterior {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    variance_interp: VarianceInterp,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    log_betas: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(schedule: NoiseSchedule) -> Self {
        let betas = schedule.betas();
        let alphas = schedule.alphas();
        let ac = schedule.alphas_cumprod();
        let acp = schedule.alphas_cumprod_prev();
        let n = schedule.len();

        let mut posterior_variance: Vec<f64> =
            (0..n).map(|i| betas[i] * (1.0 - acp[i]) / (1.0 - ac[i])).collect();
        // The posterior variance is exactly zero at the first step, floor it at
        // the first beta.
        posterior_variance[0] = posterior_variance[0].max(betas[0]);

        Self {
            variance_interp: VarianceInterp::default(),
            sqrt_alphas_cumprod: ac.iter().map(|a| a.sqrt()).collect(),
            sqrt_one_minus_alphas_cumprod: ac.iter().map(|a| (1.0 - a).sqrt()).collect(),
            sqrt_recip_alphas_cumprod: ac.iter().map(|a| (1.0 / a).sqrt()).collect(),
            sqrt_recipm1_alphas_cumprod: ac.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect(),
            log_betas: betas.iter().map(|b| b.ln()).collect(),
            posterior_log_variance_clipped: posterior_variance.iter().map(|v| v.ln()).collect(),
            posterior_variance,
            posterior_mean_coef1: (0..n).map(|i| betas[i] * acp[i].sqrt() / (1.0 - ac[i])).collect(),
            posterior_mean_coef2: (0..n)
                .map(|i| (1.0 - acp[i]) * alphas[i].sqrt() / (1.0 - ac[i]))
                .collect(),
            schedule,
        }
    }

    pub fn with_variance_interp(mut self, variance_interp: VarianceInterp) -> Self {
        self.variance_interp = variance_interp;
        self
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.len()
    }

    pub fn variance_interp(&self) -> VarianceInterp {
        self.variance_interp
    }

    pub(crate) fn alphas_cumprod(&self) -> &[f64] {
        self.schedule.alphas_cumprod()
    }

    pub(crate) fn alphas_cumprod_prev(&self) -> &[f64] {
        self.schedule.alphas_cumprod_prev()
    }

    /// Validates that `t` holds one in-range index per batch element.
    pub(crate) fn check_timesteps(&self, op: &'static str, t: &Tensor, batch: i64) -> Result<()> {
        if t.dim() != 1 || t.size()[0] != batch {
            return Err(DiffusionError::shape(op, format!("timesteps of shape [{batch}]"), t.size()));
        }
        if batch == 0 {
            return Ok(());
        }
        let lo = t.min().int64_value(&[]);
        let hi = t.max().int64_value(&[]);
        if lo < 0 || hi >= self.num_timesteps() as i64 {
            return Err(DiffusionError::shape(
                op,
                format!("timesteps in [0, {})", self.num_timesteps()),
                vec![lo, hi],
            ));
        }
        Ok(())
    }

    /// Converts indices of the active schedule into indices of the schedule the
    /// predictor was trained on.
    pub fn map_timesteps(&self, t: &Tensor) -> Result<Tensor> {
        self.check_timesteps("map_timesteps", t, batch_size(t))?;
        let t = t.to_kind(Kind::Int64);
        Ok(match self.schedule.timestep_map() {
            Some(map) => {
                let map: Vec<i64> = map.iter().map(|&i| i as i64).collect();
                Tensor::from_slice(&map).to_device(t.device()).index_select(0, &t)
            }
            None => t,
        })
    }

    /// Diffuses `x_start` to step `t` in one shot: `q(x_t | x_0)`.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: &Tensor) -> Result<Tensor> {
        check_same_shape("q_sample", x_start, noise)?;
        self.check_timesteps("q_sample", t, x_start.size()[0])?;
        Ok(extract(&self.sqrt_alphas_cumprod, t, x_start) * x_start
            + extract(&self.sqrt_one_minus_alphas_cumprod, t, x_start) * noise)
    }

    /// Posterior `q(x_{t-1} | x_t, x_0)`. The variance is floored at `t = 0`.
    pub fn q_posterior_mean_variance(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
    ) -> Result<Posterior> {
        check_same_shape("q_posterior_mean_variance", x_t, x_start)?;
        self.check_timesteps("q_posterior_mean_variance", t, x_t.size()[0])?;
        let mean = extract(&self.posterior_mean_coef1, t, x_t) * x_start
            + extract(&self.posterior_mean_coef2, t, x_t) * x_t;
        let variance = extract(&self.posterior_variance, t, x_t).expand_as(x_t);
        let log_variance = extract(&self.posterior_log_variance_clipped, t, x_t).expand_as(x_t);
        Ok(Posterior { mean, variance, log_variance })
    }

    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &Tensor, eps: &Tensor) -> Result<Tensor> {
        check_same_shape("predict_xstart_from_eps", x_t, eps)?;
        self.check_timesteps("predict_xstart_from_eps", t, x_t.size()[0])?;
        Ok(extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t
            - extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t) * eps)
    }

    pub(crate) fn predict_eps_from_xstart(&self, x_t: &Tensor, t: &Tensor, pred_xstart: &Tensor) -> Tensor {
        (extract(&self.sqrt_recip_alphas_cumprod, t, x_t) * x_t - pred_xstart)
            / extract(&self.sqrt_recipm1_alphas_cumprod, t, x_t)
    }

    /// Learned log-variance, interpolated between the clipped posterior
    /// log-variance and `log(beta_t)` by the raw variance channels.
    pub fn model_log_variance(&self, var_interp_raw: &Tensor, t: &Tensor) -> Result<Tensor> {
        self.check_timesteps("model_log_variance", t, batch_size(var_interp_raw))?;
        let min_log = extract(&self.posterior_log_variance_clipped, t, var_interp_raw);
        let max_log = extract(&self.log_betas, t, var_interp_raw);
        let frac = self.variance_interp.weight(var_interp_raw);
        Ok(&frac * max_log + (1.0 - &frac) * min_log)
    }
}

/// Builds the base schedule described by `config` and respaces it if asked to.
pub fn diffusion_from_config(config: &DiffusionConfig) -> Result<GaussianDiffusion> {
    let base = NoiseSchedule::build(config.schedule, config.timesteps)?;
    let schedule = match config.respacing.as_deref() {
        Some(section_counts) if !section_counts.trim().is_empty() => {
            respace::respace(&base, section_counts)?
        }
        _ => base,
    };
    info!(
        schedule = %config.schedule,
        timesteps = config.timesteps,
        active = schedule.len(),
        "built gaussian diffusion"
    );
    Ok(GaussianDiffusion::new(schedule).with_variance_interp(config.loss.variance_interp))
}
