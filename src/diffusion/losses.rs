//! # Hybrid Training Objective
//!
//! `L_simple` (noise-prediction MSE) plus a variational term that trains the
//! learned per-step variance, as in Improved DDPM.
use std::f64::consts::{LN_2, PI};

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use tracing::{debug, trace};

use super::types::Predictor;
use super::{check_same_shape, mean_flat, GaussianDiffusion};
use crate::error::{DiffusionError, Result};

/// Half width of the bins used by the decoder likelihood at `t = 0`.
const BIN_HALF_WIDTH: f64 = 1.0 / 255.0;

/// How the raw variance channels become an interpolation weight between the
/// minimum and maximum log-variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceInterp {
    /// `sigmoid(v)`.
    #[default]
    Sigmoid,
    /// `(v + 1) / 2`, the Improved DDPM parameterization.
    Linear,
}

impl VarianceInterp {
    pub fn weight(&self, var_interp_raw: &Tensor) -> Tensor {
        match self {
            VarianceInterp::Sigmoid => var_interp_raw.sigmoid(),
            VarianceInterp::Linear => (var_interp_raw + 1.0) / 2.0,
        }
    }
}

/// Scale applied to the variational term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbWeight {
    /// `lambda * T`: `lambda * L_vlb` with `L_vlb` estimated from a single
    /// uniformly sampled step.
    Lambda(f64),
    Fixed(f64),
}

impl Default for VbWeight {
    fn default() -> Self {
        VbWeight::Lambda(0.001)
    }
}

impl VbWeight {
    pub fn resolve(&self, num_timesteps: usize) -> f64 {
        match *self {
            VbWeight::Lambda(lambda) => lambda * num_timesteps as f64,
            VbWeight::Fixed(weight) => weight,
        }
    }
}

/// Where the mean of the model Gaussian in the variational term comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VbMean {
    /// Reconstructed from the true injected noise, so the term only trains the
    /// variance channels.
    #[default]
    TrueNoise,
    /// Reconstructed from the detached noise prediction.
    DetachedPrediction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridLossConfig {
    #[serde(default)]
    pub vb_weight: VbWeight,
    #[serde(default)]
    pub variance_interp: VarianceInterp,
    #[serde(default)]
    pub vb_mean: VbMean,
}

/// Per-example loss terms, each of shape `[N]`.
#[derive(Debug)]
pub struct LossTerms {
    pub loss: Tensor,
    pub mse: Tensor,
    pub vb: Tensor,
}

/// KL divergence between two diagonal Gaussians, elementwise, in nats.
pub fn normal_kl(mean1: &Tensor, logvar1: &Tensor, mean2: &Tensor, logvar2: &Tensor) -> Tensor {
    let diff = mean1 - mean2;
    0.5 * (-1.0 + logvar2 - logvar1 + (logvar1 - logvar2).exp() + &diff * &diff * (-logvar2).exp())
}

/// A fast approximation of the cumulative distribution function of the
/// standard normal.
pub fn approx_standard_normal_cdf(x: &Tensor) -> Tensor {
    let inner = (2.0 / PI).sqrt() * (x + 0.044715_f64 * x.pow_tensor_scalar(3));
    0.5 * (1.0 + inner.tanh())
}

/// Log-likelihood of `x` under a Gaussian discretized into bins of width
/// `2 / 255` over `[-1, 1]`, with open-ended outer bins. Elementwise, in nats.
pub fn discretized_gaussian_log_likelihood(x: &Tensor, means: &Tensor, log_scales: &Tensor) -> Tensor {
    let centered_x = x - means;
    let inv_stdv = (-log_scales).exp();
    let cdf_plus = approx_standard_normal_cdf(&(&inv_stdv * (&centered_x + BIN_HALF_WIDTH)));
    let cdf_min = approx_standard_normal_cdf(&(&inv_stdv * (&centered_x - BIN_HALF_WIDTH)));
    let log_cdf_plus = cdf_plus.clamp_min(1e-12).log();
    let log_one_minus_cdf_min = (1.0_f64 - &cdf_min).clamp_min(1e-12).log();
    let log_cdf_delta = (&cdf_plus - &cdf_min).clamp_min(1e-12).log();
    let upper = log_one_minus_cdf_min.where_self(&x.gt(0.999), &log_cdf_delta);
    log_cdf_plus.where_self(&x.lt(-0.999), &upper)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HybridLoss {
    config: HybridLossConfig,
}

impl HybridLoss {
    pub fn new(config: HybridLossConfig) -> Self {
        Self { config }
    }

    /// Per-example hybrid loss for a predictor output of shape `[N, 2D]` given
    /// the clean batch `x_start`, its noised version `x_t` (from
    /// [`GaussianDiffusion::q_sample`] with the same `noise`) and the steps `t`
    /// of the active schedule.
    pub fn compute(
        &self,
        diffusion: &GaussianDiffusion,
        model_output: &Tensor,
        x_start: &Tensor,
        x_t: &Tensor,
        noise: &Tensor,
        t: &Tensor,
    ) -> Result<LossTerms> {
        check_same_shape("training loss", x_start, noise)?;
        check_same_shape("training loss", x_start, x_t)?;
        let (eps_pred, var_interp_raw) = split_model_output("training loss", model_output, x_start)?;

        let mse = mean_flat(&(noise - &eps_pred).square());

        let true_posterior = diffusion.q_posterior_mean_variance(x_start, x_t, t)?;
        let model_eps = match self.config.vb_mean {
            VbMean::TrueNoise => noise.detach(),
            VbMean::DetachedPrediction => eps_pred.detach(),
        };
        let pred_xstart = diffusion.predict_xstart_from_eps(x_t, t, &model_eps)?;
        let model_mean = diffusion.q_posterior_mean_variance(&pred_xstart, x_t, t)?.mean;
        let model_log_variance = diffusion.model_log_variance(&var_interp_raw, t)?;

        let kl = mean_flat(&normal_kl(
            &true_posterior.mean,
            &true_posterior.log_variance,
            &model_mean,
            &model_log_variance,
        )) / LN_2;
        let decoder_nll = mean_flat(&-discretized_gaussian_log_likelihood(
            x_start,
            &model_mean,
            &(0.5 * &model_log_variance),
        )) / LN_2;
        // There is no previous step at t = 0, score the decoder there instead.
        let first_step = t.eq(0i64).to_device(kl.device());
        let vb = decoder_nll.where_self(&first_step, &kl);

        let weight = self.config.vb_weight.resolve(diffusion.num_timesteps());
        let loss = &mse + &vb * weight;
        debug!(batch = x_start.size()[0], vb_weight = weight, "computed hybrid loss");
        trace!(
            mse = mse.mean(Kind::Double).double_value(&[]),
            vb = vb.mean(Kind::Double).double_value(&[]),
            "loss terms"
        );
        Ok(LossTerms { loss, mse, vb })
    }
}

/// Splits a `[N, 2D, ...]` predictor output into its noise and variance halves.
pub(crate) fn split_model_output(
    op: &'static str,
    model_output: &Tensor,
    like: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let mut expected = like.size();
    if expected.len() < 2 {
        return Err(DiffusionError::shape(op, "a [N, D, ...] state batch", expected));
    }
    let channels = expected[1];
    expected[1] = 2 * channels;
    if model_output.size() != expected {
        return Err(DiffusionError::shape(op, format!("{expected:?}"), model_output.size()));
    }
    let mut halves = model_output.split(channels, 1).into_iter();
    match (halves.next(), halves.next()) {
        (Some(eps), Some(var_interp_raw)) => Ok((eps, var_interp_raw)),
        _ => Err(DiffusionError::shape(op, format!("{expected:?}"), model_output.size())),
    }
}

impl GaussianDiffusion {
    /// Noises `x_start` to `t`, runs the predictor on it and scores the output.
    pub fn training_losses<P: Predictor + ?Sized>(
        &self,
        loss: &HybridLoss,
        predictor: &P,
        x_start: &Tensor,
        t: &Tensor,
        noise: &Tensor,
        cond: &Tensor,
    ) -> Result<LossTerms> {
        if cond.dim() == 0 || cond.size()[0] != x_start.size()[0] {
            return Err(DiffusionError::shape(
                "training_losses",
                format!("conditioning with batch size {}", x_start.size()[0]),
                cond.size(),
            ));
        }
        let x_t = self.q_sample(x_start, t, noise)?;
        let model_output = predictor
            .predict(&x_t, &self.map_timesteps(t)?, cond)
            .map_err(DiffusionError::Predictor)?;
        loss.compute(self, &model_output, x_start, &x_t, noise, t)
    }
}
