//! # Reverse Sampling
//!
//! Ancestral DDPM sampling from pure noise down to a clean sample, one
//! predictor call per step. A DDIM update can drive the same loop.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use tch::{Device, Kind, Tensor};
use tracing::{debug, warn};

use super::losses::split_model_output;
use super::types::{NoiseSource, Predictor};
use super::GaussianDiffusion;
use crate::error::{DiffusionError, Result};
use crate::utils::has_nan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Initializing,
    /// The next transition denoises step `t` of the active schedule.
    Stepping(usize),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMethod {
    /// Sample every step from the modeled posterior, with the learned variance.
    Ancestral,
    /// DDIM update, deterministic when `eta` is zero.
    Ddim { eta: f64 },
}

/// The model's Gaussian for `p(x_{t-1} | x_t)`.
#[derive(Debug)]
pub struct ModelPrediction {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

impl GaussianDiffusion {
    pub fn p_mean_variance<P: Predictor + ?Sized>(
        &self,
        predictor: &P,
        x: &Tensor,
        t: &Tensor,
        cond: &Tensor,
        clip_denoised: bool,
    ) -> Result<ModelPrediction> {
        self.check_timesteps("p_mean_variance", t, x.size()[0])?;
        let model_output = predictor
            .predict(x, &self.map_timesteps(t)?, cond)
            .map_err(DiffusionError::Predictor)?
            .to_kind(x.kind());
        let (eps, var_interp_raw) = split_model_output("p_mean_variance", &model_output, x)?;
        let log_variance = self.model_log_variance(&var_interp_raw, t)?;
        let variance = log_variance.exp();
        let mut pred_xstart = self.predict_xstart_from_eps(x, t, &eps)?;
        if clip_denoised {
            pred_xstart = pred_xstart.clamp(-1.0, 1.0);
        }
        let mean = self.q_posterior_mean_variance(&pred_xstart, x, t)?.mean;
        Ok(ModelPrediction { mean, variance, log_variance, pred_xstart })
    }

    /// Runs the full ancestral loop and returns `x_0`.
    pub fn p_sample_loop<P: Predictor + ?Sized, R: NoiseSource>(
        &self,
        predictor: &P,
        shape: &[i64],
        cond: &Tensor,
        clip_denoised: bool,
        noise: R,
    ) -> Result<Tensor> {
        ReverseSampler::new(self, predictor, shape, cond, noise)?.clip_denoised(clip_denoised).run()
    }

    pub fn ddim_sample_loop<P: Predictor + ?Sized, R: NoiseSource>(
        &self,
        predictor: &P,
        shape: &[i64],
        cond: &Tensor,
        clip_denoised: bool,
        eta: f64,
        noise: R,
    ) -> Result<Tensor> {
        ReverseSampler::new(self, predictor, shape, cond, noise)?
            .clip_denoised(clip_denoised)
            .method(SamplingMethod::Ddim { eta })
            .run()
    }
}

enum Stage {
    Initializing,
    Stepping { t: usize, x: Tensor },
    Done { x: Tensor },
}

/// One sampling run. Every batch element sits at the same step; steps are
/// visited strictly in descending order, one predictor call each.
pub struct ReverseSampler<'a, P: Predictor + ?Sized, R: NoiseSource> {
    diffusion: &'a GaussianDiffusion,
    predictor: &'a P,
    cond: Tensor,
    shape: Vec<i64>,
    kind: Kind,
    device: Device,
    clip_denoised: bool,
    method: SamplingMethod,
    noise: R,
    stage: Stage,
    steps_taken: usize,
}

impl<'a, P: Predictor + ?Sized, R: NoiseSource> ReverseSampler<'a, P, R> {
    pub fn new(
        diffusion: &'a GaussianDiffusion,
        predictor: &'a P,
        shape: &[i64],
        cond: &Tensor,
        noise: R,
    ) -> Result<Self> {
        if shape.len() < 2 || shape.iter().any(|&d| d <= 0) {
            return Err(DiffusionError::shape("ReverseSampler", "a positive [N, D, ...] shape", shape.to_vec()));
        }
        if cond.dim() == 0 || cond.size()[0] != shape[0] {
            return Err(DiffusionError::shape(
                "ReverseSampler",
                format!("conditioning with batch size {}", shape[0]),
                cond.size(),
            ));
        }
        Ok(Self {
            diffusion,
            predictor,
            cond: cond.shallow_clone(),
            shape: shape.to_vec(),
            kind: if cond.is_floating_point() { cond.kind() } else { Kind::Float },
            device: cond.device(),
            clip_denoised: false,
            method: SamplingMethod::Ancestral,
            noise,
            stage: Stage::Initializing,
            steps_taken: 0,
        })
    }

    /// Clamp every intermediate `x_0` estimate into `[-1, 1]`.
    pub fn clip_denoised(mut self, clip_denoised: bool) -> Self {
        self.clip_denoised = clip_denoised;
        self
    }

    pub fn method(mut self, method: SamplingMethod) -> Self {
        self.method = method;
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn state(&self) -> SamplerState {
        match self.stage {
            Stage::Initializing => SamplerState::Initializing,
            Stage::Stepping { t, .. } => SamplerState::Stepping(t),
            Stage::Done { .. } => SamplerState::Done,
        }
    }

    /// Number of predictor calls made so far.
    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// The current `x_t`, or the final sample once done.
    pub fn current(&self) -> Option<&Tensor> {
        match &self.stage {
            Stage::Initializing => None,
            Stage::Stepping { x, .. } | Stage::Done { x } => Some(x),
        }
    }

    /// Performs one transition and returns the new state. A failed step leaves
    /// the sampler where it was.
    pub fn step(&mut self) -> Result<SamplerState> {
        let _guard = tch::no_grad_guard();
        let next = match &self.stage {
            Stage::Initializing => {
                let x = self.noise.randn(&self.shape, self.kind, self.device);
                Stage::Stepping { t: self.diffusion.num_timesteps() - 1, x }
            }
            Stage::Stepping { t, x } => {
                let (t, x) = (*t, x.shallow_clone());
                let x_prev = self.denoise(&x, t)?;
                self.steps_taken += 1;
                if t == 0 {
                    Stage::Done { x: x_prev }
                } else {
                    Stage::Stepping { t: t - 1, x: x_prev }
                }
            }
            Stage::Done { .. } => return Ok(SamplerState::Done),
        };
        self.stage = next;
        Ok(self.state())
    }

    /// Steps until done and returns `x_0`.
    pub fn run(mut self) -> Result<Tensor> {
        loop {
            if let Stage::Done { x } = &self.stage {
                if has_nan(x) {
                    warn!(steps = self.steps_taken, "sample contains NaN values");
                }
                return Ok(x.shallow_clone());
            }
            self.step()?;
        }
    }

    fn denoise(&mut self, x: &Tensor, t: usize) -> Result<Tensor> {
        let batch = self.shape[0];
        let t_batch = Tensor::full([batch], t as i64, (Kind::Int64, x.device()));
        debug!(t, timestep = self.diffusion.schedule().original_timestep(t), "denoising step");
        let out = self.diffusion.p_mean_variance(self.predictor, x, &t_batch, &self.cond, self.clip_denoised)?;
        match self.method {
            SamplingMethod::Ancestral => {
                if t == 0 {
                    return Ok(out.mean);
                }
                let z = self.noise.randn(&x.size(), x.kind(), x.device());
                Ok(out.mean + (0.5_f64 * &out.log_variance).exp() * z)
            }
            SamplingMethod::Ddim { eta } => {
                let eps = self.diffusion.predict_eps_from_xstart(x, &t_batch, &out.pred_xstart);
                let alpha_bar = self.diffusion.alphas_cumprod()[t];
                let alpha_bar_prev = self.diffusion.alphas_cumprod_prev()[t];
                let sigma = eta
                    * ((1.0 - alpha_bar_prev) / (1.0 - alpha_bar)).sqrt()
                    * (1.0 - alpha_bar / alpha_bar_prev).sqrt();
                let mean_pred = &out.pred_xstart * alpha_bar_prev.sqrt()
                    + eps * (1.0 - alpha_bar_prev - sigma * sigma).max(0.0).sqrt();
                if t == 0 || sigma == 0.0 {
                    return Ok(mean_pred);
                }
                let z = self.noise.randn(&x.size(), x.kind(), x.device());
                Ok(mean_pred + sigma * z)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::respace::respace;
    use crate::diffusion::schedule::{BetaSchedule, NoiseSchedule};
    use crate::diffusion::types::SeededNoise;
    use crate::predictor::{MlpPredictor, PredictorConfig};

    const OPTS: (Kind, Device) = (Kind::Double, Device::Cpu);

    fn respaced(steps: &str) -> GaussianDiffusion {
        let base = NoiseSchedule::build(BetaSchedule::Linear, 1024).unwrap();
        GaussianDiffusion::new(respace(&base, steps).unwrap())
    }

    fn shrinking(x: &Tensor, _t: &Tensor, cond: &Tensor) -> anyhow::Result<Tensor> {
        let eps = x * 0.1 + cond.mean_dim(Some([1i64].as_slice()), true, x.kind());
        Ok(Tensor::cat(&[eps, x.zeros_like()], 1))
    }

    #[test]
    fn test_state_transitions() {
        let diffusion = respaced("4");
        let cond = Tensor::zeros([2, 8], OPTS);
        let mut sampler =
            ReverseSampler::new(&diffusion, &shrinking, &[2, 13], &cond, SeededNoise::new(0)).unwrap().kind(Kind::Double);
        assert_eq!(sampler.state(), SamplerState::Initializing);
        assert!(sampler.current().is_none());
        let mut visited = vec![];
        loop {
            let state = sampler.step().unwrap();
            visited.push(state);
            if state == SamplerState::Done {
                break;
            }
        }
        assert_eq!(
            visited,
            vec![
                SamplerState::Stepping(3),
                SamplerState::Stepping(2),
                SamplerState::Stepping(1),
                SamplerState::Stepping(0),
                SamplerState::Done
            ]
        );
        assert_eq!(sampler.steps_taken(), 4);
        // done is terminal
        assert_eq!(sampler.step().unwrap(), SamplerState::Done);
        assert_eq!(sampler.steps_taken(), 4);
        assert_eq!(sampler.current().unwrap().size(), vec![2, 13]);
    }

    #[test]
    fn test_last_step_adds_no_noise() {
        let diffusion = respaced("8");
        let cond = Tensor::ones([3, 8], OPTS);
        let mut sampler =
            ReverseSampler::new(&diffusion, &shrinking, &[3, 13], &cond, SeededNoise::new(11)).unwrap().kind(Kind::Double);
        while sampler.state() != SamplerState::Stepping(0) {
            sampler.step().unwrap();
        }
        let x = sampler.current().unwrap().shallow_clone();
        let t = Tensor::zeros([3], (Kind::Int64, Device::Cpu));
        let expected = diffusion.p_mean_variance(&shrinking, &x, &t, &cond, false).unwrap().mean;
        assert_eq!(sampler.step().unwrap(), SamplerState::Done);
        assert!(sampler.current().unwrap().equal(&expected));
    }

    #[test]
    fn test_sampling_is_deterministic_for_a_seed() {
        let diffusion = respaced("16");
        let cond = Tensor::ones([2, 8], OPTS);
        let run = |seed| {
            ReverseSampler::new(&diffusion, &shrinking, &[2, 13], &cond, SeededNoise::new(seed))
                .unwrap()
                .kind(Kind::Double)
                .run()
                .unwrap()
        };
        assert!(run(5).equal(&run(5)));
        assert!(!run(5).equal(&run(6)));
    }

    #[test]
    fn test_clip_denoised_bounds_estimate() {
        let diffusion = respaced("16");
        let x = Tensor::full([1, 4], 50.0, OPTS);
        let t = Tensor::from_slice(&[3i64]);
        let cond = Tensor::zeros([1, 8], OPTS);
        let zero = |x: &Tensor, _t: &Tensor, _c: &Tensor| -> anyhow::Result<Tensor> {
            Ok(Tensor::cat(&[x.zeros_like(), x.zeros_like()], 1))
        };
        let clipped = diffusion.p_mean_variance(&zero, &x, &t, &cond, true).unwrap();
        assert_eq!(clipped.pred_xstart.max().double_value(&[]), 1.0);
        let raw = diffusion.p_mean_variance(&zero, &x, &t, &cond, false).unwrap();
        assert!(raw.pred_xstart.max().double_value(&[]) > 50.0);
    }

    #[test]
    fn test_ddim_without_eta_only_uses_initial_noise() {
        let diffusion = respaced("ddim32");
        let cond = Tensor::ones([2, 8], OPTS);
        let sample = |seed| {
            diffusion.ddim_sample_loop(&shrinking, &[2, 13], &cond, false, 0.0, SeededNoise::new(seed))
        };
        let a = sample(9).unwrap();
        assert!(a.equal(&sample(9).unwrap()));
        assert_eq!(a.size(), vec![2, 13]);
        assert!(crate::utils::all_finite(&a));
    }

    #[test]
    fn test_bad_predictor_output_is_a_shape_error() {
        let diffusion = respaced("4");
        let cond = Tensor::zeros([1, 8], OPTS);
        let narrow = |x: &Tensor, _t: &Tensor, _c: &Tensor| -> anyhow::Result<Tensor> { Ok(x.zeros_like()) };
        let mut sampler = ReverseSampler::new(&diffusion, &narrow, &[1, 13], &cond, SeededNoise::new(0)).unwrap();
        sampler.step().unwrap();
        assert!(matches!(sampler.step(), Err(DiffusionError::Shape { .. })));
        // the failed step did not advance the sampler
        assert_eq!(sampler.state(), SamplerState::Stepping(3));
    }

    #[test]
    fn test_stepping_does_not_track_gradients() {
        let diffusion = respaced("8");
        let vs = tch::nn::VarStore::new(Device::Cpu);
        let config = PredictorConfig { d_model: 16, ..Default::default() };
        let predictor = MlpPredictor::new(&vs.root(), &config);
        assert!(vs.trainable_variables().iter().all(|v| v.requires_grad()));
        let cond = Tensor::ones([2, 8], (Kind::Float, Device::Cpu));
        let mut sampler =
            ReverseSampler::new(&diffusion, &predictor, &[2, 13], &cond, SeededNoise::new(4)).unwrap();
        while sampler.step().unwrap() != SamplerState::Done {
            assert!(!sampler.current().unwrap().requires_grad());
        }
        let sample = sampler.current().unwrap();
        assert!(!sample.requires_grad());
        assert_eq!(sample.size(), vec![2, 13]);
    }

    #[test]
    fn test_conditioning_batch_must_match() {
        let diffusion = respaced("4");
        let cond = Tensor::zeros([2, 8], OPTS);
        let result = ReverseSampler::new(&diffusion, &shrinking, &[3, 13], &cond, SeededNoise::new(0));
        assert!(matches!(result, Err(DiffusionError::Shape { .. })));
    }
}
