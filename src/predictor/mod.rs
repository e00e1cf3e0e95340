//! # Conditional MLP Predictor
//!
//! Predicts the injected noise and the variance interpolation values for a
//! noised pose vector, conditioned on the projected target corners. Timestep,
//! input and conditioning embeddings are summed before a small backbone.
//!
//! Variable names follow `torch.nn.Sequential` numbering so that weights
//! exported from the training scripts load unchanged.
use anyhow::ensure;
use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

use crate::diffusion::types::Predictor;

pub use self::config::PredictorConfig;

mod config;

/// Sinusoidal timestep embeddings of shape `[N, dim]`, `[cos | sin]` halves.
///
/// `max_period` controls the minimum frequency of the embeddings. Timesteps
/// may be fractional.
pub fn timestep_embedding(timesteps: &Tensor, dim: i64, max_period: f64) -> Tensor {
    let half = dim / 2;
    let device = timesteps.device();
    let freqs = (Tensor::arange(half, (Kind::Float, device)) * (-max_period.ln() / half as f64)).exp();
    let args = timesteps.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
    let embedding = Tensor::cat(&[args.cos(), args.sin()], -1);
    if dim % 2 == 1 {
        let pad = embedding.narrow(-1, 0, 1).zeros_like();
        Tensor::cat(&[embedding, pad], -1)
    } else {
        embedding
    }
}

fn two_layer_mlp(vs: nn::Path, in_dim: i64, d_model: i64) -> nn::Sequential {
    nn::seq()
        .add(nn::linear(&vs / "0", in_dim, d_model, Default::default()))
        .add_fn(|xs| xs.relu())
        .add(nn::linear(&vs / "2", d_model, d_model, Default::default()))
}

#[derive(Debug)]
pub struct MlpPredictor {
    time_embed: nn::Sequential,
    cond_embed: nn::Sequential,
    input_embed: nn::Sequential,
    backbone: nn::Sequential,
    pub config: PredictorConfig,
}

impl MlpPredictor {
    pub fn new(vs: &nn::Path, config: &PredictorConfig) -> Self {
        let d_model = config.d_model;
        let time_embed = two_layer_mlp(vs / "time_embed", d_model, d_model);
        let cond_embed = two_layer_mlp(vs / "cond_embed", config.d_cond, d_model);
        let input_embed = two_layer_mlp(vs / "input_embed", config.d_input, d_model);
        let vs_backbone = vs / "backbone";
        let backbone = nn::seq()
            .add(nn::linear(&vs_backbone / "0", d_model, d_model, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(nn::linear(&vs_backbone / "2", d_model, d_model, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(nn::linear(&vs_backbone / "4", d_model, config.d_input * 2, Default::default()));
        Self { time_embed, cond_embed, input_embed, backbone, config: config.clone() }
    }
}

impl Predictor for MlpPredictor {
    fn predict(&self, x_t: &Tensor, timesteps: &Tensor, cond: &Tensor) -> anyhow::Result<Tensor> {
        ensure!(
            x_t.dim() == 2 && x_t.size()[1] == self.config.d_input,
            "expected inputs of shape [N, {}], got {:?}",
            self.config.d_input,
            x_t.size()
        );
        ensure!(
            cond.dim() == 2 && cond.size()[1] == self.config.d_cond,
            "expected conditioning of shape [N, {}], got {:?}",
            self.config.d_cond,
            cond.size()
        );
        let time_emb = self
            .time_embed
            .forward(&timestep_embedding(timesteps, self.config.d_model, 10000.0));
        let input_emb = self.input_embed.forward(&x_t.to_kind(Kind::Float));
        let cond_emb = self.cond_embed.forward(&cond.to_kind(Kind::Float));
        let hidden = (time_emb + input_emb + cond_emb) / 3f64.sqrt();
        Ok(self.backbone.forward(&hidden))
    }
}

#[cfg(test)]
mod tests {
    use tch::Device;

    use super::*;

    #[test]
    fn test_timestep_embedding() {
        let t = Tensor::from_slice(&[0i64, 7]);
        let emb = timestep_embedding(&t, 6, 10000.0);
        assert_eq!(emb.size(), vec![2, 6]);
        // cos half first, all ones at t = 0
        assert_eq!(emb.double_value(&[0, 0]), 1.0);
        assert_eq!(emb.double_value(&[0, 3]), 0.0);
        assert!((emb.double_value(&[1, 3]) - 7f64.sin()).abs() < 1e-5);

        let odd = timestep_embedding(&t, 5, 10000.0);
        assert_eq!(odd.size(), vec![2, 5]);
        assert_eq!(odd.double_value(&[1, 4]), 0.0);
    }

    #[test]
    fn test_predictor_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = PredictorConfig { d_model: 32, ..Default::default() };
        let predictor = MlpPredictor::new(&vs.root(), &config);
        let x = Tensor::zeros([4, 13], (Kind::Double, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 10, 100, 1023]);
        let cond = Tensor::zeros([4, 8], (Kind::Float, Device::Cpu));
        let out = predictor.predict(&x, &t, &cond).unwrap();
        assert_eq!(out.size(), vec![4, 26]);
        assert!(vs.variables().contains_key("backbone.4.weight"));

        let bad_cond = Tensor::zeros([4, 6], (Kind::Float, Device::Cpu));
        assert!(predictor.predict(&x, &t, &bad_cond).is_err());
    }
}
