use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tch::{Device, Kind, Tensor};

/// Anything that predicts, for a noised batch `x_t` of shape `[N, D]`, the
/// injected noise in its first `D` output channels and the raw variance
/// interpolation values in the next `D`.
///
/// `timesteps` holds indices into the schedule the predictor was trained on,
/// one per batch element. `cond` is passed through untouched at every step.
pub trait Predictor {
    fn predict(&self, x_t: &Tensor, timesteps: &Tensor, cond: &Tensor) -> anyhow::Result<Tensor>;
}

impl<F> Predictor for F
where
    F: Fn(&Tensor, &Tensor, &Tensor) -> anyhow::Result<Tensor>,
{
    fn predict(&self, x_t: &Tensor, timesteps: &Tensor, cond: &Tensor) -> anyhow::Result<Tensor> {
        self(x_t, timesteps, cond)
    }
}

/// Source of the Gaussian noise and uniform timesteps consumed by training and
/// sampling.
pub trait NoiseSource {
    fn randn(&mut self, shape: &[i64], kind: Kind, device: Device) -> Tensor;

    /// `n` timesteps drawn uniformly from `[0, high)`.
    fn timesteps(&mut self, n: i64, high: usize, device: Device) -> Tensor;
}

/// Draws from torch's global generator, seed it with `tch::manual_seed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TorchNoise;

impl NoiseSource for TorchNoise {
    fn randn(&mut self, shape: &[i64], kind: Kind, device: Device) -> Tensor {
        Tensor::randn(shape, (kind, device))
    }

    fn timesteps(&mut self, n: i64, high: usize, device: Device) -> Tensor {
        Tensor::randint(high as i64, [n], (Kind::Int64, device))
    }
}

/// A self-contained seeded generator. Two sources built from the same seed
/// produce the same stream regardless of what else runs in the process.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl NoiseSource for SeededNoise {
    fn randn(&mut self, shape: &[i64], kind: Kind, device: Device) -> Tensor {
        let numel: i64 = shape.iter().product();
        let values: Vec<f64> =
            (0..numel).map(|_| self.rng.sample::<f64, _>(StandardNormal)).collect();
        Tensor::from_slice(&values).view(shape).to_kind(kind).to_device(device)
    }

    fn timesteps(&mut self, n: i64, high: usize, device: Device) -> Tensor {
        let values: Vec<i64> = (0..n).map(|_| self.rng.gen_range(0..high) as i64).collect();
        Tensor::from_slice(&values).to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let mut a = SeededNoise::new(42);
        let mut b = SeededNoise::new(42);
        let xa = a.randn(&[4, 13], Kind::Double, Device::Cpu);
        let xb = b.randn(&[4, 13], Kind::Double, Device::Cpu);
        assert_eq!(xa.size(), vec![4, 13]);
        assert!(xa.equal(&xb));
        let ta = a.timesteps(8, 1024, Device::Cpu);
        let tb = b.timesteps(8, 1024, Device::Cpu);
        assert!(ta.equal(&tb));
        assert!(ta.max().int64_value(&[]) < 1024);
        assert!(ta.min().int64_value(&[]) >= 0);
    }

    #[test]
    fn test_torch_noise() {
        let mut noise = TorchNoise;
        let x = noise.randn(&[64, 13], Kind::Float, Device::Cpu);
        assert_eq!(x.size(), vec![64, 13]);
        assert_eq!(x.kind(), Kind::Float);
        assert!(x.std(true).double_value(&[]) > 0.5);
        let t = noise.timesteps(256, 128, Device::Cpu);
        assert_eq!(t.size(), vec![256]);
        assert_eq!(t.kind(), Kind::Int64);
        assert!(t.min().int64_value(&[]) >= 0);
        assert!(t.max().int64_value(&[]) < 128);
    }

    #[test]
    fn test_closure_predictor() {
        let predictor = |x: &Tensor, _t: &Tensor, _c: &Tensor| -> anyhow::Result<Tensor> {
            Ok(Tensor::cat(&[x.zeros_like(), x.zeros_like()], 1))
        };
        let x = Tensor::ones([2, 3], (Kind::Double, Device::Cpu));
        let t = Tensor::from_slice(&[0i64, 1]);
        let out = predictor.predict(&x, &t, &x).unwrap();
        assert_eq!(out.size(), vec![2, 6]);
    }
}
