//! Exponential moving average of model parameters, kept alongside training and
//! swapped in for evaluation.
use anyhow::{anyhow, Result};
use tch::{nn, Tensor};

pub const DEFAULT_EMA_RATE: f64 = 0.9999;

#[derive(Debug)]
pub struct Ema {
    rate: f64,
    shadow: Vec<(String, Tensor)>,
}

impl Ema {
    pub fn new(vs: &nn::VarStore, rate: f64) -> Self {
        let mut shadow: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .map(|(name, var)| (name, var.detach().copy()))
            .collect();
        shadow.sort_by(|a, b| a.0.cmp(&b.0));
        Self { rate, shadow }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.shadow.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// `shadow = rate * shadow + (1 - rate) * param`, call after each
    /// optimizer step.
    pub fn update(&mut self, vs: &nn::VarStore) -> Result<()> {
        let vars = vs.variables();
        let rate = self.rate;
        for (name, shadow) in self.shadow.iter_mut() {
            let var = vars.get(name.as_str()).ok_or_else(|| anyhow!("variable {name} missing from store"))?;
            tch::no_grad(|| {
                let updated = &*shadow * rate + var * (1.0 - rate);
                shadow.copy_(&updated);
            });
        }
        Ok(())
    }

    /// Overwrites the store's variables with the averaged values.
    pub fn copy_to(&self, vs: &nn::VarStore) -> Result<()> {
        let mut vars = vs.variables();
        for (name, shadow) in &self.shadow {
            let var =
                vars.get_mut(name.as_str()).ok_or_else(|| anyhow!("variable {name} missing from store"))?;
            tch::no_grad(|| var.copy_(shadow));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind};

    use super::*;

    #[test]
    fn test_update_and_copy() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut w = vs.root().zeros("w", &[2]);
        let mut ema = Ema::new(&vs, 0.9);
        tch::no_grad(|| w.copy_(&Tensor::ones([2], (Kind::Float, Device::Cpu))));
        ema.update(&vs).unwrap();
        assert!((ema.get("w").unwrap().double_value(&[0]) - 0.1).abs() < 1e-6);
        // the live parameter is untouched by update
        assert_eq!(w.double_value(&[1]), 1.0);

        ema.copy_to(&vs).unwrap();
        assert!((w.double_value(&[1]) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_missing_variable() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().zeros("w", &[2]);
        let ema = Ema::new(&vs, DEFAULT_EMA_RATE);
        let other = nn::VarStore::new(Device::Cpu);
        assert!(ema.copy_to(&other).is_err());
    }
}
