//! Layout of the 13 dimensional state vector sampled for a planar target.
use tch::{Kind, Tensor};

use crate::error::{DiffusionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseLayout {
    pub origin: i64,
    pub size: i64,
    pub rotation: i64,
    pub translation: i64,
    pub post_translation: i64,
}

impl Default for PoseLayout {
    fn default() -> Self {
        Self { origin: 3, size: 2, rotation: 3, translation: 3, post_translation: 2 }
    }
}

/// The components of a batch of samples, each of shape `[N, len]`.
#[derive(Debug)]
pub struct Pose {
    pub origin: Tensor,
    pub size: Tensor,
    pub rotation: Tensor,
    pub translation: Tensor,
    pub post_translation: Tensor,
}

impl PoseLayout {
    pub fn dim(&self) -> i64 {
        self.origin + self.size + self.rotation + self.translation + self.post_translation
    }

    fn sizes(&self) -> [i64; 5] {
        [self.origin, self.size, self.rotation, self.translation, self.post_translation]
    }

    pub fn split(&self, sample: &Tensor) -> Result<Pose> {
        if sample.dim() != 2 || sample.size()[1] != self.dim() {
            return Err(DiffusionError::shape(
                "PoseLayout::split",
                format!("[N, {}]", self.dim()),
                sample.size(),
            ));
        }
        let parts = sample.split_with_sizes(self.sizes().as_slice(), 1);
        match <[Tensor; 5]>::try_from(parts) {
            Ok([origin, size, rotation, translation, post_translation]) => {
                Ok(Pose { origin, size, rotation, translation, post_translation })
            }
            Err(parts) => Err(DiffusionError::shape(
                "PoseLayout::split",
                "5 components",
                vec![parts.len() as i64],
            )),
        }
    }

    pub fn concat(&self, pose: &Pose) -> Result<Tensor> {
        let parts =
            [&pose.origin, &pose.size, &pose.rotation, &pose.translation, &pose.post_translation];
        for (part, len) in parts.iter().zip(self.sizes()) {
            if part.dim() != 2 || part.size()[1] != len {
                return Err(DiffusionError::shape("PoseLayout::concat", format!("[N, {len}]"), part.size()));
            }
        }
        Ok(Tensor::cat(&parts, 1))
    }
}

impl Pose {
    /// Row `i` of every component as plain floats, in layout order.
    pub fn row(&self, i: i64) -> Result<[Vec<f64>; 5]> {
        let values = |xs: &Tensor| Vec::<f64>::try_from(&xs.get(i).to_kind(Kind::Double));
        Ok([
            values(&self.origin)?,
            values(&self.size)?,
            values(&self.rotation)?,
            values(&self.translation)?,
            values(&self.post_translation)?,
        ])
    }
}
