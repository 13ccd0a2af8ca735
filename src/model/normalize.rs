use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::error::KtError;

/// Fixed per-channel `(x - mean) / std`.
pub struct Normalize {
    mean: Tensor, // [1, C, 1, 1]
    std: Tensor,
    channels: usize,
}

impl Normalize {
    pub fn new(mean: &[f32], std: &[f32], device: &Device) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(KtError::ShapeMismatch {
                what: "normalization statistics".into(),
                expected: vec![mean.len()],
                got: vec![std.len()],
            }
            .into());
        }
        let channels = mean.len();
        Ok(Self {
            mean: Tensor::from_slice(mean, (1, channels, 1, 1), device)?,
            std: Tensor::from_slice(std, (1, channels, 1, 1), device)?,
            channels,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = x.dims4()?;
        if c != self.channels {
            return Err(KtError::ShapeMismatch {
                what: "normalize input channels".into(),
                expected: vec![self.channels],
                got: vec![c],
            }
            .into());
        }
        Ok(x.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }
}
