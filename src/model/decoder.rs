use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::CodeDecoder;
use crate::error::KtError;

const HIDDEN_CHANNELS: usize = 128;

fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

/// Deconvolutional decoder: code -> fc -> 2x (upsample, conv) -> conv -> tanh.
pub struct ImageDecoder {
    l1: nn::Linear,
    conv1: nn::Conv2d,
    conv2: nn::Conv2d,
    conv3: nn::Conv2d,
    code_dim: usize,
    init_size: usize,
    out_channels: usize,
    /// Gray mode emits one channel and replicates it to `out_channels`.
    gray: bool,
}

impl ImageDecoder {
    pub fn new(
        vb: VarBuilder<'_>,
        code_dim: usize,
        image_size: usize,
        out_channels: usize,
        gray: bool,
    ) -> Result<Self> {
        let init_size = image_size / 4;
        let cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let emitted = if gray { 1 } else { out_channels };
        let l1 = nn::linear(code_dim, HIDDEN_CHANNELS * init_size * init_size, vb.pp("l1"))?;
        let conv1 = nn::conv2d(HIDDEN_CHANNELS, HIDDEN_CHANNELS, 3, cfg, vb.pp("conv1"))?;
        let conv2 = nn::conv2d(HIDDEN_CHANNELS, 64, 3, cfg, vb.pp("conv2"))?;
        let conv3 = nn::conv2d(64, emitted, 3, cfg, vb.pp("conv3"))?;
        Ok(Self {
            l1,
            conv1,
            conv2,
            conv3,
            code_dim,
            init_size,
            out_channels,
            gray,
        })
    }
}

impl CodeDecoder for ImageDecoder {
    fn forward(&self, code: &Tensor) -> Result<Tensor> {
        let (b, width) = code.dims2()?;
        if width != self.code_dim {
            return Err(KtError::ShapeMismatch {
                what: "decoder code".into(),
                expected: vec![b, self.code_dim],
                got: vec![b, width],
            }
            .into());
        }
        let s = self.init_size;
        let h = self
            .l1
            .forward(code)?
            .reshape((b, HIDDEN_CHANNELS, s, s))?; // [B, 128, s, s]
        let h = h.upsample_nearest2d(2 * s, 2 * s)?;
        let h = leaky_relu(&self.conv1.forward(&h)?, 0.2)?;
        let h = h.upsample_nearest2d(4 * s, 4 * s)?;
        let h = leaky_relu(&self.conv2.forward(&h)?, 0.2)?;
        let img = self.conv3.forward(&h)?.tanh()?; // [B, C', 4s, 4s]
        if self.gray && self.out_channels > 1 {
            return Ok(img.repeat((1, self.out_channels, 1, 1))?);
        }
        Ok(img)
    }

    fn code_dim(&self) -> usize {
        self.code_dim
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }
}
