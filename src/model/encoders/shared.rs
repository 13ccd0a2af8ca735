use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use crate::error::KtError;

/// LeNet-5 style convolutional classifier shared by the teacher and small encoders.
pub(crate) struct ConvBackbone {
    conv1: nn::Conv2d,
    conv2: nn::Conv2d,
    fc3: nn::Linear,
    fc4: nn::Linear,
    fc5: nn::Linear,
    in_channels: usize,
}

impl ConvBackbone {
    pub(crate) fn new(
        vb: VarBuilder<'_>,
        in_channels: usize,
        widths: (usize, usize),
        image_size: usize,
        num_class: usize,
    ) -> Result<Self> {
        let cfg = nn::Conv2dConfig::default();
        let conv1 = nn::conv2d(in_channels, widths.0, 5, cfg, vb.pp("conv1"))?;
        let conv2 = nn::conv2d(widths.0, widths.1, 5, cfg, vb.pp("conv2"))?;
        // two (conv5 valid, pool2) stages
        let side = ((image_size - 4) / 2 - 4) / 2;
        let fc3 = nn::linear(widths.1 * side * side, 120, vb.pp("fc3"))?;
        let fc4 = nn::linear(120, 84, vb.pp("fc4"))?;
        let fc5 = nn::linear(84, num_class, vb.pp("fc5"))?;
        Ok(Self {
            conv1,
            conv2,
            fc3,
            fc4,
            fc5,
            in_channels,
        })
    }

    pub(crate) fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        let dims = x.dims();
        if dims.len() != 4 || dims[1] != self.in_channels {
            return Err(KtError::ShapeMismatch {
                what: "classifier input (B, C, H, W)".into(),
                expected: vec![self.in_channels],
                got: dims.to_vec(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let branches = self.forward_branch(x)?;
        branches
            .into_iter()
            .last()
            .ok_or_else(|| anyhow::anyhow!("classifier produced no output"))
    }

    pub(crate) fn forward_branch(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        self.check_input(x)?;
        let h1 = self.conv1.forward(x)?.relu()?;
        let h = h1.max_pool2d(2)?;
        let h2 = self.conv2.forward(&h)?.relu()?;
        let h = h2.max_pool2d(2)?.flatten_from(1)?;
        let h3 = self.fc3.forward(&h)?.relu()?;
        let h4 = self.fc4.forward(&h3)?.relu()?;
        let logits = self.fc5.forward(&h4)?;
        Ok(vec![h1, h2, h3, h4, logits])
    }
}
