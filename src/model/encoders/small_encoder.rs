use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::shared::ConvBackbone;
use crate::model::{BranchClassifier, Classifier};

/// Small encoder: distillation student and discriminator on decoder output.
pub struct SmallEncoder {
    inner: ConvBackbone,
}

impl SmallEncoder {
    pub fn new(
        vb: VarBuilder<'_>,
        in_channels: usize,
        image_size: usize,
        num_class: usize,
    ) -> Result<Self> {
        Ok(Self {
            inner: ConvBackbone::new(vb, in_channels, (3, 8), image_size, num_class)?,
        })
    }
}

impl Classifier for SmallEncoder {
    fn forward(&self, image: &Tensor) -> Result<Tensor> {
        self.inner.forward(image)
    }

    fn in_channels(&self) -> usize {
        self.inner.in_channels()
    }
}

impl BranchClassifier for SmallEncoder {
    fn forward_branch(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        self.inner.forward_branch(image)
    }
}
