use anyhow::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::shared::ConvBackbone;
use crate::model::{BranchClassifier, Classifier};

/// Big encoder: the pretrained classifier being inverted. Always held fixed.
pub struct TeacherEncoder {
    inner: ConvBackbone,
}

impl TeacherEncoder {
    pub fn new(
        vb: VarBuilder<'_>,
        in_channels: usize,
        image_size: usize,
        num_class: usize,
    ) -> Result<Self> {
        Ok(Self {
            inner: ConvBackbone::new(vb, in_channels, (6, 16), image_size, num_class)?,
        })
    }
}

impl Classifier for TeacherEncoder {
    fn forward(&self, image: &Tensor) -> Result<Tensor> {
        self.inner.forward(image)
    }

    fn in_channels(&self) -> usize {
        self.inner.in_channels()
    }
}

impl BranchClassifier for TeacherEncoder {
    fn forward_branch(&self, image: &Tensor) -> Result<Vec<Tensor>> {
        self.inner.forward_branch(image)
    }
}
