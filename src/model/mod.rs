pub mod decoder;
pub mod ema;
pub mod encoders;
pub mod network;
pub mod normalize;
pub mod transform;

use anyhow::Result;
use candle_core::Tensor;

pub use decoder::ImageDecoder;
pub use ema::EmaTracker;
pub use encoders::{SmallEncoder, TeacherEncoder};
pub use network::Network;
pub use normalize::Normalize;
pub use transform::{DefinedTransform, Perturbation};

/// Image -> class logits.
pub trait Classifier {
    fn forward(&self, image: &Tensor) -> Result<Tensor>;
    fn in_channels(&self) -> usize;
}

/// Classifier exposing its intermediate activations.
pub trait BranchClassifier: Classifier {
    /// Activations at the tap points, in depth order, ending with the logits.
    fn forward_branch(&self, image: &Tensor) -> Result<Vec<Tensor>>;
}

/// Code (logit-space vector) -> image.
pub trait CodeDecoder {
    fn forward(&self, code: &Tensor) -> Result<Tensor>;
    fn code_dim(&self) -> usize;
    fn out_channels(&self) -> usize;
}
