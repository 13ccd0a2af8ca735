pub mod cifar;
pub mod codes;
#[allow(clippy::module_inception)]
pub mod data;

pub use cifar::Cifar10Dataset;
pub use codes::{CodeBatch, CodeSampler};
pub use data::{epoch_batches, flip_and_pad_crop, ordered_batches, ImageDataset, InMemoryDataset};
