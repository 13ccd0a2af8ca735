mod cli;
#[allow(clippy::module_inception)]
mod config;

pub use cli::Cli;
pub use config::{resolve_weight_path, LossWeights, TrainConfig};
