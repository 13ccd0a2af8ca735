//! Data-free knowledge transfer by logit inversion.
//!
//! A fixed teacher classifier is inverted by a set of image decoders, and a set
//! of small encoders is distilled on the synthesized images. See [`tasks::Trainer`]
//! for the training loop.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod tasks;

pub use error::{KtError, Result};
