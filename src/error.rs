//! Error taxonomy for the training core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KtError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("EMA shadow for {0:?} registered twice")]
    DuplicateRegistration(String),

    #[error("EMA shadow for {0:?} was never registered")]
    UnregisteredName(String),

    #[error("shape mismatch in {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, KtError>;
