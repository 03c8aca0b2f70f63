//! Error type shared by every transform in the crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The input is of a kind the transform cannot work with (e.g. an integer tensor).
    #[error("{0}")]
    Type(String),

    /// Tensor shape does not match what the transform expects.
    #[error("{what} must be {expected}. Got {actual}")]
    Shape {
        what: String,
        expected: String,
        actual: String,
    },

    /// Invalid value (statistic length, spatial size, parameter range ...).
    #[error("{0}")]
    Value(String),

    /// The prompt list does not line up with the image batch.
    #[error("The number of images (`B`) should match with the length of prompts! Got {images} images and {prompts} prompts")]
    PromptCount { images: usize, prompts: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(
        what: impl Into<String>,
        expected: impl Into<String>,
        actual: &[usize],
    ) -> Self {
        Error::Shape {
            what: what.into(),
            expected: expected.into(),
            actual: format!("{actual:?}"),
        }
    }
}
