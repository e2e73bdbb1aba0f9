use thiserror::Error;

/// Internal recognizer error kind, collapsed into
/// `pageread_core::Error::InvalidConfiguration` at the crate boundary,
/// except tokenizer/weight loading failures which surface as
/// `pageread_core::Error::ModelDeliveryFailed` since they indicate a
/// broken or incomplete snapshot rather than a bad request.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] pageread_tensor::Error),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("weight loading error: {0}")]
    WeightLoad(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for pageread_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Tokenizer(msg) => pageread_core::Error::ModelDeliveryFailed(msg),
            Error::WeightLoad(msg) => pageread_core::Error::ModelDeliveryFailed(msg),
            other => pageread_core::Error::InvalidConfiguration(other.to_string()),
        }
    }
}
