use thiserror::Error;

/// Internal tensor-layer error kind. Callers in `pageread-layout` and
/// `pageread-recognizer` collapse these into
/// `pageread_core::Error::InvalidConfiguration` at the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type Result<T> = std::result::Result<T, Error>;
