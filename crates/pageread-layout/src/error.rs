use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] pageread_tensor::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("layout model input must be [1,3,800,800], got {0:?}")]
    InputShape(Vec<usize>),

    #[error("layout config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for pageread_core::Error {
    fn from(err: Error) -> Self {
        pageread_core::Error::InvalidConfiguration(err.to_string())
    }
}
