use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("region {0} has no content to format")]
    MissingContent(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for pageread_core::Error {
    fn from(err: Error) -> Self {
        pageread_core::Error::InvalidConfiguration(err.to_string())
    }
}
