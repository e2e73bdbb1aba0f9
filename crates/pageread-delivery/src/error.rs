//! Internal delivery error kinds; all collapse into
//! `pageread_core::Error::ModelDeliveryFailed` at the crate boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("required file missing from snapshot: {0}")]
    MissingRequiredFile(String),

    #[error("no .safetensors file found in snapshot for {0}")]
    NoSafetensorsFound(String),

    #[error("hub request failed: {0}")]
    HubRequestFailed(String),

    #[error("checksum mismatch for {path}: expected {expected}, actual {actual}")]
    ChecksumMismatch { path: String, expected: String, actual: String },

    #[error("no persisted delivery state at {0}")]
    MissingState(String),

    #[error("persisted state has no entry for model {0}")]
    MissingMetadata(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for pageread_core::Error {
    fn from(err: Error) -> Self {
        pageread_core::Error::ModelDeliveryFailed(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
