//! Public error taxonomy.
//!
//! Internal crates define their own `thiserror` enums for the failure
//! modes specific to their stage, then collapse into one of the four
//! surface kinds here at the crate boundary.

use thiserror::Error;

/// Top-level error returned by [`crate::Pipeline::parse`]-shaped entry points.
///
/// The four variants form a small surface taxonomy: most internal
/// failures are fatal and collapse into one of these; per-region
/// failures are recorded as warnings instead of propagated (see
/// [`crate::DiagnosticBundle`]).
#[derive(Debug, Error)]
pub enum Error {
    /// Config validation or a tensor/contract violation that makes the
    /// request impossible to service (bad options, wrong model output
    /// shape, cancellation during a page that can't be half-returned).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The page loader failed to rasterize one or more PDF pages.
    #[error("PDF rendering failed: {0}")]
    PDFRenderingFailed(String),

    /// Snapshot resolution, integrity verification, or offline
    /// readiness failed in the model delivery layer.
    #[error("model delivery failed: {0}")]
    ModelDeliveryFailed(String),

    /// A code path describes behavior explicitly out of scope for this
    /// engine.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The calling task was cancelled; no partial result is returned.
    #[error("parse cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
