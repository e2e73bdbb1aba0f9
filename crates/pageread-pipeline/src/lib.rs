//! Pipeline orchestration: page loading, bounded-concurrency
//! recognition dispatch, cancellation, and diagnostics.

pub mod cancellation;
pub mod collaborators;
pub mod limiter;
pub mod pipeline;

pub use cancellation::CancellationToken;
pub use collaborators::{CandleLayoutDetector, CandleRecognizer, LayoutDetector, Recognizer, SharedLayoutDetector, SharedRecognizer};
pub use limiter::AsyncLimiter;
pub use pipeline::Pipeline;
