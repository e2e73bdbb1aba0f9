//! Page loading, region cropping, and shared image preprocessing.

pub mod cropper;
pub mod error;
pub mod loader;
pub mod preprocess;

pub use cropper::crop_region;
pub use error::{Error, Result};
pub use loader::{InputDocument, PdfRuntime};
