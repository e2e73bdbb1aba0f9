//! Deterministic Markdown formatting for recognized page regions: label
//! normalization, content cleanup, per-category rendering rules, and
//! cross-region merges, assembled into a page's final region list and
//! Markdown fragment.

pub mod assemble;
pub mod cleanup;
pub mod error;
pub mod label;
pub mod merge;
pub mod rules;

pub use assemble::{format_page, FormatRegion};
pub use error::{Error, Result};
pub use label::Category;
