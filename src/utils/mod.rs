//! Shared utility functions.
//!
//! - String truncation (UTF-8 safe)
//! - Slugs and path-safe identifiers for branches and artifacts

mod slug;
mod string;

pub use slug::{path_component, slugify};
pub use string::{truncate_chars, truncate_with_marker};
