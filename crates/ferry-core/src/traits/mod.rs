//! Core traits for ferry sources.

mod extractor;

pub use extractor::*;
