//! Core types for ferry.

mod message;
mod result;

pub use message::*;
pub use result::*;
