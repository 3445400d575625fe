//! Shared kernel - Common types used across the user agent

pub mod error;
pub mod result;

pub use error::UaError;
pub use result::Result;
