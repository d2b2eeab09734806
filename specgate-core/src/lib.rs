//! Shared foundation types for the specgate workspace: the request error
//! taxonomy, digest helpers and duration parsing used by every other
//! member crate.

pub mod digest;
pub mod duration;
pub mod error;

pub use error::{Error, Result};
