//! # Error Handling
//!
//! Process-level errors for the crossvault engine, defined with `thiserror`.

pub mod types;

pub use types::{CrossvaultError, Result};
