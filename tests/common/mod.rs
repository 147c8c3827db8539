//! Common test utilities for all integration tests.
//!
//! Provides a seeded multi-domain cloud, file-backed state databases and a
//! reconciler wired the same way the engine wires it.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod cloud;
pub mod test_db;
