//! Core utilities for the vkforge renderer.
//!
//! This crate provides foundational types and utilities used across the
//! workspace:
//! - Error types and result aliases
//! - Logging initialization

mod error;
mod logging;

pub use error::{Error, Result};
pub use logging::init_logging;
