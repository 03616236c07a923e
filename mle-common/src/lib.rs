//! MLE Common - shared configuration, errors, and logging for the MLE workspace.
//!
//! This crate provides:
//! - Project configuration lookup (`get_config`) and the `Platform` enumeration
//! - Error types and context helpers
//! - Logging setup with noise filtering
//! - Observer middleware for instrumenting model calls

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod observe;

pub use config::{get_config, MemorySettings, Platform, ProjectConfig};
pub use error::{Error, Result, ResultExt};
pub use observe::{ModelObserver, Observation, Outcome, TracingObserver};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{get_config, Platform, ProjectConfig};
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
}
