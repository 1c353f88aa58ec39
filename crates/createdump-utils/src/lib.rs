//! # createdump Utilities
//!
//! Logging setup shared by the createdump binary and its tests.
//!
//! This crate provides the `tracing` subscriber configuration: console
//! output on stderr, an optional log file, and level selection from
//! command-line flags or `RUST_LOG`.

pub mod logging;

// Re-export commonly used logging items for convenience
pub use logging::{init_logging, LogFormat, LogLevel, LoggingError, LoggingOptions};
pub use tracing::{debug, error, info, trace, warn};
