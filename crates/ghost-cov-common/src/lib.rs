//! ghost-cov common types
//!
//! Error type, logging setup, configuration and the data model shared by the
//! coverage engine and the command line front end.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{CoverageConfig, FilterConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
