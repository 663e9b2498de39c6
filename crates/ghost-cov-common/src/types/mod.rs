//! Types shared by the coverage engine and its front ends
//!
//! - `address` - process-qualified addresses
//! - `location` - modules, symbols, line tables and source locations
//! - `coverage` - the coverage result tree
//! - `process` - launch settings

pub mod address;
pub mod coverage;
pub mod location;
pub mod process;

pub use address::*;
pub use coverage::*;
pub use location::*;
pub use process::*;
