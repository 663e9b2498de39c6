//! ghost-cov core library
//!
//! Breakpoint-driven code coverage. Every source line and every conditional
//! branch outcome of the selected modules gets a one-byte trap; the first
//! time a trap fires, everything registered at that address is marked as
//! executed and the original instruction is put back.
//!
//! The engine is platform neutral and talks to the debuggee through the
//! traits in [`traits`]. The Windows backend lives in `win32`.

pub mod breakpoint;
pub mod disasm;
pub mod exception;
pub mod filter;
pub mod registry;
pub mod runner;
pub mod traits;
pub mod walker;

#[cfg(windows)]
pub mod win32;

pub use filter::WildcardFilter;
pub use ghost_cov_common::{Error, Result};
pub use registry::ExecutedAddressManager;
pub use runner::{BreakpointRegistrar, CoverageRunner};
pub use traits::*;
pub use walker::DebugInformation;
