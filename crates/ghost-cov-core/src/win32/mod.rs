//! Windows backend
//!
//! Drives the Win32 debug API and DbgHelp behind the engine's collaborator
//! traits.

mod dbghelp;
mod debugger;
mod process;

pub use dbghelp::DbgHelpSymbols;
pub use debugger::Debugger;
pub use process::{WindowsProcess, WindowsThread};

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

/// Nul-terminated UTF-16 copy of `value`
fn to_wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(std::iter::once(0)).collect()
}
