//! Exception classification
//!
//! Decides what an exception raised by a debuggee means for the coverage
//! run. Trap resolution itself happens in the runner; this module only
//! knows exception codes and the per-process loader breakpoint.

use crate::traits::ExceptionInfo;
use ghost_cov_common::ProcessKey;
use std::collections::{HashMap, HashSet};

/// Exception codes
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
/// Breakpoint raised by a 32-bit process running under WOW64
pub const STATUS_WX86_BREAKPOINT: u32 = 0x4000_001F;
/// Code the MSVC runtime raises for `throw`
pub const CPP_EXCEPTION_CODE: u32 = 0xE06D_7363;

/// What the runner should do with an exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    /// The loader's breakpoint when a process starts
    InitialBreakpoint,
    /// A trap, possibly one of ours
    Breakpoint,
    /// Any other first-chance exception, for the debuggee to handle
    FirstChance,
    /// A C++ exception nobody caught
    UnhandledCpp,
    /// Any other exception nobody caught
    Unhandled,
}

/// Outcome reported for an exception once it has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOutcome {
    InitialBreakpoint,
    Breakpoint,
    InvalidBreakpoint,
    NotHandled,
    LanguageError,
    Error,
}

#[derive(Debug, Default)]
pub struct ExceptionHandler {
    /// Breakpoint codes already raised by each live process
    ///
    /// A WOW64 process hits two loader breakpoints, a native one and then
    /// `STATUS_WX86_BREAKPOINT`; the first of each code is the loader's.
    breakpoint_codes_seen: HashMap<ProcessKey, HashSet<u32>>,
}

pub fn is_breakpoint_code(code: u32) -> bool {
    code == EXCEPTION_BREAKPOINT || code == STATUS_WX86_BREAKPOINT
}

impl ExceptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create_process(&mut self, process: ProcessKey) {
        self.breakpoint_codes_seen.insert(process, HashSet::new());
    }

    pub fn on_exit_process(&mut self, process: ProcessKey) {
        self.breakpoint_codes_seen.remove(&process);
    }

    pub fn classify(&mut self, process: ProcessKey, exception: &ExceptionInfo) -> ExceptionClass {
        if is_breakpoint_code(exception.code) {
            if let Some(seen) = self.breakpoint_codes_seen.get_mut(&process) {
                if seen.insert(exception.code) {
                    return ExceptionClass::InitialBreakpoint;
                }
            }
            return ExceptionClass::Breakpoint;
        }

        if exception.first_chance {
            ExceptionClass::FirstChance
        } else if exception.code == CPP_EXCEPTION_CODE {
            ExceptionClass::UnhandledCpp
        } else {
            ExceptionClass::Unhandled
        }
    }
}

/// Human readable name of well-known exception codes
pub fn exception_name(code: u32) -> &'static str {
    match code {
        EXCEPTION_BREAKPOINT | STATUS_WX86_BREAKPOINT => "breakpoint",
        CPP_EXCEPTION_CODE => "C++ exception",
        0xC000_0005 => "access violation",
        0xC000_001D => "illegal instruction",
        0xC000_0094 => "integer divide by zero",
        0xC000_00FD => "stack overflow",
        0xC000_0409 => "stack buffer overrun",
        0x8000_0004 => "single step",
        _ => "unknown exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exception(code: u32, first_chance: bool) -> ExceptionInfo {
        ExceptionInfo {
            code,
            address: 0x1000,
            first_chance,
        }
    }

    #[test]
    fn test_first_breakpoint_per_process_is_initial() {
        let mut handler = ExceptionHandler::new();
        handler.on_create_process(ProcessKey(1));
        handler.on_create_process(ProcessKey(2));

        let bp = exception(EXCEPTION_BREAKPOINT, true);
        assert_eq!(
            handler.classify(ProcessKey(1), &bp),
            ExceptionClass::InitialBreakpoint
        );
        assert_eq!(handler.classify(ProcessKey(1), &bp), ExceptionClass::Breakpoint);

        let wow = exception(STATUS_WX86_BREAKPOINT, true);
        assert_eq!(
            handler.classify(ProcessKey(2), &wow),
            ExceptionClass::InitialBreakpoint
        );
    }

    #[test]
    fn test_wow64_process_has_two_loader_breakpoints() {
        let mut handler = ExceptionHandler::new();
        let key = ProcessKey(7);
        handler.on_create_process(key);

        let native = exception(EXCEPTION_BREAKPOINT, true);
        let wow = exception(STATUS_WX86_BREAKPOINT, true);
        assert_eq!(handler.classify(key, &native), ExceptionClass::InitialBreakpoint);
        assert_eq!(handler.classify(key, &wow), ExceptionClass::InitialBreakpoint);
        assert_eq!(handler.classify(key, &wow), ExceptionClass::Breakpoint);
        assert_eq!(handler.classify(key, &native), ExceptionClass::Breakpoint);
    }

    #[test]
    fn test_unknown_process_breakpoint_is_regular() {
        let mut handler = ExceptionHandler::new();
        assert_eq!(
            handler.classify(ProcessKey(9), &exception(EXCEPTION_BREAKPOINT, true)),
            ExceptionClass::Breakpoint
        );
    }

    #[test]
    fn test_other_exceptions() {
        let mut handler = ExceptionHandler::new();
        let key = ProcessKey(1);
        assert_eq!(
            handler.classify(key, &exception(0xC000_0005, true)),
            ExceptionClass::FirstChance
        );
        assert_eq!(
            handler.classify(key, &exception(CPP_EXCEPTION_CODE, true)),
            ExceptionClass::FirstChance
        );
        assert_eq!(
            handler.classify(key, &exception(CPP_EXCEPTION_CODE, false)),
            ExceptionClass::UnhandledCpp
        );
        assert_eq!(
            handler.classify(key, &exception(0xC000_0005, false)),
            ExceptionClass::Unhandled
        );
    }

    #[test]
    fn test_exit_forgets_pending_initial_breakpoint() {
        let mut handler = ExceptionHandler::new();
        handler.on_create_process(ProcessKey(1));
        handler.on_exit_process(ProcessKey(1));
        assert_eq!(
            handler.classify(ProcessKey(1), &exception(EXCEPTION_BREAKPOINT, true)),
            ExceptionClass::Breakpoint
        );
    }

    #[test]
    fn test_exception_name() {
        assert_eq!(exception_name(0xC000_0005), "access violation");
        assert_eq!(exception_name(CPP_EXCEPTION_CODE), "C++ exception");
        assert_eq!(exception_name(0x1234), "unknown exception");
    }
}
