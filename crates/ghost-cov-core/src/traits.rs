//! Core trait definitions for ghost-cov
//!
//! The coverage engine only talks to the debuggee, the symbol engine and the
//! OS debug loop through these traits. The Windows backend implements them
//! on top of the Win32 debug API and DbgHelp; tests implement them in memory.

use ghost_cov_common::{
    Address, FunctionSymbol, LineInfo, LoadedModule, ModuleImage, ProcessKey, Result,
    SourceCodeLocation, StartInfo,
};

/// Raw access to a debuggee's address space
pub trait ProcessMemory {
    /// Read exactly `size` bytes at `address`
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Write `data` at `address`
    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Make patched code visible to the CPU
    fn flush_instruction_cache(&self, address: u64, size: usize) -> Result<()>;
}

/// A debuggee as seen by the event dispatcher
pub trait TargetProcess: ProcessMemory {
    /// Stable identity of this process for the whole run
    fn key(&self) -> ProcessKey;

    /// Implementations return `self`
    fn as_memory(&self) -> &dyn ProcessMemory;

    /// Start a symbol session for this process
    ///
    /// Called once per process, when the process is created. The session is
    /// dropped when the process exits.
    fn open_debug_information(&self) -> Result<Box<dyn DebugInformationProvider>>;
}

/// Register access for the thread that raised an exception
pub trait ThreadControl {
    fn instruction_pointer(&self) -> Result<u64>;

    fn set_instruction_pointer(&self, value: u64) -> Result<()>;
}

/// Per-process symbol engine
///
/// All addresses taken and returned are in symbol space, relative to
/// [`LoadedModule::symbol_base`].
pub trait DebugInformationProvider {
    fn load_module(&mut self, image: &ModuleImage) -> Result<LoadedModule>;

    /// Every function symbol of the module
    fn enumerate_functions(&mut self, module: &LoadedModule) -> Result<Vec<FunctionSymbol>>;

    /// Line table entries covering `function`, in any order
    fn function_lines(
        &mut self,
        module: &LoadedModule,
        function: &FunctionSymbol,
    ) -> Result<Vec<LineInfo>>;

    /// Address of a named symbol, if the module defines it
    fn resolve_symbol(&mut self, module: &LoadedModule, name: &str) -> Result<Option<u64>>;

    fn unload_module(&mut self, module: &LoadedModule) -> Result<()>;
}

/// Selects what gets instrumented
pub trait CoverageFilter {
    fn is_module_selected(&self, module_path: &str) -> bool;

    fn is_source_file_selected(&self, file_path: &str) -> bool;

    fn is_line_selected(
        &self,
        module: &ModuleImage,
        file_path: &str,
        function_name: &str,
        line: &LineInfo,
    ) -> bool;
}

/// Receives what the walker discovers in a module
///
/// Addresses carried by locations and branch targets are process addresses.
pub trait DebugInformationEventHandler {
    fn on_new_file(&mut self, _file_name: &str) {}

    fn on_new_class(&mut self, _class_name: &str) {}

    fn on_new_function(&mut self, _file_name: &str, _class_name: &str, _function_name: &str) {}

    fn on_new_line(&mut self, location: &SourceCodeLocation) -> Result<()>;

    /// `true_branch` is the taken target, `false_branch` the fall-through
    fn on_new_conditional(
        &mut self,
        location: &SourceCodeLocation,
        true_branch: u64,
        false_branch: u64,
    ) -> Result<()>;

    /// Byte hidden under a trap this handler already placed at `address`
    fn original_byte(&self, _address: Address) -> Option<u8> {
        None
    }
}

// ============================================================================
// Debug loop
// ============================================================================

/// An exception reported by the OS debug loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub code: u32,
    pub address: u64,
    pub first_chance: bool,
}

/// One debug event. References are only valid for the duration of the callback.
pub enum DebugEvent<'a> {
    ProcessCreated {
        process: &'a dyn TargetProcess,
        image: ModuleImage,
    },
    ModuleLoaded {
        process: &'a dyn TargetProcess,
        image: ModuleImage,
    },
    ModuleUnloaded {
        process: &'a dyn TargetProcess,
        base: u64,
    },
    ProcessExited {
        process: &'a dyn TargetProcess,
        exit_code: i32,
    },
    ExceptionRaised {
        process: &'a dyn TargetProcess,
        thread: &'a dyn ThreadControl,
        exception: ExceptionInfo,
    },
}

impl DebugEvent<'_> {
    pub fn process(&self) -> ProcessKey {
        match self {
            DebugEvent::ProcessCreated { process, .. }
            | DebugEvent::ModuleLoaded { process, .. }
            | DebugEvent::ModuleUnloaded { process, .. }
            | DebugEvent::ProcessExited { process, .. }
            | DebugEvent::ExceptionRaised { process, .. } => process.key(),
        }
    }
}

/// How the debug loop resumes the debuggee after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// The event was consumed, resume execution
    Continue,
    /// Pass the exception on to the debuggee's own handlers
    ExceptionNotHandled,
}

/// Consumer of debug events
pub trait DebugEventsHandler {
    fn on_event(&mut self, event: DebugEvent<'_>) -> Result<ContinueStatus>;
}

/// Runs a program under the debugger until it and every debugged child exit
pub trait DebugLoop {
    /// Returns the exit code of the root process
    fn debug(&mut self, start_info: &StartInfo, handler: &mut dyn DebugEventsHandler)
        -> Result<i32>;
}
