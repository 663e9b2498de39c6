//! Debug event dispatcher
//!
//! [`CoverageRunner`] receives every event of the debug loop, instruments
//! modules as they load, resolves traps as they fire and turns the registry
//! into [`CoverageData`] once the root process has exited.

use crate::breakpoint;
use crate::exception::{exception_name, ExceptionClass, ExceptionHandler, ExceptionOutcome};
use crate::registry::ExecutedAddressManager;
use crate::traits::{
    ContinueStatus, CoverageFilter, DebugEvent, DebugEventsHandler, DebugInformationEventHandler,
    DebugLoop, ExceptionInfo, ProcessMemory, TargetProcess, ThreadControl,
};
use crate::walker::DebugInformation;
use ghost_cov_common::{
    Address, CoverageData, ModuleImage, ProcessKey, Result, RunCoverageSettings,
    SourceCodeLocation,
};
use std::collections::HashMap;

/// Installs a trap for every discovery and registers it
///
/// When the registry reports the address as already trapped, the freshly
/// installed duplicate is removed again so only one trap per address exists.
pub struct BreakpointRegistrar<'a> {
    memory: &'a dyn ProcessMemory,
    registry: &'a mut ExecutedAddressManager,
}

impl<'a> BreakpointRegistrar<'a> {
    pub fn new(memory: &'a dyn ProcessMemory, registry: &'a mut ExecutedAddressManager) -> Self {
        Self { memory, registry }
    }

    fn trap<F>(&mut self, address: u64, register: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutedAddressManager, u8) -> Result<bool>,
    {
        let original = breakpoint::install(self.memory, address)?;
        match register(&mut *self.registry, original) {
            Ok(true) => Ok(()),
            Ok(false) => breakpoint::remove(self.memory, address, original),
            Err(e) => {
                // Leave memory as it was before reporting the contract violation
                if let Err(restore) = breakpoint::remove(self.memory, address, original) {
                    tracing::error!(
                        target: "ghost_cov_core::runner",
                        addr = format!("0x{:x}", address),
                        error = %restore,
                        "Cannot restore original byte"
                    );
                }
                Err(e)
            }
        }
    }
}

impl DebugInformationEventHandler for BreakpointRegistrar<'_> {
    fn on_new_line(&mut self, location: &SourceCodeLocation) -> Result<()> {
        self.trap(location.address.value, |registry, original| {
            registry.register_address(location, original)
        })
    }

    fn on_new_conditional(
        &mut self,
        location: &SourceCodeLocation,
        true_branch: u64,
        false_branch: u64,
    ) -> Result<()> {
        for branch in [true_branch, false_branch] {
            let branch_address = location.address.with_value(branch);
            self.trap(branch, |registry, original| {
                registry.register_branch_address(location, branch_address, original)
            })?;
        }
        Ok(())
    }

    fn original_byte(&self, address: Address) -> Option<u8> {
        self.registry
            .breakpoint(address)
            .map(|breakpoint| breakpoint.original_instruction)
    }
}

/// Drives one coverage run
pub struct CoverageRunner {
    filter: Box<dyn CoverageFilter>,
    registry: ExecutedAddressManager,
    exceptions: ExceptionHandler,
    debug_information: HashMap<ProcessKey, DebugInformation>,
    exit_codes: HashMap<ProcessKey, i32>,
    continue_after_cpp_exception: bool,
}

impl std::fmt::Debug for CoverageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageRunner")
            .field("breakpoints", &self.registry.breakpoint_count())
            .field("processes", &self.debug_information.len())
            .field(
                "continue_after_cpp_exception",
                &self.continue_after_cpp_exception,
            )
            .finish()
    }
}

impl CoverageRunner {
    pub fn new(filter: Box<dyn CoverageFilter>) -> Self {
        Self {
            filter,
            registry: ExecutedAddressManager::new(),
            exceptions: ExceptionHandler::new(),
            debug_information: HashMap::new(),
            exit_codes: HashMap::new(),
            continue_after_cpp_exception: false,
        }
    }

    /// Run `settings.start_info` under `debug_loop` and collect its coverage
    ///
    /// The loop must already be configured for child-process debugging if
    /// `settings.cover_children` is set.
    pub fn run_coverage(
        &mut self,
        debug_loop: &mut dyn DebugLoop,
        settings: &RunCoverageSettings,
    ) -> Result<CoverageData> {
        self.continue_after_cpp_exception = settings.continue_after_cpp_exception;

        tracing::info!(
            target: "ghost_cov_core::runner",
            program = %settings.start_info.program.display(),
            cover_children = settings.cover_children,
            "Starting coverage run"
        );

        let exit_code = debug_loop.debug(&settings.start_info, self)?;
        let data = self
            .registry
            .create_coverage_data(&settings.start_info.run_name(), exit_code);

        let stats = data.stats();
        tracing::info!(
            target: "ghost_cov_core::runner",
            exit_code,
            lines = stats.lines_total,
            executed = stats.lines_executed,
            branches = stats.branches_total,
            "Coverage run finished"
        );
        Ok(data)
    }

    pub fn registry(&self) -> &ExecutedAddressManager {
        &self.registry
    }

    /// Number of processes with a live symbol session
    pub fn debug_information_count(&self) -> usize {
        self.debug_information.len()
    }

    /// Exit code recorded for an exited process
    pub fn exit_code(&self, process: ProcessKey) -> Option<i32> {
        self.exit_codes.get(&process).copied()
    }

    fn on_create_process(&mut self, process: &dyn TargetProcess, image: &ModuleImage) -> Result<()> {
        let key = process.key();
        let provider = process.open_debug_information()?;
        self.debug_information
            .insert(key, DebugInformation::new(key, provider));
        self.exceptions.on_create_process(key);

        tracing::debug!(
            target: "ghost_cov_core::runner",
            process = %key,
            image = %image.path,
            "Process created"
        );
        self.load_module(process, image)
    }

    fn load_module(&mut self, process: &dyn TargetProcess, image: &ModuleImage) -> Result<()> {
        let key = process.key();
        if !self.filter.is_module_selected(&image.path) {
            tracing::debug!(
                target: "ghost_cov_core::runner",
                module = %image.path,
                "Module not selected"
            );
            return Ok(());
        }

        let Some(debug_information) = self.debug_information.get_mut(&key) else {
            tracing::warn!(
                target: "ghost_cov_core::runner",
                process = %key,
                module = %image.path,
                "Module loaded by a process that was never created"
            );
            return Ok(());
        };
        self.registry.add_module(&image.path, image.base);

        let mut registrar = BreakpointRegistrar::new(process.as_memory(), &mut self.registry);
        match debug_information.load_module(
            process.as_memory(),
            image,
            self.filter.as_ref(),
            &mut registrar,
        ) {
            Ok(summary) => {
                tracing::debug!(
                    target: "ghost_cov_core::runner",
                    module = %image.path,
                    functions = summary.functions,
                    lines = summary.lines,
                    conditionals = summary.conditionals,
                    breakpoints = self.registry.breakpoint_count(),
                    "Module instrumented"
                );
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(
                    target: "ghost_cov_core::runner",
                    module = %image.path,
                    error = %e,
                    "Module not covered"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn on_exit_process(&mut self, process: ProcessKey, exit_code: i32) {
        self.exceptions.on_exit_process(process);
        self.registry.on_exit_process(process);
        if self.debug_information.remove(&process).is_none() {
            tracing::warn!(
                target: "ghost_cov_core::runner",
                process = %process,
                "Exit of a process that was never created"
            );
        }
        self.exit_codes.insert(process, exit_code);

        tracing::debug!(
            target: "ghost_cov_core::runner",
            process = %process,
            exit_code,
            "Process exited"
        );
    }

    /// Restore the original byte and rewind the thread if the trap is ours
    fn on_breakpoint(
        &mut self,
        process: &dyn TargetProcess,
        thread: &dyn ThreadControl,
        address: u64,
    ) -> Result<bool> {
        let address = Address::new(process.key(), address);
        let Some(original) = self.registry.mark_address_as_executed(address) else {
            return Ok(false);
        };

        breakpoint::remove(process.as_memory(), address.value, original)?;
        breakpoint::adjust_instruction_pointer_after_trap(thread)?;
        Ok(true)
    }

    fn handle_exception(
        &mut self,
        process: &dyn TargetProcess,
        thread: &dyn ThreadControl,
        exception: &ExceptionInfo,
    ) -> ExceptionOutcome {
        let key = process.key();
        match self.exceptions.classify(key, exception) {
            ExceptionClass::InitialBreakpoint => ExceptionOutcome::InitialBreakpoint,
            ExceptionClass::Breakpoint => {
                match self.on_breakpoint(process, thread, exception.address) {
                    Ok(true) => ExceptionOutcome::Breakpoint,
                    Ok(false) => {
                        tracing::debug!(
                            target: "ghost_cov_core::runner",
                            process = %key,
                            addr = format!("0x{:x}", exception.address),
                            "Breakpoint not set by coverage"
                        );
                        ExceptionOutcome::InvalidBreakpoint
                    }
                    Err(e) => {
                        tracing::error!(
                            target: "ghost_cov_core::runner",
                            process = %key,
                            addr = format!("0x{:x}", exception.address),
                            error = %e,
                            "Cannot resolve breakpoint"
                        );
                        ExceptionOutcome::Error
                    }
                }
            }
            ExceptionClass::FirstChance => ExceptionOutcome::NotHandled,
            ExceptionClass::UnhandledCpp => {
                if self.continue_after_cpp_exception {
                    tracing::warn!(
                        target: "ghost_cov_core::runner",
                        process = %key,
                        addr = format!("0x{:x}", exception.address),
                        "Unhandled C++ exception, continuing"
                    );
                } else {
                    tracing::error!(
                        target: "ghost_cov_core::runner",
                        process = %key,
                        addr = format!("0x{:x}", exception.address),
                        "Unhandled C++ exception"
                    );
                }
                ExceptionOutcome::LanguageError
            }
            ExceptionClass::Unhandled => {
                tracing::error!(
                    target: "ghost_cov_core::runner",
                    process = %key,
                    code = format!("0x{:08x}", exception.code),
                    name = exception_name(exception.code),
                    addr = format!("0x{:x}", exception.address),
                    "Unhandled exception in target"
                );
                ExceptionOutcome::Error
            }
        }
    }

    fn continue_status(&self, outcome: ExceptionOutcome) -> ContinueStatus {
        match outcome {
            ExceptionOutcome::InitialBreakpoint | ExceptionOutcome::Breakpoint => {
                ContinueStatus::Continue
            }
            ExceptionOutcome::LanguageError if self.continue_after_cpp_exception => {
                ContinueStatus::Continue
            }
            ExceptionOutcome::InvalidBreakpoint
            | ExceptionOutcome::NotHandled
            | ExceptionOutcome::LanguageError
            | ExceptionOutcome::Error => ContinueStatus::ExceptionNotHandled,
        }
    }
}

impl DebugEventsHandler for CoverageRunner {
    fn on_event(&mut self, event: DebugEvent<'_>) -> Result<ContinueStatus> {
        match event {
            DebugEvent::ProcessCreated { process, image } => {
                self.on_create_process(process, &image)?;
            }
            DebugEvent::ModuleLoaded { process, image } => {
                self.load_module(process, &image)?;
            }
            DebugEvent::ModuleUnloaded { process, base } => {
                self.registry.on_unload_module(process.key(), base);
            }
            DebugEvent::ProcessExited { process, exit_code } => {
                self.on_exit_process(process.key(), exit_code);
            }
            DebugEvent::ExceptionRaised {
                process,
                thread,
                exception,
            } => {
                let outcome = self.handle_exception(process, thread, &exception);
                return Ok(self.continue_status(outcome));
            }
        }
        Ok(ContinueStatus::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::INT3;
    use crate::filter::WildcardFilter;
    use crate::traits::DebugInformationProvider;
    use ghost_cov_common::{Error, FunctionSymbol, LineInfo, LoadedModule};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    const PROCESS: ProcessKey = ProcessKey(1);

    #[derive(Default)]
    struct Memory {
        bytes: RefCell<BTreeMap<u64, u8>>,
    }

    impl Memory {
        fn with(address: u64, data: &[u8]) -> Self {
            let memory = Memory::default();
            for (i, b) in data.iter().enumerate() {
                memory.bytes.borrow_mut().insert(address + i as u64, *b);
            }
            memory
        }

        fn byte(&self, address: u64) -> u8 {
            self.bytes.borrow()[&address]
        }
    }

    impl ProcessMemory for Memory {
        fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
            let bytes = self.bytes.borrow();
            (address..address + size as u64)
                .map(|a| {
                    bytes.get(&a).copied().ok_or(Error::MemoryAccess {
                        address: a,
                        message: "unmapped".to_string(),
                    })
                })
                .collect()
        }

        fn write(&self, address: u64, data: &[u8]) -> Result<()> {
            let mut bytes = self.bytes.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(address + i as u64, *b);
            }
            Ok(())
        }

        fn flush_instruction_cache(&self, _: u64, _: usize) -> Result<()> {
            Ok(())
        }
    }

    fn location(line: u32, address: u64) -> SourceCodeLocation {
        SourceCodeLocation {
            file_name: "main.cpp".to_string(),
            class_name: "<global>".to_string(),
            function_name: "main".to_string(),
            line_number: line,
            address: Address::new(PROCESS, address),
        }
    }

    #[test]
    fn test_registrar_removes_duplicate_trap() {
        let memory = Memory::with(0x1000, &[0x55, 0x85]);
        let mut registry = ExecutedAddressManager::new();
        registry.add_module("app.exe", 0x400000);

        {
            let mut registrar = BreakpointRegistrar::new(&memory, &mut registry);
            registrar.on_new_line(&location(10, 0x1000)).unwrap();
            registrar.on_new_line(&location(11, 0x1000)).unwrap();
        }

        assert_eq!(memory.byte(0x1000), INT3);
        assert_eq!(registry.breakpoint_count(), 1);
        assert_eq!(
            registry.mark_address_as_executed(Address::new(PROCESS, 0x1000)),
            Some(0x55)
        );
    }

    #[test]
    fn test_registrar_traps_both_branch_outcomes() {
        let memory = Memory::with(0x1000, &[0x85, 0xC9, 0x74, 0x03, 0x31, 0xC0, 0xC3, 0xB8]);
        let mut registry = ExecutedAddressManager::new();
        registry.add_module("app.exe", 0x400000);

        {
            let mut registrar = BreakpointRegistrar::new(&memory, &mut registry);
            let line = location(11, 0x1000);
            registrar.on_new_line(&line).unwrap();
            registrar.on_new_conditional(&line, 0x1007, 0x1004).unwrap();
        }

        assert_eq!(memory.byte(0x1000), INT3);
        assert_eq!(memory.byte(0x1004), INT3);
        assert_eq!(memory.byte(0x1007), INT3);
        assert_eq!(registry.breakpoint_count(), 3);
    }

    #[test]
    fn test_registrar_restores_byte_on_contract_violation() {
        let memory = Memory::with(0x1000, &[0x55]);
        let mut registry = ExecutedAddressManager::new();

        let mut registrar = BreakpointRegistrar::new(&memory, &mut registry);
        let err = registrar.on_new_line(&location(10, 0x1000)).unwrap_err();

        assert!(matches!(err, Error::UnknownModule));
        assert_eq!(memory.byte(0x1000), 0x55);
    }

    #[test]
    fn test_registrar_propagates_memory_error() {
        let memory = Memory::default();
        let mut registry = ExecutedAddressManager::new();
        registry.add_module("app.exe", 0x400000);

        let mut registrar = BreakpointRegistrar::new(&memory, &mut registry);
        let err = registrar.on_new_line(&location(10, 0x1000)).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(registry.breakpoint_count(), 0);
    }

    /// Two symbols folded onto one body at 0x401000
    struct FoldedSymbols;

    impl DebugInformationProvider for FoldedSymbols {
        fn load_module(&mut self, image: &ModuleImage) -> Result<LoadedModule> {
            Ok(LoadedModule {
                image: image.clone(),
                symbol_base: 0x400000,
            })
        }

        fn enumerate_functions(&mut self, _: &LoadedModule) -> Result<Vec<FunctionSymbol>> {
            Ok(["a::f", "b::g"]
                .into_iter()
                .map(|name| FunctionSymbol {
                    name: name.to_string(),
                    address: 0x401000,
                    size: 8,
                })
                .collect())
        }

        fn function_lines(
            &mut self,
            _: &LoadedModule,
            _: &FunctionSymbol,
        ) -> Result<Vec<LineInfo>> {
            Ok([(1, 0x401000), (2, 0x401002), (3, 0x401007)]
                .into_iter()
                .map(|(line_number, address)| LineInfo {
                    file_name: "main.cpp".to_string(),
                    line_number,
                    address,
                })
                .collect())
        }

        fn resolve_symbol(&mut self, _: &LoadedModule, _: &str) -> Result<Option<u64>> {
            Ok(None)
        }

        fn unload_module(&mut self, _: &LoadedModule) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_folded_functions_share_traps() {
        // mov al,5; mov eax,1; ret
        let body = [0xB0, 0x05, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];
        let memory = Memory::with(0x401000, &body);
        let image = ModuleImage {
            path: "app.exe".to_string(),
            base: 0x400000,
            size: 0x2000,
            bitness: 64,
        };
        let mut registry = ExecutedAddressManager::new();
        registry.add_module(&image.path, image.base);

        let mut info = DebugInformation::new(PROCESS, Box::new(FoldedSymbols));
        let summary = {
            let mut registrar = BreakpointRegistrar::new(&memory, &mut registry);
            info.load_module(&memory, &image, &WildcardFilter::default(), &mut registrar)
                .unwrap()
        };

        assert_eq!(summary.functions, 2);
        assert_eq!(summary.lines, 6);
        let traps: Vec<u64> = (0x401000..0x401008)
            .filter(|&a| memory.byte(a) == INT3)
            .collect();
        assert_eq!(traps, vec![0x401000, 0x401002, 0x401007]);
        assert_eq!(memory.byte(0x401006), 0x00);
        assert_eq!(registry.breakpoint_count(), 3);
        assert_eq!(
            registry.mark_address_as_executed(Address::new(PROCESS, 0x401002)),
            Some(0xB8)
        );
    }
}
