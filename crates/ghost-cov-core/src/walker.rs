//! Symbol and disassembly walk
//!
//! For every function of a module whose source file is selected, decodes
//! the function body and reports each source line boundary and each
//! conditional branch to a [`DebugInformationEventHandler`].
//!
//! Symbol engine addresses are relocated into the debuggee with
//! `process = symbol - symbol_base + image_base`.

use crate::breakpoint::INT3;
use crate::disasm::{
    self, DecodedInstruction, DecodedRun, InstructionKind, MAX_INSTRUCTION_LENGTH,
};
use crate::traits::{
    CoverageFilter, DebugInformationEventHandler, DebugInformationProvider, ProcessMemory,
};
use ghost_cov_common::{
    Address, Error, FunctionSymbol, LineInfo, LoadedModule, ModuleImage, ProcessKey, Result,
    SourceCodeLocation,
};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Line number the symbol engine reports for compiler-generated code
pub const NO_SOURCE_LINE: u32 = 0x00fe_efee;

/// Scope reported for free functions
pub const GLOBAL_SCOPE: &str = "<global>";

/// Compiler stack-check helpers. Their branches are never instrumented.
pub const STACK_CHECK_HELPERS: [&str; 2] = ["__security_check_cookie", "_RTC_CheckStackVars"];

/// Split `ns::Class::method` into (`ns::Class`, `method`)
pub fn split_scope_and_function(name: &str) -> (String, String) {
    static SCOPE_AND_FUNCTION: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = SCOPE_AND_FUNCTION.get_or_init(|| Regex::new(r"::(\w+)$").ok());

    if let Some(captures) = regex.as_ref().and_then(|r| r.captures(name)) {
        if let (Some(whole), Some(function)) = (captures.get(0), captures.get(1)) {
            return (
                name[..whole.start()].to_string(),
                function.as_str().to_string(),
            );
        }
    }
    (GLOBAL_SCOPE.to_string(), name.to_string())
}

/// What one module walk produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Functions fully walked
    pub functions: usize,
    /// Functions without line information or in an unselected file
    pub skipped_functions: usize,
    /// Functions cut short by a memory or decoding error
    pub partial_functions: usize,
    pub lines: usize,
    pub conditionals: usize,
    /// Conditionals left alone because they guard a stack-check helper
    pub excluded_conditionals: usize,
}

/// Stack-check helper addresses of one module, in process space
struct StackCheckHelpers {
    addresses: HashSet<u64>,
    /// Call targets already classified, thunks to a helper map to `true`
    call_targets: HashMap<u64, bool>,
}

impl StackCheckHelpers {
    fn resolve(provider: &mut dyn DebugInformationProvider, module: &LoadedModule) -> Self {
        let mut addresses = HashSet::new();
        for name in STACK_CHECK_HELPERS {
            match provider.resolve_symbol(module, name) {
                Ok(Some(address)) => {
                    addresses.insert(module.relocate(address));
                }
                Ok(None) => {}
                Err(e) => tracing::debug!(
                    target: "ghost_cov_core::walker",
                    helper = name,
                    error = %e,
                    "Cannot resolve stack-check helper"
                ),
            }
        }
        Self {
            addresses,
            call_targets: HashMap::new(),
        }
    }

    fn contains(&self, address: u64) -> bool {
        self.addresses.contains(&address)
    }

    /// Whether a call to `target` ends up in a helper, following one `jmp` thunk
    fn is_helper_call(&mut self, memory: &dyn ProcessMemory, target: u64, bitness: u32) -> bool {
        if self.addresses.is_empty() {
            return false;
        }
        if self.contains(target) {
            return true;
        }
        if let Some(&known) = self.call_targets.get(&target) {
            return known;
        }

        let is_thunk = memory
            .read(target, MAX_INSTRUCTION_LENGTH)
            .ok()
            .and_then(|bytes| disasm::jump_thunk_target(&bytes, target, bitness))
            .is_some_and(|destination| self.addresses.contains(&destination));
        self.call_targets.insert(target, is_thunk);
        is_thunk
    }
}

/// Per-process symbol session
///
/// Created when a process starts and dropped when it exits. Files and
/// classes are announced to the event handler once per process.
pub struct DebugInformation {
    process: ProcessKey,
    provider: Box<dyn DebugInformationProvider>,
    known_files: HashSet<String>,
    known_classes: HashSet<String>,
}

impl std::fmt::Debug for DebugInformation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugInformation")
            .field("process", &self.process)
            .field("known_files", &self.known_files.len())
            .field("known_classes", &self.known_classes.len())
            .finish()
    }
}

/// Everything a function walk needs besides the session itself
struct ModuleContext<'a> {
    memory: &'a dyn ProcessMemory,
    module: &'a LoadedModule,
    filter: &'a dyn CoverageFilter,
}

impl DebugInformation {
    pub fn new(process: ProcessKey, provider: Box<dyn DebugInformationProvider>) -> Self {
        Self {
            process,
            provider,
            known_files: HashSet::new(),
            known_classes: HashSet::new(),
        }
    }

    pub fn process(&self) -> ProcessKey {
        self.process
    }

    /// Walk every selected function of `image`
    ///
    /// Symbol loading and enumeration failures come back as
    /// [`Error::SymbolEnumeration`]. Memory and decoding failures only cost
    /// the affected function. Errors raised by `handler` for any other
    /// reason abort the walk. The module's symbols are unloaded in all cases.
    pub fn load_module(
        &mut self,
        memory: &dyn ProcessMemory,
        image: &ModuleImage,
        filter: &dyn CoverageFilter,
        handler: &mut dyn DebugInformationEventHandler,
    ) -> Result<WalkSummary> {
        let loaded = self
            .provider
            .load_module(image)
            .map_err(|e| symbol_error(image, e))?;

        let context = ModuleContext {
            memory,
            module: &loaded,
            filter,
        };
        let result = self.walk_module(&context, handler);

        if let Err(e) = self.provider.unload_module(&loaded) {
            tracing::warn!(
                target: "ghost_cov_core::walker",
                module = %image.path,
                error = %e,
                "Cannot unload module symbols"
            );
        }
        result
    }

    fn walk_module(
        &mut self,
        context: &ModuleContext<'_>,
        handler: &mut dyn DebugInformationEventHandler,
    ) -> Result<WalkSummary> {
        let image = &context.module.image;
        let functions = self
            .provider
            .enumerate_functions(context.module)
            .map_err(|e| symbol_error(image, e))?;
        let mut helpers = StackCheckHelpers::resolve(self.provider.as_mut(), context.module);
        let mut summary = WalkSummary::default();

        tracing::debug!(
            target: "ghost_cov_core::walker",
            module = %image.path,
            functions = functions.len(),
            helpers = helpers.addresses.len(),
            "Walking module"
        );

        for function in &functions {
            match self.walk_function(context, function, &mut helpers, handler, &mut summary) {
                Ok(true) => summary.functions += 1,
                Ok(false) => summary.skipped_functions += 1,
                Err(e) if e.is_recoverable() => {
                    summary.partial_functions += 1;
                    tracing::warn!(
                        target: "ghost_cov_core::walker",
                        module = %image.path,
                        function = %function.name,
                        error = %e,
                        "Module partially covered"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            target: "ghost_cov_core::walker",
            module = %image.path,
            lines = summary.lines,
            conditionals = summary.conditionals,
            partial = summary.partial_functions,
            "Module walked"
        );
        Ok(summary)
    }

    /// Returns `Ok(false)` when the function is not instrumented at all
    fn walk_function(
        &mut self,
        context: &ModuleContext<'_>,
        function: &FunctionSymbol,
        helpers: &mut StackCheckHelpers,
        handler: &mut dyn DebugInformationEventHandler,
        summary: &mut WalkSummary,
    ) -> Result<bool> {
        let module = context.module;
        let image = &module.image;

        let mut lines = self
            .provider
            .function_lines(module, function)
            .map_err(|e| symbol_error(image, e))?;
        lines.retain(|l| l.line_number != NO_SOURCE_LINE);
        lines.sort_by_key(|l| l.address);

        let Some(first_line) = lines.first() else {
            return Ok(false);
        };
        let file_name = first_line.file_name.clone();
        if function.size == 0 || !context.filter.is_source_file_selected(&file_name) {
            return Ok(false);
        }

        let start = module.relocate(function.address);
        let size = usize::try_from(function.size).map_err(|_| Error::MemoryAccess {
            address: start,
            message: format!("function size {:#x} out of range", function.size),
        })?;
        let mut bytes = context.memory.read(start, size)?;
        self.restore_original_bytes(&mut bytes, start, &*handler);
        let DecodedRun {
            instructions,
            error: decode_error,
        } = disasm::decode_run(&bytes, start, image.bitness);
        if instructions.is_empty() {
            if let Some(error) = decode_error {
                return Err(error);
            }
        }

        let (class_name, function_name) = split_scope_and_function(&function.name);
        if self.known_files.insert(file_name.clone()) {
            handler.on_new_file(&file_name);
        }
        if self.known_classes.insert(class_name.clone()) {
            handler.on_new_class(&class_name);
        }
        handler.on_new_function(&file_name, &class_name, &function_name);

        let index: HashMap<u64, &DecodedInstruction> =
            instructions.iter().map(|i| (i.address, i)).collect();
        let inside_helper = helpers.contains(start);

        let mut cursor = 0;
        let mut current: Option<(SourceCodeLocation, bool)> = None;

        for instruction in &instructions {
            let symbol_address = module.to_symbol_space(instruction.address);

            while let Some(line) = lines.get(cursor).filter(|l| l.address <= symbol_address) {
                cursor += 1;
                let selected =
                    context
                        .filter
                        .is_line_selected(image, &line.file_name, &function_name, line);
                let location = SourceCodeLocation {
                    file_name: line.file_name.clone(),
                    class_name: class_name.clone(),
                    function_name: function_name.clone(),
                    line_number: line.line_number,
                    address: Address::new(self.process, instruction.address),
                };
                if selected {
                    handler.on_new_line(&location)?;
                    summary.lines += 1;
                }
                current = Some((location, selected));
            }

            let Some((location, true)) = current.as_ref() else {
                continue;
            };
            if instruction.kind != InstructionKind::ConditionalBranch || inside_helper {
                continue;
            }
            let Some(taken) = instruction.target_address.and_then(|t| index.get(&t)) else {
                continue;
            };
            let Some(fall_through) = index.get(&instruction.next_address()) else {
                continue;
            };

            let guards_helper = [taken, fall_through].iter().any(|target| {
                target.kind == InstructionKind::Call
                    && target.target_address.is_some_and(|callee| {
                        helpers.is_helper_call(context.memory, callee, image.bitness)
                    })
            });
            if guards_helper {
                summary.excluded_conditionals += 1;
                tracing::trace!(
                    target: "ghost_cov_core::walker",
                    addr = format!("0x{:x}", instruction.address),
                    "Skipping stack-check branch"
                );
                continue;
            }

            tracing::trace!(
                target: "ghost_cov_core::walker",
                addr = format!("0x{:x}", instruction.address),
                instruction = %instruction.text(),
                line = location.line_number,
                "Conditional branch"
            );
            handler.on_new_conditional(location, taken.address, fall_through.address)?;
            summary.conditionals += 1;
        }

        // Whatever decoded before the bad instruction stays instrumented
        match decode_error {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    /// Put back the bytes hidden under traps `handler` already placed
    ///
    /// Folded functions share one body, so a later walk reads the traps of
    /// an earlier one.
    fn restore_original_bytes(
        &self,
        bytes: &mut [u8],
        start: u64,
        handler: &dyn DebugInformationEventHandler,
    ) {
        for (address, byte) in (start..).zip(bytes.iter_mut()) {
            if *byte != INT3 {
                continue;
            }
            if let Some(original) = handler.original_byte(Address::new(self.process, address)) {
                *byte = original;
            }
        }
    }
}

fn symbol_error(image: &ModuleImage, error: Error) -> Error {
    match error {
        Error::SymbolEnumeration { .. } => error,
        other => Error::SymbolEnumeration {
            module: image.path.clone(),
            message: other.to_string(),
        },
    }
}
