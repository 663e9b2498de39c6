//! Address registry
//!
//! Maps every trapped `(process, address)` pair to the execution flags of
//! the source constructs that live there. Several lines or branch outcomes
//! may share one physical address (folded code, inlined helpers); a trap
//! firing there marks all of them.
//!
//! Flags live in an arena owned by the registry and are referenced through
//! [`FlagId`]. The module → file → class → method bookkeeping outlives the
//! physical entries, which are purged on process exit and module unload.

use ghost_cov_common::{Address, CoverageData, Error, ProcessKey, Result, SourceCodeLocation};
use std::collections::{BTreeMap, HashMap};

/// Index of an execution flag in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagId(usize);

/// One trapped address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalBreakpoint {
    /// Byte the trap replaced
    pub original_instruction: u8,
    /// Load base of the module that registered the address
    pub module_base: u64,
    /// Flags set when the trap fires
    pub flags: Vec<FlagId>,
}

#[derive(Debug, Default)]
struct Method {
    /// Line number → branch outcome flags, in registration order
    lines: BTreeMap<u32, Vec<FlagId>>,
}

#[derive(Debug, Default)]
struct Class {
    methods: BTreeMap<String, Method>,
}

#[derive(Debug, Default)]
struct File {
    lines: BTreeMap<u32, FlagId>,
    classes: BTreeMap<String, Class>,
}

#[derive(Debug)]
struct Module {
    name: String,
    files: BTreeMap<String, File>,
}

#[derive(Debug, Clone, Copy)]
struct CurrentModule {
    index: usize,
    base: u64,
}

#[derive(Debug, Default)]
pub struct ExecutedAddressManager {
    flags: Vec<bool>,
    modules: Vec<Module>,
    module_index: HashMap<String, usize>,
    current: Option<CurrentModule>,
    breakpoints: HashMap<Address, PhysicalBreakpoint>,
}

impl ExecutedAddressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` the target of subsequent registrations
    ///
    /// Adding a name twice reuses the existing module; only the load base is
    /// updated.
    pub fn add_module(&mut self, name: &str, load_base: u64) {
        let index = match self.module_index.get(name) {
            Some(&index) => index,
            None => {
                self.modules.push(Module {
                    name: name.to_string(),
                    files: BTreeMap::new(),
                });
                let index = self.modules.len() - 1;
                self.module_index.insert(name.to_string(), index);
                index
            }
        };
        self.current = Some(CurrentModule {
            index,
            base: load_base,
        });

        tracing::debug!(
            target: "ghost_cov_core::registry",
            module = name,
            base = format!("0x{:x}", load_base),
            "Module added"
        );
    }

    /// Register a source line at `location.address`
    ///
    /// Returns `true` when this is the first registration of the address, in
    /// which case the caller's trap stays installed. On `false` a trap is
    /// already active there and the caller must remove its duplicate.
    pub fn register_address(
        &mut self,
        location: &SourceCodeLocation,
        original_instruction: u8,
    ) -> Result<bool> {
        let current = self.current.ok_or(Error::UnknownModule)?;

        let module = &mut self.modules[current.index];
        let file = module.files.entry(location.file_name.clone()).or_default();
        file.classes
            .entry(location.class_name.clone())
            .or_default()
            .methods
            .entry(location.function_name.clone())
            .or_default()
            .lines
            .entry(location.line_number)
            .or_default();

        let flags = &mut self.flags;
        let line_flag = *file.lines.entry(location.line_number).or_insert_with(|| {
            flags.push(false);
            FlagId(flags.len() - 1)
        });

        tracing::trace!(
            target: "ghost_cov_core::registry",
            addr = %location.address,
            file = %location.file_name,
            line = location.line_number,
            "Register address"
        );

        Ok(self.attach_flag(location.address, current.base, original_instruction, line_flag))
    }

    /// Register one outcome of a conditional on an already registered line
    ///
    /// Same keep/remove contract as [`ExecutedAddressManager::register_address`],
    /// keyed by `branch_address`.
    pub fn register_branch_address(
        &mut self,
        location: &SourceCodeLocation,
        branch_address: Address,
        original_instruction: u8,
    ) -> Result<bool> {
        let current = self.current.ok_or(Error::UnknownModule)?;

        let unregistered = || Error::UnregisteredLine {
            file: location.file_name.clone(),
            line: location.line_number,
        };
        let outcomes = self.modules[current.index]
            .files
            .get_mut(&location.file_name)
            .and_then(|f| f.classes.get_mut(&location.class_name))
            .and_then(|c| c.methods.get_mut(&location.function_name))
            .and_then(|m| m.lines.get_mut(&location.line_number))
            .ok_or_else(unregistered)?;

        self.flags.push(false);
        let flag = FlagId(self.flags.len() - 1);
        outcomes.push(flag);

        tracing::trace!(
            target: "ghost_cov_core::registry",
            addr = %branch_address,
            file = %location.file_name,
            line = location.line_number,
            "Register branch address"
        );

        Ok(self.attach_flag(branch_address, current.base, original_instruction, flag))
    }

    fn attach_flag(
        &mut self,
        address: Address,
        module_base: u64,
        original_instruction: u8,
        flag: FlagId,
    ) -> bool {
        let mut created = false;
        let entry = self.breakpoints.entry(address).or_insert_with(|| {
            created = true;
            PhysicalBreakpoint {
                original_instruction,
                module_base,
                flags: Vec::new(),
            }
        });
        entry.flags.push(flag);
        created
    }

    /// Mark everything at `address` as executed
    ///
    /// Returns the byte to restore, or `None` when the address is not ours.
    /// The entry is kept, so a second hit (another thread racing on the same
    /// trap) gets the same byte back.
    pub fn mark_address_as_executed(&mut self, address: Address) -> Option<u8> {
        let entry = self.breakpoints.get(&address)?;
        for flag in &entry.flags {
            self.flags[flag.0] = true;
        }
        Some(entry.original_instruction)
    }

    /// Drop every physical entry of `process`
    pub fn on_exit_process(&mut self, process: ProcessKey) {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|address, _| address.process != process);

        tracing::debug!(
            target: "ghost_cov_core::registry",
            process = %process,
            purged = before - self.breakpoints.len(),
            "Process exited"
        );
    }

    /// Drop the physical entries registered for the module loaded at `load_base`
    pub fn on_unload_module(&mut self, process: ProcessKey, load_base: u64) {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|address, breakpoint| {
            address.process != process || breakpoint.module_base != load_base
        });

        tracing::debug!(
            target: "ghost_cov_core::registry",
            process = %process,
            base = format!("0x{:x}", load_base),
            purged = before - self.breakpoints.len(),
            "Module unloaded"
        );
    }

    /// Number of live physical entries
    pub fn breakpoint_count(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn breakpoint(&self, address: Address) -> Option<&PhysicalBreakpoint> {
        self.breakpoints.get(&address)
    }

    /// Snapshot of everything registered so far
    pub fn create_coverage_data(&self, name: &str, exit_code: i32) -> CoverageData {
        let mut data = CoverageData::new(name, exit_code);

        for module in &self.modules {
            let module_coverage = data.add_module(module.name.clone());

            for (file_name, file) in &module.files {
                let file_coverage = module_coverage.add_file(file_name.clone());

                for (&line_number, flag) in &file.lines {
                    let line = file_coverage.add_line(line_number, self.flags[flag.0]);
                    let outcomes = file
                        .classes
                        .values()
                        .flat_map(|c| c.methods.values())
                        .filter_map(|m| m.lines.get(&line_number))
                        .flatten();
                    for (number, outcome) in outcomes.enumerate() {
                        line.add_branch(number as u32, self.flags[outcome.0]);
                    }
                }

                for (class_name, class) in &file.classes {
                    for (method_name, method) in &class.methods {
                        let method_coverage =
                            file_coverage.add_method(class_name.clone(), method_name.clone());
                        for (&line_number, outcomes) in &method.lines {
                            let executed = file
                                .lines
                                .get(&line_number)
                                .map(|flag| self.flags[flag.0])
                                .unwrap_or(false);
                            let line = method_coverage.add_line(line_number, executed);
                            for (number, outcome) in outcomes.iter().enumerate() {
                                line.add_branch(number as u32, self.flags[outcome.0]);
                            }
                        }
                    }
                }
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROCESS: ProcessKey = ProcessKey(100);

    fn location(file: &str, line: u32, address: u64) -> SourceCodeLocation {
        SourceCodeLocation {
            file_name: file.to_string(),
            class_name: "Widget".to_string(),
            function_name: "draw".to_string(),
            line_number: line,
            address: Address::new(PROCESS, address),
        }
    }

    fn line_executed(data: &CoverageData, module: &str, file: &str, line: u32) -> bool {
        data.module(module)
            .and_then(|m| m.file(file))
            .and_then(|f| f.line(line))
            .map(|l| l.executed)
            .unwrap()
    }

    #[test]
    fn test_register_address_before_add_module_fails() {
        let mut manager = ExecutedAddressManager::new();
        let err = manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownModule));

        let err = manager
            .register_branch_address(
                &location("a.cpp", 1, 0x1000),
                Address::new(PROCESS, 0x1004),
                0x55,
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownModule));
    }

    #[test]
    fn test_branch_before_line_fails() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap();

        let err = manager
            .register_branch_address(
                &location("a.cpp", 2, 0x1002),
                Address::new(PROCESS, 0x1010),
                0x90,
            )
            .unwrap_err();
        match err {
            Error::UnregisteredLine { file, line } => {
                assert_eq!(file, "a.cpp");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_mark_unregistered_address_returns_none() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap();

        assert!(manager
            .mark_address_as_executed(Address::new(PROCESS, 0x2000))
            .is_none());
        assert!(manager
            .mark_address_as_executed(Address::new(ProcessKey(7), 0x1000))
            .is_none());
    }

    #[test]
    fn test_dedup_same_address() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);

        assert!(manager
            .register_address(&location("a.cpp", 10, 0x1000), 0x55)
            .unwrap());
        assert!(!manager
            .register_address(&location("a.cpp", 11, 0x1000), 0xCC)
            .unwrap());
        assert_eq!(manager.breakpoint_count(), 1);

        // The byte saved by the first registration wins
        assert_eq!(
            manager.mark_address_as_executed(Address::new(PROCESS, 0x1000)),
            Some(0x55)
        );

        let data = manager.create_coverage_data("run", 0);
        assert!(line_executed(&data, "app.exe", "a.cpp", 10));
        assert!(line_executed(&data, "app.exe", "a.cpp", 11));
    }

    #[test]
    fn test_alias_fan_out_across_files() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("A.cpp", 5, 0x3000), 0x48)
            .unwrap();
        manager
            .register_address(&location("B.cpp", 9, 0x3000), 0xCC)
            .unwrap();

        manager.mark_address_as_executed(Address::new(PROCESS, 0x3000));

        let data = manager.create_coverage_data("run", 0);
        assert!(line_executed(&data, "app.exe", "A.cpp", 5));
        assert!(line_executed(&data, "app.exe", "B.cpp", 9));
    }

    #[test]
    fn test_unexecuted_by_default() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap();
        manager
            .register_address(&location("a.cpp", 2, 0x1001), 0x8b)
            .unwrap();

        manager.mark_address_as_executed(Address::new(PROCESS, 0x1001));

        let data = manager.create_coverage_data("run", 0);
        assert!(!line_executed(&data, "app.exe", "a.cpp", 1));
        assert!(line_executed(&data, "app.exe", "a.cpp", 2));
    }

    #[test]
    fn test_monotonic_execution() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap();

        let address = Address::new(PROCESS, 0x1000);
        assert_eq!(manager.mark_address_as_executed(address), Some(0x55));
        assert_eq!(manager.mark_address_as_executed(address), Some(0x55));

        let data = manager.create_coverage_data("run", 0);
        assert!(line_executed(&data, "app.exe", "a.cpp", 1));
    }

    #[test]
    fn test_unload_purges_module_not_siblings() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("a.dll", 0x10000);
        manager
            .register_address(&location("a.cpp", 1, 0x10100), 0x55)
            .unwrap();
        manager.add_module("b.dll", 0x20000);
        manager
            .register_address(&location("b.cpp", 1, 0x20100), 0x56)
            .unwrap();

        manager.on_unload_module(PROCESS, 0x10000);

        assert!(manager
            .mark_address_as_executed(Address::new(PROCESS, 0x10100))
            .is_none());
        assert_eq!(
            manager.mark_address_as_executed(Address::new(PROCESS, 0x20100)),
            Some(0x56)
        );

        // Unloading only drops live traps, reporting keeps both modules
        let data = manager.create_coverage_data("run", 0);
        assert_eq!(data.modules.len(), 2);
        assert!(!line_executed(&data, "a.dll", "a.cpp", 1));
        assert!(line_executed(&data, "b.dll", "b.cpp", 1));
    }

    #[test]
    fn test_unload_same_base_in_other_process_is_untouched() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("a.dll", 0x10000);
        manager
            .register_address(&location("a.cpp", 1, 0x10100), 0x55)
            .unwrap();
        let mut other = location("a.cpp", 1, 0x10100);
        other.address = Address::new(ProcessKey(200), 0x10100);
        manager.register_address(&other, 0x55).unwrap();

        manager.on_unload_module(ProcessKey(200), 0x10000);
        assert_eq!(manager.breakpoint_count(), 1);
        assert!(manager.breakpoint(Address::new(PROCESS, 0x10100)).is_some());
    }

    #[test]
    fn test_exit_process_purges_only_that_process() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        manager
            .register_address(&location("a.cpp", 1, 0x1000), 0x55)
            .unwrap();
        let mut child = location("a.cpp", 1, 0x1000);
        child.address = Address::new(ProcessKey(200), 0x1000);
        assert!(manager.register_address(&child, 0x55).unwrap());

        manager.on_exit_process(PROCESS);

        assert!(manager
            .mark_address_as_executed(Address::new(PROCESS, 0x1000))
            .is_none());
        assert_eq!(
            manager.mark_address_as_executed(Address::new(ProcessKey(200), 0x1000)),
            Some(0x55)
        );
    }

    #[test]
    fn test_snapshot() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("M1", 0x400000);
        manager
            .register_address(&location("F1", 10, 0x1000), 0x55)
            .unwrap();
        manager
            .register_address(&location("F1", 11, 0x1010), 0x55)
            .unwrap();
        manager.mark_address_as_executed(Address::new(PROCESS, 0x1010));

        let data = manager.create_coverage_data("run", 0);
        assert_eq!(data.name, "run");
        assert_eq!(data.exit_code, 0);
        assert_eq!(data.modules.len(), 1);
        let file = data.module("M1").unwrap().file("F1").unwrap();
        assert_eq!(file.lines.len(), 2);
        assert!(!file.line(10).unwrap().executed);
        assert!(file.line(11).unwrap().executed);
    }

    #[test]
    fn test_add_same_module_twice() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("a.dll", 0x10000);
        manager.add_module("b.dll", 0x20000);
        manager.add_module("a.dll", 0x30000);
        manager
            .register_address(&location("a.cpp", 1, 0x30100), 0x55)
            .unwrap();

        let data = manager.create_coverage_data("run", 0);
        assert_eq!(data.modules.len(), 2);
        assert_eq!(data.modules[0].path, "a.dll");
        assert_eq!(data.modules[1].path, "b.dll");
        assert!(data.module("a.dll").unwrap().file("a.cpp").is_some());

        // The entry belongs to the new load base
        assert_eq!(
            manager
                .breakpoint(Address::new(PROCESS, 0x30100))
                .unwrap()
                .module_base,
            0x30000
        );
    }

    #[test]
    fn test_branch_outcomes() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        let line = location("a.cpp", 11, 0x1001);
        manager.register_address(&line, 0x85).unwrap();
        assert!(manager
            .register_branch_address(&line, Address::new(PROCESS, 0x1008), 0xb8)
            .unwrap());
        assert!(manager
            .register_branch_address(&line, Address::new(PROCESS, 0x1005), 0x31)
            .unwrap());

        manager.mark_address_as_executed(Address::new(PROCESS, 0x1001));
        manager.mark_address_as_executed(Address::new(PROCESS, 0x1005));

        let data = manager.create_coverage_data("run", 0);
        let file = data.module("app.exe").unwrap().file("a.cpp").unwrap();
        let covered = file.line(11).unwrap();
        assert!(covered.executed);
        assert_eq!(covered.branches.len(), 2);
        assert!(!covered.branch(0).unwrap().executed);
        assert!(covered.branch(1).unwrap().executed);

        let method = file.method("Widget", "draw").unwrap();
        assert_eq!(method.line(11).unwrap().branches.len(), 2);
    }

    #[test]
    fn test_branch_shares_address_with_line() {
        let mut manager = ExecutedAddressManager::new();
        manager.add_module("app.exe", 0x400000);
        let first = location("a.cpp", 11, 0x1001);
        let second = location("a.cpp", 12, 0x1005);
        manager.register_address(&first, 0x85).unwrap();
        manager.register_address(&second, 0x31).unwrap();

        // Fall-through of the conditional is the start of line 12
        assert!(!manager
            .register_branch_address(&first, Address::new(PROCESS, 0x1005), 0xCC)
            .unwrap());
        assert_eq!(manager.breakpoint_count(), 2);

        assert_eq!(
            manager.mark_address_as_executed(Address::new(PROCESS, 0x1005)),
            Some(0x31)
        );
        let data = manager.create_coverage_data("run", 0);
        let file = data.module("app.exe").unwrap().file("a.cpp").unwrap();
        assert!(file.line(12).unwrap().executed);
        assert!(file.line(11).unwrap().branch(0).unwrap().executed);
        assert!(!file.line(11).unwrap().executed);
    }
}
