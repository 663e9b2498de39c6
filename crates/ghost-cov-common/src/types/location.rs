//! Module, symbol and source location types

use super::address::Address;
use serde::{Deserialize, Serialize};

/// One point of interest in the source. Several locations may share an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCodeLocation {
    pub file_name: String,
    pub class_name: String,
    pub function_name: String,
    pub line_number: u32,
    pub address: Address,
}

/// An image mapped into a debuggee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub path: String,
    pub base: u64,
    pub size: u64,
    /// 32 or 64
    pub bitness: u32,
}

impl ModuleImage {
    /// File name component of `path`, accepting both separators
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// A module whose symbols have been loaded by a debug information provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub image: ModuleImage,
    /// Base address the provider reports symbol addresses against
    pub symbol_base: u64,
}

impl LoadedModule {
    /// Translate a symbol-space address into the debuggee's address space
    pub fn relocate(&self, symbol_address: u64) -> u64 {
        symbol_address
            .wrapping_sub(self.symbol_base)
            .wrapping_add(self.image.base)
    }

    /// Inverse of [`LoadedModule::relocate`]
    pub fn to_symbol_space(&self, process_address: u64) -> u64 {
        process_address
            .wrapping_sub(self.image.base)
            .wrapping_add(self.symbol_base)
    }
}

/// A function symbol, addresses in symbol space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

impl FunctionSymbol {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }
}

/// Line table entry, address in symbol space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInfo {
    pub file_name: String,
    pub line_number: u32,
    pub address: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ModuleImage {
        ModuleImage {
            path: "C:\\app\\bin\\target.exe".to_string(),
            base: 0x7ff6_0000_0000,
            size: 0x20000,
            bitness: 64,
        }
    }

    #[test]
    fn test_module_file_name() {
        assert_eq!(image().file_name(), "target.exe");

        let unix = ModuleImage {
            path: "/opt/lib/libfoo.so".to_string(),
            ..image()
        };
        assert_eq!(unix.file_name(), "libfoo.so");
    }

    #[test]
    fn test_relocate_symbol_address() {
        let loaded = LoadedModule {
            image: image(),
            symbol_base: 0x1_4000_0000,
        };
        assert_eq!(loaded.relocate(0x1_4000_1234), 0x7ff6_0000_1234);
        assert_eq!(loaded.to_symbol_space(0x7ff6_0000_1234), 0x1_4000_1234);
    }

    #[test]
    fn test_function_end() {
        let f = FunctionSymbol {
            name: "main".to_string(),
            address: 0x1000,
            size: 0x40,
        };
        assert_eq!(f.end(), 0x1040);
    }
}
