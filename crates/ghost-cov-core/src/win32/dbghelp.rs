//! Symbol enumeration and line tables via DbgHelp
//!
//! One symbol session per debuggee, keyed by its process handle. DbgHelp is
//! not thread-safe; sessions are only used from the debug loop thread.

use crate::traits::DebugInformationProvider;
use ghost_cov_common::{Error, FunctionSymbol, LineInfo, LoadedModule, ModuleImage, Result};
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use windows::core::PCSTR;
use windows::Win32::Foundation::{BOOL, FALSE, HANDLE, MAX_PATH, TRUE};
use windows::Win32::System::Diagnostics::Debug::{
    SymCleanup, SymEnumSymbols, SymFromName, SymGetLineFromAddr64, SymGetLineNext64,
    SymGetSearchPath, SymInitialize, SymLoadModuleEx, SymRegisterCallback64, SymSetOptions,
    SymSetSearchPath, SymUnloadModule64, IMAGEHLP_LINE64, SYMBOL_INFO, SYMOPT_DEBUG,
    SYMOPT_DEFERRED_LOADS, SYMOPT_LOAD_LINES, SYMOPT_NO_UNQUALIFIED_LOADS, SYMOPT_UNDNAME,
    SYM_LOAD_FLAGS,
};

/// `SymTagFunction` from cvconst.h
const SYM_TAG_FUNCTION: u32 = 5;

/// `CBA_DEBUG_INFO` action code: `callback_data` is an ANSI diagnostic line
const CBA_DEBUG_INFO: u32 = 0x1000_0000;

const SEARCH_PATH_BUFFER_SIZE: usize = 4096;

pub struct DbgHelpSymbols {
    process: HANDLE,
    default_search_path: String,
}

impl DbgHelpSymbols {
    pub fn new(process: HANDLE) -> Result<Self> {
        unsafe {
            SymSetOptions(
                SYMOPT_DEFERRED_LOADS
                    | SYMOPT_LOAD_LINES
                    | SYMOPT_NO_UNQUALIFIED_LOADS
                    | SYMOPT_UNDNAME
                    | SYMOPT_DEBUG,
            );

            SymInitialize(process, PCSTR::null(), false)
                .map_err(|e| Error::Internal(format!("SymInitialize failed: {}", e)))?;
        }

        if let Err(e) = unsafe { SymRegisterCallback64(process, Some(forward_debug_info), 0) } {
            unsafe {
                let _ = SymCleanup(process);
            }
            return Err(Error::Internal(format!("SymRegisterCallback64 failed: {}", e)));
        }

        let mut buffer = vec![0u8; SEARCH_PATH_BUFFER_SIZE];
        if let Err(e) = unsafe { SymGetSearchPath(process, &mut buffer) } {
            unsafe {
                let _ = SymCleanup(process);
            }
            return Err(Error::Internal(format!("SymGetSearchPath failed: {}", e)));
        }
        let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        let default_search_path = String::from_utf8_lossy(&buffer[..len]).to_string();

        tracing::debug!(target: "ghost_cov_core::win32::dbghelp",
            search_path = %default_search_path,
            "Symbol session started");

        Ok(Self {
            process,
            default_search_path,
        })
    }

    /// Look for the PDB next to the module as well as on the default path
    fn update_search_path(&self, image: &ModuleImage) -> Result<()> {
        let parent = Path::new(&image.path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let search_path = format!("{};{}", self.default_search_path, parent);
        let search_path = to_cstring(&search_path)?;

        unsafe { SymSetSearchPath(self.process, PCSTR::from_raw(search_path.as_ptr() as *const u8)) }
            .map_err(|e| Error::Internal(format!("SymSetSearchPath failed: {}", e)))
    }
}

impl Drop for DbgHelpSymbols {
    fn drop(&mut self) {
        unsafe {
            if SymCleanup(self.process).is_err() {
                tracing::error!(target: "ghost_cov_core::win32::dbghelp", "SymCleanup failed");
            }
        }
    }
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| Error::Internal(format!("Invalid string for DbgHelp: {}", e)))
}

fn symbol_name(symbol: &SYMBOL_INFO) -> String {
    let len = symbol.NameLen.min(symbol.MaxNameLen.max(1)) as usize;
    let name_ptr = symbol.Name.as_ptr();
    let name_bytes: Vec<u8> = (0..len)
        .map(|i| unsafe { *name_ptr.add(i) as u8 })
        .collect();
    String::from_utf8_lossy(&name_bytes).to_string()
}

fn trim_debug_message(message: &str) -> &str {
    message.trim_end_matches(['\r', '\n'])
}

/// Routes `SYMOPT_DEBUG` diagnostics into the log
unsafe extern "system" fn forward_debug_info(
    _process: HANDLE,
    action_code: u32,
    callback_data: u64,
    _user_context: u64,
) -> BOOL {
    if action_code != CBA_DEBUG_INFO || callback_data == 0 {
        return FALSE;
    }

    let message = CStr::from_ptr(callback_data as *const c_char).to_string_lossy();
    tracing::debug!(target: "ghost_cov_core::win32::dbghelp", "{}", trim_debug_message(&message));
    TRUE
}

unsafe extern "system" fn collect_function(
    symbol: *const SYMBOL_INFO,
    _symbol_size: u32,
    context: *const c_void,
) -> BOOL {
    let functions = &mut *(context as *mut Vec<FunctionSymbol>);
    if let Some(symbol) = symbol.as_ref() {
        if symbol.Tag == SYM_TAG_FUNCTION {
            functions.push(FunctionSymbol {
                name: symbol_name(symbol),
                address: symbol.Address,
                size: u64::from(symbol.Size),
            });
        }
    }
    TRUE
}

impl DebugInformationProvider for DbgHelpSymbols {
    fn load_module(&mut self, image: &ModuleImage) -> Result<LoadedModule> {
        self.update_search_path(image)?;
        let image_name = to_cstring(&image.path)?;

        let symbol_base = unsafe {
            SymLoadModuleEx(
                self.process,
                HANDLE::default(),
                PCSTR::from_raw(image_name.as_ptr() as *const u8),
                PCSTR::null(),
                0,
                0,
                None,
                SYM_LOAD_FLAGS(0),
            )
        };

        if symbol_base == 0 {
            return Err(Error::SymbolEnumeration {
                module: image.path.clone(),
                message: format!("SymLoadModuleEx failed: {}", windows::core::Error::from_win32()),
            });
        }

        tracing::debug!(target: "ghost_cov_core::win32::dbghelp",
            module = %image.path,
            symbol_base = format!("0x{:x}", symbol_base),
            "Loaded symbols");

        Ok(LoadedModule {
            image: image.clone(),
            symbol_base,
        })
    }

    fn enumerate_functions(&mut self, module: &LoadedModule) -> Result<Vec<FunctionSymbol>> {
        let mut functions: Vec<FunctionSymbol> = Vec::new();

        unsafe {
            SymEnumSymbols(
                self.process,
                module.symbol_base,
                PCSTR::null(),
                Some(collect_function),
                Some(&mut functions as *mut Vec<FunctionSymbol> as *const c_void),
            )
        }
        .map_err(|e| Error::SymbolEnumeration {
            module: module.image.path.clone(),
            message: format!("SymEnumSymbols failed: {}", e),
        })?;

        Ok(functions)
    }

    fn function_lines(
        &mut self,
        _module: &LoadedModule,
        function: &FunctionSymbol,
    ) -> Result<Vec<LineInfo>> {
        let mut lines = Vec::new();
        let mut line = IMAGEHLP_LINE64 {
            SizeOfStruct: std::mem::size_of::<IMAGEHLP_LINE64>() as u32,
            ..Default::default()
        };
        let mut displacement = 0u32;

        unsafe {
            if SymGetLineFromAddr64(self.process, function.address, &mut displacement, &mut line)
                .is_err()
            {
                return Ok(lines);
            }

            while line.Address < function.end() {
                if line.Address >= function.address {
                    lines.push(LineInfo {
                        file_name: String::from_utf8_lossy(line.FileName.as_bytes()).to_string(),
                        line_number: line.LineNumber,
                        address: line.Address,
                    });
                }
                if SymGetLineNext64(self.process, &mut line).is_err() {
                    break;
                }
            }
        }

        Ok(lines)
    }

    fn resolve_symbol(&mut self, module: &LoadedModule, name: &str) -> Result<Option<u64>> {
        let module_name = Path::new(&module.image.path)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let qualified = to_cstring(&format!("{}!{}", module_name, name))?;

        // SYMBOL_INFO has a Name[1] array at the end, so we need extra space for the name
        let buffer_size = std::mem::size_of::<SYMBOL_INFO>() + MAX_PATH as usize;
        let mut buffer = vec![0u64; buffer_size.div_ceil(8)];

        unsafe {
            let symbol = buffer.as_mut_ptr() as *mut SYMBOL_INFO;
            (*symbol).SizeOfStruct = std::mem::size_of::<SYMBOL_INFO>() as u32;
            (*symbol).MaxNameLen = MAX_PATH;

            if SymFromName(
                self.process,
                PCSTR::from_raw(qualified.as_ptr() as *const u8),
                symbol,
            )
            .is_err()
            {
                return Ok(None);
            }

            if (*symbol).ModBase != module.symbol_base {
                return Ok(None);
            }
            Ok(Some((*symbol).Address))
        }
    }

    fn unload_module(&mut self, module: &LoadedModule) -> Result<()> {
        unsafe { SymUnloadModule64(self.process, module.symbol_base) }.map_err(|e| {
            Error::SymbolEnumeration {
                module: module.image.path.clone(),
                message: format!("SymUnloadModule64 failed: {}", e),
            }
        })
    }
}
