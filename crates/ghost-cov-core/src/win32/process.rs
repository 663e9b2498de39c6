//! Debuggee memory and thread access

use super::dbghelp::DbgHelpSymbols;
use crate::traits::{DebugInformationProvider, ProcessMemory, TargetProcess, ThreadControl};
use ghost_cov_common::{Error, ProcessKey, Result};
use std::ffi::c_void;
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    FlushInstructionCache, GetThreadContext, ReadProcessMemory, SetThreadContext,
    WriteProcessMemory, CONTEXT, CONTEXT_FLAGS,
};

#[cfg(target_arch = "x86_64")]
use windows::Win32::System::Diagnostics::Debug::{
    Wow64GetThreadContext, Wow64SetThreadContext, WOW64_CONTEXT, WOW64_CONTEXT_FLAGS,
};

#[cfg(target_arch = "x86_64")]
const CONTEXT_CONTROL: CONTEXT_FLAGS = CONTEXT_FLAGS(0x0010_0001);
#[cfg(target_arch = "x86")]
const CONTEXT_CONTROL: CONTEXT_FLAGS = CONTEXT_FLAGS(0x0001_0001);
#[cfg(target_arch = "x86_64")]
const WOW64_CONTEXT_CONTROL: WOW64_CONTEXT_FLAGS = WOW64_CONTEXT_FLAGS(0x0001_0001);

const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;

/// A process being debugged
///
/// The process handle belongs to the debug loop; the OS closes it once the
/// exit event has been continued.
pub struct WindowsProcess {
    pid: u32,
    handle: HANDLE,
    bitness: u32,
}

impl WindowsProcess {
    pub fn new(pid: u32, handle: HANDLE) -> Self {
        Self {
            pid,
            handle,
            bitness: native_bitness(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn bitness(&self) -> u32 {
        self.bitness
    }

    pub(crate) fn set_bitness(&mut self, bitness: u32) {
        self.bitness = bitness;
    }

    /// A 32-bit debuggee on a 64-bit debugger
    pub fn is_wow64(&self) -> bool {
        self.bitness != native_bitness()
    }

    fn read_u16(&self, address: u64) -> Result<u16> {
        let bytes = self.read(address, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Size and bitness of the image mapped at `base`, from its PE headers
    pub fn image_layout(&self, base: u64) -> Result<(u64, u32)> {
        let e_lfanew = self.read_u32(base + 0x3C)?;
        let nt_headers = base + u64::from(e_lfanew);

        let signature = self.read(nt_headers, 4)?;
        if signature != b"PE\0\0" {
            return Err(Error::MemoryAccess {
                address: nt_headers,
                message: "Invalid PE signature".into(),
            });
        }

        let bitness = match self.read_u16(nt_headers + 4)? {
            IMAGE_FILE_MACHINE_AMD64 => 64,
            IMAGE_FILE_MACHINE_I386 => 32,
            machine => {
                return Err(Error::NotSupported(format!(
                    "Unsupported image machine type 0x{:x}",
                    machine
                )))
            }
        };

        // SizeOfImage sits at the same offset in PE32 and PE32+ optional headers
        let size_of_image = self.read_u32(nt_headers + 0x18 + 0x38)?;
        Ok((u64::from(size_of_image), bitness))
    }
}

fn native_bitness() -> u32 {
    if cfg!(target_pointer_width = "64") {
        64
    } else {
        32
    }
}

impl ProcessMemory for WindowsProcess {
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        let mut bytes_read = 0usize;

        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                size,
                Some(&mut bytes_read),
            )
        }
        .map_err(|e| Error::MemoryAccess {
            address,
            message: format!("ReadProcessMemory failed: {}", e),
        })?;

        if bytes_read != size {
            return Err(Error::MemoryAccess {
                address,
                message: format!("Partial read: {} of {} bytes", bytes_read, size),
            });
        }
        Ok(buffer)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut bytes_written = 0usize;

        unsafe {
            WriteProcessMemory(
                self.handle,
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut bytes_written),
            )
        }
        .map_err(|e| Error::MemoryAccess {
            address,
            message: format!("WriteProcessMemory failed: {}", e),
        })?;

        if bytes_written != data.len() {
            return Err(Error::MemoryAccess {
                address,
                message: format!("Partial write: {} of {} bytes", bytes_written, data.len()),
            });
        }
        Ok(())
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) -> Result<()> {
        unsafe { FlushInstructionCache(self.handle, Some(address as *const c_void), size) }.map_err(
            |e| Error::MemoryAccess {
                address,
                message: format!("FlushInstructionCache failed: {}", e),
            },
        )
    }
}

impl TargetProcess for WindowsProcess {
    fn key(&self) -> ProcessKey {
        ProcessKey(u64::from(self.pid))
    }

    fn as_memory(&self) -> &dyn ProcessMemory {
        self
    }

    fn open_debug_information(&self) -> Result<Box<dyn DebugInformationProvider>> {
        Ok(Box::new(DbgHelpSymbols::new(self.handle)?))
    }
}

/// The thread that raised a debug event
pub struct WindowsThread {
    handle: HANDLE,
    #[cfg_attr(target_arch = "x86", allow(dead_code))]
    wow64: bool,
}

impl WindowsThread {
    pub fn new(handle: HANDLE, wow64: bool) -> Self {
        Self { handle, wow64 }
    }

    fn native_context(&self) -> Result<CONTEXT> {
        let mut context = CONTEXT {
            ContextFlags: CONTEXT_CONTROL,
            ..Default::default()
        };
        unsafe { GetThreadContext(self.handle, &mut context) }
            .map_err(|e| Error::Internal(format!("GetThreadContext failed: {}", e)))?;
        Ok(context)
    }

    fn set_native_context(&self, context: &CONTEXT) -> Result<()> {
        unsafe { SetThreadContext(self.handle, context) }
            .map_err(|e| Error::Internal(format!("SetThreadContext failed: {}", e)))
    }

    #[cfg(target_arch = "x86_64")]
    fn wow64_context(&self) -> Result<WOW64_CONTEXT> {
        let mut context = WOW64_CONTEXT {
            ContextFlags: WOW64_CONTEXT_CONTROL,
            ..Default::default()
        };
        unsafe { Wow64GetThreadContext(self.handle, &mut context) }
            .map_err(|e| Error::Internal(format!("Wow64GetThreadContext failed: {}", e)))?;
        Ok(context)
    }
}

#[cfg(target_arch = "x86_64")]
impl ThreadControl for WindowsThread {
    fn instruction_pointer(&self) -> Result<u64> {
        if self.wow64 {
            return Ok(u64::from(self.wow64_context()?.Eip));
        }
        Ok(self.native_context()?.Rip)
    }

    fn set_instruction_pointer(&self, value: u64) -> Result<()> {
        if self.wow64 {
            let mut context = self.wow64_context()?;
            context.Eip = u32::try_from(value).map_err(|_| {
                Error::Internal(format!("0x{:x} is not a 32-bit address", value))
            })?;
            return unsafe { Wow64SetThreadContext(self.handle, &context) }
                .map_err(|e| Error::Internal(format!("Wow64SetThreadContext failed: {}", e)));
        }

        let mut context = self.native_context()?;
        context.Rip = value;
        self.set_native_context(&context)
    }
}

#[cfg(target_arch = "x86")]
impl ThreadControl for WindowsThread {
    fn instruction_pointer(&self) -> Result<u64> {
        Ok(u64::from(self.native_context()?.Eip))
    }

    fn set_instruction_pointer(&self, value: u64) -> Result<()> {
        let mut context = self.native_context()?;
        context.Eip = u32::try_from(value)
            .map_err(|_| Error::Internal(format!("0x{:x} is not a 32-bit address", value)))?;
        self.set_native_context(&context)
    }
}
