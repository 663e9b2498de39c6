//! Single-byte software breakpoints in a debuggee
//!
//! Stateless. Callers own install/remove symmetry: the registry decides
//! which original byte goes back where.

use crate::traits::{ProcessMemory, ThreadControl};
use ghost_cov_common::{Error, Result};

/// INT3 opcode for software breakpoints
pub const INT3: u8 = 0xCC;

/// Width of the trap instruction, the amount the IP is past the trap when it fires
pub const TRAP_INSTRUCTION_SIZE: u64 = 1;

fn memory_error(address: u64, action: &str, source: Error) -> Error {
    match source {
        Error::MemoryAccess { .. } => source,
        other => Error::MemoryAccess {
            address,
            message: format!("{}: {}", action, other),
        },
    }
}

/// Patch a trap at `address` and return the byte it replaced
pub fn install(memory: &dyn ProcessMemory, address: u64) -> Result<u8> {
    let original = memory
        .read(address, 1)
        .map_err(|e| memory_error(address, "read original byte", e))?;
    let original = *original.first().ok_or_else(|| Error::MemoryAccess {
        address,
        message: "empty read".to_string(),
    })?;

    memory
        .write(address, &[INT3])
        .map_err(|e| memory_error(address, "write trap", e))?;
    memory
        .flush_instruction_cache(address, 1)
        .map_err(|e| memory_error(address, "flush instruction cache", e))?;

    tracing::trace!(
        target: "ghost_cov_core::breakpoint",
        addr = format!("0x{:x}", address),
        original = format!("0x{:02x}", original),
        "Trap installed"
    );
    Ok(original)
}

/// Put `original` back at `address`
pub fn remove(memory: &dyn ProcessMemory, address: u64, original: u8) -> Result<()> {
    memory
        .write(address, &[original])
        .map_err(|e| memory_error(address, "restore original byte", e))?;
    memory
        .flush_instruction_cache(address, 1)
        .map_err(|e| memory_error(address, "flush instruction cache", e))?;

    tracing::trace!(
        target: "ghost_cov_core::breakpoint",
        addr = format!("0x{:x}", address),
        "Trap removed"
    );
    Ok(())
}

/// Rewind the thread so the restored instruction executes next
pub fn adjust_instruction_pointer_after_trap(thread: &dyn ThreadControl) -> Result<()> {
    let ip = thread.instruction_pointer()?;
    thread.set_instruction_pointer(ip.wrapping_sub(TRAP_INSTRUCTION_SIZE))
}
