//! Debug module - The process-control boundary of the tracer.
//!
//! The tracer only needs a narrow slice of a debugger:
//! - Spawn a target under debug control
//! - Place software breakpoints at absolute addresses
//! - Block for the next debug event
//! - Read registers and memory of the halted target

pub mod types;

#[cfg(all(target_os = "windows", any(target_arch = "x86", target_arch = "x86_64")))]
pub mod windows;

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub mod linux;

#[cfg(all(target_os = "windows", any(target_arch = "x86", target_arch = "x86_64")))]
pub use windows::WindowsEngine as PlatformEngine;

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
pub use linux::PtraceEngine as PlatformEngine;

pub use types::{DebugError, DebugEvent, PendingSteps, Register};

use std::path::Path;

/// Read-only view of a halted process
pub trait ProcessInspector {
    /// Read `len` bytes of target memory at an absolute address
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebugError>;

    /// Read a general-purpose register of the thread that raised the last event
    fn read_register(&self, reg: Register) -> Result<u64, DebugError>;

    /// Read a little-endian u32 from target memory
    fn read_u32(&self, address: u64) -> Result<u32, DebugError> {
        let data = self.read_memory(address, 4)?;
        let bytes: [u8; 4] = data
            .as_slice()
            .try_into()
            .map_err(|_| DebugError::ShortRead {
                address,
                wanted: 4,
                got: data.len(),
            })?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Platform-agnostic debugging engine
///
/// A thread halted by an event stays halted until the next call to
/// [`DebugEngine::wait_for_event`], so everything read between two waits
/// observes the same stopped state.
pub trait DebugEngine: ProcessInspector {
    /// Start `path` as a new process under debug control
    fn spawn(&mut self, path: &Path) -> Result<(), DebugError>;

    /// Set a software breakpoint at an absolute address
    fn set_breakpoint(&mut self, address: u64) -> Result<(), DebugError>;

    /// Resume the halted target and block until its next debug event
    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError>;
}
