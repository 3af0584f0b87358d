//! Common types for debugging functionality.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// x86 software breakpoint opcode
pub const INT3: u8 = 0xCC;

/// Engine-level errors; all of them are fatal to a session
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Failed to spawn {path}: {reason}")]
    SpawnFailed { path: String, reason: String },

    #[error("Breakpoint error at {address:#x}: {reason}")]
    BreakpointError { address: u64, reason: String },

    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Short read at {address:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        address: u64,
        wanted: usize,
        got: usize,
    },

    #[error("Failed to read register {register}: {reason}")]
    RegisterError { register: Register, reason: String },

    #[error("Debug event error: {0}")]
    EventError(String),

    #[error("No process is being debugged")]
    NoProcess,
}

/// Debug event received from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Target image mapped; `base_address` is where the main module loaded
    ProcessCreated { base_address: u64 },
    /// Execution reached a breakpoint; `address` is the breakpoint itself
    BreakpointHit { address: u64, thread_id: u32 },
    /// Process exited
    ProcessExited { exit_code: i32 },
    /// Anything the tracer has no use for
    Other(String),
}

/// General-purpose registers of the 32-bit target
///
/// Each backend maps these onto its own register storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Eax => "eax",
            Register::Ebx => "ebx",
            Register::Ecx => "ecx",
            Register::Edx => "edx",
            Register::Esi => "esi",
            Register::Edi => "edi",
            Register::Ebp => "ebp",
            Register::Esp => "esp",
            Register::Eip => "eip",
        };
        f.write_str(name)
    }
}

/// Breakpoints lifted for a single step, keyed by the stepping thread
///
/// Several threads can be parked on the same breakpoint at once. The INT3
/// goes back only when the last of them has stepped past it.
#[derive(Debug, Default)]
pub struct PendingSteps {
    by_thread: HashMap<u32, u64>,
}

impl PendingSteps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `thread_id` is stepping over the breakpoint at `address`
    pub fn start(&mut self, thread_id: u32, address: u64) {
        self.by_thread.insert(thread_id, address);
    }

    /// `thread_id` finished its step; returns the address to re-arm, if any
    pub fn finish(&mut self, thread_id: u32) -> Option<u64> {
        let address = self.by_thread.remove(&thread_id)?;
        if self.by_thread.values().any(|&other| other == address) {
            return None;
        }
        Some(address)
    }

    /// Whether `thread_id` has a step in flight
    pub fn is_stepping(&self, thread_id: u32) -> bool {
        self.by_thread.contains_key(&thread_id)
    }

    pub fn is_empty(&self) -> bool {
        self.by_thread.is_empty()
    }
}
