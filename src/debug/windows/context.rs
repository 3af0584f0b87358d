//! Thread context access for the 32-bit target.
//!
//! On a 64-bit host the player runs under WOW64, so its x86 register file is
//! reached through the Wow64 context calls.

use super::super::types::{DebugError, Register};

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Threading::{OpenThread, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT};

#[cfg(target_arch = "x86_64")]
use windows::Win32::System::Diagnostics::Debug::{
    Wow64GetThreadContext as get_thread_context, Wow64SetThreadContext as set_thread_context,
    WOW64_CONTEXT as ThreadContext, WOW64_CONTEXT_FULL as CONTEXT_FULL,
};

#[cfg(target_arch = "x86")]
use windows::Win32::System::Diagnostics::Debug::{
    GetThreadContext as get_thread_context, SetThreadContext as set_thread_context,
    CONTEXT as ThreadContext, CONTEXT_FULL_X86 as CONTEXT_FULL,
};

/// x86 trap flag in EFLAGS
const TRAP_FLAG: u32 = 0x100;

/// Open thread handle, closed on drop
struct ThreadHandle(HANDLE);

impl ThreadHandle {
    fn open(thread_id: u32) -> Result<Self, String> {
        // SAFETY: plain Win32 call; the handle is owned by the returned guard
        unsafe {
            OpenThread(THREAD_GET_CONTEXT | THREAD_SET_CONTEXT, false, thread_id)
                .map(Self)
                .map_err(|e| format!("OpenThread({}) failed: {:?}", thread_id, e))
        }
    }

    fn context(&self) -> Result<ThreadContext, String> {
        let mut ctx = ThreadContext {
            ContextFlags: CONTEXT_FULL,
            ..Default::default()
        };
        // SAFETY: ctx is a valid, writable context structure
        unsafe {
            get_thread_context(self.0, &mut ctx)
                .map_err(|e| format!("GetThreadContext failed: {:?}", e))?;
        }
        Ok(ctx)
    }

    fn set_context(&self, ctx: &ThreadContext) -> Result<(), String> {
        // SAFETY: ctx was obtained from the same thread and only EIP/EFLAGS changed
        unsafe {
            set_thread_context(self.0, ctx).map_err(|e| format!("SetThreadContext failed: {:?}", e))
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // SAFETY: handle came from OpenThread and is closed exactly once
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Read one register of a halted thread
pub fn read_register(thread_id: u32, reg: Register) -> Result<u64, DebugError> {
    let to_err = |reason: String| DebugError::RegisterError { register: reg, reason };
    let ctx = ThreadHandle::open(thread_id).and_then(|t| t.context()).map_err(to_err)?;

    let value = match reg {
        Register::Eax => ctx.Eax,
        Register::Ebx => ctx.Ebx,
        Register::Ecx => ctx.Ecx,
        Register::Edx => ctx.Edx,
        Register::Esi => ctx.Esi,
        Register::Edi => ctx.Edi,
        Register::Ebp => ctx.Ebp,
        Register::Esp => ctx.Esp,
        Register::Eip => ctx.Eip,
    };
    Ok(value as u64)
}

/// Rewind a thread onto `address` and arm a single step
pub fn rewind_and_trap(thread_id: u32, address: u64) -> Result<(), DebugError> {
    let to_err = |reason: String| DebugError::BreakpointError { address, reason };
    let thread = ThreadHandle::open(thread_id).map_err(to_err)?;
    let mut ctx = thread.context().map_err(to_err)?;

    ctx.Eip = address as u32;
    ctx.EFlags |= TRAP_FLAG;
    thread.set_context(&ctx).map_err(to_err)
}
