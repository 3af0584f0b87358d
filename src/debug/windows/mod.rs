//! Windows-specific debugger implementation using Win32 Debug API.

mod context;

use super::types::{DebugError, DebugEvent, PendingSteps, Register, INT3};
use super::{DebugEngine, ProcessInspector};

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, NTSTATUS};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, FlushInstructionCache, ReadProcessMemory, WaitForDebugEvent,
    WriteProcessMemory, CREATE_PROCESS_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{
    CreateProcessW, DEBUG_ONLY_THIS_PROCESS, INFINITE, PROCESS_INFORMATION, STARTUPINFOW,
};

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x00010002i32);
const DBG_EXCEPTION_NOT_HANDLED: NTSTATUS = NTSTATUS(0x80010001u32 as i32);
const EXCEPTION_BREAKPOINT_CODE: u32 = 0x80000003;
const EXCEPTION_SINGLE_STEP_CODE: u32 = 0x80000004;
// Raised instead of the above for 32-bit code running under WOW64
const STATUS_WX86_BREAKPOINT: u32 = 0x4000001F;
const STATUS_WX86_SINGLE_STEP: u32 = 0x4000001E;

/// Windows debugger implementation
pub struct WindowsEngine {
    /// Debuggee process handle
    process: Option<HANDLE>,
    /// Debuggee process ID
    pid: u32,
    /// Thread that raised the last event
    last_thread_id: u32,
    /// Continue status owed for the last event
    pending_continue: Option<NTSTATUS>,
    /// Breakpoints lifted while their thread single-steps
    pending_steps: PendingSteps,
    /// Installed breakpoints and the bytes they replaced
    original_bytes: HashMap<u64, u8>,
}

impl WindowsEngine {
    /// Create a new Windows debugger instance
    pub fn new() -> Self {
        Self {
            process: None,
            pid: 0,
            last_thread_id: 0,
            pending_continue: None,
            pending_steps: PendingSteps::new(),
            original_bytes: HashMap::new(),
        }
    }

    fn process(&self) -> Result<HANDLE, DebugError> {
        self.process.ok_or(DebugError::NoProcess)
    }

    fn write_byte(&self, address: u64, byte: u8) -> Result<(), DebugError> {
        let process = self.process()?;
        let data = [byte];
        let mut written = 0usize;

        // SAFETY: writes one byte from a live local buffer into the debuggee
        unsafe {
            WriteProcessMemory(
                process,
                address as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut written),
            )
            .map_err(|e| DebugError::BreakpointError {
                address,
                reason: e.to_string(),
            })?;
            FlushInstructionCache(process, Some(address as *const c_void), data.len()).map_err(|e| {
                DebugError::BreakpointError {
                    address,
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(())
    }

    fn resume(&mut self) -> Result<(), DebugError> {
        if let Some(status) = self.pending_continue.take() {
            // SAFETY: continues the event most recently returned by WaitForDebugEvent
            unsafe {
                ContinueDebugEvent(self.pid, self.last_thread_id, status)
                    .map_err(|e| DebugError::EventError(format!("Continue failed: {:?}", e)))?;
            }
        }
        Ok(())
    }

    /// Turn an exception into an event, or `None` if it was internal bookkeeping
    fn on_exception(&mut self, code: u32, address: u64) -> Result<Option<DebugEvent>, DebugError> {
        match code {
            EXCEPTION_BREAKPOINT_CODE | STATUS_WX86_BREAKPOINT => {
                self.pending_continue = Some(DBG_CONTINUE);
                let Some(&original) = self.original_bytes.get(&address) else {
                    return Ok(Some(DebugEvent::Other(format!("breakpoint at {:#x}", address))));
                };

                // Put the real instruction back and step over it before re-arming
                self.write_byte(address, original)?;
                context::rewind_and_trap(self.last_thread_id, address)?;
                self.pending_steps.start(self.last_thread_id, address);

                Ok(Some(DebugEvent::BreakpointHit {
                    address,
                    thread_id: self.last_thread_id,
                }))
            }
            EXCEPTION_SINGLE_STEP_CODE | STATUS_WX86_SINGLE_STEP => {
                self.pending_continue = Some(DBG_CONTINUE);
                match self.pending_steps.finish(self.last_thread_id) {
                    Some(bp) => {
                        self.write_byte(bp, INT3)?;
                        Ok(None)
                    }
                    None if self.pending_steps.is_empty() => Ok(Some(DebugEvent::Other("single step".into()))),
                    // Another thread is still stepping over the same breakpoint
                    None => Ok(None),
                }
            }
            _ => {
                self.pending_continue = Some(DBG_EXCEPTION_NOT_HANDLED);
                Ok(Some(DebugEvent::Other(format!(
                    "exception {:#010x} at {:#x}",
                    code, address
                ))))
            }
        }
    }
}

impl Default for WindowsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for WindowsEngine {
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebugError> {
        let process = self.process()?;
        let mut buffer = vec![0u8; len];
        let mut bytes_read = 0usize;

        // SAFETY: buffer is valid for `len` bytes
        unsafe {
            ReadProcessMemory(
                process,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                Some(&mut bytes_read),
            )
            .map_err(|e| DebugError::ReadFailed {
                address,
                reason: e.to_string(),
            })?;
        }

        if bytes_read != len {
            return Err(DebugError::ShortRead {
                address,
                wanted: len,
                got: bytes_read,
            });
        }
        Ok(buffer)
    }

    fn read_register(&self, reg: Register) -> Result<u64, DebugError> {
        self.process()?;
        context::read_register(self.last_thread_id, reg)
    }
}

impl DebugEngine for WindowsEngine {
    fn spawn(&mut self, path: &Path) -> Result<(), DebugError> {
        let mut command_line: Vec<u16> = "\""
            .encode_utf16()
            .chain(path.as_os_str().encode_wide())
            .chain("\"".encode_utf16())
            .chain(std::iter::once(0))
            .collect();

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        log::info!("Spawning {}", path.display());

        // SAFETY: command_line is a writable NUL-terminated buffer that outlives the call
        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                DEBUG_ONLY_THIS_PROCESS,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
            .map_err(|e| DebugError::SpawnFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let _ = CloseHandle(info.hThread);
        }

        self.process = Some(info.hProcess);
        self.pid = info.dwProcessId;
        self.last_thread_id = info.dwThreadId;
        Ok(())
    }

    fn set_breakpoint(&mut self, address: u64) -> Result<(), DebugError> {
        if self.original_bytes.contains_key(&address) {
            return Ok(());
        }

        let original_byte = self
            .read_memory(address, 1)
            .map_err(|e| DebugError::BreakpointError {
                address,
                reason: e.to_string(),
            })?[0];
        self.write_byte(address, INT3)?;

        log::debug!("Breakpoint set at {:#x} (saved {:#04x})", address, original_byte);
        self.original_bytes.insert(address, original_byte);
        Ok(())
    }

    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError> {
        self.process()?;

        loop {
            self.resume()?;

            let mut debug_event = DEBUG_EVENT::default();
            // SAFETY: debug_event is a valid out-parameter
            unsafe {
                WaitForDebugEvent(&mut debug_event, INFINITE)
                    .map_err(|e| DebugError::EventError(format!("WaitForDebugEvent failed: {:?}", e)))?;
            }

            self.last_thread_id = debug_event.dwThreadId;
            self.pending_continue = Some(DBG_CONTINUE);

            let event = match debug_event.dwDebugEventCode {
                CREATE_PROCESS_DEBUG_EVENT => {
                    // SAFETY: union member matches the event code
                    let info = unsafe { debug_event.u.CreateProcessInfo };
                    if !info.hFile.is_invalid() {
                        // SAFETY: the debugger owns this file handle
                        unsafe {
                            let _ = CloseHandle(info.hFile);
                        }
                    }
                    Some(DebugEvent::ProcessCreated {
                        base_address: info.lpBaseOfImage as u64,
                    })
                }
                EXCEPTION_DEBUG_EVENT => {
                    // SAFETY: union member matches the event code
                    let record = unsafe { debug_event.u.Exception.ExceptionRecord };
                    self.on_exception(record.ExceptionCode.0 as u32, record.ExceptionAddress as u64)?
                }
                EXIT_PROCESS_DEBUG_EVENT => {
                    // SAFETY: union member matches the event code
                    let exit_code = unsafe { debug_event.u.ExitProcess.dwExitCode };
                    Some(DebugEvent::ProcessExited {
                        exit_code: exit_code as i32,
                    })
                }
                LOAD_DLL_DEBUG_EVENT => {
                    // SAFETY: union member matches the event code
                    let info = unsafe { debug_event.u.LoadDll };
                    if !info.hFile.is_invalid() {
                        // SAFETY: the debugger owns this file handle
                        unsafe {
                            let _ = CloseHandle(info.hFile);
                        }
                    }
                    Some(DebugEvent::Other(format!("dll loaded at {:#x}", info.lpBaseOfDll as u64)))
                }
                code => Some(DebugEvent::Other(format!("debug event {}", code.0))),
            };

            if let Some(event) = event {
                return Ok(event);
            }
        }
    }
}

impl Drop for WindowsEngine {
    fn drop(&mut self) {
        let _ = self.resume();
        if let Some(process) = self.process.take() {
            // SAFETY: handle came from CreateProcessW and is closed exactly once
            unsafe {
                let _ = CloseHandle(process);
            }
        }
    }
}
