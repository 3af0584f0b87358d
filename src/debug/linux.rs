//! Linux debugging engine built on ptrace (nix).
//!
//! Every thread of the target is traced (`PTRACE_O_TRACECLONE`), so a
//! breakpoint may fire in any of them. Target memory is accessed through
//! `/proc/<pid>/mem`, which the tracer may read and write even on read-only
//! text pages.

use super::types::{DebugError, DebugEvent, Register, INT3};
use super::{DebugEngine, ProcessInspector};

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};

/// A thread we reported to the caller and still hold stopped
#[derive(Debug, Clone, Copy)]
struct Stop {
    tid: Pid,
    /// Breakpoint the thread is parked on
    breakpoint: Option<u64>,
}

/// Result of stepping a thread over a lifted breakpoint
enum StepOutcome {
    /// Instruction executed; the signal (if any) arrived meanwhile and is still owed
    Stepped(Option<Signal>),
    /// Thread or whole process went away during the step
    Gone,
}

/// ptrace-backed engine for a single spawned target
pub struct PtraceEngine {
    /// Thread group leader, `None` before spawn and after exit
    pid: Option<Pid>,
    /// Handle on `/proc/<pid>/mem`
    mem: Option<File>,
    /// Canonical path of the spawned image
    image_path: Option<PathBuf>,
    /// Installed breakpoints and the bytes they replaced
    original_bytes: HashMap<u64, u8>,
    /// Every live traced thread
    threads: HashSet<Pid>,
    /// Clones whose initial SIGSTOP has not been seen yet
    fresh_threads: HashSet<Pid>,
    /// Thread that raised the last reported event
    stopped: Option<Stop>,
    /// Events produced without resuming the target
    queued: VecDeque<DebugEvent>,
}

impl PtraceEngine {
    pub fn new() -> Self {
        Self {
            pid: None,
            mem: None,
            image_path: None,
            original_bytes: HashMap::new(),
            threads: HashSet::new(),
            fresh_threads: HashSet::new(),
            stopped: None,
            queued: VecDeque::new(),
        }
    }

    fn pid(&self) -> Result<Pid, DebugError> {
        self.pid.ok_or(DebugError::NoProcess)
    }

    /// Thread whose registers `read_register` reports
    fn current_tid(&self) -> Result<Pid, DebugError> {
        match self.stopped {
            Some(stop) => Ok(stop.tid),
            None => self.pid(),
        }
    }

    fn mem(&self) -> Result<&File, DebugError> {
        self.mem.as_ref().ok_or(DebugError::NoProcess)
    }

    fn write_byte(&self, address: u64, byte: u8) -> Result<(), DebugError> {
        let to_err = |e: std::io::Error| DebugError::BreakpointError {
            address,
            reason: e.to_string(),
        };
        let mut mem = self.mem()?;
        mem.seek(SeekFrom::Start(address)).map_err(to_err)?;
        mem.write_all(&[byte]).map_err(to_err)
    }

    fn module_base(&self, pid: Pid) -> Result<u64, DebugError> {
        let image = self.image_path.as_deref().ok_or(DebugError::NoProcess)?;
        let maps = fs::read_to_string(format!("/proc/{}/maps", pid))
            .map_err(|e| DebugError::EventError(format!("Failed to read memory map: {}", e)))?;

        image_base(&maps, image).ok_or_else(|| {
            DebugError::EventError(format!("{} is not mapped in process {}", image.display(), pid))
        })
    }

    fn cont(&self, tid: Pid, sig: Option<Signal>) -> Result<(), DebugError> {
        ptrace::cont(tid, sig)
            .map_err(|e| DebugError::EventError(format!("Continue of thread {} failed: {}", tid, e)))
    }

    /// Wait on our own tracees only, never on children of other threads
    fn wait(&self, tid: Option<Pid>) -> Result<WaitStatus, DebugError> {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD;
        let status = waitpid(tid, Some(flags)).map_err(|e| DebugError::EventError(e.to_string()))?;
        log::trace!("waitpid: {:?}", status);
        Ok(status)
    }

    fn on_clone(&mut self, parent: Pid) -> Result<(), DebugError> {
        let raw = ptrace::getevent(parent)
            .map_err(|e| DebugError::EventError(format!("Failed to read clone event: {}", e)))?;
        let child = Pid::from_raw(raw as i32);
        // The child's initial stop may already have been seen
        if self.threads.insert(child) {
            self.fresh_threads.insert(child);
        }
        log::debug!("Thread {} created by {}", child, parent);
        Ok(())
    }

    /// A thread ended; returns the process exit event if it was the leader
    fn on_thread_exit(&mut self, tid: Pid, exit_code: i32) -> Option<DebugEvent> {
        self.threads.remove(&tid);
        self.fresh_threads.remove(&tid);
        if Some(tid) != self.pid {
            log::debug!("Thread {} exited", tid);
            return None;
        }

        self.pid = None;
        self.mem = None;
        self.stopped = None;
        self.threads.clear();
        Some(DebugEvent::ProcessExited { exit_code })
    }

    /// Move a thread past the breakpoint it is parked on and re-arm it.
    ///
    /// Signals arriving before the instruction has executed are held back, so
    /// the thread never re-enters the breakpoint it is leaving.
    fn step_over(&mut self, tid: Pid, address: u64) -> Result<StepOutcome, DebugError> {
        let original = self
            .original_bytes
            .get(&address)
            .copied()
            .ok_or_else(|| DebugError::BreakpointError {
                address,
                reason: "not an installed breakpoint".into(),
            })?;

        // Other threads can run past the breakpoint while it is lifted
        self.write_byte(address, original)?;

        let mut held = None;
        loop {
            ptrace::step(tid, None).map_err(|e| DebugError::EventError(format!("Single step failed: {}", e)))?;

            match self.wait(Some(tid))? {
                WaitStatus::Exited(_, code) => return self.step_ended(tid, address, code),
                WaitStatus::Signaled(_, sig, _) => return self.step_ended(tid, address, 128 + sig as i32),
                WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
                WaitStatus::Stopped(_, sig) => {
                    log::trace!("Holding {} until thread {} leaves {:#x}", sig, tid, address);
                    held.get_or_insert(sig);
                }
                WaitStatus::PtraceEvent(_, _, event) if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 => {
                    self.on_clone(tid)?;
                }
                status => {
                    log::trace!("Unexpected status while stepping: {:?}", status);
                    break;
                }
            }
        }

        self.write_byte(address, INT3)?;
        Ok(StepOutcome::Stepped(held))
    }

    fn step_ended(&mut self, tid: Pid, address: u64, exit_code: i32) -> Result<StepOutcome, DebugError> {
        if let Some(event) = self.on_thread_exit(tid, exit_code) {
            self.queued.push_back(event);
        } else {
            self.write_byte(address, INT3)?;
        }
        Ok(StepOutcome::Gone)
    }

    /// Let the thread held by the last reported event run again
    fn resume(&mut self) -> Result<(), DebugError> {
        let Some(stop) = self.stopped.take() else {
            return Ok(());
        };

        let signal = match stop.breakpoint {
            Some(address) => match self.step_over(stop.tid, address)? {
                StepOutcome::Stepped(held) => held,
                StepOutcome::Gone => return Ok(()),
            },
            None => None,
        };
        self.cont(stop.tid, signal)
    }

    /// Handle one wait status; `None` means it was absorbed internally
    fn translate(&mut self, status: WaitStatus) -> Result<Option<DebugEvent>, DebugError> {
        let event = match status {
            WaitStatus::Exited(tid, code) => self.on_thread_exit(tid, code),
            WaitStatus::Signaled(tid, sig, _) => self.on_thread_exit(tid, 128 + sig as i32),
            WaitStatus::PtraceEvent(tid, _, event) => {
                if event == ptrace::Event::PTRACE_EVENT_CLONE as i32 {
                    self.on_clone(tid)?;
                }
                self.cont(tid, None)?;
                None
            }
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                let mut regs = ptrace::getregs(tid)
                    .map_err(|e| DebugError::EventError(format!("Failed to read registers: {}", e)))?;
                let address = arch::pc(&regs).wrapping_sub(1);

                if self.original_bytes.contains_key(&address) {
                    arch::set_pc(&mut regs, address);
                    ptrace::setregs(tid, regs).map_err(|e| DebugError::BreakpointError {
                        address,
                        reason: e.to_string(),
                    })?;
                    self.stopped = Some(Stop {
                        tid,
                        breakpoint: Some(address),
                    });
                    Some(DebugEvent::BreakpointHit {
                        address,
                        thread_id: tid.as_raw() as u32,
                    })
                } else {
                    log::trace!("Stray SIGTRAP in thread {}", tid);
                    self.cont(tid, None)?;
                    None
                }
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP)
                if self.fresh_threads.remove(&tid) || !self.threads.contains(&tid) =>
            {
                // Initial stop of a freshly cloned thread
                self.threads.insert(tid);
                self.cont(tid, None)?;
                None
            }
            WaitStatus::Stopped(tid, sig) => {
                log::trace!("Forwarding {} to thread {}", sig, tid);
                self.cont(tid, Some(sig))?;
                None
            }
            status => {
                log::trace!("Ignoring wait status {:?}", status);
                None
            }
        };
        Ok(event)
    }
}

impl Default for PtraceEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowest start address of `image` in a `/proc/<pid>/maps` listing
///
/// The pathname is everything after the fifth field and may contain spaces.
pub fn image_base(maps: &str, image: &Path) -> Option<u64> {
    maps.lines()
        .filter_map(|line| {
            let mut rest = line;
            let mut range = "";
            for i in 0..5 {
                let (field, tail) = rest.trim_start().split_once(' ')?;
                if i == 0 {
                    range = field;
                }
                rest = tail;
            }
            (Path::new(rest.trim_start()) == image).then_some(range)
        })
        .filter_map(|range| {
            let start = range.split('-').next()?;
            u64::from_str_radix(start, 16).ok()
        })
        .min()
}

impl ProcessInspector for PtraceEngine {
    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebugError> {
        let to_err = |e: std::io::Error| DebugError::ReadFailed {
            address,
            reason: e.to_string(),
        };
        let mut mem = self.mem()?;
        let mut buffer = vec![0u8; len];
        mem.seek(SeekFrom::Start(address)).map_err(to_err)?;
        mem.read_exact(&mut buffer).map_err(to_err)?;
        Ok(buffer)
    }

    fn read_register(&self, reg: Register) -> Result<u64, DebugError> {
        let regs = ptrace::getregs(self.current_tid()?).map_err(|e| DebugError::RegisterError {
            register: reg,
            reason: e.to_string(),
        })?;
        Ok(arch::register(&regs, reg))
    }
}

impl DebugEngine for PtraceEngine {
    fn spawn(&mut self, path: &Path) -> Result<(), DebugError> {
        let spawn_err = |reason: String| DebugError::SpawnFailed {
            path: path.display().to_string(),
            reason,
        };

        let image = path.canonicalize().map_err(|e| spawn_err(e.to_string()))?;
        let program = CString::new(image.to_string_lossy().as_bytes()).map_err(|e| spawn_err(e.to_string()))?;

        log::info!("Spawning {}", image.display());

        // SAFETY: the child only calls traceme/execv before replacing itself
        match unsafe { fork() }.map_err(|e| spawn_err(e.to_string()))? {
            ForkResult::Child => {
                if ptrace::traceme().is_ok() {
                    let _ = execv(&program, &[&program]);
                }
                // SAFETY: exec failed, leave without running parent cleanup
                unsafe { nix::libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                // The child stops with SIGTRAP once exec has mapped the image
                match waitpid(child, None).map_err(|e| spawn_err(e.to_string()))? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                    status => return Err(spawn_err(format!("unexpected status after exec: {:?}", status))),
                }

                ptrace::setoptions(
                    child,
                    ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACECLONE,
                )
                .map_err(|e| spawn_err(e.to_string()))?;

                let mem = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(format!("/proc/{}/mem", child))
                    .map_err(|e| spawn_err(e.to_string()))?;

                self.pid = Some(child);
                self.mem = Some(mem);
                self.image_path = Some(image);
                self.threads.insert(child);
                self.stopped = Some(Stop {
                    tid: child,
                    breakpoint: None,
                });

                let base_address = self.module_base(child)?;
                log::debug!("Process {} created, image base {:#x}", child, base_address);
                self.queued.push_back(DebugEvent::ProcessCreated { base_address });
                Ok(())
            }
        }
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
        if let Some(event) = self.queued.pop_front() {
            return Ok(event);
        }

        self.resume()?;

        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(event);
            }
            self.pid()?;

            let status = self.wait(None)?;
            if let Some(event) = self.translate(status)? {
                return Ok(event);
            }
        }
    }
}

impl Drop for PtraceEngine {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Register;
    use nix::libc::user_regs_struct;

    pub fn pc(regs: &user_regs_struct) -> u64 {
        regs.rip
    }

    pub fn set_pc(regs: &mut user_regs_struct, address: u64) {
        regs.rip = address;
    }

    pub fn register(regs: &user_regs_struct, reg: Register) -> u64 {
        match reg {
            Register::Eax => regs.rax,
            Register::Ebx => regs.rbx,
            Register::Ecx => regs.rcx,
            Register::Edx => regs.rdx,
            Register::Esi => regs.rsi,
            Register::Edi => regs.rdi,
            Register::Ebp => regs.rbp,
            Register::Esp => regs.rsp,
            Register::Eip => regs.rip,
        }
    }
}

#[cfg(target_arch = "x86")]
mod arch {
    use super::Register;
    use nix::libc::user_regs_struct;

    pub fn pc(regs: &user_regs_struct) -> u64 {
        regs.eip as u32 as u64
    }

    pub fn set_pc(regs: &mut user_regs_struct, address: u64) {
        regs.eip = address as u32 as _;
    }

    pub fn register(regs: &user_regs_struct, reg: Register) -> u64 {
        let value = match reg {
            Register::Eax => regs.eax,
            Register::Ebx => regs.ebx,
            Register::Ecx => regs.ecx,
            Register::Edx => regs.edx,
            Register::Esi => regs.esi,
            Register::Edi => regs.edi,
            Register::Ebp => regs.ebp,
            Register::Esp => regs.esp,
            Register::Eip => regs.eip,
        };
        value as u32 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c4a00000-55d0c4a02000 r--p 00000000 08:01 1311 /opt/flash player/flashplayer
55d0c4a02000-55d0c4a08000 r-xp 00002000 08:01 1311 /opt/flash player/flashplayer
55d0c4a08000-55d0c4a0a000 r--p 00008000 08:01 1311 /opt/flash player/flashplayer
55d0c5e3c000-55d0c5e5d000 rw-p 00000000 00:00 0                          [heap]
7f1a2b000000-7f1a2b028000 r--p 00000000 08:01 2048                       /usr/lib/libc.so.6
7ffd9a1de000-7ffd9a1ff000 rw-p 00000000 00:00 0                          [stack]
7ffd9a3f0000-7ffd9a3f2000 r-xp 00000000 00:00 0
";

    #[test]
    fn test_image_base_with_spaces_in_path() {
        let image = Path::new("/opt/flash player/flashplayer");
        assert_eq!(image_base(MAPS, image), Some(0x55d0c4a00000));
    }

    #[test]
    fn test_image_base_takes_lowest_mapping() {
        // Same mappings listed out of order
        let shuffled: String = MAPS.lines().rev().map(|l| format!("{l}\n")).collect();
        let image = Path::new("/opt/flash player/flashplayer");
        assert_eq!(image_base(&shuffled, image), Some(0x55d0c4a00000));
    }

    #[test]
    fn test_image_base_padded_pathname() {
        assert_eq!(
            image_base(MAPS, Path::new("/usr/lib/libc.so.6")),
            Some(0x7f1a2b000000)
        );
    }

    #[test]
    fn test_image_base_missing_image() {
        assert_eq!(image_base(MAPS, Path::new("/opt/flash")), None);
        assert_eq!(image_base(MAPS, Path::new("/opt/flash player/flash")), None);
        assert_eq!(image_base("", Path::new("/opt/flash player/flashplayer")), None);
    }
}
