//! Tracee for the ptrace engine tests.
//!
//! `--offset` prints where `swftrace_fixture_target` sits relative to the
//! image base, followed by the number of calls a normal run makes.
//!
//! A normal run calls the target only from a worker thread while another
//! thread keeps signalling the process, then exits with code 7.

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
mod tracee {
    use std::hint::black_box;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::anyhow;
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use nix::unistd::getpid;

    const CALLS: u32 = 200;
    const EXIT_CODE: i32 = 7;

    #[no_mangle]
    #[inline(never)]
    pub extern "C" fn swftrace_fixture_target(n: u32) -> u32 {
        black_box(n).wrapping_mul(3)
    }

    extern "C" fn on_usr1(_: nix::libc::c_int) {}

    pub fn print_offset() -> anyhow::Result<()> {
        let exe = std::env::current_exe()?;
        let maps = std::fs::read_to_string("/proc/self/maps")?;
        let base = swftrace::debug::linux::image_base(&maps, &exe)
            .ok_or_else(|| anyhow!("{} is not mapped", exe.display()))?;

        let address = swftrace_fixture_target as usize as u64;
        println!("{:#x} {}", address - base, CALLS);
        Ok(())
    }

    pub fn run() -> anyhow::Result<()> {
        let action = SigAction::new(SigHandler::Handler(on_usr1), SaFlags::SA_RESTART, SigSet::empty());
        // SAFETY: the handler touches nothing
        unsafe { signal::sigaction(Signal::SIGUSR1, &action) }?;

        let done = Arc::new(AtomicBool::new(false));
        let noise = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let pid = getpid();
                while !done.load(Ordering::Relaxed) {
                    let _ = signal::kill(pid, Signal::SIGUSR1);
                    thread::sleep(Duration::from_micros(100));
                }
            })
        };

        let worker = thread::spawn(|| {
            let mut acc = 0u32;
            for i in 0..CALLS {
                acc = acc.wrapping_add(swftrace_fixture_target(i));
                thread::sleep(Duration::from_micros(200));
            }
            acc
        });

        let acc = worker.join().map_err(|_| anyhow!("worker thread panicked"))?;
        done.store(true, Ordering::Relaxed);
        let _ = noise.join();

        black_box(acc);
        std::process::exit(EXIT_CODE)
    }
}

#[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
fn main() -> anyhow::Result<()> {
    match std::env::args().nth(1).as_deref() {
        Some("--offset") => tracee::print_offset(),
        _ => tracee::run(),
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64"))))]
fn main() {}
