//! PtraceEngine against a real multi-threaded tracee
//!
//! Run with: cargo test --test ptrace_engine

#![cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

use swftrace::debug::linux::PtraceEngine;
use swftrace::debug::{DebugEngine, DebugError, DebugEvent, ProcessInspector, Register};

const FIXTURE: &str = env!("CARGO_BIN_EXE_swftrace-fixture");
const FIXTURE_EXIT_CODE: i32 = 7;

/// Offset of the traced function from the image base, and how often a run calls it
fn fixture_layout() -> (u64, u32) {
    let output = Command::new(FIXTURE).arg("--offset").output().expect("run fixture");
    assert!(output.status.success(), "fixture --offset failed: {:?}", output.status);

    let text = String::from_utf8(output.stdout).expect("utf-8 output");
    let (offset, calls) = text.trim().split_once(' ').expect("offset and call count");
    let offset = u64::from_str_radix(offset.trim_start_matches("0x"), 16).expect("hex offset");
    (offset, calls.parse().expect("call count"))
}

fn spawn(engine: &mut PtraceEngine) -> u64 {
    engine.spawn(Path::new(FIXTURE)).expect("spawn fixture");
    match engine.wait_for_event().expect("creation event") {
        DebugEvent::ProcessCreated { base_address } => base_address,
        other => panic!("expected ProcessCreated, got {other:?}"),
    }
}

#[test]
fn test_untraced_run_reports_exit_code() {
    let mut engine = PtraceEngine::new();
    spawn(&mut engine);

    let exit_code = loop {
        match engine.wait_for_event().expect("debug event") {
            DebugEvent::ProcessExited { exit_code } => break exit_code,
            DebugEvent::BreakpointHit { address, .. } => panic!("unexpected hit at {address:#x}"),
            _ => {}
        }
    };
    assert_eq!(exit_code, FIXTURE_EXIT_CODE);
}

#[test]
fn test_breakpoint_patches_int3() {
    let (offset, _) = fixture_layout();
    let mut engine = PtraceEngine::new();
    let address = spawn(&mut engine) + offset;

    let original = engine.read_memory(address, 1).expect("read code");
    assert_ne!(original, [0xCC]);

    engine.set_breakpoint(address).expect("set breakpoint");
    assert_eq!(engine.read_memory(address, 1).expect("read code"), [0xCC]);
}

#[test]
fn test_breakpoint_in_worker_thread_under_signals() {
    let (offset, calls) = fixture_layout();
    let mut engine = PtraceEngine::new();
    let address = spawn(&mut engine) + offset;
    engine.set_breakpoint(address).expect("set breakpoint");

    let mut hits = 0u32;
    let mut threads = HashSet::new();
    let exit_code = loop {
        match engine.wait_for_event().expect("debug event") {
            DebugEvent::BreakpointHit { address: hit, thread_id } => {
                assert_eq!(hit, address);
                assert_eq!(engine.read_register(Register::Eip).unwrap(), address);

                // First argument of the n-th call is n; a replayed hit would repeat it
                #[cfg(target_arch = "x86_64")]
                assert_eq!(
                    engine.read_register(Register::Edi).unwrap() & 0xFFFF_FFFF,
                    hits as u64,
                    "hit {hits} read the wrong argument"
                );

                threads.insert(thread_id);
                hits += 1;
            }
            DebugEvent::ProcessExited { exit_code } => break exit_code,
            _ => {}
        }
    };

    assert_eq!((hits, exit_code), (calls, FIXTURE_EXIT_CODE));
    assert_eq!(threads.len(), 1, "all calls come from the one worker thread");
}

#[test]
fn test_spawn_missing_file_fails() {
    let mut engine = PtraceEngine::new();
    assert!(matches!(
        engine.spawn(Path::new("/nonexistent/flashplayer")),
        Err(DebugError::SpawnFailed { .. })
    ));
    assert!(matches!(engine.wait_for_event(), Err(DebugError::NoProcess)));
}
