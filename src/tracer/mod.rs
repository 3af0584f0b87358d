//! Tracer - Debug session lifecycle and breakpoint dispatch
//!
//! The session moves through:
//! `Created -> Spawning -> Running -> Tracing -> Terminated`
//!
//! Breakpoints are only placed once the engine reports process creation,
//! because the module base is unknown before that.

pub mod decode;

pub use decode::{decode_tag_event, DecodeError, TagEvent};

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::debug::{DebugEngine, DebugError, DebugEvent};
use crate::signature::{ProbeName, ResolvedBreakpoints};

/// Session-fatal errors
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to install {probe} breakpoint at {address:#x}: {source}")]
    Install {
        probe: ProbeName,
        address: u64,
        #[source]
        source: DebugError,
    },

    #[error(transparent)]
    Engine(#[from] DebugError),

    #[error("Failed to write trace output: {0}")]
    Output(#[from] io::Error),
}

/// Debug session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Created,
    Spawning,
    /// Process exists, module base not yet known
    Running,
    /// Base known, breakpoints installed
    Tracing,
    Terminated,
}

/// Which probe points the operator asked for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSelection(BTreeSet<ProbeName>);

impl ProbeSelection {
    pub fn from_flags(tags: bool, bytecode: bool) -> Self {
        let mut selected = BTreeSet::new();
        if tags {
            selected.insert(ProbeName::TagParseEntry);
        }
        if bytecode {
            selected.insert(ProbeName::BytecodeEntry);
        }
        Self(selected)
    }

    pub fn contains(&self, probe: ProbeName) -> bool {
        self.0.contains(&probe)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ProbeName> for ProbeSelection {
    fn from_iter<I: IntoIterator<Item = ProbeName>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a finished session saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub exit_code: i32,
    /// Tag lines written
    pub tags_emitted: u64,
    /// Hits that could not be decoded
    pub anomalies: u64,
    /// Bytecode probe hits
    pub bytecode_hits: u64,
}

/// Breakpoint tracer for one spawned target
pub struct Tracer<E: DebugEngine> {
    engine: E,
    target: PathBuf,
    resolved: ResolvedBreakpoints,
    selection: ProbeSelection,
    state: SessionState,
    base_address: Option<u64>,
    /// Absolute breakpoint address -> probe it belongs to
    installed: BTreeMap<u64, ProbeName>,
    summary: TraceSummary,
}

impl<E: DebugEngine> Tracer<E> {
    pub fn new(
        engine: E,
        target: impl Into<PathBuf>,
        resolved: ResolvedBreakpoints,
        selection: ProbeSelection,
    ) -> Self {
        Self {
            engine,
            target: target.into(),
            resolved,
            selection,
            state: SessionState::Created,
            base_address: None,
            installed: BTreeMap::new(),
            summary: TraceSummary::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Module base, once process creation has been observed
    pub fn base_address(&self) -> Option<u64> {
        self.base_address
    }

    /// Installed breakpoints, keyed by absolute address
    pub fn installed(&self) -> &BTreeMap<u64, ProbeName> {
        &self.installed
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Spawn the target and trace it until it exits.
    ///
    /// Tag lines go to `out` as they are decoded.
    pub fn run<W: Write>(&mut self, out: &mut W) -> Result<TraceSummary, TraceError> {
        self.state = SessionState::Spawning;
        self.engine.spawn(&self.target)?;
        self.state = SessionState::Running;

        loop {
            let event = self.engine.wait_for_event()?;
            log::trace!("Debug event: {:?}", event);

            match event {
                DebugEvent::ProcessCreated { base_address } => self.on_process_created(base_address)?,
                DebugEvent::BreakpointHit { address, .. } => self.on_breakpoint(address, out)?,
                DebugEvent::ProcessExited { exit_code } => {
                    log::info!("Process exited with code {}", exit_code);
                    self.state = SessionState::Terminated;
                    self.summary.exit_code = exit_code;
                    return Ok(self.summary.clone());
                }
                DebugEvent::Other(_) => {}
            }
        }
    }

    fn on_process_created(&mut self, base_address: u64) -> Result<(), TraceError> {
        if self.base_address.is_some() {
            log::warn!("Ignoring repeated process creation (base {:#x})", base_address);
            return Ok(());
        }

        log::info!("Module base at {:#x}", base_address);
        self.base_address = Some(base_address);

        let wanted: Vec<(ProbeName, u64)> = self
            .resolved
            .iter()
            .filter(|(probe, _)| self.selection.contains(*probe))
            .collect();

        for (probe, offset) in wanted {
            let address = base_address.wrapping_add(offset);
            self.engine
                .set_breakpoint(address)
                .map_err(|source| TraceError::Install {
                    probe,
                    address,
                    source,
                })?;
            log::info!("Breakpoint {} at {:#x} (base + {:#x})", probe, address, offset);
            self.installed.insert(address, probe);
        }

        if self.installed.is_empty() {
            log::info!("No probes enabled; process runs untraced");
        }
        self.state = SessionState::Tracing;
        Ok(())
    }

    fn on_breakpoint<W: Write>(&mut self, address: u64, out: &mut W) -> Result<(), TraceError> {
        match self.installed.get(&address) {
            Some(ProbeName::BytecodeEntry) => self.on_bytecode_entry(),
            Some(ProbeName::TagParseEntry) => self.on_tag_parse_entry(out),
            None => {
                log::trace!("Breakpoint at {:#x} is not ours", address);
                Ok(())
            }
        }
    }

    /// Hook for ActionScript 2 bytecode decoding; nothing is decoded here yet
    fn on_bytecode_entry(&mut self) -> Result<(), TraceError> {
        self.summary.bytecode_hits += 1;
        Ok(())
    }

    fn on_tag_parse_entry<W: Write>(&mut self, out: &mut W) -> Result<(), TraceError> {
        match decode_tag_event(&self.engine) {
            Ok(event) => {
                writeln!(out, "{}", event)?;
                out.flush()?;
                self.summary.tags_emitted += 1;
                Ok(())
            }
            Err(err @ DecodeError::UnknownTag { .. }) => {
                log::warn!("{}", err);
                self.summary.anomalies += 1;
                Ok(())
            }
            Err(DecodeError::Engine(err)) => Err(err.into()),
        }
    }
}
