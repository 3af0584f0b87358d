//! swftrace - Flash Player tag tracer
//!
//! Fingerprints a Flash Player build from byte signatures in its executable,
//! then runs it under a debugger and prints every SWF tag the player parses.

pub mod debug;
pub mod signature;
pub mod tags;
pub mod tracer;
