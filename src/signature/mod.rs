//! Signature module - Build fingerprinting for the target player.
//!
//! Provides:
//! - The static catalog of known builds and their probe points
//! - Byte-signature matching of an on-disk image against that catalog

pub mod catalog;
pub mod resolver;

pub use catalog::{BuildDescriptor, ProbeName, ProbePoint, CATALOG};
pub use resolver::{identify, identify_bytes, ResolveError, ResolvedBreakpoints, TargetImage};
