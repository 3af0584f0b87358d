//! Signature Catalog - Known player builds and their probe points
//!
//! Each probe point pairs a file offset (where the fingerprint bytes live on
//! disk) with a memory offset relative to the module base (where the
//! breakpoint goes at runtime). The two are supplied per build; they are not
//! derivable from one another.

use std::fmt;

/// Logical locations of interest inside the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProbeName {
    /// Entry of the ActionScript 2 bytecode interpreter
    BytecodeEntry,
    /// Point in the tag parser right after the tag code has been read
    TagParseEntry,
}

impl ProbeName {
    pub const ALL: [ProbeName; 2] = [ProbeName::BytecodeEntry, ProbeName::TagParseEntry];

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeName::BytecodeEntry => "bytecode-entry",
            ProbeName::TagParseEntry => "tag-parse-entry",
        }
    }
}

impl fmt::Display for ProbeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One instruction location, described in both address spaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePoint {
    /// Byte offset into the executable on disk
    pub file_offset: u64,
    /// Bytes expected at `file_offset`
    pub pattern: &'static [u8],
    /// Offset relative to the loaded module base
    pub memory_offset: u64,
}

impl ProbePoint {
    /// Check the pattern against a file image. Short images never match.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.bytes_at(data) == Some(self.pattern)
    }

    /// Slice of `data` covered by this probe, if the image is long enough
    pub fn bytes_at<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        let start = usize::try_from(self.file_offset).ok()?;
        let end = start.checked_add(self.pattern.len())?;
        data.get(start..end)
    }
}

/// The full fingerprint of one build
#[derive(Debug, Clone, Copy)]
pub struct BuildDescriptor {
    /// Human-readable build identifier
    pub name: &'static str,
    /// Named probe points; all of them must match
    pub probes: &'static [(ProbeName, ProbePoint)],
}

impl BuildDescriptor {
    /// Find a probe point by name
    pub fn probe(&self, name: ProbeName) -> Option<&ProbePoint> {
        self.probes
            .iter()
            .find(|(probe, _)| *probe == name)
            .map(|(_, point)| point)
    }
}

/// Known builds, checked in this order
pub static CATALOG: &[BuildDescriptor] = &[BuildDescriptor {
    name: "Flash Player 10.1.85.3",
    probes: &[
        (
            ProbeName::BytecodeEntry,
            ProbePoint {
                file_offset: 0xB7655,
                pattern: &[0x40, 0x88, 0x54, 0x24],
                memory_offset: 0xB8252,
            },
        ),
        (
            ProbeName::TagParseEntry,
            ProbePoint {
                file_offset: 0xEE71B,
                pattern: &[0x8B, 0xF8, 0x83, 0xFF],
                memory_offset: 0xEF31B,
            },
        ),
    ],
}];

/// Find a build descriptor by name
pub fn find_build(name: &str) -> Option<&'static BuildDescriptor> {
    CATALOG.iter().find(|build| build.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_well_formed() {
        assert!(!CATALOG.is_empty());
        for build in CATALOG {
            for name in ProbeName::ALL {
                let probe = build
                    .probe(name)
                    .unwrap_or_else(|| panic!("{} is missing {}", build.name, name));
                assert_eq!(probe.pattern.len(), 4);
            }
        }
    }

    #[test]
    fn test_find_build() {
        let build = find_build("Flash Player 10.1.85.3").unwrap();
        let tags = build.probe(ProbeName::TagParseEntry).unwrap();
        assert_eq!(tags.memory_offset, 0xEF31B);
        assert!(find_build("Flash Player 9.0.0.0").is_none());
    }

    #[test]
    fn test_probe_bounds() {
        let probe = ProbePoint {
            file_offset: 4,
            pattern: &[0xAA, 0xBB],
            memory_offset: 0,
        };
        assert!(probe.matches(&[0, 0, 0, 0, 0xAA, 0xBB]));
        // One byte short of the end of the pattern
        assert!(!probe.matches(&[0, 0, 0, 0, 0xAA]));
        assert!(!probe.matches(&[]));
        assert!(!probe.matches(&[0, 0, 0, 0, 0xAA, 0xBC]));
    }
}
