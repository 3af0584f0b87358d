//! Version Resolver - Match an executable image against the catalog
//!
//! Reads the target once and checks every probe point of every known build.
//! The first build whose probes all match wins; its memory offsets become the
//! breakpoint table for the session.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::catalog::{BuildDescriptor, ProbeName, CATALOG};

/// Resolver errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Memory offsets of a matched build, keyed by probe name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBreakpoints {
    /// Name of the matched build
    pub build: &'static str,
    offsets: BTreeMap<ProbeName, u64>,
}

impl ResolvedBreakpoints {
    fn from_descriptor(build: &BuildDescriptor) -> Self {
        let offsets = build
            .probes
            .iter()
            .map(|(name, point)| (*name, point.memory_offset))
            .collect();

        Self {
            build: build.name,
            offsets,
        }
    }

    /// Module-relative offset of a probe, if this build defines it
    pub fn offset(&self, name: ProbeName) -> Option<u64> {
        self.offsets.get(&name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProbeName, u64)> + '_ {
        self.offsets.iter().map(|(name, offset)| (*name, *offset))
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Container format of the target, as far as goblin can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    Pe { is_64bit: bool },
    Elf { is_64bit: bool },
    MachO,
    Unknown,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = |is_64bit: bool| if is_64bit { "64-bit" } else { "32-bit" };
        match self {
            ImageFormat::Pe { is_64bit } => write!(f, "{} PE", bits(*is_64bit)),
            ImageFormat::Elf { is_64bit } => write!(f, "{} ELF", bits(*is_64bit)),
            ImageFormat::MachO => f.write_str("Mach-O"),
            ImageFormat::Unknown => f.write_str("unknown format"),
        }
    }
}

/// The on-disk image of the target, read once
#[derive(Debug)]
pub struct TargetImage {
    /// Original file path
    pub path: PathBuf,
    /// Raw bytes of the file
    pub data: Vec<u8>,
}

impl TargetImage {
    /// Read the whole file into memory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ResolveError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path).map_err(|source| ResolveError::Io {
            path: path.clone(),
            source,
        })?;
        log::debug!("Read {} bytes from {}", data.len(), path.display());
        Ok(Self { path, data })
    }

    /// Best-effort description of the container; never affects matching
    pub fn format(&self) -> ImageFormat {
        match goblin::Object::parse(&self.data) {
            Ok(goblin::Object::PE(pe)) => ImageFormat::Pe { is_64bit: pe.is_64 },
            Ok(goblin::Object::Elf(elf)) => ImageFormat::Elf {
                is_64bit: elf.is_64,
            },
            Ok(goblin::Object::Mach(_)) => ImageFormat::MachO,
            _ => ImageFormat::Unknown,
        }
    }

    /// Match this image against the built-in catalog
    pub fn resolve(&self) -> Option<ResolvedBreakpoints> {
        identify_in(CATALOG, &self.data)
    }
}

/// Identify the build of the executable at `path`.
///
/// `Ok(None)` means the file was read but matches no known build.
pub fn identify<P: AsRef<Path>>(path: P) -> Result<Option<ResolvedBreakpoints>, ResolveError> {
    Ok(TargetImage::load(path)?.resolve())
}

/// Identify a build from an in-memory image
pub fn identify_bytes(data: &[u8]) -> Option<ResolvedBreakpoints> {
    identify_in(CATALOG, data)
}

/// Match `data` against an arbitrary catalog, first full match wins
pub fn identify_in(catalog: &[BuildDescriptor], data: &[u8]) -> Option<ResolvedBreakpoints> {
    catalog
        .iter()
        .find(|build| build_matches(build, data))
        .map(ResolvedBreakpoints::from_descriptor)
}

fn build_matches(build: &BuildDescriptor, data: &[u8]) -> bool {
    build.probes.iter().all(|(name, point)| {
        let found = point.bytes_at(data);
        let matched = found == Some(point.pattern);
        log::debug!(
            "{} / {} @ {:#x}: expected {}, found {}",
            build.name,
            name,
            point.file_offset,
            hex::encode(point.pattern),
            found.map(hex::encode).unwrap_or_else(|| "<eof>".into()),
        );
        matched
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::catalog::ProbePoint;

    /// A zero-filled image with every probe of `build` stamped in place
    fn stamp(build: &BuildDescriptor, padding: usize) -> Vec<u8> {
        let end = build
            .probes
            .iter()
            .map(|(_, p)| p.file_offset as usize + p.pattern.len())
            .max()
            .unwrap();
        let mut data = vec![0u8; end + padding];
        for (_, probe) in build.probes {
            let start = probe.file_offset as usize;
            data[start..start + probe.pattern.len()].copy_from_slice(probe.pattern);
        }
        data
    }

    #[test]
    fn test_exact_match_returns_memory_offsets() {
        let data = stamp(&CATALOG[0], 128);
        let resolved = identify_bytes(&data).expect("build should be recognized");

        assert_eq!(resolved.build, "Flash Player 10.1.85.3");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved.offset(ProbeName::BytecodeEntry), Some(0xB8252));
        assert_eq!(resolved.offset(ProbeName::TagParseEntry), Some(0xEF31B));
    }

    #[test]
    fn test_match_ending_at_eof() {
        let data = stamp(&CATALOG[0], 0);
        assert!(identify_bytes(&data).is_some());
    }

    #[test]
    fn test_single_byte_difference_rejects() {
        for (_, probe) in CATALOG[0].probes {
            for i in 0..probe.pattern.len() {
                let mut data = stamp(&CATALOG[0], 16);
                data[probe.file_offset as usize + i] ^= 0xFF;
                assert!(identify_bytes(&data).is_none());
            }
        }
    }

    #[test]
    fn test_short_files_are_unrecognized() {
        let full = stamp(&CATALOG[0], 0);
        for len in [0, 1, 0xB7655, 0xB7659, 0xEE71B, full.len() - 1] {
            assert!(identify_bytes(&full[..len]).is_none(), "len {len:#x}");
        }
    }

    #[test]
    fn test_first_full_match_wins() {
        static CATALOG_UNDER_TEST: &[BuildDescriptor] = &[
            BuildDescriptor {
                name: "needs more",
                probes: &[
                    (
                        ProbeName::TagParseEntry,
                        ProbePoint {
                            file_offset: 0,
                            pattern: &[1, 2],
                            memory_offset: 0x10,
                        },
                    ),
                    (
                        ProbeName::BytecodeEntry,
                        ProbePoint {
                            file_offset: 2,
                            pattern: &[9, 9],
                            memory_offset: 0x20,
                        },
                    ),
                ],
            },
            BuildDescriptor {
                name: "first",
                probes: &[(
                    ProbeName::TagParseEntry,
                    ProbePoint {
                        file_offset: 0,
                        pattern: &[1, 2],
                        memory_offset: 0x100,
                    },
                )],
            },
            BuildDescriptor {
                name: "second",
                probes: &[(
                    ProbeName::TagParseEntry,
                    ProbePoint {
                        file_offset: 2,
                        pattern: &[3, 4],
                        memory_offset: 0x200,
                    },
                )],
            },
        ];

        let resolved = identify_in(CATALOG_UNDER_TEST, &[1, 2, 3, 4]).unwrap();
        assert_eq!(resolved.build, "first");
        assert_eq!(resolved.offset(ProbeName::TagParseEntry), Some(0x100));
        assert_eq!(resolved.offset(ProbeName::BytecodeEntry), None);
    }

    #[test]
    fn test_identify_from_file_is_idempotent() {
        let path = std::env::temp_dir().join(format!("swftrace-resolver-{}.bin", std::process::id()));
        fs::write(&path, stamp(&CATALOG[0], 64)).unwrap();

        let first = identify(&path).unwrap();
        let second = identify(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("swftrace-definitely-missing.exe");
        match identify(&path) {
            Err(ResolveError::Io { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected an I/O error, got {other:?}"),
        }
    }

    #[test]
    fn test_format_of_garbage_is_unknown() {
        let image = TargetImage {
            path: PathBuf::from("garbage.bin"),
            data: vec![0u8; 64],
        };
        assert_eq!(image.format(), ImageFormat::Unknown);
    }
}
