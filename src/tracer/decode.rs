//! Breakpoint-hit decoding.
//!
//! These functions only look at a halted process through [`ProcessInspector`];
//! they hold no session state.

use std::fmt;

use thiserror::Error;

use crate::debug::{DebugError, ProcessInspector, Register};
use crate::tags;

/// Register holding the tag code at the tag-parse probe
pub const TAG_CODE_REGISTER: Register = Register::Eax;
/// Register holding the parser frame at the tag-parse probe
pub const FRAME_REGISTER: Register = Register::Ebp;
/// `[frame + 4]` is the position inside the tag data
pub const FRAME_POSITION_OFFSET: u64 = 4;

/// Decoding errors
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unknown tag code {code:#04x} at offset {offset:#010x}")]
    UnknownTag { code: u64, offset: u32 },

    #[error(transparent)]
    Engine(#[from] DebugError),
}

/// One parsed tag, as seen at the tag-parse probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEvent {
    /// Byte offset within the tag data being parsed
    pub offset: u32,
    /// Registry name of the tag
    pub name: &'static str,
    /// Numeric tag code
    pub code: u32,
}

impl fmt::Display for TagEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}: {} ({:02X})", self.offset, self.name, self.code)
    }
}

/// Decode the tag-parse probe from a halted process
pub fn decode_tag_event<P: ProcessInspector + ?Sized>(process: &P) -> Result<TagEvent, DecodeError> {
    let code = process.read_register(TAG_CODE_REGISTER)?;
    let frame = process.read_register(FRAME_REGISTER)?;
    let offset = process.read_u32(frame.wrapping_add(FRAME_POSITION_OFFSET))?;

    let unknown = DecodeError::UnknownTag { code, offset };
    let Some(code32) = u32::try_from(code).ok() else {
        return Err(unknown);
    };
    let name = tags::tag_name(code32).ok_or(unknown)?;

    Ok(TagEvent {
        offset,
        name,
        code: code32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Frozen register file plus a sparse memory image
    struct Halted {
        registers: HashMap<Register, u64>,
        memory: HashMap<u64, u8>,
    }

    impl Halted {
        fn new(code: u64, frame: u64, position: [u8; 4]) -> Self {
            let registers = HashMap::from([(Register::Eax, code), (Register::Ebp, frame)]);
            let memory = (0..4).map(|i| (frame + 4 + i, position[i as usize])).collect();
            Self { registers, memory }
        }
    }

    impl ProcessInspector for Halted {
        fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, DebugError> {
            (address..address + len as u64)
                .map(|a| {
                    self.memory.get(&a).copied().ok_or(DebugError::ReadFailed {
                        address: a,
                        reason: "unmapped".into(),
                    })
                })
                .collect()
        }

        fn read_register(&self, reg: Register) -> Result<u64, DebugError> {
            Ok(self.registers.get(&reg).copied().unwrap_or(0))
        }
    }

    #[test]
    fn test_decode_define_shape() {
        let halted = Halted::new(2, 0x0012_F000, [0x10, 0, 0, 0]);
        let event = decode_tag_event(&halted).unwrap();

        assert_eq!(event.code, 2);
        assert_eq!(event.name, "DefineShape");
        assert_eq!(event.offset, 0x10);
        assert_eq!(event.to_string(), "00000010: DefineShape (02)");
    }

    #[test]
    fn test_position_is_little_endian() {
        let halted = Halted::new(82, 0x1000, [0x78, 0x56, 0x34, 0x12]);
        let event = decode_tag_event(&halted).unwrap();
        assert_eq!(event.to_string(), "12345678: DoABC (52)");
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let halted = Halted::new(255, 0x1000, [0x10, 0, 0, 0]);
        match decode_tag_event(&halted) {
            Err(DecodeError::UnknownTag { code, offset }) => {
                assert_eq!(code, 255);
                assert_eq!(offset, 0x10);
            }
            other => panic!("expected UnknownTag, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_code_is_unknown() {
        // Low half alone would be DefineShape
        let halted = Halted::new(0x1_0000_0002, 0x1000, [0; 4]);
        assert!(matches!(
            decode_tag_event(&halted),
            Err(DecodeError::UnknownTag { code: 0x1_0000_0002, .. })
        ));
    }

    #[test]
    fn test_largest_u32_code_is_unknown() {
        let halted = Halted::new(u32::MAX as u64, 0x1000, [0; 4]);
        assert!(matches!(
            decode_tag_event(&halted),
            Err(DecodeError::UnknownTag { code, .. }) if code == u32::MAX as u64
        ));
    }

    #[test]
    fn test_unreadable_frame_is_an_engine_error() {
        let mut halted = Halted::new(2, 0x1000, [0; 4]);
        halted.memory.clear();
        assert!(matches!(
            decode_tag_event(&halted),
            Err(DecodeError::Engine(DebugError::ReadFailed { .. }))
        ));
    }
}
