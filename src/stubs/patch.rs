//! Runtime switching of record-write barrier modes.
//!
//! Every barrier stub starts with a three-word header:
//!
//! ```text
//! 0: mode slot   nop | b incremental | b compaction
//! 4: adr xzr, incremental
//! 8: adr xzr, compaction
//! ```
//!
//! The `adr` words never affect execution (they write the zero register)
//! but record where the two incremental bodies start, so the mode slot can
//! be decoded and rewritten without any side table. Switching modes touches
//! the slot word only.

use std::fmt;

use crate::jit::aarch64::{NOP, decode_adr, decode_b, encode_b};
use crate::jit::{ExecutableMemory, MemoryError};

use super::GeneratedStub;
use crate::gc::marking::MarkingPhase;

pub const MODE_SLOT_OFFSET: usize = 0;
pub const INCREMENTAL_TARGET_OFFSET: usize = 4;
pub const COMPACTION_TARGET_OFFSET: usize = 8;

/// Words in the barrier header.
pub const HEADER_WORDS: usize = 3;

/// Active behavior of a record-write barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    StoreBufferOnly,
    Incremental,
    IncrementalCompaction,
}

impl Mode {
    pub const ALL: [Mode; 3] = [
        Mode::StoreBufferOnly,
        Mode::Incremental,
        Mode::IncrementalCompaction,
    ];

    /// Barrier mode required while the collector is in `phase`.
    pub fn for_phase(phase: MarkingPhase) -> Mode {
        match phase {
            MarkingPhase::Idle => Mode::StoreBufferOnly,
            MarkingPhase::Marking => Mode::Incremental,
            MarkingPhase::MarkingWithCompaction => Mode::IncrementalCompaction,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::StoreBufferOnly => "store-buffer-only",
            Mode::Incremental => "incremental",
            Mode::IncrementalCompaction => "incremental-compaction",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown barrier mode '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// The code is too short to hold a barrier header.
    SlotOutOfBounds { offset: usize, len: usize },
    /// The header does not hold a known mode encoding.
    UnrecognizedModeSlot(u32),
    Memory(MemoryError),
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::SlotOutOfBounds { offset, len } => {
                write!(f, "mode slot at {} is outside {} bytes of code", offset, len)
            }
            PatchError::UnrecognizedModeSlot(word) => {
                write!(f, "unrecognized mode slot contents {:#010x}", word)
            }
            PatchError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<MemoryError> for PatchError {
    fn from(e: MemoryError) -> Self {
        PatchError::Memory(e)
    }
}

/// Code whose instruction words can be read and replaced one at a time.
pub trait PatchableCode {
    fn code_len(&self) -> usize;

    /// Word at a 4-aligned offset, or `None` if it is out of bounds.
    fn read_word(&self, offset: usize) -> Option<u32>;

    /// Replace the word at a 4-aligned offset as one indivisible write.
    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError>;
}

impl PatchableCode for [u8] {
    fn code_len(&self) -> usize {
        self.len()
    }

    fn read_word(&self, offset: usize) -> Option<u32> {
        let bytes = self.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError> {
        let len = self.len();
        let bytes = offset
            .checked_add(4)
            .and_then(|end| self.get_mut(offset..end))
            .ok_or(PatchError::SlotOutOfBounds { offset, len })?;
        bytes.copy_from_slice(&word.to_le_bytes());
        Ok(())
    }
}

impl PatchableCode for Vec<u8> {
    fn code_len(&self) -> usize {
        self.as_slice().code_len()
    }

    fn read_word(&self, offset: usize) -> Option<u32> {
        self.as_slice().read_word(offset)
    }

    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError> {
        self.as_mut_slice().replace_word(offset, word)
    }
}

impl PatchableCode for ExecutableMemory {
    fn code_len(&self) -> usize {
        self.len()
    }

    fn read_word(&self, offset: usize) -> Option<u32> {
        ExecutableMemory::read_word(self, offset).ok()
    }

    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError> {
        Ok(self.patch_word(offset, word)?)
    }
}

/// Shared handle to installed code. Patching through it is safe while other
/// threads execute the same code.
impl PatchableCode for &ExecutableMemory {
    fn code_len(&self) -> usize {
        self.len()
    }

    fn read_word(&self, offset: usize) -> Option<u32> {
        ExecutableMemory::read_word(self, offset).ok()
    }

    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError> {
        Ok(self.patch_word(offset, word)?)
    }
}

impl PatchableCode for GeneratedStub {
    fn code_len(&self) -> usize {
        self.code.len()
    }

    fn read_word(&self, offset: usize) -> Option<u32> {
        self.code.read_word(offset)
    }

    fn replace_word(&mut self, offset: usize, word: u32) -> Result<(), PatchError> {
        self.code.replace_word(offset, word)
    }
}

fn word<C: PatchableCode + ?Sized>(code: &C, offset: usize) -> Result<u32, PatchError> {
    code.read_word(offset).ok_or(PatchError::SlotOutOfBounds {
        offset,
        len: code.code_len(),
    })
}

/// Byte offset of the code an `adr xzr, label` header word points at.
fn recorded_target<C: PatchableCode + ?Sized>(
    code: &C,
    offset: usize,
) -> Result<usize, PatchError> {
    let inst = word(code, offset)?;
    match decode_adr(inst) {
        Some((31, delta)) if offset as i64 + delta >= 0 => Ok((offset as i64 + delta) as usize),
        _ => Err(PatchError::UnrecognizedModeSlot(inst)),
    }
}

/// Read the active mode of a barrier.
pub fn get_mode<C: PatchableCode + ?Sized>(code: &C) -> Result<Mode, PatchError> {
    let slot = word(code, MODE_SLOT_OFFSET)?;
    if slot == NOP {
        return Ok(Mode::StoreBufferOnly);
    }
    let Some(delta) = decode_b(slot) else {
        return Err(PatchError::UnrecognizedModeSlot(slot));
    };
    let target = MODE_SLOT_OFFSET as i64 + delta;
    if target == recorded_target(code, INCREMENTAL_TARGET_OFFSET)? as i64 {
        Ok(Mode::Incremental)
    } else if target == recorded_target(code, COMPACTION_TARGET_OFFSET)? as i64 {
        Ok(Mode::IncrementalCompaction)
    } else {
        Err(PatchError::UnrecognizedModeSlot(slot))
    }
}

/// Instruction the mode slot holds in `mode`.
pub fn mode_slot_word<C: PatchableCode + ?Sized>(code: &C, mode: Mode) -> Result<u32, PatchError> {
    let target = match mode {
        Mode::StoreBufferOnly => return Ok(NOP),
        Mode::Incremental => recorded_target(code, INCREMENTAL_TARGET_OFFSET)?,
        Mode::IncrementalCompaction => recorded_target(code, COMPACTION_TARGET_OFFSET)?,
    };
    encode_b(MODE_SLOT_OFFSET, target).ok_or(PatchError::SlotOutOfBounds {
        offset: target,
        len: code.code_len(),
    })
}

/// Switch a barrier to `mode`, returning the mode it was in.
///
/// Only the mode slot word is written, and only when it changes.
pub fn patch<C: PatchableCode + ?Sized>(code: &mut C, mode: Mode) -> Result<Mode, PatchError> {
    let previous = get_mode(&*code)?;
    if previous != mode {
        let slot = mode_slot_word(&*code, mode)?;
        code.replace_word(MODE_SLOT_OFFSET, slot)?;
    }
    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::{AArch64Assembler, CodeBuffer, Reg};

    /// Header followed by two marked bodies.
    fn barrier_shaped_code() -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        let incremental = asm.new_label();
        let compaction = asm.new_label();
        asm.nop();
        asm.adr(Reg::XZR, incremental);
        asm.adr(Reg::XZR, compaction);
        asm.ret();
        asm.bind(incremental);
        asm.ret();
        asm.bind(compaction);
        asm.ret();
        buf.resolve_labels().unwrap();
        buf.into_code()
    }

    #[test]
    fn test_fresh_code_is_store_buffer_only() {
        let code = barrier_shaped_code();
        assert_eq!(get_mode(code.as_slice()).unwrap(), Mode::StoreBufferOnly);
    }

    #[test]
    fn test_patch_every_transition() {
        let mut code = barrier_shaped_code();
        let original = code.clone();

        for from in Mode::ALL {
            for to in Mode::ALL {
                patch(&mut code, from).unwrap();
                assert_eq!(patch(&mut code, to).unwrap(), from);
                assert_eq!(get_mode(&code).unwrap(), to);
                assert_eq!(code.len(), original.len());
                assert_eq!(code[4..], original[4..]);
            }
        }
    }

    #[test]
    fn test_slot_targets_bodies() {
        let mut code = barrier_shaped_code();
        patch(&mut code, Mode::Incremental).unwrap();
        assert_eq!(decode_b(code.read_word(0).unwrap()), Some(16));
        patch(&mut code, Mode::IncrementalCompaction).unwrap();
        assert_eq!(decode_b(code.read_word(0).unwrap()), Some(20));
    }

    #[test]
    fn test_rejects_foreign_code() {
        let mut code = barrier_shaped_code();
        code.replace_word(0, 0xD65F03C0).unwrap();
        assert_eq!(get_mode(&code), Err(PatchError::UnrecognizedModeSlot(0xD65F03C0)));

        // A branch that lands on neither body
        let stray = encode_b(0, 12).unwrap();
        code.replace_word(0, stray).unwrap();
        assert_eq!(get_mode(&code), Err(PatchError::UnrecognizedModeSlot(stray)));

        let short = [0u8; 2];
        assert!(matches!(
            get_mode(&short[..]),
            Err(PatchError::SlotOutOfBounds { offset: 0, len: 2 })
        ));
    }

    #[test]
    fn test_patch_executable_memory() {
        let code = barrier_shaped_code();
        let mut memory = ExecutableMemory::new_patchable(code.len()).unwrap();
        memory.write(0, &code).unwrap();
        let mut handle = &memory;

        patch(&mut handle, Mode::IncrementalCompaction).unwrap();
        assert_eq!(get_mode(&memory).unwrap(), Mode::IncrementalCompaction);
        assert_eq!(memory.to_vec()[4..], code[4..]);
    }
}
