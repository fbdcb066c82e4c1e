//! Code buffer for building stub code.
//!
//! This module provides a buffer for incrementally building machine code
//! before copying it to executable memory. Branch targets are expressed as
//! [`Label`]s which are bound to offsets as emission proceeds and resolved
//! in a single pass once the stub body is complete.

use std::fmt;

/// A branch target inside a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Kind of immediate field a label reference occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// B / BL: imm26 at bits 25:0, in instructions.
    Branch26,
    /// B.cond / CBZ / CBNZ: imm19 at bits 23:5, in instructions.
    Branch19,
    /// TBZ / TBNZ: imm14 at bits 18:5, in instructions.
    Branch14,
    /// ADR: imm21 split into immlo (30:29) and immhi (23:5), in bytes.
    Adr21,
}

impl ReferenceKind {
    /// Encode `delta` (target minus reference offset, in bytes) into `inst`.
    /// Returns `None` if the delta does not fit the field.
    pub fn encode(self, inst: u32, delta: i64) -> Option<u32> {
        match self {
            ReferenceKind::Branch26 => {
                let imm = in_range(delta / 4, 26)?;
                Some((inst & 0xFC00_0000) | (imm & 0x03FF_FFFF))
            }
            ReferenceKind::Branch19 => {
                let imm = in_range(delta / 4, 19)?;
                Some((inst & 0xFF00_001F) | ((imm & 0x7FFFF) << 5))
            }
            ReferenceKind::Branch14 => {
                let imm = in_range(delta / 4, 14)?;
                Some((inst & 0xFFF8_001F) | ((imm & 0x3FFF) << 5))
            }
            ReferenceKind::Adr21 => {
                let imm = in_range(delta, 21)?;
                let immlo = imm & 0x3;
                let immhi = (imm >> 2) & 0x7FFFF;
                Some((inst & 0x9F00_001F) | (immlo << 29) | (immhi << 5))
            }
        }
    }

    /// Decode the byte delta stored in `inst`.
    pub fn decode(self, inst: u32) -> i64 {
        match self {
            ReferenceKind::Branch26 => sign_extend(inst & 0x03FF_FFFF, 26) * 4,
            ReferenceKind::Branch19 => sign_extend((inst >> 5) & 0x7FFFF, 19) * 4,
            ReferenceKind::Branch14 => sign_extend((inst >> 5) & 0x3FFF, 14) * 4,
            ReferenceKind::Adr21 => {
                let immlo = (inst >> 29) & 0x3;
                let immhi = (inst >> 5) & 0x7FFFF;
                sign_extend((immhi << 2) | immlo, 21)
            }
        }
    }
}

fn in_range(value: i64, bits: u32) -> Option<u32> {
    let limit = 1i64 << (bits - 1);
    if (-limit..limit).contains(&value) {
        Some(value as u32)
    } else {
        None
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Error raised while resolving label references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeBufferError {
    /// A branch references a label that was never bound.
    UnboundLabel { label: Label, at: usize },
    /// A bound label is too far away for the referencing instruction.
    BranchOutOfRange { label: Label, at: usize },
}

impl fmt::Display for CodeBufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeBufferError::UnboundLabel { label, at } => {
                write!(f, "label {} referenced at {:#x} was never bound", label.0, at)
            }
            CodeBufferError::BranchOutOfRange { label, at } => {
                write!(f, "branch at {:#x} cannot reach label {}", at, label.0)
            }
        }
    }
}

impl std::error::Error for CodeBufferError {}

/// A buffer for building machine code.
pub struct CodeBuffer {
    /// The code bytes
    code: Vec<u8>,
    /// Bound offset of each label, `None` while unbound
    labels: Vec<Option<usize>>,
    /// Pending label references (instruction offset, label, field kind)
    references: Vec<(usize, Label, ReferenceKind)>,
}

impl CodeBuffer {
    /// Create a new empty code buffer.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Create a new code buffer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset (for labels).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Create a fresh, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position.
    ///
    /// # Panics
    /// Binding the same label twice is an emitter bug and panics.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(self.code.len());
    }

    /// Emit `inst` with its immediate field left blank; the field is
    /// filled in by [`CodeBuffer::resolve_labels`].
    pub fn emit_label_ref(&mut self, inst: u32, label: Label, kind: ReferenceKind) {
        self.references.push((self.code.len(), label, kind));
        self.emit_u32(inst);
    }

    /// Patch every pending label reference.
    pub fn resolve_labels(&mut self) -> Result<(), CodeBufferError> {
        for (at, label, kind) in self.references.drain(..) {
            let target = self.labels[label.0].ok_or(CodeBufferError::UnboundLabel { label, at })?;
            let current = read_u32(&self.code, at);
            let delta = target as i64 - at as i64;
            let patched = kind
                .encode(current, delta)
                .ok_or(CodeBufferError::BranchOutOfRange { label, at })?;
            self.code[at..at + 4].copy_from_slice(&patched.to_le_bytes());
        }
        Ok(())
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Read the instruction word at `offset`.
    pub fn word_at(&self, offset: usize) -> u32 {
        read_u32(&self.code, offset)
    }

    /// Consume the buffer and return the raw code bytes.
    /// Note: This does not resolve labels - call `resolve_labels` first.
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(code: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        code[offset],
        code[offset + 1],
        code[offset + 2],
        code[offset + 3],
    ])
}
