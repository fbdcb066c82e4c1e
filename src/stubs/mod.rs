//! Code stubs: small machine-code routines shared by every call site that
//! needs them and identified by an integer key.
//!
//! Two kinds exist. The record-write stub is the write barrier run after a
//! heap store; its behavior is switched between three modes by patching one
//! instruction. The name-dictionary lookup stub probes a property
//! dictionary out of line when the inline probes emitted by
//! [`dictionary::generate_negative_lookup`] could not decide.

pub mod dictionary;
pub mod key;
pub mod patch;
pub mod record_write;
pub mod registers;

use std::fmt;

use crate::config::StubConfig;
use crate::jit::{CodeBufferError, ExecutableMemory, MemoryError, Reg};
use crate::trace;

use dictionary::{LookupMode, NameDictionaryLookupStub};
use patch::{Mode, PatchError, PatchableCode};
use record_write::RecordWriteStub;
use registers::RegisterRole;

/// Bits of a stub key that name the stub kind.
pub const MAJOR_KEY_BITS: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    InvalidRegister { role: RegisterRole, code: u8 },
    AliasedRegisters { reg: Reg },
    ReservedRegister { role: RegisterRole, reg: Reg },
    /// Fewer than two allocatable registers remain for scratch use.
    InsufficientScratch,
    InvalidKey(u32),
    InvalidConfig(String),
    CodeBuffer(CodeBufferError),
    Memory(MemoryError),
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubError::InvalidRegister { role, code } => {
                write!(f, "{} register index {} is out of range", role, code)
            }
            StubError::AliasedRegisters { reg } => {
                write!(f, "register {:?} is used for more than one operand", reg)
            }
            StubError::ReservedRegister { role, reg } => {
                write!(f, "{} register {:?} is reserved", role, reg)
            }
            StubError::InsufficientScratch => {
                write!(f, "not enough allocatable registers for scratch use")
            }
            StubError::InvalidKey(key) => write!(f, "invalid stub key {:#x}", key),
            StubError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            StubError::CodeBuffer(e) => write!(f, "{}", e),
            StubError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StubError {}

impl From<CodeBufferError> for StubError {
    fn from(e: CodeBufferError) -> Self {
        StubError::CodeBuffer(e)
    }
}

impl From<MemoryError> for StubError {
    fn from(e: MemoryError) -> Self {
        StubError::Memory(e)
    }
}

/// Reject configurations whose offsets or bit indices cannot be encoded.
pub(crate) fn check_config(config: &StubConfig) -> Result<(), StubError> {
    config.validate().map_err(StubError::InvalidConfig)
}

/// Stub kind, stored in the low bits of the full key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MajorKey {
    RecordWrite = 1,
    NameDictionaryLookup = 2,
}

impl MajorKey {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MajorKey::RecordWrite),
            2 => Some(MajorKey::NameDictionaryLookup),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MajorKey::RecordWrite => "RecordWriteStub",
            MajorKey::NameDictionaryLookup => "NameDictionaryLookupStub",
        }
    }
}

/// Combine a stub kind with its minor key.
pub fn full_key(major: MajorKey, minor: u32) -> Result<u32, StubError> {
    if minor >> (32 - MAJOR_KEY_BITS) != 0 {
        return Err(StubError::InvalidKey(minor));
    }
    Ok(major as u32 | (minor << MAJOR_KEY_BITS))
}

/// Split a full key into kind and minor key.
pub fn split_key(key: u32) -> Result<(MajorKey, u32), StubError> {
    let major = MajorKey::from_u32(key & ((1 << MAJOR_KEY_BITS) - 1))
        .ok_or(StubError::InvalidKey(key))?;
    Ok((major, key >> MAJOR_KEY_BITS))
}

/// Machine code produced by a stub, not yet installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedStub {
    pub kind: MajorKey,
    pub key: u32,
    pub code: Vec<u8>,
}

impl GeneratedStub {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn words(&self) -> Vec<u32> {
        self.code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Copy the code into executable memory. Barrier stubs stay patchable.
    pub fn install(&self) -> Result<ExecutableMemory, StubError> {
        let patchable = self.kind == MajorKey::RecordWrite;
        Ok(ExecutableMemory::from_code(&self.code, patchable)?)
    }
}

/// Every stub kind the generator knows.
#[derive(Debug, Clone)]
pub enum CodeStub {
    RecordWrite(RecordWriteStub),
    NameDictionaryLookup(NameDictionaryLookupStub),
}

impl CodeStub {
    /// Rebuild a stub from its full key.
    pub fn from_key(config: &StubConfig, key: u32) -> Result<Self, StubError> {
        let (major, minor) = split_key(key)?;
        let stub = match major {
            MajorKey::RecordWrite => {
                CodeStub::RecordWrite(RecordWriteStub::from_minor_key(config, minor)?)
            }
            MajorKey::NameDictionaryLookup => {
                let mode = LookupMode::from_minor_key(minor).ok_or(StubError::InvalidKey(key))?;
                CodeStub::NameDictionaryLookup(NameDictionaryLookupStub::new(config, mode)?)
            }
        };
        Ok(stub)
    }

    pub fn major_key(&self) -> MajorKey {
        match self {
            CodeStub::RecordWrite(_) => MajorKey::RecordWrite,
            CodeStub::NameDictionaryLookup(_) => MajorKey::NameDictionaryLookup,
        }
    }

    pub fn minor_key(&self) -> u32 {
        match self {
            CodeStub::RecordWrite(stub) => stub.minor_key(),
            CodeStub::NameDictionaryLookup(stub) => stub.minor_key(),
        }
    }

    pub fn key(&self) -> u32 {
        // Both minor keys are narrower than the space left by the major key.
        self.major_key() as u32 | (self.minor_key() << MAJOR_KEY_BITS)
    }

    pub fn name(&self) -> &'static str {
        self.major_key().name()
    }

    pub fn generate(&self) -> Result<GeneratedStub, StubError> {
        let (code, trace_enabled) = match self {
            CodeStub::RecordWrite(stub) => (stub.generate()?, stub.trace_enabled()),
            CodeStub::NameDictionaryLookup(stub) => (stub.generate()?, stub.trace_enabled()),
        };
        trace::stub_generated(trace_enabled, self.name(), self.key(), code.len());
        Ok(GeneratedStub {
            kind: self.major_key(),
            key: self.key(),
            code,
        })
    }

    pub fn needs_immovable_code(&self) -> bool {
        false
    }

    pub fn sometimes_sets_up_frame(&self) -> bool {
        false
    }

    /// Bring freshly generated code in line with the collector's current
    /// state. Only barriers carry state.
    pub fn activate<C: PatchableCode + ?Sized>(
        &self,
        code: &mut C,
        mode: Mode,
    ) -> Result<(), PatchError> {
        match self {
            CodeStub::RecordWrite(stub) => {
                let previous = patch::patch(code, mode)?;
                if previous != mode {
                    trace::mode_patched(stub.trace_enabled(), previous, mode);
                }
                Ok(())
            }
            CodeStub::NameDictionaryLookup(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key::{RememberedSetAction, SaveFpRegsMode};

    fn record_write(config: &StubConfig) -> CodeStub {
        CodeStub::RecordWrite(
            RecordWriteStub::new(
                config,
                1,
                3,
                2,
                RememberedSetAction::EmitRememberedSet,
                SaveFpRegsMode::DontSaveFpRegs,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_full_key_layout() {
        let config = StubConfig::default();
        let stub = record_write(&config);

        assert_eq!(stub.major_key(), MajorKey::RecordWrite);
        assert_eq!(stub.minor_key(), 0x861);
        assert_eq!(stub.key(), 1 | (0x861 << 7));
        assert_eq!(full_key(MajorKey::RecordWrite, 0x861).unwrap(), stub.key());
        assert_eq!(split_key(stub.key()).unwrap(), (MajorKey::RecordWrite, 0x861));
    }

    #[test]
    fn test_from_key_rebuilds_same_stub() {
        let config = StubConfig::default();
        let stub = record_write(&config);
        let rebuilt = CodeStub::from_key(&config, stub.key()).unwrap();

        assert_eq!(rebuilt.key(), stub.key());
        assert_eq!(rebuilt.generate().unwrap(), stub.generate().unwrap());

        let lookup = CodeStub::NameDictionaryLookup(
            NameDictionaryLookupStub::new(&config, LookupMode::Negative).unwrap(),
        );
        let rebuilt = CodeStub::from_key(&config, lookup.key()).unwrap();
        assert_eq!(rebuilt.minor_key(), lookup.minor_key());
    }

    #[test]
    fn test_bad_keys() {
        let config = StubConfig::default();
        assert!(matches!(CodeStub::from_key(&config, 0), Err(StubError::InvalidKey(0))));
        assert!(CodeStub::from_key(&config, 2 | (7 << 7)).is_err());
        assert!(full_key(MajorKey::RecordWrite, 1 << 25).is_err());
    }

    #[test]
    fn test_capabilities() {
        let config = StubConfig::default();
        let stub = record_write(&config);
        assert!(!stub.needs_immovable_code());
        assert!(!stub.sometimes_sets_up_frame());
        assert_eq!(stub.name(), "RecordWriteStub");
    }

    #[test]
    fn test_activate_only_patches_barriers() {
        let config = StubConfig::default();
        let stub = record_write(&config);
        let mut generated = stub.generate().unwrap();
        let before = generated.len();

        stub.activate(&mut generated, Mode::Incremental).unwrap();
        assert_eq!(patch::get_mode(&generated).unwrap(), Mode::Incremental);
        assert_eq!(generated.len(), before);

        let lookup = CodeStub::NameDictionaryLookup(
            NameDictionaryLookupStub::new(&config, LookupMode::Positive).unwrap(),
        );
        let mut code = lookup.generate().unwrap();
        let original = code.clone();
        lookup.activate(&mut code, Mode::Incremental).unwrap();
        assert_eq!(code, original);
    }
}
