//! Minor-key encoding for record-write stubs.
//!
//! Layout (bit 0 is the least significant):
//!
//! ```text
//! 0-4    object register
//! 5-9    value register
//! 10-14  address register
//! 15     remembered set action
//! 16     save fp regs mode
//! ```

use super::StubError;
use super::registers::RegisterRole;

const REGISTER_BITS: u32 = 5;
const REGISTER_MASK: u32 = (1 << REGISTER_BITS) - 1;

const OBJECT_SHIFT: u32 = 0;
const VALUE_SHIFT: u32 = 5;
const ADDRESS_SHIFT: u32 = 10;
const REMEMBERED_SET_ACTION_SHIFT: u32 = 15;
const SAVE_FP_REGS_SHIFT: u32 = 16;

/// Number of bits a record-write minor key occupies.
pub const MINOR_KEY_BITS: u32 = 17;

/// Whether a store needs a remembered-set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RememberedSetAction {
    EmitRememberedSet = 0,
    OmitRememberedSet = 1,
}

impl RememberedSetAction {
    fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            RememberedSetAction::EmitRememberedSet
        } else {
            RememberedSetAction::OmitRememberedSet
        }
    }
}

/// Whether the slow path must preserve caller-saved FP registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SaveFpRegsMode {
    DontSaveFpRegs = 0,
    SaveFpRegs = 1,
}

impl SaveFpRegsMode {
    fn from_bit(bit: u32) -> Self {
        if bit == 0 {
            SaveFpRegsMode::DontSaveFpRegs
        } else {
            SaveFpRegsMode::SaveFpRegs
        }
    }
}

/// Decoded form of a record-write stub key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordWriteKey {
    pub object: u8,
    pub value: u8,
    pub address: u8,
    pub remembered_set_action: RememberedSetAction,
    pub save_fp_regs_mode: SaveFpRegsMode,
}

impl RecordWriteKey {
    /// Build a key, rejecting register indices that do not fit the 5-bit
    /// fields.
    pub fn new(
        object: u8,
        value: u8,
        address: u8,
        remembered_set_action: RememberedSetAction,
        save_fp_regs_mode: SaveFpRegsMode,
    ) -> Result<Self, StubError> {
        for (role, code) in [
            (RegisterRole::Object, object),
            (RegisterRole::Value, value),
            (RegisterRole::Address, address),
        ] {
            if code as u32 > REGISTER_MASK {
                return Err(StubError::InvalidRegister { role, code });
            }
        }
        Ok(Self {
            object,
            value,
            address,
            remembered_set_action,
            save_fp_regs_mode,
        })
    }

    pub fn encode(&self) -> u32 {
        ((self.object as u32 & REGISTER_MASK) << OBJECT_SHIFT)
            | ((self.value as u32 & REGISTER_MASK) << VALUE_SHIFT)
            | ((self.address as u32 & REGISTER_MASK) << ADDRESS_SHIFT)
            | ((self.remembered_set_action as u32) << REMEMBERED_SET_ACTION_SHIFT)
            | ((self.save_fp_regs_mode as u32) << SAVE_FP_REGS_SHIFT)
    }

    pub fn decode(key: u32) -> Result<Self, StubError> {
        if key >> MINOR_KEY_BITS != 0 {
            return Err(StubError::InvalidKey(key));
        }
        let field = |shift: u32| ((key >> shift) & REGISTER_MASK) as u8;
        Ok(Self {
            object: field(OBJECT_SHIFT),
            value: field(VALUE_SHIFT),
            address: field(ADDRESS_SHIFT),
            remembered_set_action: RememberedSetAction::from_bit(
                (key >> REMEMBERED_SET_ACTION_SHIFT) & 1,
            ),
            save_fp_regs_mode: SaveFpRegsMode::from_bit((key >> SAVE_FP_REGS_SHIFT) & 1),
        })
    }
}
