//! Register bookkeeping for stubs.
//!
//! A stub receives its operands in registers picked by the calling compiler
//! and must hand every other register back untouched. [`RegisterPlan`]
//! decides which registers the stub may use internally and how they are
//! saved around the code that needs them.

use crate::config::RegisterTable;
use crate::jit::{AArch64Assembler, FpReg, Reg};

use super::StubError;
use super::key::SaveFpRegsMode;

/// A set of AArch64 register codes (0-31).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegList(u32);

impl RegList {
    pub const fn empty() -> Self {
        RegList(0)
    }

    pub const fn all() -> Self {
        RegList(u32::MAX)
    }

    pub fn from_codes(codes: &[u8]) -> Self {
        codes.iter().fold(Self::empty(), |list, &code| list.with(code))
    }

    pub fn from_regs(regs: &[Reg]) -> Self {
        regs.iter().fold(Self::empty(), |list, r| list.with(r.code()))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, code: u8) -> bool {
        code < 32 && self.0 & (1 << code) != 0
    }

    pub fn with(self, code: u8) -> Self {
        if code < 32 { RegList(self.0 | (1 << code)) } else { self }
    }

    pub fn without(self, code: u8) -> Self {
        if code < 32 { RegList(self.0 & !(1 << code)) } else { self }
    }

    pub fn union(self, other: RegList) -> Self {
        RegList(self.0 | other.0)
    }

    pub fn intersection(self, other: RegList) -> Self {
        RegList(self.0 & other.0)
    }

    pub fn difference(self, other: RegList) -> Self {
        RegList(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Remove and return the lowest-numbered register.
    pub fn pop_lowest(&mut self) -> Option<u8> {
        if self.0 == 0 {
            return None;
        }
        let code = self.0.trailing_zeros() as u8;
        self.0 &= self.0 - 1;
        Some(code)
    }

    /// Register codes in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..32u8).filter(move |&code| self.contains(code))
    }

    pub fn regs(self) -> Vec<Reg> {
        self.iter().filter_map(Reg::from_code).collect()
    }
}

/// Role a caller-supplied register plays in a stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRole {
    Object,
    Address,
    Value,
    Receiver,
    Properties,
    Scratch,
    Root,
}

impl std::fmt::Display for RegisterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterRole::Object => "object",
            RegisterRole::Address => "address",
            RegisterRole::Value => "value",
            RegisterRole::Receiver => "receiver",
            RegisterRole::Properties => "properties",
            RegisterRole::Scratch => "scratch",
            RegisterRole::Root => "root",
        };
        f.write_str(name)
    }
}

/// Check that caller-supplied registers are in range, pairwise distinct,
/// and not claimed by the VM or the assembler.
pub fn check_operands(
    table: &RegisterTable,
    operands: &[(RegisterRole, u8)],
) -> Result<Vec<Reg>, StubError> {
    let forbidden = table.reserved().union(table.assembler_temps());
    let mut seen = RegList::empty();
    let mut regs = Vec::with_capacity(operands.len());
    for &(role, code) in operands {
        let reg = Reg::from_code(code).ok_or(StubError::InvalidRegister { role, code })?;
        if forbidden.contains(code) {
            return Err(StubError::ReservedRegister { role, reg });
        }
        if seen.contains(code) {
            return Err(StubError::AliasedRegisters { reg });
        }
        seen = seen.with(code);
        regs.push(reg);
    }
    Ok(regs)
}

/// The assembler temporary stubs use for call targets and constants.
pub fn assembler_temp(table: &RegisterTable) -> Result<Reg, StubError> {
    table
        .assembler_temps
        .first()
        .and_then(|&code| Reg::from_code(code))
        .ok_or(StubError::InsufficientScratch)
}

/// Registers used by one record-write stub instance.
///
/// `object` and `address` are inputs that must survive the stub. `scratch0`
/// is the caller's value register, handed over for the stub to clobber.
/// `scratch1` and `scratch2` are borrowed from the allocatable pool and
/// saved around their use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPlan {
    object: Reg,
    address: Reg,
    scratch0: Reg,
    scratch1: Reg,
    scratch2: Reg,
    saved_regs: Vec<Reg>,
    saved_fp_regs: Vec<FpReg>,
}

impl RegisterPlan {
    pub fn new(
        table: &RegisterTable,
        object: u8,
        address: u8,
        scratch: u8,
    ) -> Result<Self, StubError> {
        let regs = check_operands(
            table,
            &[
                (RegisterRole::Object, object),
                (RegisterRole::Address, address),
                (RegisterRole::Value, scratch),
            ],
        )?;
        let (object, address, scratch0) = (regs[0], regs[1], regs[2]);

        let mut pool = table
            .allocatable()
            .difference(RegList::from_regs(&[object, address, scratch0]));
        let (Some(s1), Some(s2)) = (pool.pop_lowest(), pool.pop_lowest()) else {
            return Err(StubError::InsufficientScratch);
        };
        let scratch1 = Reg::from_code(s1).ok_or(StubError::InsufficientScratch)?;
        let scratch2 = Reg::from_code(s2).ok_or(StubError::InsufficientScratch)?;

        // The scratch registers are restored by other means, so they stay out
        // of the caller-save block. The link register always goes in: the
        // native call overwrites it.
        let saved_regs = table
            .caller_saved()
            .difference(RegList::from_regs(&[scratch0, scratch1, scratch2]))
            .with(table.link_register)
            .regs();
        let saved_fp_regs = table
            .caller_saved_fp
            .iter()
            .filter_map(|&code| FpReg::new(code))
            .collect();

        Ok(Self {
            object,
            address,
            scratch0,
            scratch1,
            scratch2,
            saved_regs,
            saved_fp_regs,
        })
    }

    pub fn object(&self) -> Reg {
        self.object
    }

    pub fn address(&self) -> Reg {
        self.address
    }

    pub fn scratch0(&self) -> Reg {
        self.scratch0
    }

    pub fn scratch1(&self) -> Reg {
        self.scratch1
    }

    pub fn scratch2(&self) -> Reg {
        self.scratch2
    }

    pub fn saved_regs(&self) -> &[Reg] {
        &self.saved_regs
    }

    pub fn saved_fp_regs(&self) -> &[FpReg] {
        &self.saved_fp_regs
    }

    /// Push `scratch1` and `scratch2`. `scratch0` belongs to the caller.
    pub fn save(&self, asm: &mut AArch64Assembler) {
        asm.stp_pre(self.scratch1, self.scratch2, -16);
    }

    pub fn restore(&self, asm: &mut AArch64Assembler) {
        asm.ldp_post(self.scratch1, self.scratch2, 16);
    }

    /// Save everything a native call may clobber.
    pub fn save_caller_registers(&self, asm: &mut AArch64Assembler, mode: SaveFpRegsMode) {
        asm.push_regs(&self.saved_regs);
        if mode == SaveFpRegsMode::SaveFpRegs {
            asm.push_fp_regs(&self.saved_fp_regs);
        }
    }

    pub fn restore_caller_registers(&self, asm: &mut AArch64Assembler, mode: SaveFpRegsMode) {
        if mode == SaveFpRegsMode::SaveFpRegs {
            asm.pop_fp_regs(&self.saved_fp_regs);
        }
        asm.pop_regs(&self.saved_regs);
    }
}
