//! A small AArch64 interpreter for generated stubs.
//!
//! It executes exactly the instruction forms the stub generators emit,
//! against a sparse memory supplied by a [`SimEnvironment`]. Calls to
//! registered host addresses are dispatched to the environment and behave
//! like native calls: they return to the link register and leave every
//! caller-saved register holding garbage.

pub mod heap;

use std::collections::HashMap;
use std::fmt;

use crate::jit::aarch64::NOP;
use crate::jit::{Cond, Reg};

pub use heap::SimHeap;

/// Address the simulated code is loaded at.
pub const CODE_BASE: u64 = 0x1_0000;
/// Return address planted in the link register by [`Simulator::call`].
pub const RETURN_SENTINEL: u64 = 0xDEAD_BEE0;
/// Value written into registers a host call clobbers.
pub const CLOBBER_PATTERN: u64 = 0xBAD0_BAD0_BAD0_0000;

const PAGE_SIZE: u64 = 4096;
const DEFAULT_STEP_LIMIT: usize = 100_000;

/// Native entry points generated code can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFn {
    /// Marker entry point, `(value, object, slot)`
    RecordWrite,
    StoreBufferOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    UnmappedAddress(u64),
    UndefinedInstruction { pc: u64, inst: u32 },
    PcOutOfRange(u64),
    MisalignedStack(u64),
    StepLimitExceeded(usize),
    /// Allocation or layout failure while building simulated heap state.
    Heap(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::UnmappedAddress(addr) => write!(f, "access to unmapped address {:#x}", addr),
            SimError::UndefinedInstruction { pc, inst } => {
                write!(f, "undefined instruction {:#010x} at {:#x}", inst, pc)
            }
            SimError::PcOutOfRange(pc) => write!(f, "pc {:#x} is outside the code", pc),
            SimError::MisalignedStack(sp) => write!(f, "stack pointer {:#x} is not 16-byte aligned", sp),
            SimError::StepLimitExceeded(n) => write!(f, "no return after {} steps", n),
            SimError::Heap(msg) => write!(f, "heap: {}", msg),
        }
    }
}

impl std::error::Error for SimError {}

/// Sparse byte-addressed memory. Accesses outside mapped ranges fail;
/// mapped pages read as zero until written.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    ranges: Vec<(u64, u64)>,
    pages: HashMap<u64, Box<[u8]>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, start: u64, len: u64) {
        self.ranges.push((start, start.saturating_add(len)));
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.ranges.iter().any(|&(start, end)| addr >= start && addr < end)
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, SimError> {
        if !self.is_mapped(addr) {
            return Err(SimError::UnmappedAddress(addr));
        }
        let page = addr / PAGE_SIZE;
        Ok(self
            .pages
            .get(&page)
            .map_or(0, |bytes| bytes[(addr % PAGE_SIZE) as usize]))
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), SimError> {
        if !self.is_mapped(addr) {
            return Err(SimError::UnmappedAddress(addr));
        }
        let page = self
            .pages
            .entry(addr / PAGE_SIZE)
            .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
        page[(addr % PAGE_SIZE) as usize] = value;
        Ok(())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, SimError> {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.read_u8(addr.wrapping_add(i as u64))?;
        }
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), SimError> {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u64), byte)?;
        }
        Ok(())
    }
}

/// What simulated code runs against.
pub trait SimEnvironment {
    fn memory(&self) -> &Memory;

    fn memory_mut(&mut self) -> &mut Memory;

    /// Run a host function. `args` are `x0`-`x2`; the result goes to `x0`.
    fn host_call(&mut self, function: HostFn, args: [u64; 3]) -> Result<u64, SimError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

impl Flags {
    fn holds(self, cond: u32) -> bool {
        let result = match cond >> 1 {
            0 => self.z,
            1 => self.c,
            2 => self.n,
            3 => self.v,
            4 => self.c && !self.z,
            5 => self.n == self.v,
            6 => !self.z && self.n == self.v,
            _ => true,
        };
        // Odd conditions negate, except AL/NV.
        if cond & 1 == 1 && cond != 0b1111 { !result } else { result }
    }
}

pub struct Simulator {
    x: [u64; 31],
    sp: u64,
    d: [u64; 32],
    pc: u64,
    flags: Flags,
    code: Vec<u8>,
    host_fns: HashMap<u64, HostFn>,
    caller_saved: Vec<u8>,
    caller_saved_fp: Vec<u8>,
    step_limit: usize,
    steps: usize,
}

impl Simulator {
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            d: [0; 32],
            pc: CODE_BASE,
            flags: Flags::default(),
            code,
            host_fns: HashMap::new(),
            caller_saved: (0..=18).collect(),
            caller_saved_fp: (0..=7).chain(16..=31).collect(),
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
        }
    }

    /// Registers a host call leaves clobbered.
    pub fn set_caller_saved(&mut self, gp: &[u8], fp: &[u8]) {
        self.caller_saved = gp.to_vec();
        self.caller_saved_fp = fp.to_vec();
    }

    pub fn set_step_limit(&mut self, limit: usize) {
        self.step_limit = limit;
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Code bytes, writable between steps.
    pub fn code_mut(&mut self) -> &mut Vec<u8> {
        &mut self.code
    }

    pub fn register_host_fn(&mut self, address: u64, function: HostFn) {
        self.host_fns.insert(address, function);
    }

    pub fn x(&self, reg: Reg) -> u64 {
        self.read_x(reg.code() as u32)
    }

    pub fn set_x(&mut self, reg: Reg, value: u64) {
        if reg == Reg::Sp {
            self.sp = value;
        } else {
            self.write_x(reg.code() as u32, value);
        }
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn set_sp(&mut self, value: u64) {
        self.sp = value;
    }

    pub fn d(&self, reg: u8) -> u64 {
        self.d[(reg & 31) as usize]
    }

    pub fn set_d(&mut self, reg: u8, bits: u64) {
        self.d[(reg & 31) as usize] = bits;
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Point the machine at the start of the code with a return address
    /// that ends the run.
    pub fn prepare_call(&mut self) {
        self.pc = CODE_BASE;
        self.x[30] = RETURN_SENTINEL;
        self.steps = 0;
    }

    /// Whether the code has returned to its caller.
    pub fn returned(&self) -> bool {
        self.pc == RETURN_SENTINEL
    }

    /// Run the code from the start until it returns.
    pub fn call<E: SimEnvironment + ?Sized>(&mut self, env: &mut E) -> Result<usize, SimError> {
        self.prepare_call();
        self.run(env)
    }

    /// Continue until the code returns. Returns the number of steps taken
    /// since [`Simulator::prepare_call`].
    pub fn run<E: SimEnvironment + ?Sized>(&mut self, env: &mut E) -> Result<usize, SimError> {
        while !self.returned() {
            self.step(env)?;
        }
        Ok(self.steps)
    }

    /// Execute one instruction.
    pub fn step<E: SimEnvironment + ?Sized>(&mut self, env: &mut E) -> Result<(), SimError> {
        if self.steps >= self.step_limit {
            return Err(SimError::StepLimitExceeded(self.steps));
        }
        self.steps += 1;

        let inst = self.fetch()?;
        let next = self.pc.wrapping_add(4);
        self.pc = self.execute(inst, next, env)?;

        if let Some(&function) = self.host_fns.get(&self.pc) {
            self.enter_host(function, env)?;
        }
        Ok(())
    }

    fn fetch(&self) -> Result<u32, SimError> {
        let offset = self
            .pc
            .checked_sub(CODE_BASE)
            .filter(|o| o % 4 == 0 && o + 4 <= self.code.len() as u64)
            .ok_or(SimError::PcOutOfRange(self.pc))? as usize;
        let bytes = &self.code[offset..offset + 4];
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Run a host function reached by a branch, then return to the link
    /// register.
    fn enter_host<E: SimEnvironment + ?Sized>(
        &mut self,
        function: HostFn,
        env: &mut E,
    ) -> Result<(), SimError> {
        let result = env.host_call(function, [self.x[0], self.x[1], self.x[2]])?;
        for &reg in &self.caller_saved {
            if (reg as usize) < self.x.len() {
                self.x[reg as usize] = CLOBBER_PATTERN | reg as u64;
            }
        }
        for &reg in &self.caller_saved_fp {
            self.d[(reg & 31) as usize] = CLOBBER_PATTERN | 0x100 | reg as u64;
        }
        self.x[0] = result;
        self.pc = self.x[30];
        Ok(())
    }

    /// `r == 31` reads the zero register.
    fn read_x(&self, r: u32) -> u64 {
        if r == 31 { 0 } else { self.x[r as usize] }
    }

    fn write_x(&mut self, r: u32, value: u64) {
        if r != 31 {
            self.x[r as usize] = value;
        }
    }

    /// `r == 31` reads the stack pointer.
    fn read_x_or_sp(&self, r: u32) -> u64 {
        if r == 31 { self.sp } else { self.x[r as usize] }
    }

    fn write_x_or_sp(&mut self, r: u32, value: u64) {
        if r == 31 {
            self.sp = value;
        } else {
            self.x[r as usize] = value;
        }
    }

    fn base_address(&self, rn: u32) -> Result<u64, SimError> {
        let base = self.read_x_or_sp(rn);
        if rn == 31 && base % 16 != 0 {
            return Err(SimError::MisalignedStack(base));
        }
        Ok(base)
    }

    fn execute<E: SimEnvironment + ?Sized>(
        &mut self,
        inst: u32,
        next: u64,
        env: &mut E,
    ) -> Result<u64, SimError> {
        let rd = inst & 0x1F;
        let rn = (inst >> 5) & 0x1F;
        let rm = (inst >> 16) & 0x1F;
        let rt2 = (inst >> 10) & 0x1F;
        let pc = self.pc;

        if inst == NOP {
            return Ok(next);
        }

        // Branches
        if inst & 0xFC00_0000 == 0x1400_0000 {
            return Ok(offset_pc(pc, sign_extend((inst & 0x03FF_FFFF) as u64, 26) * 4));
        }
        if inst & 0xFF00_0010 == 0x5400_0000 {
            let taken = self.flags.holds(inst & 0xF);
            return Ok(if taken { offset_pc(pc, imm19(inst)) } else { next });
        }
        if inst & 0xFE00_0000 == 0xB400_0000 {
            let is_zero = self.read_x(rd) == 0;
            let branch_if_zero = inst & 0x0100_0000 == 0;
            return Ok(if is_zero == branch_if_zero { offset_pc(pc, imm19(inst)) } else { next });
        }
        if inst & 0x7E00_0000 == 0x3600_0000 {
            let bit = ((inst >> 31) << 5) | ((inst >> 19) & 0x1F);
            let set = (self.read_x(rd) >> bit) & 1 == 1;
            let branch_if_set = inst & 0x0100_0000 != 0;
            let delta = sign_extend(((inst >> 5) & 0x3FFF) as u64, 14) * 4;
            return Ok(if set == branch_if_set { offset_pc(pc, delta) } else { next });
        }
        if inst & 0x9F00_0000 == 0x1000_0000 {
            let immlo = ((inst >> 29) & 0x3) as u64;
            let immhi = ((inst >> 5) & 0x7FFFF) as u64;
            let delta = sign_extend((immhi << 2) | immlo, 21);
            self.write_x(rd, offset_pc(pc, delta));
            return Ok(next);
        }
        if inst & 0xFFFF_FC1F == 0xD63F_0000 {
            let target = self.read_x(rn);
            self.x[30] = next;
            return Ok(target);
        }
        if inst & 0xFFFF_FC1F == 0xD65F_0000 {
            return Ok(self.read_x(rn));
        }

        // Data processing
        match inst & 0xFF20_0000 {
            0x8B00_0000 if inst & 0x00C0_0000 == 0 => {
                let shift = (inst >> 10) & 0x3F;
                let value = self.read_x(rn).wrapping_add(self.read_x(rm) << shift);
                self.write_x(rd, value);
                return Ok(next);
            }
            0x8A00_0000 => {
                let value = self.read_x(rn) & self.read_x(rm);
                self.write_x(rd, value);
                return Ok(next);
            }
            0xAA00_0000 => {
                let value = self.read_x(rn) | self.read_x(rm);
                self.write_x(rd, value);
                return Ok(next);
            }
            0xEB00_0000 => {
                let (a, b) = (self.read_x(rn), self.read_x(rm));
                let result = a.wrapping_sub(b);
                self.flags = Flags {
                    n: (result as i64) < 0,
                    z: result == 0,
                    c: a >= b,
                    v: ((a ^ b) & (a ^ result)) >> 63 == 1,
                };
                self.write_x(rd, result);
                return Ok(next);
            }
            _ => {}
        }

        match inst & 0xFFC0_0000 {
            0x9100_0000 | 0xD100_0000 => {
                let imm = ((inst >> 10) & 0xFFF) as u64;
                let base = self.read_x_or_sp(rn);
                let value = if inst & 0x4000_0000 == 0 {
                    base.wrapping_add(imm)
                } else {
                    base.wrapping_sub(imm)
                };
                self.write_x_or_sp(rd, value);
                return Ok(next);
            }
            0xD340_0000 => {
                let immr = (inst >> 16) & 0x3F;
                let imms = (inst >> 10) & 0x3F;
                let src = self.read_x(rn);
                let value = if imms >= immr {
                    (src >> immr) & low_mask(imms - immr + 1)
                } else {
                    (src & low_mask(imms + 1)) << (64 - immr)
                };
                self.write_x(rd, value);
                return Ok(next);
            }
            0xF940_0000 | 0xF900_0000 => {
                let addr = self
                    .base_address(rn)?
                    .wrapping_add(((inst >> 10) & 0xFFF) as u64 * 8);
                if inst & 0x0040_0000 != 0 {
                    let value = env.memory().read_u64(addr)?;
                    self.write_x(rd, value);
                } else {
                    env.memory_mut().write_u64(addr, self.read_x(rd))?;
                }
                return Ok(next);
            }
            0xA980_0000 | 0xA880_0000 | 0xA8C0_0000 => {
                let imm = sign_extend(((inst >> 15) & 0x7F) as u64, 7) * 8;
                let base = self.base_address(rn)?;
                let pre_index = inst & 0x0100_0000 != 0;
                let addr = if pre_index { offset_pc(base, imm) } else { base };
                if inst & 0x0040_0000 != 0 {
                    let first = env.memory().read_u64(addr)?;
                    let second = env.memory().read_u64(addr.wrapping_add(8))?;
                    self.write_x(rd, first);
                    self.write_x(rt2, second);
                } else {
                    let (first, second) = (self.read_x(rd), self.read_x(rt2));
                    env.memory_mut().write_u64(addr, first)?;
                    env.memory_mut().write_u64(addr.wrapping_add(8), second)?;
                }
                self.write_x_or_sp(rn, offset_pc(base, imm));
                return Ok(next);
            }
            0x6D80_0000 | 0x6CC0_0000 => {
                let imm = sign_extend(((inst >> 15) & 0x7F) as u64, 7) * 8;
                let base = self.base_address(rn)?;
                let pre_index = inst & 0x0100_0000 != 0;
                let addr = if pre_index { offset_pc(base, imm) } else { base };
                if inst & 0x0040_0000 != 0 {
                    self.d[rd as usize] = env.memory().read_u64(addr)?;
                    self.d[rt2 as usize] = env.memory().read_u64(addr.wrapping_add(8))?;
                } else {
                    env.memory_mut().write_u64(addr, self.d[rd as usize])?;
                    env.memory_mut()
                        .write_u64(addr.wrapping_add(8), self.d[rt2 as usize])?;
                }
                self.write_x_or_sp(rn, offset_pc(base, imm));
                return Ok(next);
            }
            _ => {}
        }

        match inst & 0xFF80_0000 {
            0xD280_0000 => {
                let hw = (inst >> 21) & 0x3;
                let imm = ((inst >> 5) & 0xFFFF) as u64;
                self.write_x(rd, imm << (16 * hw));
                return Ok(next);
            }
            0xF280_0000 => {
                let hw = (inst >> 21) & 0x3;
                let imm = ((inst >> 5) & 0xFFFF) as u64;
                let mask = 0xFFFFu64 << (16 * hw);
                let value = (self.read_x(rd) & !mask) | (imm << (16 * hw));
                self.write_x(rd, value);
                return Ok(next);
            }
            _ => {}
        }

        let simm9 = sign_extend(((inst >> 12) & 0x1FF) as u64, 9);
        match inst & 0xFFE0_0C00 {
            0xF840_0000 => {
                let addr = offset_pc(self.base_address(rn)?, simm9);
                let value = env.memory().read_u64(addr)?;
                self.write_x(rd, value);
                return Ok(next);
            }
            0x3840_0000 => {
                let addr = offset_pc(self.base_address(rn)?, simm9);
                let value = env.memory().read_u8(addr)? as u64;
                self.write_x(rd, value);
                return Ok(next);
            }
            0xFC00_0C00 => {
                let base = self.base_address(rn)?;
                let addr = offset_pc(base, simm9);
                env.memory_mut().write_u64(addr, self.d[rd as usize])?;
                self.write_x_or_sp(rn, addr);
                return Ok(next);
            }
            0xFC40_0400 => {
                let base = self.base_address(rn)?;
                self.d[rd as usize] = env.memory().read_u64(base)?;
                self.write_x_or_sp(rn, offset_pc(base, simm9));
                return Ok(next);
            }
            _ => {}
        }

        Err(SimError::UndefinedInstruction { pc, inst })
    }

    /// Evaluate a condition against the current flags.
    pub fn condition_holds(&self, cond: Cond) -> bool {
        self.flags.holds(cond as u32)
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn imm19(inst: u32) -> i64 {
    sign_extend(((inst >> 5) & 0x7FFFF) as u64, 19) * 4
}

fn offset_pc(base: u64, delta: i64) -> u64 {
    base.wrapping_add(delta as u64)
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}
