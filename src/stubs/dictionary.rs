//! Name dictionary probing.
//!
//! Dictionaries are open-addressed hash tables with a power-of-two capacity.
//! Each entry is [`ENTRY_SIZE`] words (key, value, details), and the `i`-th
//! probe for hash `h` looks at entry `(h + (i + i*i) / 2) & (capacity - 1)`.
//! An empty entry holds `undefined`; a deleted one holds `the_hole`.
//!
//! [`generate_negative_lookup`] inlines the first few probes at a property
//! access site to prove a name absent without a call.
//! [`NameDictionaryLookupStub`] is the out-of-line routine that runs the
//! whole probe sequence.

use crate::config::{HeapLayout, StubConfig};
use crate::jit::{AArch64Assembler, CodeBuffer, Cond, Label, Reg};

use super::{StubError, check_config};
use super::registers::{RegisterRole, assembler_temp, check_operands};

/// Probes emitted inline at a lookup site.
pub const INLINED_PROBES: u32 = 4;
/// Probes the full lookup runs before giving up.
pub const TOTAL_PROBES: u32 = 20;
/// Words per dictionary entry.
pub const ENTRY_SIZE: u32 = 3;

/// Name hashes occupy the low 30 bits.
pub const HASH_BITS: u32 = 30;
const ZERO_HASH: u32 = 27;

/// Offset added to the hash for probe `i`.
pub fn probe_offset(i: u32) -> u32 {
    (i + i * i) >> 1
}

/// Entry examined by probe `i`.
pub fn probe_index(hash: u32, i: u32, capacity: u32) -> u32 {
    hash.wrapping_add(probe_offset(i)) & capacity.wrapping_sub(1)
}

/// Jenkins one-at-a-time hash of a name, as the runtime assigns it.
pub fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for &byte in name.as_bytes() {
        hash = hash.wrapping_add(byte as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);

    let hash = hash & ((1 << HASH_BITS) - 1);
    if hash == 0 { ZERO_HASH } else { hash }
}

/// A name known at code generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameConstant {
    /// Tagged pointer to the name
    pub ptr: u64,
    pub hash: u32,
}

/// Emit probes that branch to `done` when `name` is provably absent from
/// the dictionary in `properties`, and to `miss` when the full lookup has
/// to decide.
///
/// `scratch0` and the assembler temporaries are clobbered. `receiver` is
/// only checked against the other operands.
#[allow(clippy::too_many_arguments)]
pub fn generate_negative_lookup(
    asm: &mut AArch64Assembler,
    config: &StubConfig,
    miss: Label,
    done: Label,
    receiver: Reg,
    properties: Reg,
    name: NameConstant,
    scratch0: Reg,
) -> Result<(), StubError> {
    check_config(config)?;
    let table = &config.registers;
    check_operands(
        table,
        &[
            (RegisterRole::Receiver, receiver.code()),
            (RegisterRole::Properties, properties.code()),
            (RegisterRole::Scratch, scratch0.code()),
        ],
    )?;
    let root = root_register(config)?;
    let temp = assembler_temp(table)?;
    let layout = &config.layout;
    let dict = &layout.dictionary;
    let index = scratch0;

    for i in 0..INLINED_PROBES {
        let good = asm.new_label();

        // index = (hash + offset(i)) & (capacity - 1)
        asm.ldr_disp(index, properties, layout.field(dict.capacity_offset));
        asm.sub_imm(index, index, 1);
        asm.mov_imm64(temp, name.hash.wrapping_add(probe_offset(i)) as u64);
        asm.and(index, index, temp);

        // Scale by the entry size and load the key.
        asm.add_lsl(index, index, index, 1);
        asm.add_lsl(index, properties, index, 3);
        let entity_name = index;
        asm.ldr_disp(entity_name, index, layout.field(dict.elements_start_offset));

        asm.ldr_disp(temp, root, layout.undefined_value_offset);
        asm.cmp(entity_name, temp);
        asm.b_cond(Cond::Eq, done);

        asm.mov_imm64(temp, name.ptr);
        asm.cmp(entity_name, temp);
        asm.b_cond(Cond::Eq, miss);

        asm.ldr_disp(temp, root, layout.the_hole_value_offset);
        asm.cmp(entity_name, temp);
        asm.b_cond(Cond::Eq, good);

        // A key that is not a unique name could still equal ours.
        load_instance_type(asm, layout, entity_name);
        asm.tbnz(entity_name, dict.not_unique_name_bit, miss);

        asm.bind(good);
    }

    asm.b(miss);
    Ok(())
}

fn root_register(config: &StubConfig) -> Result<Reg, StubError> {
    let code = config.registers.root;
    Reg::from_code(code).ok_or(StubError::InvalidRegister {
        role: RegisterRole::Root,
        code,
    })
}

/// Replace the heap object in `reg` with its instance type byte.
fn load_instance_type(asm: &mut AArch64Assembler, layout: &HeapLayout, reg: Reg) {
    let dict = &layout.dictionary;
    asm.ldr_disp(reg, reg, layout.field(dict.map_offset));
    asm.ldurb(reg, reg, layout.field(dict.instance_type_offset) as i16);
}

/// Which answer an exhausted probe sequence gives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupMode {
    Positive,
    Negative,
}

impl LookupMode {
    pub fn from_minor_key(minor: u32) -> Option<Self> {
        match minor {
            0 => Some(LookupMode::Positive),
            1 => Some(LookupMode::Negative),
            _ => None,
        }
    }

    pub fn minor_key(self) -> u32 {
        match self {
            LookupMode::Positive => 0,
            LookupMode::Negative => 1,
        }
    }
}

/// Out-of-line dictionary lookup.
///
/// Takes the dictionary in `x0` and the name in `x1` and returns in `x0`
/// 1 when the name is in the dictionary and 0 when it is not. When the
/// probes cannot decide, a negative lookup answers 1 and a positive lookup
/// answers 0, so neither ever reports a wrong definite answer.
/// Clobbers `x2`-`x4` and the assembler temporaries.
#[derive(Debug, Clone)]
pub struct NameDictionaryLookupStub {
    mode: LookupMode,
    layout: HeapLayout,
    root: Reg,
    temp: Reg,
    trace: bool,
}

impl NameDictionaryLookupStub {
    pub const DICTIONARY: Reg = Reg::X0;
    pub const NAME: Reg = Reg::X1;
    pub const RESULT: Reg = Reg::X0;
    const MASK: Reg = Reg::X2;
    const HASH: Reg = Reg::X3;
    const INDEX: Reg = Reg::X4;

    pub fn new(config: &StubConfig, mode: LookupMode) -> Result<Self, StubError> {
        let table = &config.registers;
        let checked = check_config(config).and_then(|()| {
            check_operands(
                table,
                &[
                    (RegisterRole::Properties, Self::DICTIONARY.code()),
                    (RegisterRole::Object, Self::NAME.code()),
                    (RegisterRole::Scratch, Self::MASK.code()),
                    (RegisterRole::Scratch, Self::HASH.code()),
                    (RegisterRole::Scratch, Self::INDEX.code()),
                ],
            )
        });
        if let Err(e) = &checked {
            crate::trace::stub_rejected(config.trace_stubs, "NameDictionaryLookupStub", e);
        }
        checked?;
        Ok(Self {
            mode,
            layout: config.layout.clone(),
            root: root_register(config)?,
            temp: assembler_temp(table)?,
            trace: config.trace_stubs,
        })
    }

    pub fn mode(&self) -> LookupMode {
        self.mode
    }

    pub fn minor_key(&self) -> u32 {
        self.mode.minor_key()
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace
    }

    pub fn generate(&self) -> Result<Vec<u8>, StubError> {
        let mut buf = CodeBuffer::with_capacity(2048);
        let mut asm = AArch64Assembler::new(&mut buf);
        self.emit(&mut asm);
        buf.resolve_labels()?;
        Ok(buf.into_code())
    }

    pub fn emit(&self, asm: &mut AArch64Assembler) {
        let layout = &self.layout;
        let dict = &layout.dictionary;
        let (dictionary, name, result) = (Self::DICTIONARY, Self::NAME, Self::RESULT);
        let (mask, hash, index) = (Self::MASK, Self::HASH, Self::INDEX);

        let in_dictionary = asm.new_label();
        let maybe_in_dictionary = asm.new_label();
        let not_in_dictionary = asm.new_label();

        asm.ldr_disp(mask, dictionary, layout.field(dict.capacity_offset));
        asm.sub_imm(mask, mask, 1);
        asm.ldr_disp(hash, name, layout.field(dict.name_hash_offset));
        asm.lsr_imm(hash, hash, dict.hash_shift);

        for i in 0..TOTAL_PROBES {
            let next = asm.new_label();

            if i > 0 {
                asm.add_imm(index, hash, probe_offset(i) as u16);
            } else {
                asm.mov(index, hash);
            }
            asm.and(index, index, mask);
            asm.add_lsl(index, index, index, 1);
            asm.add_lsl(index, dictionary, index, 3);
            asm.ldr_disp(index, index, layout.field(dict.elements_start_offset));

            asm.ldr_disp(self.temp, self.root, layout.undefined_value_offset);
            asm.cmp(index, self.temp);
            asm.b_cond(Cond::Eq, not_in_dictionary);

            asm.cmp(index, name);
            asm.b_cond(Cond::Eq, in_dictionary);

            if self.mode == LookupMode::Negative {
                // Deleted entries are skipped; any other key must be a
                // unique name for the comparison above to be conclusive.
                asm.ldr_disp(self.temp, self.root, layout.the_hole_value_offset);
                asm.cmp(index, self.temp);
                asm.b_cond(Cond::Eq, next);
                load_instance_type(asm, layout, index);
                asm.tbnz(index, dict.not_unique_name_bit, maybe_in_dictionary);
            }

            asm.bind(next);
        }

        asm.bind(maybe_in_dictionary);
        if self.mode == LookupMode::Positive {
            asm.mov_imm(result, 0);
            asm.ret();
        }

        asm.bind(in_dictionary);
        asm.mov_imm(result, 1);
        asm.ret();

        asm.bind(not_in_dictionary);
        asm.mov_imm(result, 0);
        asm.ret();
    }
}
