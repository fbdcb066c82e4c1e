//! The record-write barrier stub.
//!
//! Generated code is laid out as
//!
//! ```text
//! header         mode slot, two recorded body addresses (see `patch`)
//! store buffer   reached when the mode slot holds a nop
//! incremental    reached through `b incremental`
//! compaction     reached through `b compaction`
//! ```
//!
//! The store-buffer-only body is the fall-through path, so a freshly
//! generated stub is in store-buffer-only mode until it is activated.

use crate::config::{HeapLayout, StubConfig};
use crate::jit::{AArch64Assembler, CodeBuffer, Cond, Label, Reg};

use super::{StubError, check_config};
use super::key::{RecordWriteKey, RememberedSetAction, SaveFpRegsMode};
use super::patch::Mode;
use super::registers::{RegisterPlan, RegisterRole, assembler_temp};

/// What the incremental bodies do when the store needs no marking work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnNoNeedToInformIncrementalMarker {
    ReturnOnNoNeedToInformIncrementalMarker,
    UpdateRememberedSetOnNoNeedToInformIncrementalMarker,
}

impl OnNoNeedToInformIncrementalMarker {
    /// Stubs that record the slot anyway keep doing so while marking.
    pub fn for_action(action: RememberedSetAction) -> Self {
        match action {
            RememberedSetAction::EmitRememberedSet => {
                Self::UpdateRememberedSetOnNoNeedToInformIncrementalMarker
            }
            RememberedSetAction::OmitRememberedSet => Self::ReturnOnNoNeedToInformIncrementalMarker,
        }
    }
}

/// Write barrier for one `(object, value, address)` register assignment.
///
/// Called after `[address] = value` where `address` points into `object`.
/// On return `object` and `address` are unchanged; `value` and the assembler
/// temporaries may have been clobbered.
#[derive(Debug, Clone)]
pub struct RecordWriteStub {
    key: RecordWriteKey,
    plan: RegisterPlan,
    layout: HeapLayout,
    root: Reg,
    temp: Reg,
    trace: bool,
}

impl RecordWriteStub {
    pub fn new(
        config: &StubConfig,
        object: u8,
        value: u8,
        address: u8,
        remembered_set_action: RememberedSetAction,
        save_fp_regs_mode: SaveFpRegsMode,
    ) -> Result<Self, StubError> {
        let key = RecordWriteKey::new(
            object,
            value,
            address,
            remembered_set_action,
            save_fp_regs_mode,
        )?;
        Self::with_key(config, key)
    }

    pub fn from_minor_key(config: &StubConfig, minor_key: u32) -> Result<Self, StubError> {
        Self::with_key(config, RecordWriteKey::decode(minor_key)?)
    }

    pub fn with_key(config: &StubConfig, key: RecordWriteKey) -> Result<Self, StubError> {
        let built = Self::build(config, key);
        if let Err(e) = &built {
            crate::trace::stub_rejected(config.trace_stubs, "RecordWriteStub", e);
        }
        built
    }

    fn build(config: &StubConfig, key: RecordWriteKey) -> Result<Self, StubError> {
        check_config(config)?;
        let table = &config.registers;
        let plan = RegisterPlan::new(table, key.object, key.address, key.value)?;
        let root = Reg::from_code(table.root).ok_or(StubError::InvalidRegister {
            role: RegisterRole::Root,
            code: table.root,
        })?;
        Ok(Self {
            key,
            plan,
            layout: config.layout.clone(),
            root,
            temp: assembler_temp(table)?,
            trace: config.trace_stubs,
        })
    }

    pub fn key(&self) -> RecordWriteKey {
        self.key
    }

    pub fn minor_key(&self) -> u32 {
        self.key.encode()
    }

    pub fn plan(&self) -> &RegisterPlan {
        &self.plan
    }

    pub fn remembered_set_action(&self) -> RememberedSetAction {
        self.key.remembered_set_action
    }

    pub fn save_fp_regs_mode(&self) -> SaveFpRegsMode {
        self.key.save_fp_regs_mode
    }

    pub fn on_no_need(&self) -> OnNoNeedToInformIncrementalMarker {
        OnNoNeedToInformIncrementalMarker::for_action(self.remembered_set_action())
    }

    pub(crate) fn trace_enabled(&self) -> bool {
        self.trace
    }

    /// Emit the stub and resolve its branches.
    pub fn generate(&self) -> Result<Vec<u8>, StubError> {
        let mut buf = CodeBuffer::with_capacity(1024);
        let mut asm = AArch64Assembler::new(&mut buf);
        self.emit(&mut asm);
        buf.resolve_labels()?;
        Ok(buf.into_code())
    }

    pub fn emit(&self, asm: &mut AArch64Assembler) {
        let incremental = asm.new_label();
        let compaction = asm.new_label();

        // The mode slot starts as a nop; the two adr words only record
        // where the bodies begin.
        asm.nop();
        asm.adr(Reg::XZR, incremental);
        asm.adr(Reg::XZR, compaction);

        if self.remembered_set_action() == RememberedSetAction::EmitRememberedSet {
            self.emit_store_buffer_append(asm);
        } else {
            asm.ret();
        }

        asm.bind(incremental);
        self.generate_incremental(asm, Mode::Incremental);

        asm.bind(compaction);
        self.generate_incremental(asm, Mode::IncrementalCompaction);
    }

    fn generate_incremental(&self, asm: &mut AArch64Assembler, mode: Mode) {
        let no_need = asm.new_label();

        self.plan.save(asm);
        self.emit_needs_marking_check(asm, no_need);

        self.inform_incremental_marker(asm);
        self.plan.restore(asm);
        if mode == Mode::IncrementalCompaction {
            // The object is marked now, but compaction may still move it.
            self.emit_store_buffer_append(asm);
        } else {
            asm.ret();
        }

        asm.bind(no_need);
        match self.on_no_need() {
            OnNoNeedToInformIncrementalMarker::ReturnOnNoNeedToInformIncrementalMarker => {
                self.emit_return_on_no_need(asm)
            }
            OnNoNeedToInformIncrementalMarker::UpdateRememberedSetOnNoNeedToInformIncrementalMarker => {
                self.emit_update_remembered_set_on_no_need(asm)
            }
        }
    }

    /// Branch to `no_need` when marking is off, the value is a small
    /// integer, or the value's region is already fully marked. Expects
    /// `scratch1` and `scratch2` saved.
    fn emit_needs_marking_check(&self, asm: &mut AArch64Assembler, no_need: Label) {
        let layout = &self.layout;
        let value = self.plan.scratch0();
        let flag = self.plan.scratch1();
        let region = self.plan.scratch2();

        asm.ldr_disp(flag, self.root, layout.marking_flag_offset);
        asm.cbz(flag, no_need);

        asm.tbz(value, layout.heap_object_tag_bit, no_need);

        asm.lsr_imm(region, value, layout.region_size_log2);
        asm.lsl_imm(region, region, layout.region_size_log2);
        asm.ldr_disp(region, region, layout.region_flags_offset);
        asm.tbnz(region, layout.fully_marked_bit, no_need);
    }

    fn emit_return_on_no_need(&self, asm: &mut AArch64Assembler) {
        self.plan.restore(asm);
        asm.ret();
    }

    fn emit_update_remembered_set_on_no_need(&self, asm: &mut AArch64Assembler) {
        self.plan.restore(asm);
        self.emit_store_buffer_append(asm);
    }

    /// Call the marker with `(value, object, address)` in the argument
    /// registers, preserving caller state around the call.
    fn inform_incremental_marker(&self, asm: &mut AArch64Assembler) {
        let fp_mode = self.save_fp_regs_mode();
        self.plan.save_caller_registers(asm, fp_mode);

        emit_parallel_move(
            asm,
            &[
                (Reg::X0, self.plan.scratch0()),
                (Reg::X1, self.plan.object()),
                (Reg::X2, self.plan.address()),
            ],
            self.temp,
        );
        asm.ldr_disp(self.temp, self.root, self.layout.record_write_fn_offset);
        asm.blr(self.temp);

        self.plan.restore_caller_registers(asm, fp_mode);
    }

    /// Append `(object, address)` to the store buffer and return. Clobbers
    /// `scratch0` and the temporary.
    ///
    /// The load/store/bump of `top` is not atomic. Each root table, and so
    /// each store buffer, must belong to a single mutator thread.
    fn emit_store_buffer_append(&self, asm: &mut AArch64Assembler) {
        let layout = &self.layout;
        let top = self.plan.scratch0();
        let done = asm.new_label();

        asm.ldr_disp(top, self.root, layout.store_buffer_top_offset);
        asm.stp_post(self.plan.object(), self.plan.address(), top, 16);
        asm.str(top, self.root, layout.store_buffer_top_offset as u16);
        asm.ldr_disp(self.temp, self.root, layout.store_buffer_limit_offset);
        asm.cmp(top, self.temp);
        asm.b_cond(Cond::LO, done);

        // Buffer full
        let fp_mode = self.save_fp_regs_mode();
        self.plan.save(asm);
        self.plan.save_caller_registers(asm, fp_mode);
        asm.ldr_disp(self.temp, self.root, layout.store_buffer_overflow_fn_offset);
        asm.blr(self.temp);
        self.plan.restore_caller_registers(asm, fp_mode);
        self.plan.restore(asm);

        asm.bind(done);
        asm.ret();
    }
}

/// Emit register moves that happen "at once": no move reads a register an
/// earlier move already overwrote. Cycles go through `temp`.
fn emit_parallel_move(asm: &mut AArch64Assembler, moves: &[(Reg, Reg)], temp: Reg) {
    let mut pending: Vec<(Reg, Reg)> = moves.iter().copied().filter(|(d, s)| d != s).collect();

    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|&(dst, _)| !pending.iter().any(|&(_, src)| src == dst));
        match ready {
            Some(i) => {
                let (dst, src) = pending.remove(i);
                asm.mov(dst, src);
            }
            None => {
                let (dst, _) = pending[0];
                asm.mov(temp, dst);
                for (_, src) in pending.iter_mut() {
                    if *src == dst {
                        *src = temp;
                    }
                }
            }
        }
    }
}
