/// AArch64 instruction encoding for stub generation.
///
/// This module provides functions for encoding AArch64 instructions
/// as machine code bytes, plus the handful of multi-instruction helpers
/// (register-list pushes, 64-bit immediates) the stubs are built from.

use super::codebuf::{CodeBuffer, Label, ReferenceKind};

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    X0 = 0, X1 = 1, X2 = 2, X3 = 3,
    X4 = 4, X5 = 5, X6 = 6, X7 = 7,
    X8 = 8, X9 = 9, X10 = 10, X11 = 11,
    X12 = 12, X13 = 13, X14 = 14, X15 = 15,
    X16 = 16, X17 = 17, X18 = 18, X19 = 19,
    X20 = 20, X21 = 21, X22 = 22, X23 = 23,
    X24 = 24, X25 = 25, X26 = 26, X27 = 27,
    X28 = 28,
    Fp = 29,  // Frame pointer
    Lr = 30,  // Link register
    Sp = 31,  // Stack pointer / Zero register (XZR in some contexts)
}

const ALL_REGS: [Reg; 32] = [
    Reg::X0, Reg::X1, Reg::X2, Reg::X3, Reg::X4, Reg::X5, Reg::X6, Reg::X7,
    Reg::X8, Reg::X9, Reg::X10, Reg::X11, Reg::X12, Reg::X13, Reg::X14, Reg::X15,
    Reg::X16, Reg::X17, Reg::X18, Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23,
    Reg::X24, Reg::X25, Reg::X26, Reg::X27, Reg::X28, Reg::Fp, Reg::Lr, Reg::Sp,
];

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Register with the given encoding, if it is in range.
    pub fn from_code(code: u8) -> Option<Reg> {
        ALL_REGS.get(code as usize).copied()
    }
}

/// AArch64 64-bit floating-point registers (D0-D31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpReg(u8);

impl FpReg {
    pub fn new(code: u8) -> Option<FpReg> {
        (code < 32).then_some(FpReg(code))
    }

    pub fn code(self) -> u8 {
        self.0
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,  // Equal
    Ne = 0b0001,  // Not equal
    Cs = 0b0010,  // Carry set / unsigned higher or same
    Cc = 0b0011,  // Carry clear / unsigned lower
    Mi = 0b0100,  // Minus / negative
    Pl = 0b0101,  // Plus / positive or zero
    Vs = 0b0110,  // Overflow set
    Vc = 0b0111,  // Overflow clear
    Hi = 0b1000,  // Unsigned higher
    Ls = 0b1001,  // Unsigned lower or same
    Ge = 0b1010,  // Signed greater than or equal
    Lt = 0b1011,  // Signed less than
    Gt = 0b1100,  // Signed greater than
    Le = 0b1101,  // Signed less than or equal
    Al = 0b1110,  // Always
}

impl Cond {
    /// Unsigned lower
    pub const LO: Cond = Cond::Cc;
}

/// `NOP`
pub const NOP: u32 = 0xD503201F;

/// Encode `B` from instruction offset `from` to `to`.
pub fn encode_b(from: usize, to: usize) -> Option<u32> {
    ReferenceKind::Branch26.encode(0x14000000, to as i64 - from as i64)
}

/// Byte displacement of a `B` instruction, or `None` if `inst` is not one.
pub fn decode_b(inst: u32) -> Option<i64> {
    (inst & 0xFC000000 == 0x14000000).then(|| ReferenceKind::Branch26.decode(inst))
}

/// Destination register and byte displacement of an `ADR` instruction.
pub fn decode_adr(inst: u32) -> Option<(u8, i64)> {
    (inst & 0x9F000000 == 0x10000000)
        .then(|| ((inst & 0x1F) as u8, ReferenceKind::Adr21.decode(inst)))
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    /// Current code offset.
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, Xm (64-bit add)
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.add_lsl(rd, rn, rm, 0);
    }

    /// ADD Xd, Xn, Xm, LSL #shift
    pub fn add_lsl(&mut self, rd: Reg, rn: Reg, rm: Reg, shift: u8) {
        // 1000 1011 000m mmmm iiii iinn nnnd dddd
        let inst = 0x8B000000
            | ((rm.code() as u32) << 16)
            | (((shift as u32) & 0x3F) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// ADD Xd, Xn, #imm12 (64-bit add immediate)
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        // 1001 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0x91000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// SUB Xd, Xn, #imm12 (64-bit subtract immediate)
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        // 1101 0001 00ii iiii iiii iinn nnnd dddd
        let inst = 0xD1000000
            | (((imm12 as u32) & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// AND Xd, Xn, Xm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        // 1000 1010 000m mmmm 0000 00nn nnnd dddd
        let inst = 0x8A000000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        // 1010 1010 000m mmmm 0000 00nn nnnd dddd
        let inst = 0xAA000000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOV Xd, Xm (register to register)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        // ORR Xd, XZR, Xm
        self.orr(rd, Reg::XZR, rm);
    }

    /// MOVZ Xd, #imm16, LSL #(16 * hw)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1101 0010 1hhi iiii iiii iiii iiid dddd
        let inst = 0xD2800000
            | (((hw as u32) & 0x3) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOVK Xd, #imm16, LSL #(16 * hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        // 1111 0010 1hhi iiii iiii iiii iiid dddd
        let inst = 0xF2800000
            | (((hw as u32) & 0x3) << 21)
            | ((imm16 as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// MOV Xd, #imm16 (move immediate)
    pub fn mov_imm(&mut self, rd: Reg, imm16: u16) {
        self.movz(rd, imm16, 0);
    }

    /// Materialize an arbitrary 64-bit constant (MOVZ + MOVK for each
    /// non-zero upper halfword).
    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        self.movz(rd, value as u16, 0);
        for hw in 1..4u8 {
            let part = (value >> (16 * hw as u32)) as u16;
            if part != 0 {
                self.movk(rd, part, hw);
            }
        }
    }

    /// LSR Xd, Xn, #shift (UBFM Xd, Xn, #shift, #63)
    pub fn lsr_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let inst = 0xD340FC00
            | (((shift as u32) & 0x3F) << 16)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    /// LSL Xd, Xn, #shift (UBFM Xd, Xn, #(-shift mod 64), #(63 - shift))
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let shift = (shift as u32) & 0x3F;
        let immr = (64 - shift) & 0x3F;
        let imms = 63 - shift;
        let inst = 0xD3400000
            | (immr << 16)
            | (imms << 10)
            | ((rn.code() as u32) << 5)
            | (rd.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Comparison ====================

    /// CMP Xn, Xm (compare registers)
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        // SUBS XZR, Xn, Xm
        // 1110 1011 000m mmmm 0000 00nn nnnd dddd
        let inst = 0xEB000000
            | ((rm.code() as u32) << 16)
            | ((rn.code() as u32) << 5)
            | (Reg::XZR.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Loads and Stores ====================

    /// LDR Xt, [Xn, #imm12] (load 64-bit, unsigned offset)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 01ii iiii iiii iinn nnnt tttt
        // imm12 is scaled by 8 (bytes)
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9400000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Xt, [Xn, #imm12] (store 64-bit, unsigned offset)
    pub fn str(&mut self, rt: Reg, rn: Reg, imm12: u16) {
        // 1111 1001 00ii iiii iiii iinn nnnt tttt
        let scaled = (imm12 / 8) as u32;
        let inst = 0xF9000000
            | ((scaled & 0xFFF) << 10)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDUR Xt, [Xn, #simm9] (load 64-bit, unscaled signed offset)
    pub fn ldur(&mut self, rt: Reg, rn: Reg, simm9: i16) {
        // 1111 1000 010i iiii iiii 00nn nnnt tttt
        let inst = 0xF8400000
            | (((simm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDURB Wt, [Xn, #simm9] (load byte, zero-extended)
    pub fn ldurb(&mut self, rt: Reg, rn: Reg, simm9: i16) {
        // 0011 1000 010i iiii iiii 00nn nnnt tttt
        let inst = 0x38400000
            | (((simm9 as u32) & 0x1FF) << 12)
            | ((rn.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// Load a 64-bit word from `[rn + disp]`, picking the scaled form when
    /// the displacement allows it.
    pub fn ldr_disp(&mut self, rt: Reg, rn: Reg, disp: i32) {
        if disp >= 0 && disp % 8 == 0 && disp < 8 * 4096 {
            self.ldr(rt, rn, disp as u16);
        } else {
            debug_assert!((-256..256).contains(&disp), "displacement {disp} out of range");
            self.ldur(rt, rn, disp as i16);
        }
    }

    /// STP Xt1, Xt2, [Xn], #imm (store pair with post-index)
    pub fn stp_post(&mut self, rt1: Reg, rt2: Reg, rn: Reg, imm: i16) {
        // 1010 1000 10ii iiii it2t 2tnn nnnt 1t1t1
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((rn.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    // ==================== Branches ====================

    /// B label (unconditional branch)
    pub fn b(&mut self, target: Label) {
        // 0001 01ii iiii iiii iiii iiii iiii iiii
        self.buf.emit_label_ref(0x14000000, target, ReferenceKind::Branch26);
    }

    /// B.cond label (conditional branch)
    pub fn b_cond(&mut self, cond: Cond, target: Label) {
        // 0101 0100 iiii iiii iiii iiii iii0 cccc
        self.buf
            .emit_label_ref(0x54000000 | (cond as u32), target, ReferenceKind::Branch19);
    }

    /// CBZ Xn, label (compare and branch if zero)
    pub fn cbz(&mut self, rn: Reg, target: Label) {
        // 1011 0100 iiii iiii iiii iiii iiit tttt
        self.buf
            .emit_label_ref(0xB4000000 | (rn.code() as u32), target, ReferenceKind::Branch19);
    }

    /// TBZ Xt, #bit, label (test bit and branch if zero)
    pub fn tbz(&mut self, rt: Reg, bit: u8, target: Label) {
        // b011 0110 bbbb biii iiii iiii iiit tttt
        let inst = 0x36000000 | Self::test_bit_fields(rt, bit);
        self.buf.emit_label_ref(inst, target, ReferenceKind::Branch14);
    }

    /// TBNZ Xt, #bit, label (test bit and branch if not zero)
    pub fn tbnz(&mut self, rt: Reg, bit: u8, target: Label) {
        let inst = 0x37000000 | Self::test_bit_fields(rt, bit);
        self.buf.emit_label_ref(inst, target, ReferenceKind::Branch14);
    }

    fn test_bit_fields(rt: Reg, bit: u8) -> u32 {
        let bit = (bit as u32) & 0x3F;
        ((bit >> 5) << 31) | ((bit & 0x1F) << 19) | (rt.code() as u32)
    }

    /// ADR Xd, label (PC-relative address)
    pub fn adr(&mut self, rd: Reg, target: Label) {
        // 0ii1 0000 iiii iiii iiii iiii iiid dddd
        self.buf
            .emit_label_ref(0x10000000 | (rd.code() as u32), target, ReferenceKind::Adr21);
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        // 1101 0110 0101 1111 0000 00nn nnn0 0000
        // Default: RET X30 (LR)
        let inst = 0xD65F03C0;
        self.emit_raw(inst);
    }

    /// BLR Xn (branch and link to register)
    pub fn blr(&mut self, rn: Reg) {
        // 1101 0110 0011 1111 0000 00nn nnn0 0000
        let inst = 0xD63F0000 | ((rn.code() as u32) << 5);
        self.emit_raw(inst);
    }

    // ==================== Stack operations ====================

    /// STP X1, X2, [SP, #imm]! (store pair with pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        // 1010 1001 10ii iiii it2t 2tnn nnnt 1t1t1
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA9800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP X1, X2, [SP], #imm (load pair with post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        // 1010 1000 11ii iiii it2t 2tnn nnnt 1t1t1
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0xA8C00000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// STP Dt1, Dt2, [SP, #imm]!
    pub fn stp_fp_pre(&mut self, rt1: FpReg, rt2: FpReg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0x6D800000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// LDP Dt1, Dt2, [SP], #imm
    pub fn ldp_fp_post(&mut self, rt1: FpReg, rt2: FpReg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        let inst = 0x6CC00000
            | (scaled << 15)
            | ((rt2.code() as u32) << 10)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt1.code() as u32);
        self.emit_raw(inst);
    }

    /// STR Dt, [SP, #imm]!
    pub fn str_fp_pre(&mut self, rt: FpReg, imm: i16) {
        let inst = 0xFC000C00
            | (((imm as u32) & 0x1FF) << 12)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// LDR Dt, [SP], #imm
    pub fn ldr_fp_post(&mut self, rt: FpReg, imm: i16) {
        let inst = 0xFC400400
            | (((imm as u32) & 0x1FF) << 12)
            | ((Reg::Sp.code() as u32) << 5)
            | (rt.code() as u32);
        self.emit_raw(inst);
    }

    /// Push general-purpose registers in pairs, keeping SP 16-byte aligned.
    /// An odd register is paired with XZR.
    pub fn push_regs(&mut self, regs: &[Reg]) {
        for pair in regs.chunks(2) {
            let second = pair.get(1).copied().unwrap_or(Reg::XZR);
            self.stp_pre(pair[0], second, -16);
        }
    }

    /// Exact mirror of [`AArch64Assembler::push_regs`].
    pub fn pop_regs(&mut self, regs: &[Reg]) {
        for pair in regs.chunks(2).rev() {
            let second = pair.get(1).copied().unwrap_or(Reg::XZR);
            self.ldp_post(pair[0], second, 16);
        }
    }

    /// Push floating-point registers in pairs.
    pub fn push_fp_regs(&mut self, regs: &[FpReg]) {
        for pair in regs.chunks(2) {
            match pair {
                [a, b] => self.stp_fp_pre(*a, *b, -16),
                [a] => self.str_fp_pre(*a, -16),
                _ => unreachable!(),
            }
        }
    }

    /// Exact mirror of [`AArch64Assembler::push_fp_regs`].
    pub fn pop_fp_regs(&mut self, regs: &[FpReg]) {
        for pair in regs.chunks(2).rev() {
            match pair {
                [a, b] => self.ldp_fp_post(*a, *b, 16),
                [a] => self.ldr_fp_post(*a, 16),
                _ => unreachable!(),
            }
        }
    }

    // ==================== NOP ====================

    /// NOP (no operation)
    pub fn nop(&mut self) {
        // 1101 0101 0000 0011 0010 0000 0001 1111
        self.emit_raw(NOP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut AArch64Assembler)) -> Vec<u32> {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        f(&mut asm);
        buf.resolve_labels().unwrap();
        buf.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_add() {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.add(Reg::X0, Reg::X1, Reg::X2);

        // ADD X0, X1, X2 should be 0x8B020020
        assert_eq!(buf.code(), &[0x20, 0x00, 0x02, 0x8B]);
    }

    #[test]
    fn test_add_lsl() {
        // add x3, x3, x3, lsl #1
        assert_eq!(assemble(|a| a.add_lsl(Reg::X3, Reg::X3, Reg::X3, 1)), vec![0x8B030463]);
    }

    #[test]
    fn test_mov_imm64() {
        let words = assemble(|a| a.mov_imm64(Reg::X0, 0x0001_0000_0000_002A));

        // movz x0, #42 ; movk x0, #1, lsl #48
        assert_eq!(words, vec![0xD2800540, 0xF2E00020]);
    }

    #[test]
    fn test_shifts() {
        // lsr x1, x2, #18 ; lsl x1, x1, #18
        let words = assemble(|a| {
            a.lsr_imm(Reg::X1, Reg::X2, 18);
            a.lsl_imm(Reg::X1, Reg::X1, 18);
        });
        assert_eq!(words, vec![0xD352FC41, 0xD36EB421]);
    }

    #[test]
    fn test_ret() {
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.ret();

        // RET should be 0xD65F03C0
        assert_eq!(buf.code(), &[0xC0, 0x03, 0x5F, 0xD6]);
    }

    #[test]
    fn test_tbnz_high_bit() {
        let words = assemble(|a| {
            let l = a.new_label();
            a.tbnz(Reg::X5, 33, l);
            a.bind(l);
        });
        // b5 = 1, b40 = 1, imm14 = 1
        assert_eq!(words[0], 0xB7080025);
    }

    #[test]
    fn test_push_pop_pairs_are_mirrored() {
        let regs = [Reg::X0, Reg::X1, Reg::X2];
        let words = assemble(|a| {
            a.push_regs(&regs);
            a.pop_regs(&regs);
        });
        // stp x0, x1, [sp, #-16]! ; stp x2, xzr, [sp, #-16]!
        // ldp x2, xzr, [sp], #16  ; ldp x0, x1, [sp], #16
        assert_eq!(words, vec![0xA9BF07E0, 0xA9BF7FE2, 0xA8C17FE2, 0xA8C107E0]);
    }

    #[test]
    fn test_branch_helpers() {
        let b = encode_b(0, 0x40).unwrap();
        assert_eq!(decode_b(b), Some(0x40));
        assert_eq!(decode_b(NOP), None);

        let words = assemble(|a| {
            let l = a.new_label();
            a.adr(Reg::XZR, l);
            a.nop();
            a.bind(l);
        });
        assert_eq!(decode_adr(words[0]), Some((31, 8)));
    }
}
