//! Opcode catalog and the four canonical operand-encoding formats instructions are
//! lowered into.
//!
//! A full catalogue with one opcode per addressing-mode variant would list roughly eighty
//! opcodes. This keeps one opcode per semantic family instead — the operand-encoding byte,
//! not the opcode, carries which addressing mode was used — which is smaller but loses
//! nothing the CPU core needs to dispatch correctly.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive as _;

use crate::assembler::address::{encode_address, MemOperand};
use crate::assembler::tables::RegisterRef;
use crate::error::PatchOutcome;
use crate::expr::Expr;
use crate::objfile::{Hole, ObjectFile, Segment};
use crate::patch::try_patch_hole;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    Nop = 0,
    Hlt = 1,
    Syscall = 2,
    Push = 3,
    Pop = 4,
    Call = 5,
    Ret = 6,
    Jmp = 7,
    Jcc = 8,
    Lea = 9,
    Mov = 10,
    MovCc = 11,
    Movzx = 12,
    Movsx = 13,
    Xchg = 14,
    Add = 15,
    Sub = 16,
    Mul = 17,
    Imul = 18,
    Div = 19,
    Idiv = 20,
    And = 21,
    Or = 22,
    Xor = 23,
    Shl = 24,
    Shr = 25,
    Sar = 26,
    Rol = 27,
    Ror = 28,
    Inc = 29,
    Dec = 30,
    Neg = 31,
    Not = 32,
    Cmp = 33,
    Cmpz = 34,
    Test = 35,
    Setcc = 36,
    Movs = 37,
    Cmps = 38,
    Lods = 39,
    Stos = 40,
    Scas = 41,
    Fld = 42,
    Fst = 43,
    Fxch = 44,
    Fadd = 45,
    Fsub = 46,
    Fmul = 47,
    Fdiv = 48,
    Fchs = 49,
    Fabs = 50,
    Fsqrt = 51,
    Finit = 52,
    Fwait = 53,
    VpuMov = 54,
    VpuAdd = 55,
    VpuSub = 56,
    VpuAnd = 57,
    VpuOr = 58,
    VpuXor = 59,
    VpuFcmp = 60,
    In = 61,
    Out = 62,
    F2xm1 = 63,
    Fyl2x = 64,
    Fscale = 65,
    Fpatan = 66,
    Fptan = 67,
    Fsin = 68,
    Fcos = 69,
    Fsincos = 70,
    Fprem = 71,
    Fprem1 = 72,
    Frndint = 73,
    Fxtract = 74,
    Fcom = 75,
    Fcomi = 76,
    VpuMul = 77,
    VpuDiv = 78,
    VpuNeg = 79,
    VpuAbs = 80,
    VpuSqrt = 81,
}

pub fn opcode_from_byte(b: u8) -> Option<Opcode> {
    Opcode::from_u8(b)
}

/// Which of the binary format's five addressing combinations this instance uses. Stored in the encoding's 4-bit mode field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandMode {
    RegReg,
    RegImm,
    RegMem,
    MemReg,
    MemImm,
}

impl OperandMode {
    pub fn tag(self) -> u8 {
        match self {
            OperandMode::RegReg => 0,
            OperandMode::RegImm => 1,
            OperandMode::RegMem => 2,
            OperandMode::MemReg => 3,
            OperandMode::MemImm => 4,
        }
    }

    pub fn from_tag(t: u8) -> Option<OperandMode> {
        Some(match t {
            0 => OperandMode::RegReg,
            1 => OperandMode::RegImm,
            2 => OperandMode::RegMem,
            3 => OperandMode::MemReg,
            4 => OperandMode::MemImm,
            _ => return None,
        })
    }

    pub fn involves_mem(self) -> bool {
        matches!(self, OperandMode::RegMem | OperandMode::MemReg | OperandMode::MemImm)
    }
}

/// The right-hand operand of a binary/ternary instruction once the router has resolved
/// what the source text named.
pub enum RmOperand {
    Reg(RegisterRef),
    Mem(MemOperand),
    Imm(Expr),
}

/// `[4:dest-reg][2:dest-size][1:dest-high][1:involves-mem]` then `[4:mode][4:src-reg]`.
fn encode_dest_header(dest: RegisterRef, involves_mem: bool) -> u8 {
    ((dest.id & 0xF) << 4) | ((dest.size_code & 0b11) << 2) | ((dest.high as u8) << 1) | (involves_mem as u8)
}

pub fn decode_dest_header(byte: u8) -> (RegisterRef, bool) {
    let involves_mem = byte & 1 != 0;
    let high = (byte >> 1) & 1 != 0;
    let size_code = (byte >> 2) & 0b11;
    let id = (byte >> 4) & 0xF;
    (RegisterRef { id, size_code, high }, involves_mem)
}

/// Appends `expr`'s bits to `seg`, deferring to a hole if it isn't evaluable yet and
/// attempting an immediate in-place patch otherwise, so concrete expressions never reach
/// the object file as holes.
pub fn emit_value(obj: &mut ObjectFile, seg: Segment, expr: Expr, size: u8, line: u32) {
    let address = obj.segment(seg).len() as u64;
    obj.segment_mut(seg)
        .extend(std::iter::repeat(0xFFu8).take(size as usize));
    let hole = Hole { address, size, line, expr };

    let (segment_bytes, symbols) = match seg {
        Segment::Text => (&mut obj.text, &mut obj.symbols),
        Segment::RoData => (&mut obj.rodata, &mut obj.symbols),
        Segment::Data => (&mut obj.data, &mut obj.symbols),
    };
    match try_patch_hole(segment_bytes, symbols, &hole) {
        PatchOutcome::Patched => {}
        PatchOutcome::Unevaluated => obj.holes_mut(seg).push(hole),
        PatchOutcome::Error(_) => obj.holes_mut(seg).push(hole),
    }
}

fn emit_rm(obj: &mut ObjectFile, seg: Segment, line: u32, operand: &RmOperand) {
    match operand {
        RmOperand::Reg(_) => {}
        RmOperand::Mem(mem) => {
            let has_imm = !matches!(&mem.displacement, Expr::Leaf(v) if v.as_u64() == 0);
            let header = encode_address(mem, has_imm);
            obj.segment_mut(seg).extend_from_slice(&header);
            if has_imm {
                let size = crate::assembler::tables::size_code_bytes(mem.pointer_size_code) as u8;
                emit_value(obj, seg, mem.displacement.clone(), size, line);
            }
        }
        RmOperand::Imm(expr) => {
            // caller determines the immediate's size from the destination register/pointer
            emit_value(obj, seg, expr.clone(), 8, line);
        }
    }
}

/// Binary-format instructions: `ADD/SUB/AND/OR/XOR/CMP/TEST/MOV/XCHG` and friends.
pub fn encode_binary(
    obj: &mut ObjectFile,
    seg: Segment,
    line: u32,
    opcode: Opcode,
    dest: RegisterRef,
    src: RmOperand,
) {
    let mode = match &src {
        RmOperand::Reg(_) => OperandMode::RegReg,
        RmOperand::Imm(_) => OperandMode::RegImm,
        RmOperand::Mem(_) => OperandMode::RegMem,
    };
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(dest, mode.involves_mem()));
    let src_reg = match &src {
        RmOperand::Reg(r) => r.id,
        _ => 0,
    };
    obj.segment_mut(seg).push((mode.tag() << 4) | (src_reg & 0xF));
    match src {
        RmOperand::Reg(_) => {}
        RmOperand::Mem(mem) => emit_rm(obj, seg, line, &RmOperand::Mem(mem)),
        RmOperand::Imm(expr) => {
            let size = crate::assembler::tables::size_code_bytes(dest.size_code) as u8;
            emit_value(obj, seg, expr, size, line);
        }
    }
}

/// `dest, mem` binary instructions whose destination is memory rather than a register
/// (`MemReg`/`MemImm` modes) — e.g. `ADD [rax], rbx` or `MOV [rax], 5`.
pub fn encode_binary_to_mem(
    obj: &mut ObjectFile,
    seg: Segment,
    line: u32,
    opcode: Opcode,
    dest_mem: MemOperand,
    src: RmOperand,
) {
    let (mode, src_reg) = match &src {
        RmOperand::Reg(r) => (OperandMode::MemReg, r.id),
        RmOperand::Imm(_) => (OperandMode::MemImm, 0),
        RmOperand::Mem(_) => panic!("memory-to-memory operands are not a valid binary form"),
    };
    let placeholder = RegisterRef { id: 0, size_code: dest_mem.pointer_size_code, high: false };
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(placeholder, true));
    obj.segment_mut(seg).push((mode.tag() << 4) | (src_reg & 0xF));
    emit_rm(obj, seg, line, &RmOperand::Mem(dest_mem.clone()));
    if let RmOperand::Imm(expr) = src {
        let size = crate::assembler::tables::size_code_bytes(dest_mem.pointer_size_code) as u8;
        emit_value(obj, seg, expr, size, line);
    }
}

/// Unary-format instructions: `INC/DEC/NEG/NOT/CMPZ/PUSH/POP/SETcc`.
pub fn encode_unary_reg(obj: &mut ObjectFile, seg: Segment, opcode: Opcode, dest: RegisterRef) {
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(dest, false));
}

pub fn encode_unary_mem(obj: &mut ObjectFile, seg: Segment, line: u32, opcode: Opcode, dest: MemOperand) {
    let placeholder = RegisterRef { id: 0, size_code: dest.pointer_size_code, high: false };
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(placeholder, true));
    emit_rm(obj, seg, line, &RmOperand::Mem(dest));
}

/// Ternary-format instructions: `IMUL dest, src, imm`.
pub fn encode_ternary(
    obj: &mut ObjectFile,
    seg: Segment,
    line: u32,
    opcode: Opcode,
    dest: RegisterRef,
    imm: Expr,
    src: RmOperand,
) {
    let involves_mem = matches!(src, RmOperand::Mem(_));
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(dest, involves_mem));
    let size = crate::assembler::tables::size_code_bytes(dest.size_code) as u8;
    emit_value(obj, seg, imm, size, line);
    match src {
        RmOperand::Reg(r) => obj.segment_mut(seg).push(r.id & 0xF),
        RmOperand::Mem(mem) => emit_rm(obj, seg, line, &RmOperand::Mem(mem)),
        RmOperand::Imm(_) => panic!("ternary source operand cannot itself be an immediate"),
    }
}

/// Shift-format: unary header plus a count byte (`bit 7` selects `CL`, low bits the
/// literal shift count masked to 5 or 6 bits per destination width).
pub fn encode_shift(
    obj: &mut ObjectFile,
    seg: Segment,
    opcode: Opcode,
    dest: RegisterRef,
    count: ShiftCount,
) {
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(encode_dest_header(dest, false));
    let mask = if dest.size_code == 3 { 0x3F } else { 0x1F };
    let byte = match count {
        ShiftCount::Cl => 0x80,
        ShiftCount::Literal(n) => n & mask,
    };
    obj.segment_mut(seg).push(byte);
}

#[derive(Clone, Copy, Debug)]
pub enum ShiftCount {
    Cl,
    Literal(u8),
}

pub fn encode_nullary(obj: &mut ObjectFile, seg: Segment, opcode: Opcode) {
    obj.segment_mut(seg).push(opcode as u8);
}

/// `CALL`/`JMP`/`Jcc` to a near target: opcode, (condition byte for `Jcc`), 8-byte
/// absolute target address expression.
pub fn encode_branch(obj: &mut ObjectFile, seg: Segment, line: u32, opcode: Opcode, cond: Option<u8>, target: Expr) {
    obj.segment_mut(seg).push(opcode as u8);
    if let Some(c) = cond {
        obj.segment_mut(seg).push(c);
    }
    emit_value(obj, seg, target, 8, line);
}

pub fn encode_push_reg(obj: &mut ObjectFile, seg: Segment, reg: RegisterRef) {
    obj.segment_mut(seg).push(Opcode::Push as u8);
    obj.segment_mut(seg).push(encode_dest_header(reg, false));
}

pub fn encode_push_imm(obj: &mut ObjectFile, seg: Segment, line: u32, imm: Expr) {
    let placeholder = RegisterRef { id: 0, size_code: 3, high: false };
    obj.segment_mut(seg).push(Opcode::Push as u8);
    obj.segment_mut(seg).push(encode_dest_header(placeholder, true));
    emit_value(obj, seg, imm, 8, line);
}

pub fn encode_string_op(obj: &mut ObjectFile, seg: Segment, opcode: Opcode, size_code: u8, rep_prefix: Option<RepPrefix>) {
    obj.segment_mut(seg).push(opcode as u8);
    let rep_byte = match rep_prefix {
        None => 0,
        Some(RepPrefix::Rep) => 1,
        Some(RepPrefix::Repe) => 2,
        Some(RepPrefix::Repne) => 3,
    };
    obj.segment_mut(seg).push((rep_byte << 2) | (size_code & 0b11));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repe,
    Repne,
}

/// FPU unary/binary ops address their operand as an `ST(i)` index 0..7 in the low 3 bits
/// of a single byte.
pub fn encode_fpu_unary(obj: &mut ObjectFile, seg: Segment, opcode: Opcode, st_index: u8) {
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(st_index & 0b111);
}

pub fn encode_fpu_binary(obj: &mut ObjectFile, seg: Segment, opcode: Opcode, dst_index: u8, src_index: u8) {
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(((dst_index & 0b111) << 3) | (src_index & 0b111));
}

/// SIMD settings byte: `[1:has-mask][1:zero-mask][1:scalar][1:mem-operand][2:elem-size][2:mode]`.
/// Always encodes `mem-operand = 0`; there is no assembler-level mnemonic syntax yet for a
/// memory-addressed vector operand (see `exec.rs`'s `fetch_vpu_rm`, which the CPU core
/// still supports when fed a hand-built instruction stream).
pub fn encode_vpu_settings(has_mask: bool, zero_mask: bool, scalar: bool, elem_size_code: u8, mode: u8) -> u8 {
    ((has_mask as u8) << 7)
        | ((zero_mask as u8) << 6)
        | ((scalar as u8) << 5)
        | ((elem_size_code & 0b11) << 2)
        | (mode & 0b11)
}

pub fn encode_vpu(obj: &mut ObjectFile, seg: Segment, opcode: Opcode, settings: u8, dst: u8, src1: u8, src2: Option<u8>) {
    obj.segment_mut(seg).push(opcode as u8);
    obj.segment_mut(seg).push(settings);
    obj.segment_mut(seg).push(dst & 0x1F);
    obj.segment_mut(seg).push(src1 & 0x1F);
    if let Some(s2) = src2 {
        obj.segment_mut(seg).push(s2 & 0x1F);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::SymbolTable;
    use std::convert::TryInto;

    fn reg(id: u8, size_code: u8) -> RegisterRef {
        RegisterRef { id, size_code, high: false }
    }

    #[test]
    fn dest_header_round_trips() {
        let r = RegisterRef { id: 11, size_code: 2, high: true };
        let byte = encode_dest_header(r, true);
        let (decoded, involves_mem) = decode_dest_header(byte);
        assert_eq!(decoded, r);
        assert!(involves_mem);
    }

    #[test]
    fn binary_reg_imm_patches_constant_immediately() {
        let mut obj = ObjectFile::new();
        encode_binary(
            &mut obj,
            Segment::Text,
            1,
            Opcode::Mov,
            reg(0, 3),
            RmOperand::Imm(Expr::int(0x93f7a810f45e0e3c)),
        );
        assert!(obj.text_holes.is_empty());
        assert_eq!(obj.text[0], Opcode::Mov as u8);
        let imm_bytes = &obj.text[3..11];
        assert_eq!(u64::from_le_bytes(imm_bytes.try_into().unwrap()), 0x93f7a810f45e0e3c);
    }

    #[test]
    fn binary_reg_imm_with_unresolved_symbol_leaves_a_hole() {
        let mut obj = ObjectFile::new();
        encode_binary(
            &mut obj,
            Segment::Text,
            1,
            Opcode::Mov,
            reg(0, 3),
            RmOperand::Imm(Expr::token("later")),
        );
        assert_eq!(obj.text_holes.len(), 1);
        obj.symbols.insert("later".to_string(), Expr::int(7));
        let mut symbols = obj.symbols.clone();
        crate::patch::drain_patchable(&mut obj.text, &mut symbols, &mut obj.text_holes).unwrap();
        assert!(obj.text_holes.is_empty());
    }

    #[test]
    fn shift_count_encodes_cl_flag() {
        let mut obj = ObjectFile::new();
        encode_shift(&mut obj, Segment::Text, Opcode::Shl, reg(0, 3), ShiftCount::Cl);
        assert_eq!(obj.text[2], 0x80);
    }

    #[test]
    fn nullary_emits_single_byte() {
        let mut obj = ObjectFile::new();
        encode_nullary(&mut obj, Segment::Text, Opcode::Hlt);
        assert_eq!(obj.text, vec![Opcode::Hlt as u8]);
    }

    #[test]
    fn opcode_round_trips_through_byte() {
        assert_eq!(opcode_from_byte(Opcode::Syscall as u8), Some(Opcode::Syscall));
        let _ = SymbolTable::new();
    }

    #[test]
    fn operand_mode_round_trips() {
        for m in [
            OperandMode::RegReg,
            OperandMode::RegImm,
            OperandMode::RegMem,
            OperandMode::MemReg,
            OperandMode::MemImm,
        ] {
            assert_eq!(OperandMode::from_tag(m.tag()), Some(m));
        }
    }
}
