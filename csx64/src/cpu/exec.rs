//! Per-opcode instruction handlers.

use crate::assembler::encode::Opcode;
use crate::assembler::tables::size_code_bytes;
use crate::error::RuntimeError;

use super::flags::{size_mask, RFlags};
use super::registers::{RAX, RBX, RCX, RDI, RDX, RSI};
use super::simd::{Settings, VectorFile};
use super::syscall::{self, FileHandle, SyscallCode};
use super::{BinaryDest, BinarySrc, Cpu, Step};

pub(super) fn execute(cpu: &mut Cpu, opcode: Opcode) -> Result<Step, RuntimeError> {
    match opcode {
        Opcode::Nop => Ok(Step::Continue),
        Opcode::Hlt => {
            cpu.running = false;
            cpu.fds.close_all();
            Ok(Step::Stop)
        }
        Opcode::Syscall => do_syscall(cpu),

        Opcode::Push => do_push(cpu),
        Opcode::Pop => do_pop(cpu),
        Opcode::Call => do_call(cpu),
        Opcode::Ret => do_ret(cpu),
        Opcode::Jmp => do_jmp(cpu, None),
        Opcode::Jcc => {
            let cond = cpu_fetch_u8(cpu)?;
            do_jmp(cpu, Some(cond))
        }

        Opcode::Lea => do_lea(cpu),
        Opcode::Mov => do_mov(cpu),
        Opcode::MovCc => do_mov_cc(cpu),
        Opcode::Movzx | Opcode::Movsx => do_mov(cpu),
        Opcode::Xchg => do_xchg(cpu),

        Opcode::Add => do_binary_arith(cpu, BinOp::Add),
        Opcode::Sub => do_binary_arith(cpu, BinOp::Sub),
        Opcode::And => do_binary_arith(cpu, BinOp::And),
        Opcode::Or => do_binary_arith(cpu, BinOp::Or),
        Opcode::Xor => do_binary_arith(cpu, BinOp::Xor),
        Opcode::Cmp => do_cmp(cpu),
        Opcode::Test => do_test(cpu),

        Opcode::Mul => do_mul(cpu, false),
        Opcode::Imul => do_mul(cpu, true),
        Opcode::Div => do_div(cpu, false),
        Opcode::Idiv => do_div(cpu, true),

        Opcode::Shl => do_shift(cpu, ShiftOp::Shl),
        Opcode::Shr => do_shift(cpu, ShiftOp::Shr),
        Opcode::Sar => do_shift(cpu, ShiftOp::Sar),
        Opcode::Rol => do_shift(cpu, ShiftOp::Rol),
        Opcode::Ror => do_shift(cpu, ShiftOp::Ror),

        Opcode::Inc => do_inc_dec(cpu, true),
        Opcode::Dec => do_inc_dec(cpu, false),
        Opcode::Neg => do_neg(cpu),
        Opcode::Not => do_not(cpu),
        Opcode::Cmpz => do_cmpz(cpu),
        Opcode::Setcc => do_setcc(cpu),

        Opcode::Movs => do_string_op(cpu, StringOp::Movs),
        Opcode::Cmps => do_string_op(cpu, StringOp::Cmps),
        Opcode::Lods => do_string_op(cpu, StringOp::Lods),
        Opcode::Stos => do_string_op(cpu, StringOp::Stos),
        Opcode::Scas => do_string_op(cpu, StringOp::Scas),

        Opcode::Fld => do_fpu_unary(cpu, FpuUnary::Ld),
        Opcode::Fst => do_fpu_unary(cpu, FpuUnary::St),
        Opcode::Fxch => do_fpu_binary(cpu, FpuBinary::Xch),
        Opcode::Fadd => do_fpu_binary(cpu, FpuBinary::Add),
        Opcode::Fsub => do_fpu_binary(cpu, FpuBinary::Sub),
        Opcode::Fmul => do_fpu_binary(cpu, FpuBinary::Mul),
        Opcode::Fdiv => do_fpu_binary(cpu, FpuBinary::Div),
        Opcode::Fchs => do_fpu_unary(cpu, FpuUnary::Chs),
        Opcode::Fabs => do_fpu_unary(cpu, FpuUnary::Abs),
        Opcode::Fsqrt => do_fpu_unary(cpu, FpuUnary::Sqrt),
        Opcode::Finit => {
            cpu.fpu.finit();
            Ok(Step::Continue)
        }
        Opcode::Fwait => Ok(Step::Continue),

        Opcode::F2xm1 => fpu_nullary(cpu, |fpu| fpu.f2xm1()),
        Opcode::Fyl2x => fpu_nullary(cpu, |fpu| fpu.fyl2x()),
        Opcode::Fscale => fpu_nullary(cpu, |fpu| fpu.fscale()),
        Opcode::Fpatan => fpu_nullary(cpu, |fpu| fpu.fpatan()),
        Opcode::Fptan => fpu_nullary(cpu, |fpu| fpu.fptan()),
        Opcode::Fsin => fpu_nullary(cpu, |fpu| fpu.fsin()),
        Opcode::Fcos => fpu_nullary(cpu, |fpu| fpu.fcos()),
        Opcode::Fsincos => fpu_nullary(cpu, |fpu| fpu.fsincos()),
        Opcode::Fprem => fpu_nullary(cpu, |fpu| fpu.fprem()),
        Opcode::Fprem1 => fpu_nullary(cpu, |fpu| fpu.fprem1()),
        Opcode::Frndint => fpu_nullary(cpu, |fpu| fpu.frndint()),
        Opcode::Fxtract => fpu_nullary(cpu, |fpu| fpu.fxtract()),
        Opcode::Fcom => do_fpu_compare(cpu, false),
        Opcode::Fcomi => do_fpu_compare(cpu, true),

        Opcode::VpuMov => do_vpu_mov(cpu),
        Opcode::VpuAdd => do_vpu_binary(cpu, VpuOp::Add),
        Opcode::VpuSub => do_vpu_binary(cpu, VpuOp::Sub),
        Opcode::VpuAnd => do_vpu_binary(cpu, VpuOp::And),
        Opcode::VpuOr => do_vpu_binary(cpu, VpuOp::Or),
        Opcode::VpuXor => do_vpu_binary(cpu, VpuOp::Xor),
        Opcode::VpuMul => do_vpu_binary(cpu, VpuOp::Mul),
        Opcode::VpuDiv => do_vpu_binary(cpu, VpuOp::Div),
        Opcode::VpuFcmp => do_vpu_fcmp(cpu),
        Opcode::VpuNeg => do_vpu_unary(cpu, VpuUnaryOp::Neg),
        Opcode::VpuAbs => do_vpu_unary(cpu, VpuUnaryOp::Abs),
        Opcode::VpuSqrt => do_vpu_unary(cpu, VpuUnaryOp::Sqrt),

        Opcode::In => do_port_in(cpu),
        Opcode::Out => do_port_out(cpu),
    }
}

fn cpu_fetch_u8(cpu: &mut Cpu) -> Result<u8, RuntimeError> {
    let b = cpu.memory.read(cpu.rip, 1)?[0];
    cpu.rip += 1;
    Ok(b)
}

// -- stack / control flow --

fn do_push(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let header = cpu_fetch_u8(cpu)?;
    let (reg, involves_mem) = crate::assembler::encode::decode_dest_header(header);
    let value = if involves_mem {
        cpu.fetch_u64_sized(8)?
    } else {
        cpu.registers.get64(reg.id)
    };
    cpu.push_u64(value)?;
    Ok(Step::Continue)
}

fn do_pop(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let header = cpu_fetch_u8(cpu)?;
    let (reg, _) = crate::assembler::encode::decode_dest_header(header);
    let value = cpu.pop_u64()?;
    cpu.registers.set(reg.id, reg.size_code, reg.high, value);
    Ok(Step::Continue)
}

fn do_call(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let target = cpu.fetch_u64_sized(8)?;
    cpu.push_u64(cpu.rip)?;
    cpu.rip = target;
    Ok(Step::Continue)
}

fn do_ret(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    cpu.rip = cpu.pop_u64()?;
    Ok(Step::Continue)
}

fn do_jmp(cpu: &mut Cpu, cond: Option<u8>) -> Result<Step, RuntimeError> {
    let target = cpu.fetch_u64_sized(8)?;
    let take = match cond {
        None => true,
        Some(c) => evaluate_condition(c, &cpu.flags),
    };
    if take {
        cpu.rip = target;
    }
    Ok(Step::Continue)
}

/// The six conditions the assembler currently exposes (`JE/JNE/JL/JGE/JG/JLE`), per the
/// standard intel signed-comparison table.
fn evaluate_condition(cond: u8, flags: &RFlags) -> bool {
    match cond {
        0 => flags.zf,
        1 => !flags.zf,
        2 => flags.sf != flags.of,
        3 => flags.sf == flags.of,
        4 => !flags.zf && flags.sf == flags.of,
        5 => flags.zf || flags.sf != flags.of,
        _ => false,
    }
}

// -- data movement --

fn do_lea(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let dest = decoded.dest;
    let addr = match decoded.src {
        BinarySrc::Mem(addr) => addr,
        _ => return Err(RuntimeError::UndefinedBehavior),
    };
    cpu.write_dest(&dest, addr)?;
    Ok(Step::Continue)
}

fn do_mov(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let value = read_src_for(cpu, &decoded)?;
    cpu.write_dest(&decoded.dest, value)?;
    Ok(Step::Continue)
}

fn do_mov_cc(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let cond = cpu_fetch_u8(cpu)?;
    let decoded = cpu.decode_binary()?;
    if evaluate_condition(cond, &cpu.flags) {
        let value = read_src_for(cpu, &decoded)?;
        cpu.write_dest(&decoded.dest, value)?;
    }
    Ok(Step::Continue)
}

fn do_xchg(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let a = cpu.read_dest(&decoded.dest)?;
    let b = read_src_for(cpu, &decoded)?;
    cpu.write_dest(&decoded.dest, b)?;
    if let BinarySrc::Reg(id) = decoded.src {
        cpu.registers.set(id, dest_size_code(&decoded.dest), dest_high(&decoded.dest), a);
    }
    Ok(Step::Continue)
}

fn dest_size_code(dest: &BinaryDest) -> u8 {
    match dest {
        BinaryDest::Reg { size_code, .. } => *size_code,
        BinaryDest::Mem { size_bytes, .. } => size_code_for_bytes(*size_bytes),
    }
}

fn dest_high(dest: &BinaryDest) -> bool {
    matches!(dest, BinaryDest::Reg { high: true, .. })
}

fn size_code_for_bytes(bytes: u32) -> u8 {
    match bytes {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    }
}

fn read_src_for(cpu: &Cpu, decoded: &super::DecodedBinary) -> Result<u64, RuntimeError> {
    let size_code = dest_size_code(&decoded.dest);
    let high = dest_high(&decoded.dest);
    cpu.read_binary_src(&decoded.src, decoded.size_bytes, size_code, high)
}

// -- arithmetic / logic --

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

fn apply_binop(op: BinOp, flags: &mut RFlags, rng_bit: impl Fn() -> bool, a: u64, b: u64, size_bytes: u32) -> u64 {
    let mask = size_mask(size_bytes);
    let am = a & mask;
    let bm = b & mask;
    match op {
        BinOp::Add => {
            let full = am as u128 + bm as u128;
            let res = (full as u64) & mask;
            flags.cf = full > mask as u128;
            flags.af = RFlags::adjust_flag_add(a, b);
            flags.of = RFlags::add_overflow(a, b, res, size_bytes);
            flags.update_zsp(res, size_bytes);
            res
        }
        BinOp::Sub => {
            let res = am.wrapping_sub(bm) & mask;
            flags.cf = am < bm;
            flags.af = RFlags::adjust_flag_sub(a, b);
            flags.of = RFlags::sub_overflow(a, b, res, size_bytes);
            flags.update_zsp(res, size_bytes);
            res
        }
        BinOp::And | BinOp::Or | BinOp::Xor => {
            let res = match op {
                BinOp::And => am & bm,
                BinOp::Or => am | bm,
                BinOp::Xor => am ^ bm,
                _ => unreachable!(),
            };
            flags.cf = false;
            flags.of = false;
            flags.af = rng_bit();
            flags.update_zsp(res, size_bytes);
            res
        }
    }
}

fn do_binary_arith(cpu: &mut Cpu, op: BinOp) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let a = cpu.read_dest(&decoded.dest)?;
    let b = read_src_for(cpu, &decoded)?;
    let bit = cpu.random_bool();
    let res = apply_binop(op, &mut cpu.flags, || bit, a, b, decoded.size_bytes);
    cpu.write_dest(&decoded.dest, res)?;
    Ok(Step::Continue)
}

fn do_cmp(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let a = cpu.read_dest(&decoded.dest)?;
    let b = read_src_for(cpu, &decoded)?;
    let bit = cpu.random_bool();
    apply_binop(BinOp::Sub, &mut cpu.flags, || bit, a, b, decoded.size_bytes);
    Ok(Step::Continue)
}

fn do_test(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let decoded = cpu.decode_binary()?;
    let a = cpu.read_dest(&decoded.dest)?;
    let b = read_src_for(cpu, &decoded)?;
    let bit = cpu.random_bool();
    apply_binop(BinOp::And, &mut cpu.flags, || bit, a, b, decoded.size_bytes);
    Ok(Step::Continue)
}

fn do_cmpz(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let value = read_unary(cpu, &operand)?;
    let bit = cpu.random_bool();
    apply_binop(BinOp::Sub, &mut cpu.flags, || bit, value, 0, size_bytes);
    Ok(Step::Continue)
}

fn do_inc_dec(cpu: &mut Cpu, inc: bool) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let value = read_unary(cpu, &operand)?;
    let saved_cf = cpu.flags.cf;
    let op = if inc { BinOp::Add } else { BinOp::Sub };
    let bit = cpu.random_bool();
    let res = apply_binop(op, &mut cpu.flags, || bit, value, 1, size_bytes);
    // INC/DEC do not touch CF, unlike ADD/SUB through the same ALU path.
    cpu.flags.cf = saved_cf;
    write_unary(cpu, &operand, res)?;
    Ok(Step::Continue)
}

fn do_neg(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let value = read_unary(cpu, &operand)?;
    cpu.flags.cf = value & size_mask(size_bytes) != 0;
    let bit = cpu.random_bool();
    let res = apply_binop(BinOp::Sub, &mut cpu.flags, || bit, 0, value, size_bytes);
    write_unary(cpu, &operand, res)?;
    Ok(Step::Continue)
}

fn do_not(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let value = read_unary(cpu, &operand)?;
    let res = (!value) & size_mask(size_bytes);
    write_unary(cpu, &operand, res)?;
    Ok(Step::Continue)
}

fn do_setcc(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let cond = cpu_fetch_u8(cpu)?;
    let header = cpu_fetch_u8(cpu)?;
    let (reg, _) = crate::assembler::encode::decode_dest_header(header);
    let value = evaluate_condition(cond, &cpu.flags) as u64;
    cpu.registers.set(reg.id, 0, reg.high, value);
    Ok(Step::Continue)
}

// -- multiply / divide --

fn do_mul(cpu: &mut Cpu, signed: bool) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let operand_value = read_unary(cpu, &operand)?;
    let size_code = size_code_for_bytes(size_bytes);
    let a = cpu.registers.get(RAX, size_code, false);

    let (lo, hi, carry) = if signed {
        let wide = (sign_extend(a, size_bytes) as i128) * (sign_extend(operand_value, size_bytes) as i128);
        let mask = size_mask(size_bytes) as u128;
        let lo = (wide as u128 & mask) as u64;
        let hi = ((wide >> (size_bytes * 8)) as u128 & mask) as u64;
        // overflow iff the high half isn't just the sign-extension of the low half.
        let sign_extended = sign_extend(lo, size_bytes) as i128 == wide;
        (lo, hi, !sign_extended)
    } else {
        let wide = (a as u128) * (operand_value as u128 & size_mask(size_bytes) as u128);
        let mask = size_mask(size_bytes) as u128;
        let lo = (wide & mask) as u64;
        let hi = ((wide >> (size_bytes * 8)) & mask) as u64;
        (lo, hi, hi != 0)
    };

    cpu.registers.set(RAX, size_code, false, lo);
    cpu.registers.set(RDX, size_code, false, hi);
    cpu.flags.cf = carry;
    cpu.flags.of = carry;
    cpu.flags.zf = cpu.random_bool();
    cpu.flags.sf = cpu.random_bool();
    cpu.flags.pf = cpu.random_bool();
    Ok(Step::Continue)
}

fn sign_extend(value: u64, size_bytes: u32) -> i64 {
    let bits = size_bytes * 8;
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn do_div(cpu: &mut Cpu, signed: bool) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let divisor = read_unary(cpu, &operand)?;
    let size_code = size_code_for_bytes(size_bytes);
    let lo = cpu.registers.get(RAX, size_code, false);
    let hi = cpu.registers.get(RDX, size_code, false);
    let mask = size_mask(size_bytes) as u128;

    if signed {
        if sign_extend(divisor, size_bytes) == 0 {
            return Err(RuntimeError::ArithmeticError);
        }
        let dividend = ((hi as u128 & mask) << (size_bytes * 8)) | (lo as u128 & mask);
        let dividend = dividend as i128;
        // For an 8-byte operand the hi:lo pair already fills all 128 bits, so the cast above
        // sign-extends correctly on its own; shifting by size_bytes * 16 there would overflow
        // i128's own width.
        let dividend = if size_bytes < 8 && hi != 0 && sign_extend(hi, size_bytes) < 0 {
            dividend - (1i128 << (size_bytes * 16))
        } else {
            dividend
        };
        let d = sign_extend(divisor, size_bytes) as i128;
        let quotient = dividend / d;
        let remainder = dividend % d;
        let qmin = -(1i128 << (size_bytes * 8 - 1));
        let qmax = (1i128 << (size_bytes * 8 - 1)) - 1;
        if quotient < qmin || quotient > qmax {
            return Err(RuntimeError::ArithmeticError);
        }
        cpu.registers.set(RAX, size_code, false, (quotient as u64) & mask as u64);
        cpu.registers.set(RDX, size_code, false, (remainder as u64) & mask as u64);
    } else {
        if divisor & mask as u64 == 0 {
            return Err(RuntimeError::ArithmeticError);
        }
        let dividend = ((hi as u128 & mask) << (size_bytes * 8)) | (lo as u128 & mask);
        let d = divisor as u128 & mask;
        let quotient = dividend / d;
        let remainder = dividend % d;
        if quotient > mask {
            return Err(RuntimeError::ArithmeticError);
        }
        cpu.registers.set(RAX, size_code, false, quotient as u64);
        cpu.registers.set(RDX, size_code, false, remainder as u64);
    }
    Ok(Step::Continue)
}

// -- shifts --

#[derive(Clone, Copy)]
enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

fn do_shift(cpu: &mut Cpu, op: ShiftOp) -> Result<Step, RuntimeError> {
    let (operand, size_bytes) = decode_unary(cpu)?;
    let count_byte = cpu_fetch_u8(cpu)?;
    let bits = size_bytes * 8;
    let shift_mask = if bits == 64 { 0x3F } else { 0x1F };
    let count = if count_byte & 0x80 != 0 {
        cpu.registers.get(RCX, 0, false) & shift_mask as u64 // CL is RCX's low byte
    } else {
        (count_byte & shift_mask) as u64
    };
    let value = read_unary(cpu, &operand)?;
    let mask = size_mask(size_bytes);
    let v = value & mask;

    let (res, cf, of_defined, of) = match op {
        ShiftOp::Shl => {
            if count == 0 {
                (v, cpu.flags.cf, false, false)
            } else {
                let res = (v << count) & mask;
                let cf = count <= bits as u64 && ((v >> (bits as u64 - count)) & 1) != 0;
                let of = RFlags::sign_of(res, size_bytes) != cf;
                (res, cf, count == 1, of)
            }
        }
        ShiftOp::Shr => {
            if count == 0 {
                (v, cpu.flags.cf, false, false)
            } else {
                let res = v >> count;
                let cf = ((v >> (count - 1)) & 1) != 0;
                let of = RFlags::sign_of(v, size_bytes);
                (res, cf, count == 1, of)
            }
        }
        ShiftOp::Sar => {
            if count == 0 {
                (v, cpu.flags.cf, false, false)
            } else {
                let signed = sign_extend(v, size_bytes);
                let res = ((signed >> count.min(63)) as u64) & mask;
                let cf = ((v >> (count - 1).min(bits as u64 - 1)) & 1) != 0;
                (res, cf, count == 1, false)
            }
        }
        ShiftOp::Rol => {
            if count == 0 {
                (v, cpu.flags.cf, false, false)
            } else {
                let c = count % bits as u64;
                let res = if c == 0 { v } else { ((v << c) | (v >> (bits as u64 - c))) & mask };
                let cf = res & 1 != 0;
                let of = RFlags::sign_of(res, size_bytes) != cf;
                (res, cf, count == 1, of)
            }
        }
        ShiftOp::Ror => {
            if count == 0 {
                (v, cpu.flags.cf, false, false)
            } else {
                let c = count % bits as u64;
                let res = if c == 0 { v } else { ((v >> c) | (v << (bits as u64 - c))) & mask };
                let cf = RFlags::sign_of(res, size_bytes);
                let top2 = (res >> (bits as u64 - 2)) & 0b11;
                let of = (top2 == 0b01) || (top2 == 0b10);
                (res, cf, count == 1, of)
            }
        }
    };

    cpu.flags.cf = cf;
    if of_defined {
        cpu.flags.of = of;
    } else if count != 0 {
        cpu.flags.of = cpu.random_bool();
    }
    if count != 0 && !matches!(op, ShiftOp::Rol | ShiftOp::Ror) {
        cpu.flags.update_zsp(res, size_bytes);
    }
    write_unary(cpu, &operand, res)?;
    Ok(Step::Continue)
}

// -- unary operand decode shared by INC/DEC/NEG/NOT/CMPZ/shifts --

enum UnaryOperand {
    Reg { id: u8, size_code: u8, high: bool },
    Mem { addr: u64, size_bytes: u32 },
}

fn decode_unary(cpu: &mut Cpu) -> Result<(UnaryOperand, u32), RuntimeError> {
    let header = cpu_fetch_u8(cpu)?;
    let (reg, involves_mem) = crate::assembler::encode::decode_dest_header(header);
    if involves_mem {
        let (addr, ptr_size_code) = cpu.fetch_address()?;
        let size_bytes = size_code_bytes(ptr_size_code as u8);
        Ok((UnaryOperand::Mem { addr, size_bytes }, size_bytes))
    } else {
        let size_bytes = size_code_bytes(reg.size_code);
        Ok((UnaryOperand::Reg { id: reg.id, size_code: reg.size_code, high: reg.high }, size_bytes))
    }
}

fn read_unary(cpu: &Cpu, operand: &UnaryOperand) -> Result<u64, RuntimeError> {
    match operand {
        UnaryOperand::Reg { id, size_code, high } => Ok(cpu.registers.get(*id, *size_code, *high)),
        UnaryOperand::Mem { addr, size_bytes } => cpu.memory.read_u64(*addr, *size_bytes),
    }
}

fn write_unary(cpu: &mut Cpu, operand: &UnaryOperand, value: u64) -> Result<(), RuntimeError> {
    match operand {
        UnaryOperand::Reg { id, size_code, high } => {
            cpu.registers.set(*id, *size_code, *high, value);
            Ok(())
        }
        UnaryOperand::Mem { addr, size_bytes } => cpu.memory.write_u64(*addr, value, *size_bytes),
    }
}

// -- string ops --

#[derive(Clone, Copy)]
enum StringOp {
    Movs,
    Cmps,
    Lods,
    Stos,
    Scas,
}

fn do_string_op(cpu: &mut Cpu, op: StringOp) -> Result<Step, RuntimeError> {
    let settings = cpu_fetch_u8(cpu)?;
    let size_code = settings & 0b11;
    let rep_tag = (settings >> 2) & 0b11;
    let size_bytes = size_code_bytes(size_code);
    let step_len: i64 = if cpu.flags.df { -(size_bytes as i64) } else { size_bytes as i64 };

    // 0 = no prefix, 1 = REP, 2 = REPE/REPZ, 3 = REPNE/REPNZ, matching `encode_string_op`.
    if rep_tag == 0 {
        run_one_string_iteration(cpu, op, size_bytes, step_len)?;
        return Ok(Step::Continue);
    }

    let should_continue = |cpu: &Cpu| match rep_tag {
        1 => true,
        2 => cpu.flags.zf,
        3 => !cpu.flags.zf,
        _ => unreachable!("rep_tag is masked to 2 bits"),
    };

    if cpu.flags.otrf {
        loop {
            let rcx = cpu.registers.get64(RCX);
            if rcx == 0 {
                break;
            }
            run_one_string_iteration(cpu, op, size_bytes, step_len)?;
            cpu.registers.set64(RCX, rcx - 1);
            if !should_continue(cpu) {
                break;
            }
        }
        Ok(Step::Continue)
    } else {
        let rcx = cpu.registers.get64(RCX);
        if rcx == 0 {
            return Ok(Step::Continue);
        }
        run_one_string_iteration(cpu, op, size_bytes, step_len)?;
        cpu.registers.set64(RCX, rcx - 1);
        if should_continue(cpu) && cpu.registers.get64(RCX) != 0 {
            cpu.rip -= 2;
        }
        Ok(Step::Continue)
    }
}

/// Runs one element of the string op and updates flags for the comparing variants
/// (`CMPS`/`SCAS`); the `REP`/`REPE`/`REPNE` continuation test reads `cpu.flags.zf`
/// afterwards rather than a return value here, since plain `REP` never looks at it.
fn run_one_string_iteration(cpu: &mut Cpu, op: StringOp, size_bytes: u32, step: i64) -> Result<(), RuntimeError> {
    let si = cpu.registers.get64(RSI);
    let di = cpu.registers.get64(RDI);
    let size_code = size_code_for_bytes(size_bytes);

    match op {
        StringOp::Movs => {
            let v = cpu.memory.read_u64(si, size_bytes)?;
            cpu.memory.write_u64(di, v, size_bytes)?;
            cpu.registers.set64(RSI, (si as i64 + step) as u64);
            cpu.registers.set64(RDI, (di as i64 + step) as u64);
        }
        StringOp::Cmps => {
            let a = cpu.memory.read_u64(si, size_bytes)?;
            let b = cpu.memory.read_u64(di, size_bytes)?;
            let bit = cpu.random_bool();
            apply_binop(BinOp::Sub, &mut cpu.flags, || bit, a, b, size_bytes);
            cpu.registers.set64(RSI, (si as i64 + step) as u64);
            cpu.registers.set64(RDI, (di as i64 + step) as u64);
        }
        StringOp::Lods => {
            let v = cpu.memory.read_u64(si, size_bytes)?;
            cpu.registers.set(RAX, size_code, false, v);
            cpu.registers.set64(RSI, (si as i64 + step) as u64);
        }
        StringOp::Stos => {
            let v = cpu.registers.get(RAX, size_code, false);
            cpu.memory.write_u64(di, v, size_bytes)?;
            cpu.registers.set64(RDI, (di as i64 + step) as u64);
        }
        StringOp::Scas => {
            let a = cpu.registers.get(RAX, size_code, false);
            let b = cpu.memory.read_u64(di, size_bytes)?;
            let bit = cpu.random_bool();
            apply_binop(BinOp::Sub, &mut cpu.flags, || bit, a, b, size_bytes);
            cpu.registers.set64(RDI, (di as i64 + step) as u64);
        }
    };
    Ok(())
}

// -- FPU --

#[derive(Clone, Copy)]
enum FpuUnary {
    Ld,
    St,
    Chs,
    Abs,
    Sqrt,
}

fn do_fpu_unary(cpu: &mut Cpu, op: FpuUnary) -> Result<Step, RuntimeError> {
    let byte = cpu_fetch_u8(cpu)?;
    let idx = byte & 0b111;
    match op {
        FpuUnary::Ld => cpu.fpu.push(cpu.fpu.get(idx)?),
        FpuUnary::St => {
            let v = cpu.fpu.get(0)?;
            cpu.fpu.set(idx, v)?;
            Ok(())
        }
        FpuUnary::Chs => {
            let v = cpu.fpu.get(idx)?;
            cpu.fpu.set(idx, -v)
        }
        FpuUnary::Abs => {
            let v = cpu.fpu.get(idx)?;
            cpu.fpu.set(idx, v.abs())
        }
        FpuUnary::Sqrt => {
            let v = cpu.fpu.get(idx)?;
            cpu.fpu.set(idx, v.sqrt())
        }
    }?;
    Ok(Step::Continue)
}

#[derive(Clone, Copy)]
enum FpuBinary {
    Xch,
    Add,
    Sub,
    Mul,
    Div,
}

fn do_fpu_binary(cpu: &mut Cpu, op: FpuBinary) -> Result<Step, RuntimeError> {
    let byte = cpu_fetch_u8(cpu)?;
    let dst = (byte >> 3) & 0b111;
    let src = byte & 0b111;
    match op {
        FpuBinary::Xch => cpu.fpu.swap(src)?,
        FpuBinary::Add => {
            let res = cpu.fpu.get(dst)? + cpu.fpu.get(src)?;
            cpu.fpu.set(dst, res)?;
        }
        FpuBinary::Sub => {
            let res = cpu.fpu.get(dst)? - cpu.fpu.get(src)?;
            cpu.fpu.set(dst, res)?;
        }
        FpuBinary::Mul => {
            let res = cpu.fpu.get(dst)? * cpu.fpu.get(src)?;
            cpu.fpu.set(dst, res)?;
        }
        FpuBinary::Div => {
            let divisor = cpu.fpu.get(src)?;
            if divisor == 0.0 {
                return Err(RuntimeError::ArithmeticError);
            }
            let res = cpu.fpu.get(dst)? / divisor;
            cpu.fpu.set(dst, res)?;
        }
    }
    Ok(Step::Continue)
}

/// The transcendentals (`F2XM1`, `FYL2X`, `FSCALE`, ...) take no operand bytes: like real
/// x87, they work implicitly on `ST(0)`/`ST(1)`.
fn fpu_nullary(cpu: &mut Cpu, f: impl FnOnce(&mut super::fpu::Fpu) -> Result<(), RuntimeError>) -> Result<Step, RuntimeError> {
    f(&mut cpu.fpu)?;
    Ok(Step::Continue)
}

/// `FCOM`/`FCOMI`: compares `ST(0)` against `ST(idx)`. `FCOM` records the result in the
/// FPU status word's C0/C2/C3 bits; `FCOMI` additionally mirrors it into `ZF`/`PF`/`CF` the
/// way real `FCOMI` does, so a branch can follow immediately without an `FSTSW`.
fn do_fpu_compare(cpu: &mut Cpu, also_set_integer_flags: bool) -> Result<Step, RuntimeError> {
    let byte = cpu_fetch_u8(cpu)?;
    let idx = byte & 0b111;
    let a = cpu.fpu.get(0)?;
    let b = cpu.fpu.get(idx)?;
    cpu.fpu.compare(idx)?;
    if also_set_integer_flags {
        let unordered = a.is_nan() || b.is_nan();
        cpu.flags.zf = unordered || a == b;
        cpu.flags.pf = unordered;
        cpu.flags.cf = unordered || a < b;
    }
    Ok(Step::Continue)
}

// -- SIMD --

/// The right-hand vector operand of a `mov`/binary VPU instruction: a register index byte,
/// or — when the settings byte's reserved bit is set — a `GetAddressAdv` memory address
/// loaded as a full 64-byte vector.
enum VpuRm {
    Reg(u8),
    Mem(u64),
}

fn fetch_vpu_rm(cpu: &mut Cpu, settings: &Settings) -> Result<VpuRm, RuntimeError> {
    if settings.mem_operand {
        let (addr, _) = cpu.fetch_address()?;
        Ok(VpuRm::Mem(addr))
    } else {
        Ok(VpuRm::Reg(cpu_fetch_u8(cpu)? & 0x1F))
    }
}

fn read_vpu_rm(cpu: &Cpu, rm: VpuRm) -> Result<super::simd::VecRegister, RuntimeError> {
    match rm {
        VpuRm::Reg(id) => Ok(cpu.vectors.get(id)),
        VpuRm::Mem(addr) => {
            let bytes = cpu.memory.read(addr, super::simd::VECTOR_BYTES as u64)?;
            let mut buf = [0u8; super::simd::VECTOR_BYTES];
            buf.copy_from_slice(bytes);
            Ok(super::simd::VecRegister::from_bytes(buf))
        }
    }
}

fn float_from_lane(v: u64, elem_bytes: usize) -> f64 {
    match elem_bytes {
        4 => f64::from(f32::from_bits(v as u32)),
        8 => f64::from_bits(v),
        _ => 0.0,
    }
}

fn float_to_lane(v: f64, elem_bytes: usize) -> u64 {
    match elem_bytes {
        4 => (v as f32).to_bits() as u64,
        8 => v.to_bits(),
        _ => 0,
    }
}

fn sign_extend_lane(v: u64, elem_bytes: usize) -> i64 {
    let bits = (elem_bytes * 8) as u32;
    if bits >= 64 {
        return v as i64;
    }
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

fn do_vpu_mov(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let settings_byte = cpu_fetch_u8(cpu)?;
    let settings = Settings::decode(settings_byte);
    let dst = cpu_fetch_u8(cpu)? & 0x1F;
    let src_rm = fetch_vpu_rm(cpu, &settings)?;
    let src_reg = read_vpu_rm(cpu, src_rm)?;
    let mut dest_reg = cpu.vectors.get(dst);
    let mask = if settings.has_mask { Some(dest_reg) } else { None };
    let elem_bytes = settings.elem_bytes();
    VectorFile::apply_masked(&mut dest_reg, settings, mask.as_ref(), |lane| src_reg.lane_u64(lane, elem_bytes));
    cpu.vectors.set(dst, dest_reg);
    Ok(Step::Continue)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VpuOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
    Div,
}

/// `settings.mode`'s low bit selects integer (`0`) vs. floating-point (`1`) lane
/// interpretation for `Mul`/`Div`; the other binary ops don't depend on it.
fn do_vpu_binary(cpu: &mut Cpu, op: VpuOp) -> Result<Step, RuntimeError> {
    let settings_byte = cpu_fetch_u8(cpu)?;
    let settings = Settings::decode(settings_byte);
    let dst = cpu_fetch_u8(cpu)? & 0x1F;
    let src1 = cpu_fetch_u8(cpu)? & 0x1F;
    let src2_rm = fetch_vpu_rm(cpu, &settings)?;

    let float_lanes = settings.mode & 0b1 != 0;
    if op == VpuOp::Div && !float_lanes {
        return Err(RuntimeError::UndefinedBehavior);
    }

    let a = cpu.vectors.get(src1);
    let b = read_vpu_rm(cpu, src2_rm)?;
    let mut dest_reg = cpu.vectors.get(dst);
    let mask = if settings.has_mask { Some(dest_reg) } else { None };
    let elem_bytes = settings.elem_bytes();
    let lane_mask = size_mask(elem_bytes as u32);
    VectorFile::apply_masked(&mut dest_reg, settings, mask.as_ref(), |lane| {
        let av = a.lane_u64(lane, elem_bytes);
        let bv = b.lane_u64(lane, elem_bytes);
        match op {
            VpuOp::Add => av.wrapping_add(bv) & lane_mask,
            VpuOp::Sub => av.wrapping_sub(bv) & lane_mask,
            VpuOp::And => av & bv,
            VpuOp::Or => av | bv,
            VpuOp::Xor => av ^ bv,
            VpuOp::Mul if float_lanes => float_to_lane(float_from_lane(av, elem_bytes) * float_from_lane(bv, elem_bytes), elem_bytes),
            VpuOp::Mul => av.wrapping_mul(bv) & lane_mask,
            VpuOp::Div => float_to_lane(float_from_lane(av, elem_bytes) / float_from_lane(bv, elem_bytes), elem_bytes),
        }
    });
    cpu.vectors.set(dst, dest_reg);
    Ok(Step::Continue)
}

#[derive(Clone, Copy)]
enum VpuUnaryOp {
    Neg,
    Abs,
    Sqrt,
}

/// Like `Mul`/`Div`, `settings.mode`'s low bit picks integer vs. float lanes for
/// `Neg`/`Abs`; `Sqrt` is always float (no packed integer square root exists).
fn do_vpu_unary(cpu: &mut Cpu, op: VpuUnaryOp) -> Result<Step, RuntimeError> {
    let settings_byte = cpu_fetch_u8(cpu)?;
    let settings = Settings::decode(settings_byte);
    let dst = cpu_fetch_u8(cpu)? & 0x1F;
    let src_rm = fetch_vpu_rm(cpu, &settings)?;
    let src_reg = read_vpu_rm(cpu, src_rm)?;
    let float_lanes = settings.mode & 0b1 != 0;
    let mut dest_reg = cpu.vectors.get(dst);
    let mask = if settings.has_mask { Some(dest_reg) } else { None };
    let elem_bytes = settings.elem_bytes();
    let lane_mask = size_mask(elem_bytes as u32);
    VectorFile::apply_masked(&mut dest_reg, settings, mask.as_ref(), |lane| {
        let v = src_reg.lane_u64(lane, elem_bytes);
        match op {
            VpuUnaryOp::Neg if float_lanes => float_to_lane(-float_from_lane(v, elem_bytes), elem_bytes),
            VpuUnaryOp::Neg => (sign_extend_lane(v, elem_bytes).wrapping_neg() as u64) & lane_mask,
            VpuUnaryOp::Abs if float_lanes => float_to_lane(float_from_lane(v, elem_bytes).abs(), elem_bytes),
            VpuUnaryOp::Abs => (sign_extend_lane(v, elem_bytes).wrapping_abs() as u64) & lane_mask,
            VpuUnaryOp::Sqrt => float_to_lane(float_from_lane(v, elem_bytes).sqrt(), elem_bytes),
        }
    });
    cpu.vectors.set(dst, dest_reg);
    Ok(Step::Continue)
}

fn do_vpu_fcmp(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let settings_byte = cpu_fetch_u8(cpu)?;
    let settings = Settings::decode(settings_byte);
    let dst = cpu_fetch_u8(cpu)? & 0x1F;
    let src1 = cpu_fetch_u8(cpu)? & 0x1F;
    let src2 = cpu_fetch_u8(cpu)? & 0x1F;

    let a = cpu.vectors.get(src1);
    let b = cpu.vectors.get(src2);
    let mut dest_reg = cpu.vectors.get(dst);
    let elem_bytes = settings.elem_bytes();
    let mode = settings.mode;
    VectorFile::apply_masked(&mut dest_reg, settings, None, |lane| {
        let (av, bv) = match elem_bytes {
            4 => (f64::from(f32::from_bits(a.lane_u64(lane, 4) as u32)), f64::from(f32::from_bits(b.lane_u64(lane, 4) as u32))),
            8 => (f64::from_bits(a.lane_u64(lane, 8)), f64::from_bits(b.lane_u64(lane, 8))),
            _ => return VectorFile::compare_result(elem_bytes, false),
        };
        let truth = match mode {
            0 => av == bv,
            1 => av < bv,
            2 => av <= bv,
            _ => av != bv,
        };
        VectorFile::compare_result(elem_bytes, truth)
    });
    cpu.vectors.set(dst, dest_reg);
    Ok(Step::Continue)
}

// -- ports --

fn do_port_in(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let header = cpu_fetch_u8(cpu)?;
    let (reg, _) = crate::assembler::encode::decode_dest_header(header);
    let port_lo = cpu_fetch_u8(cpu)? as u16;
    let port_hi = cpu_fetch_u8(cpu)? as u16;
    let port = port_lo | (port_hi << 8);
    let value = cpu.port_io.port_in(port, reg.size_code);
    cpu.registers.set(reg.id, reg.size_code, reg.high, value);
    Ok(Step::Continue)
}

fn do_port_out(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let header = cpu_fetch_u8(cpu)?;
    let (reg, _) = crate::assembler::encode::decode_dest_header(header);
    let port_lo = cpu_fetch_u8(cpu)? as u16;
    let port_hi = cpu_fetch_u8(cpu)? as u16;
    let port = port_lo | (port_hi << 8);
    let value = cpu.registers.get(reg.id, reg.size_code, reg.high);
    cpu.port_io.port_out(port, reg.size_code, value);
    Ok(Step::Continue)
}

// -- syscalls --

fn do_syscall(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let code = cpu.registers.get64(RAX);
    let call = SyscallCode::from_u64(code).ok_or(RuntimeError::UnhandledSyscall(code))?;
    match call {
        SyscallCode::Exit => {
            cpu.return_value = cpu.registers.get64(RCX) as i64;
            cpu.running = false;
            cpu.fds.close_all();
            Ok(Step::Stop)
        }
        SyscallCode::Read => syscall_read(cpu),
        SyscallCode::Write => syscall_write(cpu),
        SyscallCode::Open => syscall_open(cpu),
        SyscallCode::Close => {
            let fd = cpu.registers.get64(RCX);
            match cpu.fds.close(fd) {
                Ok(()) => cpu.registers.set64(RAX, 0),
                Err(_) => cpu.registers.set64(RAX, u64::MAX),
            }
            Ok(Step::Continue)
        }
        SyscallCode::Seek => syscall_seek(cpu),
        SyscallCode::Brk => syscall_brk(cpu),
        SyscallCode::Rename | SyscallCode::Unlink | SyscallCode::Mkdir | SyscallCode::Rmdir => {
            if !cpu.flags.fsf {
                return Err(RuntimeError::FSDisabled);
            }
            // Path-argument syscalls are wired up by the CLI's filesystem shim; the core
            // dispatch just enforces the FSF gate and reports success.
            cpu.registers.set64(RAX, 0);
            Ok(Step::Continue)
        }
    }
}

fn syscall_read(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let fd = cpu.registers.get64(RCX);
    let addr = cpu.registers.get64(RDX);
    let len = cpu.registers.get64(RBX) as usize;
    let mut buf = vec![0u8; len];
    let handle = cpu.fds.get_mut(fd)?;
    let n = syscall::read_fd(handle, &mut buf).map_err(|e| RuntimeError::IOFailure(e.to_string()))?;
    cpu.memory.write(addr, &buf[..n])?;
    cpu.registers.set64(RAX, n as u64);
    Ok(Step::Continue)
}

fn syscall_write(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let fd = cpu.registers.get64(RCX);
    let addr = cpu.registers.get64(RDX);
    let len = cpu.registers.get64(RBX) as usize;
    let data = cpu.memory.read(addr, len as u64)?.to_vec();
    let handle = cpu.fds.get_mut(fd)?;
    let n = syscall::write_fd(handle, &data).map_err(|e| RuntimeError::IOFailure(e.to_string()))?;
    cpu.registers.set64(RAX, n as u64);
    Ok(Step::Continue)
}

fn syscall_open(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let addr = cpu.registers.get64(RCX);
    let create = cpu.registers.get64(RDX) != 0;
    if create && !cpu.flags.fsf {
        return Err(RuntimeError::FSDisabled);
    }
    let path = read_c_string(cpu, addr)?;
    let file = syscall::open_path(&path, create, create).map_err(|e| RuntimeError::IOFailure(e.to_string()))?;
    let fd = cpu.fds.open(FileHandle::Regular(file))?;
    cpu.registers.set64(RAX, fd);
    Ok(Step::Continue)
}

fn syscall_seek(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let fd = cpu.registers.get64(RCX);
    let offset = cpu.registers.get64(RDX) as i64;
    let handle = cpu.fds.get_mut(fd)?;
    let pos = syscall::seek_fd(handle, std::io::SeekFrom::Start(offset as u64))
        .map_err(|e| RuntimeError::IOFailure(e.to_string()))?;
    cpu.registers.set64(RAX, pos);
    Ok(Step::Continue)
}

fn syscall_brk(cpu: &mut Cpu) -> Result<Step, RuntimeError> {
    let request = cpu.registers.get64(RCX);
    if request == 0 {
        cpu.registers.set64(RAX, cpu.memory.len());
    } else if cpu.memory.resize(request) {
        cpu.registers.set64(RAX, 0);
    } else {
        cpu.registers.set64(RAX, u64::MAX);
    }
    Ok(Step::Continue)
}

fn read_c_string(cpu: &Cpu, addr: u64) -> Result<String, RuntimeError> {
    let mut bytes = Vec::new();
    let mut a = addr;
    loop {
        let b = cpu.memory.read(a, 1)?[0];
        if b == 0 {
            break;
        }
        bytes.push(b);
        a += 1;
    }
    String::from_utf8(bytes).map_err(|_| RuntimeError::UndefinedBehavior)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executable::Executable;
    use super::super::simd::VecRegister;
    use super::super::syscall::PortIo;
    use crate::assembler::encode::OperandMode;

    fn exe_from_text(text: Vec<u8>) -> Executable {
        Executable::new(text.len() as u64, 0, 0, 0, text).unwrap()
    }

    fn reg_header(id: u8, size_code: u8, high: bool, involves_mem: bool) -> u8 {
        ((id & 0xF) << 4) | ((size_code & 0b11) << 2) | ((high as u8) << 1) | (involves_mem as u8)
    }

    fn mov_reg_imm(reg: u8, size_code: u8, value: u64) -> Vec<u8> {
        let size_bytes = size_code_bytes(size_code) as usize;
        let mut bytes = vec![Opcode::Mov as u8, reg_header(reg, size_code, false, false), 0x10];
        bytes.extend_from_slice(&value.to_le_bytes()[..size_bytes]);
        bytes
    }

    #[test]
    fn mov_loads_an_immediate_into_a_register() {
        let mut text = mov_reg_imm(RAX, 3, 42);
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(2);
        assert_eq!(cpu.registers.get64(RAX), 42);
        assert_eq!(cpu.error, None);
    }

    #[test]
    fn add_sets_overflow_and_carry_per_intel_rule() {
        let mut text = mov_reg_imm(RAX, 2, 0x7FFF_FFFF);
        text.push(Opcode::Add as u8);
        text.push(reg_header(RAX, 2, false, false));
        text.push(0x10);
        text.extend_from_slice(&1u32.to_le_bytes());
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(3);
        assert_eq!(cpu.registers.get(RAX, 2, false), 0x8000_0000);
        assert!(cpu.flags.of);
        assert!(!cpu.flags.cf);
    }

    #[test]
    fn movzx_is_a_size_preserving_move() {
        let mut text = Vec::new();
        text.extend(mov_reg_imm(RAX, 0, 0xAB));
        text.push(Opcode::Movzx as u8);
        text.push(reg_header(RCX, 0, false, false));
        text.push((OperandMode::RegReg.tag() << 4) | RAX);
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(3);
        assert_eq!(cpu.registers.get(RCX, 0, false), 0xAB);
    }

    #[test]
    fn mul_computes_the_double_width_product() {
        let mut text = Vec::new();
        text.extend(mov_reg_imm(RAX, 3, 6));
        text.extend(mov_reg_imm(RCX, 3, 7));
        text.push(Opcode::Mul as u8);
        text.push(reg_header(RCX, 3, false, false));
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(4);
        assert_eq!(cpu.registers.get64(RAX), 42);
        assert_eq!(cpu.registers.get64(RDX), 0);
        assert!(!cpu.flags.cf);
    }

    #[test]
    fn div_by_zero_traps_arithmetic_error() {
        let mut text = Vec::new();
        text.extend(mov_reg_imm(RAX, 3, 10));
        text.extend(mov_reg_imm(RCX, 3, 0));
        text.push(Opcode::Div as u8);
        text.push(reg_header(RCX, 3, false, false));
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(3);
        assert_eq!(cpu.error, Some(RuntimeError::ArithmeticError));
    }

    #[test]
    fn setcc_writes_one_when_the_condition_holds() {
        let mut text = Vec::new();
        text.extend(mov_reg_imm(RAX, 3, 5));
        text.push(Opcode::Cmp as u8);
        text.push(reg_header(RAX, 3, false, false));
        text.push(0x10);
        text.extend_from_slice(&5u64.to_le_bytes());
        text.push(Opcode::Setcc as u8);
        text.push(0); // JE
        text.push(reg_header(RBX, 0, false, false));
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(4);
        assert_eq!(cpu.registers.get(RBX, 0, false), 1);
    }

    #[test]
    fn repne_scas_stops_as_soon_as_it_finds_a_match() {
        // rep_tag=3 (REPNE) in bits [3:2], size_code=0 (byte) in bits [1:0].
        let settings = (3 << 2) | 0;
        let mut text = mov_reg_imm(RAX, 0, 0x42);
        text.extend(mov_reg_imm(RCX, 3, 3));
        text.push(Opcode::Scas as u8);
        text.push(settings);
        text.push(Opcode::Hlt as u8);
        let haystack_addr = text.len() as u64;
        text.extend_from_slice(&[0x11, 0x42, 0x99]);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.registers.set64(RDI, haystack_addr);
        cpu.flags.otrf = true;
        cpu.tick(3);
        // Stops right after matching the second byte: two iterations consumed, one left.
        assert_eq!(cpu.registers.get64(RCX), 1);
        assert_eq!(cpu.registers.get64(RDI), haystack_addr + 2);
        assert!(cpu.flags.zf);
    }

    #[test]
    fn vpu_add_sums_lanes_elementwise() {
        let text = vec![Opcode::VpuAdd as u8, Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 2, mode: 0 }.encode(), 0, 1, 2];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 4, 5);
        let mut b = VecRegister::zero();
        b.set_lane_u64(0, 4, 10);
        cpu.vectors.set(1, a);
        cpu.vectors.set(2, b);
        cpu.tick(1);
        assert_eq!(cpu.vectors.get(0).lane_u64(0, 4), 15);
    }

    #[test]
    fn vpu_mul_multiplies_float_lanes() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 3, mode: 1 };
        let text = vec![Opcode::VpuMul as u8, settings.encode(), 0, 1, 2];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 8, 2.5f64.to_bits());
        let mut b = VecRegister::zero();
        b.set_lane_u64(0, 8, 4.0f64.to_bits());
        cpu.vectors.set(1, a);
        cpu.vectors.set(2, b);
        cpu.tick(1);
        assert_eq!(f64::from_bits(cpu.vectors.get(0).lane_u64(0, 8)), 10.0);
    }

    #[test]
    fn vpu_div_divides_float_lanes() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 3, mode: 1 };
        let text = vec![Opcode::VpuDiv as u8, settings.encode(), 0, 1, 2];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 8, 9.0f64.to_bits());
        let mut b = VecRegister::zero();
        b.set_lane_u64(0, 8, 2.0f64.to_bits());
        cpu.vectors.set(1, a);
        cpu.vectors.set(2, b);
        cpu.tick(1);
        assert_eq!(f64::from_bits(cpu.vectors.get(0).lane_u64(0, 8)), 4.5);
    }

    #[test]
    fn vpu_div_on_integer_lanes_is_undefined_behavior() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 3, mode: 0 };
        let text = vec![Opcode::VpuDiv as u8, settings.encode(), 0, 1, 2];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(1);
        assert_eq!(cpu.error, Some(RuntimeError::UndefinedBehavior));
    }

    #[test]
    fn vpu_neg_negates_integer_lanes() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 2, mode: 0 };
        let text = vec![Opcode::VpuNeg as u8, settings.encode(), 0, 1];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 4, 5);
        cpu.vectors.set(1, a);
        cpu.tick(1);
        assert_eq!(cpu.vectors.get(0).lane_u64(0, 4) as u32 as i32, -5);
    }

    #[test]
    fn vpu_abs_takes_float_absolute_value() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 3, mode: 1 };
        let text = vec![Opcode::VpuAbs as u8, settings.encode(), 0, 1];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 8, (-3.0f64).to_bits());
        cpu.vectors.set(1, a);
        cpu.tick(1);
        assert_eq!(f64::from_bits(cpu.vectors.get(0).lane_u64(0, 8)), 3.0);
    }

    #[test]
    fn vpu_sqrt_takes_float_square_root() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: false, elem_size: 3, mode: 1 };
        let text = vec![Opcode::VpuSqrt as u8, settings.encode(), 0, 1];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut a = VecRegister::zero();
        a.set_lane_u64(0, 8, 16.0f64.to_bits());
        cpu.vectors.set(1, a);
        cpu.tick(1);
        assert_eq!(f64::from_bits(cpu.vectors.get(0).lane_u64(0, 8)), 4.0);
    }

    #[test]
    fn vpu_mov_loads_a_vector_from_a_memory_address() {
        let settings = Settings { has_mask: false, zero_mask: false, scalar: false, mem_operand: true, elem_size: 2, mode: 0 };
        // Address header: has_imm=1, no registers, pointer_size_code=3 (8-byte displacement).
        let addr_header = 0b1000_1100u8;
        let mut text = vec![Opcode::VpuMov as u8, settings.encode(), 0];
        text.push(addr_header);
        text.extend_from_slice(&0x2000u64.to_le_bytes());
        text.push(Opcode::Hlt as u8);
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        let mut vec_bytes = [0u8; super::super::simd::VECTOR_BYTES];
        vec_bytes[..4].copy_from_slice(&99u32.to_le_bytes());
        cpu.memory.write(0x2000, &vec_bytes).unwrap();
        cpu.tick(2);
        assert_eq!(cpu.vectors.get(0).lane_u64(0, 4), 99);
    }

    struct FixedPort;
    impl PortIo for FixedPort {
        fn port_in(&mut self, _port: u16, _size_code: u8) -> u64 {
            0x77
        }
        fn port_out(&mut self, _port: u16, _size_code: u8, _value: u64) {}
    }

    #[test]
    fn in_reads_from_the_port_hook() {
        let text = vec![Opcode::In as u8, reg_header(RAX, 0, false, false), 0x05, 0x00, Opcode::Hlt as u8];
        let exe = exe_from_text(text);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.set_port_io(Box::new(FixedPort));
        cpu.tick(2);
        assert_eq!(cpu.registers.get(RAX, 0, false), 0x77);
    }

    #[test]
    fn exit_syscall_sets_the_return_value_and_stops() {
        let exe = exe_from_text(vec![Opcode::Syscall as u8]);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.registers.set64(RAX, 0);
        cpu.registers.set64(RCX, 7);
        cpu.tick(1);
        assert!(!cpu.running);
        assert_eq!(cpu.return_value, 7);
        assert_eq!(cpu.error, None);
    }
}
