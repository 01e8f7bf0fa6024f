//! Assembler front end: line splitting, label mutation, segment directives, symbol
//! definition, instruction routing, and the end-of-file integrity/size pass.

pub mod address;
pub mod encode;
pub mod expr_parser;
pub mod tables;

use std::collections::HashMap;

use crate::error::AssembleError;
use crate::expr::{Expr, Op, Value};
use crate::objfile::{ObjectFile, Segment};

use address::parse_address;
use encode::{
    encode_binary, encode_binary_to_mem, encode_branch, encode_fpu_binary, encode_fpu_unary,
    encode_nullary, encode_push_imm, encode_push_reg, encode_shift, encode_string_op,
    encode_unary_mem, encode_unary_reg, Opcode, RepPrefix, RmOperand, ShiftCount,
};
use expr_parser::parse_expr;
use tables::{register_table, reserved_names, RegisterRef};

/// Caller-supplied assembler parameters.
#[derive(Clone, Debug, Default)]
pub struct AssemblerConfig {
    /// Predefined `EQU`-style symbols injected before the first line is read.
    pub predefines: HashMap<String, Expr>,
}

pub struct Assembler {
    registers: HashMap<String, RegisterRef>,
    reserved: std::collections::HashSet<String>,
    obj: ObjectFile,
    segment: Option<Segment>,
    last_nonlocal: Option<String>,
    segments_seen: std::collections::HashSet<Segment>,
    bss_seen: bool,
    in_bss: bool,
    line: u32,
    pending_rep: Option<RepPrefix>,
}

impl Assembler {
    pub fn new(config: AssemblerConfig) -> Assembler {
        let mut obj = ObjectFile::new();
        obj.symbols.extend(config.predefines);
        Assembler {
            registers: register_table(),
            reserved: reserved_names(),
            obj,
            pending_rep: None,
            segment: None,
            last_nonlocal: None,
            segments_seen: std::collections::HashSet::new(),
            bss_seen: false,
            in_bss: false,
            line: 0,
        }
    }

    pub fn assemble(mut self, source: &str) -> Result<ObjectFile, AssembleError> {
        if source.trim().is_empty() {
            return Err(AssembleError::EmptyFile);
        }
        for raw_line in source.lines() {
            self.line += 1;
            self.assemble_line(raw_line)?;
        }
        self.verify_integrity()?;
        self.minimize_size();
        self.obj.clean = true;
        Ok(self.obj)
    }

    fn err(&self, message: impl Into<String>) -> AssembleError {
        AssembleError::FormatError { line: self.line, message: message.into() }
    }

    fn assemble_line(&mut self, raw_line: &str) -> Result<(), AssembleError> {
        let without_comment = strip_comment(raw_line);
        let trimmed = without_comment.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let (label, rest) = split_label(trimmed);
        let rest = rest.trim();

        if let Some(raw_label) = label {
            let label_name = self.canonicalize_label(raw_label)?;
            if rest.to_ascii_uppercase().starts_with("EQU") {
                let expr_text = rest[3..].trim();
                if expr_text.is_empty() {
                    return Err(self.err("EQU requires an argument"));
                }
                let parsed = parse_expr(expr_text).map_err(|m| self.err(m))?;
                self.define_symbol(&label_name, parsed.expr)?;
                return Ok(());
            }
            let def = if self.in_bss {
                Expr::binary(Op::Add, Expr::token("#B"), Expr::int(self.obj.bss_len))
            } else {
                let origin = self
                    .segment
                    .ok_or_else(|| self.err("label defined outside of any segment"))?;
                let offset = self.obj.segment(origin).len() as u64;
                Expr::binary(Op::Add, Expr::token(origin_symbol(origin)), Expr::int(offset))
            };
            self.define_symbol(&label_name, def)?;
        }

        if rest.is_empty() {
            return Ok(());
        }

        let (mut mnemonic, mut args_text) = split_first_word(rest);
        let mut mnemonic_upper = mnemonic.to_ascii_uppercase();

        self.pending_rep = match mnemonic_upper.as_str() {
            "REP" => Some(RepPrefix::Rep),
            "REPE" | "REPZ" => Some(RepPrefix::Repe),
            "REPNE" | "REPNZ" => Some(RepPrefix::Repne),
            _ => None,
        };
        if self.pending_rep.is_some() {
            let rest2 = args_text.trim();
            let parts = split_first_word(rest2);
            mnemonic = parts.0;
            args_text = parts.1;
            mnemonic_upper = mnemonic.to_ascii_uppercase();
        }

        if mnemonic_upper == "SEGMENT" || mnemonic_upper == "SECTION" {
            return self.handle_segment_directive(args_text.trim());
        }

        let args = split_args(args_text).map_err(|m| self.err(m))?;
        self.route_instruction(&mnemonic_upper, &args)
    }

    fn canonicalize_label(&mut self, raw: &str) -> Result<String, AssembleError> {
        if !is_valid_label_syntax(raw) {
            return Err(AssembleError::InvalidLabel { line: self.line, message: raw.to_string() });
        }
        let canonical = if let Some(local) = raw.strip_prefix('.') {
            let base = self
                .last_nonlocal
                .clone()
                .ok_or_else(|| self.err("local label defined before any non-local label"))?;
            format!("{}{}", base, format!(".{}", local))
        } else {
            self.last_nonlocal = Some(raw.to_string());
            raw.to_string()
        };
        if self.reserved.contains(&canonical.to_ascii_uppercase()) {
            return Err(AssembleError::InvalidLabel { line: self.line, message: canonical });
        }
        Ok(canonical)
    }

    fn define_symbol(&mut self, name: &str, expr: Expr) -> Result<(), AssembleError> {
        if self.obj.symbols.contains_key(name) {
            return Err(AssembleError::SymbolRedefinition { line: self.line, message: name.to_string() });
        }
        self.obj.symbols.insert(name.to_string(), expr);
        Ok(())
    }

    fn handle_segment_directive(&mut self, arg: &str) -> Result<(), AssembleError> {
        let seg = match arg.to_ascii_uppercase().as_str() {
            ".TEXT" => Segment::Text,
            ".RODATA" => Segment::RoData,
            ".DATA" => Segment::Data,
            ".BSS" => {
                // BSS has no byte blob of its own, so it isn't one of the three addressable
                // segments the encoder writes bytes into, but it still gets a once-per-file
                // check of its own.
                if self.bss_seen {
                    return Err(self.err("segment BSS declared more than once".to_string()));
                }
                self.bss_seen = true;
                self.segment = None;
                self.in_bss = true;
                self.last_nonlocal = None;
                return Ok(());
            }
            other => return Err(self.err(format!("unknown segment directive '{}'", other))),
        };
        if !self.segments_seen.insert(seg) {
            return Err(self.err(format!("segment {:?} declared more than once", seg)));
        }
        self.segment = Some(seg);
        self.in_bss = false;
        self.last_nonlocal = None;
        Ok(())
    }

    fn current_segment(&self) -> Result<Segment, AssembleError> {
        self.segment.ok_or_else(|| self.err("instruction outside of any segment"))
    }

    fn parse_operand(&self, arg: &str) -> Result<Operand, AssembleError> {
        let trimmed = arg.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some(reg) = self.registers.get(&upper) {
            return Ok(Operand::Register(*reg));
        }
        if trimmed.contains('[') {
            let mem = parse_address(trimmed, &self.registers).map_err(|m| self.err(m))?;
            return Ok(Operand::Memory(mem));
        }
        let parsed = parse_expr(trimmed).map_err(|m| self.err(m))?;
        Ok(Operand::Immediate(parsed.expr))
    }

    fn route_instruction(&mut self, mnemonic: &str, args: &[String]) -> Result<(), AssembleError> {
        match mnemonic {
            "NOP" => self.nullary(Opcode::Nop, args, 0),
            "HLT" => self.nullary(Opcode::Hlt, args, 0),
            "SYSCALL" => self.nullary(Opcode::Syscall, args, 0),
            "RET" => self.nullary(Opcode::Ret, args, 0),
            "FINIT" => self.nullary(Opcode::Finit, args, 0),
            "FWAIT" => self.nullary(Opcode::Fwait, args, 0),

            "MOV" => self.binary_mnemonic(Opcode::Mov, args),
            "ADD" => self.binary_mnemonic(Opcode::Add, args),
            "SUB" => self.binary_mnemonic(Opcode::Sub, args),
            "AND" => self.binary_mnemonic(Opcode::And, args),
            "OR" => self.binary_mnemonic(Opcode::Or, args),
            "XOR" => self.binary_mnemonic(Opcode::Xor, args),
            "TEST" => self.binary_mnemonic(Opcode::Test, args),
            "XCHG" => self.binary_mnemonic(Opcode::Xchg, args),

            "CMP" => self.cmp_mnemonic(args),

            "INC" => self.unary_mnemonic(Opcode::Inc, args),
            "DEC" => self.unary_mnemonic(Opcode::Dec, args),
            "NEG" => self.unary_mnemonic(Opcode::Neg, args),
            "NOT" => self.unary_mnemonic(Opcode::Not, args),

            "SHL" => self.shift_mnemonic(Opcode::Shl, args),
            "SHR" => self.shift_mnemonic(Opcode::Shr, args),
            "SAR" => self.shift_mnemonic(Opcode::Sar, args),
            "ROL" => self.shift_mnemonic(Opcode::Rol, args),
            "ROR" => self.shift_mnemonic(Opcode::Ror, args),

            "LEA" => self.lea_mnemonic(args),

            "PUSH" => self.push_mnemonic(args),
            "POP" => self.pop_mnemonic(args),

            "JMP" => self.branch_mnemonic(Opcode::Jmp, None, args),
            "CALL" => self.branch_mnemonic(Opcode::Call, None, args),
            "JE" => self.branch_mnemonic(Opcode::Jcc, Some(0), args),
            "JNE" => self.branch_mnemonic(Opcode::Jcc, Some(1), args),
            "JL" => self.branch_mnemonic(Opcode::Jcc, Some(2), args),
            "JGE" => self.branch_mnemonic(Opcode::Jcc, Some(3), args),
            "JG" => self.branch_mnemonic(Opcode::Jcc, Some(4), args),
            "JLE" => self.branch_mnemonic(Opcode::Jcc, Some(5), args),

            "MOVSB" | "MOVSW" | "MOVSD" | "MOVSQ" => self.string_mnemonic(Opcode::Movs, mnemonic, args),
            "CMPSB" | "CMPSW" | "CMPSQ" => self.string_mnemonic(Opcode::Cmps, mnemonic, args),
            "LODSB" | "LODSW" | "LODSD" | "LODSQ" => self.string_mnemonic(Opcode::Lods, mnemonic, args),
            "STOSB" | "STOSW" | "STOSD" | "STOSQ" => self.string_mnemonic(Opcode::Stos, mnemonic, args),
            "SCASB" | "SCASW" | "SCASD" | "SCASQ" => self.string_mnemonic(Opcode::Scas, mnemonic, args),

            "FLD" => self.fpu_unary(Opcode::Fld, args),
            "FST" => self.fpu_unary(Opcode::Fst, args),
            "FCHS" => self.fpu_unary(Opcode::Fchs, args),
            "FABS" => self.fpu_unary(Opcode::Fabs, args),
            "FSQRT" => self.fpu_unary(Opcode::Fsqrt, args),
            "FXCH" => self.fpu_binary(Opcode::Fxch, args),
            "FADD" => self.fpu_binary(Opcode::Fadd, args),
            "FSUB" => self.fpu_binary(Opcode::Fsub, args),
            "FMUL" => self.fpu_binary(Opcode::Fmul, args),
            "FDIV" => self.fpu_binary(Opcode::Fdiv, args),

            "F2XM1" => self.nullary(Opcode::F2xm1, args, 0),
            "FYL2X" => self.nullary(Opcode::Fyl2x, args, 0),
            "FSCALE" => self.nullary(Opcode::Fscale, args, 0),
            "FPATAN" => self.nullary(Opcode::Fpatan, args, 0),
            "FPTAN" => self.nullary(Opcode::Fptan, args, 0),
            "FSIN" => self.nullary(Opcode::Fsin, args, 0),
            "FCOS" => self.nullary(Opcode::Fcos, args, 0),
            "FSINCOS" => self.nullary(Opcode::Fsincos, args, 0),
            "FPREM" => self.nullary(Opcode::Fprem, args, 0),
            "FPREM1" => self.nullary(Opcode::Fprem1, args, 0),
            "FRNDINT" => self.nullary(Opcode::Frndint, args, 0),
            "FXTRACT" => self.nullary(Opcode::Fxtract, args, 0),
            "FCOM" => self.fpu_unary(Opcode::Fcom, args),
            "FCOMI" => self.fpu_unary(Opcode::Fcomi, args),

            "DECLARE" | "DB" | "DW" | "DD" | "DQ" => self.data_directive(mnemonic, args),

            "RESB" => self.reserve_directive(args, 1),
            "RESW" => self.reserve_directive(args, 2),
            "RESD" => self.reserve_directive(args, 4),
            "RESQ" => self.reserve_directive(args, 8),

            _ => Err(AssembleError::UnknownOp { line: self.line, message: mnemonic.to_string() }),
        }
    }

    fn nullary(&mut self, opcode: Opcode, args: &[String], expect: usize) -> Result<(), AssembleError> {
        if args.len() != expect {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let seg = self.current_segment()?;
        encode_nullary(&mut self.obj, seg, opcode);
        Ok(())
    }

    fn binary_mnemonic(&mut self, opcode: Opcode, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 2 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let dest = self.parse_operand(&args[0])?;
        let src = self.parse_operand(&args[1])?;
        let seg = self.current_segment()?;
        let line = self.line;
        match dest {
            Operand::Register(reg) => {
                let rm = match src {
                    Operand::Register(r) => RmOperand::Reg(r),
                    Operand::Memory(m) => RmOperand::Mem(m),
                    Operand::Immediate(e) => RmOperand::Imm(e),
                };
                encode_binary(&mut self.obj, seg, line, opcode, reg, rm);
                Ok(())
            }
            Operand::Memory(mem) => {
                let rm = match src {
                    Operand::Register(r) => RmOperand::Reg(r),
                    Operand::Immediate(e) => RmOperand::Imm(e),
                    Operand::Memory(_) => return Err(self.err("memory-to-memory operands are not supported")),
                };
                encode_binary_to_mem(&mut self.obj, seg, line, opcode, mem, rm);
                Ok(())
            }
            Operand::Immediate(_) => Err(self.err("destination operand cannot be an immediate")),
        }
    }

    /// `CMP reg, 0` canonically folds to the single-operand `CMPZ` form.
    fn cmp_mnemonic(&mut self, args: &[String]) -> Result<(), AssembleError> {
        if args.len() == 2 {
            if let Operand::Immediate(Expr::Leaf(v)) = self.parse_operand(&args[1])? {
                if v.as_u64() == 0 {
                    return self.unary_mnemonic(Opcode::Cmpz, &args[..1]);
                }
            }
        }
        self.binary_mnemonic(Opcode::Cmp, args)
    }

    fn unary_mnemonic(&mut self, opcode: Opcode, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let operand = self.parse_operand(&args[0])?;
        let seg = self.current_segment()?;
        let line = self.line;
        match operand {
            Operand::Register(reg) => {
                encode_unary_reg(&mut self.obj, seg, opcode, reg);
                Ok(())
            }
            Operand::Memory(mem) => {
                encode_unary_mem(&mut self.obj, seg, line, opcode, mem);
                Ok(())
            }
            Operand::Immediate(_) => Err(self.err("operand must be a register or memory address")),
        }
    }

    fn shift_mnemonic(&mut self, opcode: Opcode, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 2 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let dest = match self.parse_operand(&args[0])? {
            Operand::Register(r) => r,
            _ => return Err(self.err("shift destination must be a register")),
        };
        let seg = self.current_segment()?;
        let count = match args[1].trim().to_ascii_uppercase().as_str() {
            "CL" => ShiftCount::Cl,
            _ => match self.parse_operand(&args[1])? {
                Operand::Immediate(Expr::Leaf(v)) => ShiftCount::Literal(v.as_u64() as u8),
                _ => return Err(self.err("shift count must be CL or a compile-time constant")),
            },
        };
        encode_shift(&mut self.obj, seg, opcode, dest, count);
        Ok(())
    }

    fn lea_mnemonic(&mut self, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 2 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let dest = match self.parse_operand(&args[0])? {
            Operand::Register(r) => r,
            _ => return Err(self.err("LEA destination must be a register")),
        };
        let mem = match self.parse_operand(&args[1])? {
            Operand::Memory(m) => m,
            _ => return Err(self.err("LEA source must be an address expression")),
        };
        let seg = self.current_segment()?;
        let line = self.line;
        encode_binary(&mut self.obj, seg, line, Opcode::Lea, dest, RmOperand::Mem(mem));
        Ok(())
    }

    fn push_mnemonic(&mut self, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let seg = self.current_segment()?;
        let line = self.line;
        match self.parse_operand(&args[0])? {
            Operand::Register(r) => {
                encode_push_reg(&mut self.obj, seg, r);
                Ok(())
            }
            Operand::Immediate(e) => {
                encode_push_imm(&mut self.obj, seg, line, e);
                Ok(())
            }
            Operand::Memory(_) => Err(self.err("PUSH does not support memory operands in this encoder")),
        }
    }

    fn pop_mnemonic(&mut self, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let reg = match self.parse_operand(&args[0])? {
            Operand::Register(r) => r,
            _ => return Err(self.err("POP operand must be a register")),
        };
        let seg = self.current_segment()?;
        encode_unary_reg(&mut self.obj, seg, Opcode::Pop, reg);
        Ok(())
    }

    fn branch_mnemonic(&mut self, opcode: Opcode, cond: Option<u8>, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let target = match self.parse_operand(&args[0])? {
            Operand::Immediate(e) => e,
            _ => return Err(self.err("branch target must be a label expression")),
        };
        let seg = self.current_segment()?;
        let line = self.line;
        encode_branch(&mut self.obj, seg, line, opcode, cond, target);
        Ok(())
    }

    fn string_mnemonic(&mut self, opcode: Opcode, mnemonic: &str, args: &[String]) -> Result<(), AssembleError> {
        if !args.is_empty() {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let size_code = match mnemonic.as_bytes().last() {
            Some(b'B') => 0,
            Some(b'W') => 1,
            Some(b'D') => 2,
            Some(b'Q') => 3,
            _ => return Err(self.err("unrecognized string-op size suffix")),
        };
        let seg = self.current_segment()?;
        encode_string_op(&mut self.obj, seg, opcode, size_code, self.pending_rep.take());
        Ok(())
    }

    fn fpu_unary(&mut self, opcode: Opcode, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let st = parse_st_index(&args[0]).map_err(|m| self.err(m))?;
        let seg = self.current_segment()?;
        encode_fpu_unary(&mut self.obj, seg, opcode, st);
        Ok(())
    }

    fn fpu_binary(&mut self, opcode: Opcode, args: &[String]) -> Result<(), AssembleError> {
        if args.len() != 2 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let dst = parse_st_index(&args[0]).map_err(|m| self.err(m))?;
        let src = parse_st_index(&args[1]).map_err(|m| self.err(m))?;
        let seg = self.current_segment()?;
        encode_fpu_binary(&mut self.obj, seg, opcode, dst, src);
        Ok(())
    }

    fn data_directive(&mut self, mnemonic: &str, args: &[String]) -> Result<(), AssembleError> {
        let size: u8 = match mnemonic {
            "DB" => 1,
            "DW" => 2,
            "DD" => 4,
            "DQ" | "DECLARE" => 8,
            _ => return Err(self.err("unknown data directive")),
        };
        if args.is_empty() {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let seg = self.current_segment()?;
        let line = self.line;
        for arg in args {
            let parsed = parse_expr(arg).map_err(|m| self.err(m))?;
            crate::assembler::encode::emit_value(&mut self.obj, seg, parsed.expr, size, line);
        }
        Ok(())
    }

    /// `RESB`/`RESW`/`RESD`/`RESQ`: reserves `count * unit_size` zero-initialized bytes in
    /// the BSS segment. The count must be a compile-time constant since BSS carries no
    /// byte blob for a hole to patch later.
    fn reserve_directive(&mut self, args: &[String], unit_size: u64) -> Result<(), AssembleError> {
        if !self.in_bss {
            return Err(self.err("reservation directives are only valid in the BSS segment"));
        }
        if args.len() != 1 {
            return Err(AssembleError::ArgCount { line: self.line, message: "wrong number of arguments".to_string() });
        }
        let parsed = parse_expr(&args[0]).map_err(|m| self.err(m))?;
        let mut symbols = self.obj.symbols.clone();
        let count = match parsed.expr.clone().evaluate_fresh(&mut symbols) {
            Ok(Value::Int(v)) => v,
            _ => return Err(self.err("reservation count must be a compile-time integer")),
        };
        self.obj.bss_len += count * unit_size;
        Ok(())
    }

    fn verify_integrity(&self) -> Result<(), AssembleError> {
        for g in &self.obj.globals {
            if !self.obj.symbols.contains_key(g) {
                return Err(AssembleError::SymbolRedefinition { line: self.line, message: g.clone() });
            }
        }
        let known_reserved = ["__heap__"];
        for seg in Segment::ALL {
            for hole in self.obj.holes(seg) {
                for tok in hole.expr.token_values() {
                    if self.obj.symbols.contains_key(tok)
                        || self.obj.externals.contains(tok)
                        || known_reserved.contains(&tok)
                        || tables::SEGMENT_ORIGINS.contains(&tok)
                        || tables::SEGMENT_OFFSETS.contains(&tok)
                    {
                        continue;
                    }
                    return Err(AssembleError::UnknownSymbol { line: self.line, message: tok.to_string() });
                }
            }
        }
        Ok(())
    }

    /// Evaluates every internal symbol eagerly, drops non-global symbols that resolved to
    /// concrete values, and renames the rest to short hex handles.
    fn minimize_size(&mut self) {
        let mut symbols = self.obj.symbols.clone();
        let names: Vec<String> = symbols.keys().cloned().collect();
        for name in &names {
            if let Some(mut e) = symbols.remove(name) {
                let _ = e.evaluate_fresh(&mut symbols);
                symbols.insert(name.clone(), e);
            }
        }

        let mut retained = crate::expr::SymbolTable::new();
        let mut rename: HashMap<String, String> = HashMap::new();
        let mut next_handle: u32 = 0;
        for (name, expr) in symbols.into_iter() {
            if self.obj.globals.contains(&name) {
                retained.insert(name, expr);
                continue;
            }
            if expr.is_leaf() {
                continue;
            }
            let handle = format!("${:x}", next_handle);
            next_handle += 1;
            rename.insert(name, handle.clone());
            retained.insert(handle, expr);
        }
        for (old, new) in &rename {
            for seg in Segment::ALL {
                for hole in self.obj.holes_mut(seg) {
                    hole.expr.resolve_token(old, new);
                }
            }
        }
        self.obj.symbols = retained;
    }
}

enum Operand {
    Register(RegisterRef),
    Memory(address::MemOperand),
    Immediate(Expr),
}

fn origin_symbol(seg: Segment) -> &'static str {
    match seg {
        Segment::Text => "#T",
        Segment::RoData => "#R",
        Segment::Data => "#D",
    }
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' || c == '`' => in_quote = Some(c),
            None if c == ';' => return &line[..i],
            None => {}
        }
    }
    line
}

fn split_label(line: &str) -> (Option<&str>, &str) {
    if let Some(idx) = line.find(':') {
        let (label, rest) = line.split_at(idx);
        (Some(label.trim()), &rest[1..])
    } else {
        (None, line)
    }
}

fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

fn split_args(s: &str) -> Result<Vec<String>, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut in_quote: Option<char> = None;
    let mut start = 0usize;
    let chars: Vec<char> = trimmed.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => continue,
            None => {}
        }
        match c {
            '"' | '\'' | '`' => in_quote = Some(c),
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            ',' if depth == 0 => {
                let piece: String = chars[start..i].iter().collect();
                let piece = piece.trim().to_string();
                if piece.is_empty() {
                    return Err("empty argument".to_string());
                }
                args.push(piece);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote.is_some() {
        return Err("unmatched quote in argument list".to_string());
    }
    let tail: String = chars[start..].iter().collect();
    let tail = tail.trim().to_string();
    if tail.is_empty() {
        return Err("empty argument".to_string());
    }
    args.push(tail);
    Ok(args)
}

fn is_valid_label_syntax(name: &str) -> bool {
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    let body_ok = if first == '.' {
        true
    } else {
        first.is_alphabetic() || first == '_'
    };
    body_ok
        && name[1..]
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn parse_st_index(arg: &str) -> Result<u8, String> {
    let trimmed = arg.trim().to_ascii_uppercase();
    let inner = trimmed
        .strip_prefix("ST(")
        .and_then(|s| s.strip_suffix(')'))
        .or_else(|| if trimmed == "ST" { Some("0") } else { None })
        .ok_or_else(|| format!("expected ST(i), found '{}'", arg))?;
    inner.parse::<u8>().map_err(|_| format!("invalid FPU stack index '{}'", inner))
}

#[cfg(test)]
mod test {
    use super::*;

    fn assemble(src: &str) -> ObjectFile {
        Assembler::new(AssemblerConfig::default()).assemble(src).unwrap()
    }

    #[test]
    fn assembles_three_nops_then_exit_sequence() {
        let obj = assemble("SEGMENT .TEXT\nnop\nnop\nnop\nmov rax, 60\nsyscall\n");
        assert_eq!(obj.text[0], Opcode::Nop as u8);
        assert_eq!(obj.text[1], Opcode::Nop as u8);
        assert_eq!(obj.text[2], Opcode::Nop as u8);
    }

    #[test]
    fn lea_with_scaled_index_assembles() {
        let obj = assemble("SEGMENT .TEXT\nlea rax, [rax + 4*rbx + 0]\n");
        assert_eq!(obj.text[0], Opcode::Lea as u8);
    }

    #[test]
    fn lea_with_three_registers_is_an_assemble_error() {
        let result = Assembler::new(AssemblerConfig::default())
            .assemble("SEGMENT .TEXT\nlea rax, [rax + rbx + rcx]\n");
        assert!(result.is_err());
    }

    #[test]
    fn cmp_zero_folds_to_cmpz() {
        let obj = assemble("SEGMENT .TEXT\ncmp rax, 0\n");
        assert_eq!(obj.text[0], Opcode::Cmpz as u8);
    }

    #[test]
    fn local_label_before_nonlocal_is_an_error() {
        let result = Assembler::new(AssemblerConfig::default()).assemble("SEGMENT .TEXT\n.loop: nop\n");
        assert!(result.is_err());
    }

    #[test]
    fn segment_redeclared_twice_is_an_error() {
        let result = Assembler::new(AssemblerConfig::default())
            .assemble("SEGMENT .TEXT\nnop\nSEGMENT .TEXT\nnop\n");
        assert!(result.is_err());
    }

    #[test]
    fn equ_binds_without_segment_offset() {
        let obj = assemble("N EQU 5\nSEGMENT .TEXT\nmov rax, N\n");
        assert_eq!(obj.symbols["N"], Expr::int(5));
    }

    #[test]
    fn bss_reservations_accumulate_length() {
        let obj = assemble("SEGMENT .BSS\nbuf: resq 4\ncount: resb 1\n");
        assert_eq!(obj.bss_len, 4 * 8 + 1);
        assert_eq!(
            obj.symbols["buf"],
            Expr::binary(Op::Add, Expr::token("#B"), Expr::int(0))
        );
        assert_eq!(
            obj.symbols["count"],
            Expr::binary(Op::Add, Expr::token("#B"), Expr::int(32))
        );
    }

    #[test]
    fn bss_declared_twice_is_an_error() {
        let result = Assembler::new(AssemblerConfig::default())
            .assemble("SEGMENT .BSS\nresb 1\nSEGMENT .BSS\nresb 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn reserve_outside_bss_is_an_error() {
        let result = Assembler::new(AssemblerConfig::default()).assemble("SEGMENT .TEXT\nresb 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn instruction_inside_bss_is_an_error() {
        let result = Assembler::new(AssemblerConfig::default()).assemble("SEGMENT .BSS\nnop\n");
        assert!(result.is_err());
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(Assembler::new(AssemblerConfig::default()).assemble("").is_err());
    }
}
