//! The CPU core: fetch-decode-dispatch, addressing, and the instruction handlers.

pub mod flags;
pub mod fpu;
mod exec;
pub mod memory;
pub mod registers;
pub mod simd;
pub mod syscall;

use crate::assembler::address::decode_address_header;
use crate::assembler::encode::{decode_dest_header, opcode_from_byte, OperandMode, Opcode};
use crate::assembler::tables::size_code_bytes;
use crate::error::RuntimeError;
use crate::executable::Executable;
use crate::rng::FastRng;

use flags::RFlags;
use fpu::Fpu;
use memory::Memory;
use registers::{RegisterFile, RBP, RDI, RSI, RSP};
use simd::VectorFile;
use syscall::{FdTable, NullPortIo, PortIo};

const DEFAULT_STACK_SIZE: u64 = 2 * 1024 * 1024;
const DEFAULT_MAX_MEMORY: u64 = 1024 * 1024 * 1024;

/// Advisory signal from an instruction handler: whether `tick`'s loop should keep going.
pub(crate) enum Step {
    Continue,
    Stop,
}

pub struct Cpu {
    pub registers: RegisterFile,
    pub flags: RFlags,
    pub memory: Memory,
    pub fpu: Fpu,
    pub vectors: VectorFile,
    pub fds: FdTable,
    pub rip: u64,
    pub running: bool,
    pub error: Option<RuntimeError>,
    pub return_value: i64,
    /// Governs whether out-of-band operand bit combinations trap `UndefinedBehavior` or
    /// are tolerated silently.
    pub strict: bool,
    rng: FastRng,
    port_io: Box<dyn PortIo>,
}

impl Cpu {
    /// Allocates memory for `exe` plus a stack, scrambles registers/vectors, runs
    /// `FINIT`, lays argv out at the top of the stack, and points `RIP` at the entry point.
    pub fn init(exe: &Executable, argv: &[String], seed: u64) -> Result<Cpu, RuntimeError> {
        Self::init_with(exe, argv, seed, DEFAULT_STACK_SIZE, DEFAULT_MAX_MEMORY)
    }

    pub fn init_with(
        exe: &Executable,
        argv: &[String],
        seed: u64,
        stack_size: u64,
        max_memory: u64,
    ) -> Result<Cpu, RuntimeError> {
        let image_size = exe.total_size().map_err(|_| RuntimeError::OutOfBounds)?;
        let total_size = image_size
            .checked_add(stack_size)
            .ok_or(RuntimeError::OutOfBounds)?;
        if total_size > max_memory {
            return Err(RuntimeError::OutOfBounds);
        }

        let mut memory = Memory::new(total_size, max_memory);
        memory.write(0, exe.text())?;
        memory.write(exe.text_len, exe.rodata())?;
        memory.write(exe.text_len + exe.rodata_len, exe.data())?;
        memory.exe_barrier = exe.text_len;
        memory.readonly_barrier = exe.text_len + exe.rodata_len;
        memory.stack_barrier = image_size;

        let mut rng = FastRng::new(seed);
        let mut registers = RegisterFile::new();
        registers.scramble(&mut rng);
        let mut vectors = VectorFile::new();
        vectors.scramble(&mut rng);

        let mut cpu = Cpu {
            registers,
            flags: RFlags::new(),
            memory,
            fpu: Fpu::new(),
            vectors,
            fds: FdTable::new(),
            rip: 0,
            running: true,
            error: None,
            return_value: 0,
            strict: true,
            rng,
            port_io: Box::new(NullPortIo),
        };

        cpu.layout_argv(argv)?;
        Ok(cpu)
    }

    pub fn set_port_io(&mut self, io: Box<dyn PortIo>) {
        self.port_io = io;
    }

    /// Pushes each argument string onto the stack, then a null-terminated array of their
    /// addresses, then loads `RDI = argc`, `RSI = &array`, and pushes `RSI; RDI` so the
    /// entry point sees a conventional frame.
    fn layout_argv(&mut self, argv: &[String]) -> Result<(), RuntimeError> {
        let mut sp = self.memory.len();
        let mut addrs = Vec::with_capacity(argv.len());
        for arg in argv {
            let bytes_len = arg.len() as u64 + 1;
            sp -= bytes_len;
            sp -= sp % 8;
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            self.memory.write(sp, &bytes)?;
            addrs.push(sp);
        }

        sp -= 8 * (addrs.len() as u64 + 1);
        sp -= sp % 16;
        let array_addr = sp;
        for (i, addr) in addrs.iter().enumerate() {
            self.memory.write_u64(array_addr + 8 * i as u64, *addr, 8)?;
        }
        self.memory
            .write_u64(array_addr + 8 * addrs.len() as u64, 0, 8)?;

        self.registers.set64(RDI, argv.len() as u64);
        self.registers.set64(RSI, array_addr);
        self.registers.set64(RSP, array_addr);
        self.registers.set64(RBP, array_addr);

        self.push_u64(array_addr)?;
        self.push_u64(argv.len() as u64)?;
        Ok(())
    }

    /// Runs up to `n` instructions, stopping early if a handler signals `Stop` (program
    /// halted, errored, or made a cooperative-yield syscall).
    pub fn tick(&mut self, n: u64) {
        for _ in 0..n {
            if !self.running {
                return;
            }
            match self.step() {
                Step::Continue => {}
                Step::Stop => return,
            }
        }
    }

    fn fail(&mut self, err: RuntimeError) -> Step {
        self.error = Some(err);
        self.running = false;
        self.fds.close_all();
        Step::Stop
    }

    fn step(&mut self) -> Step {
        if self.rip >= self.memory.exe_barrier {
            return self.fail(RuntimeError::AccessViolation);
        }
        let opcode_byte = match self.fetch_u8() {
            Ok(b) => b,
            Err(e) => return self.fail(e),
        };
        let opcode = match opcode_from_byte(opcode_byte) {
            Some(op) => op,
            None => return self.fail(RuntimeError::UnknownOp),
        };
        self.dispatch(opcode)
    }

    fn fetch_u8(&mut self) -> Result<u8, RuntimeError> {
        let b = self.memory.read(self.rip, 1)?[0];
        self.rip += 1;
        Ok(b)
    }

    fn fetch_bytes(&mut self, n: u64) -> Result<Vec<u8>, RuntimeError> {
        let bytes = self.memory.read(self.rip, n)?.to_vec();
        self.rip += n;
        Ok(bytes)
    }

    fn fetch_u64_sized(&mut self, size_bytes: u32) -> Result<u64, RuntimeError> {
        let bytes = self.fetch_bytes(size_bytes as u64)?;
        let mut buf = [0u8; 8];
        buf[..size_bytes as usize].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads an address header plus optional register-pair byte and optional trailing
    /// immediate starting at `RIP`, and resolves it to a flat memory address.
    fn fetch_address(&mut self) -> Result<(u64, u32), RuntimeError> {
        let lookahead = self.memory.read(self.rip, self.memory.len() - self.rip)?;
        let (header, consumed) =
            decode_address_header(lookahead).map_err(|_| RuntimeError::UndefinedBehavior)?;
        self.rip += consumed as u64;

        let mut addr: i64 = 0;
        if let Some(r1) = header.reg1 {
            let size_code = if header.pointer_size_code == 0 { 3 } else { header.pointer_size_code };
            let base = self.registers.get(r1, size_code, false) as i64;
            addr = addr.wrapping_add(base.wrapping_mul(header.reg1_mult as i64));
        }
        if let Some(r2) = header.reg2 {
            let size_code = if header.pointer_size_code == 0 { 3 } else { header.pointer_size_code };
            addr = addr.wrapping_add(self.registers.get(r2, size_code, false) as i64);
        }
        if header.has_imm {
            let size_bytes = size_code_bytes(header.pointer_size_code);
            let imm = self.fetch_u64_sized(size_bytes)?;
            addr = addr.wrapping_add(imm as i64);
        }
        Ok((addr as u64, header.pointer_size_code as u32))
    }

    fn push_u64(&mut self, value: u64) -> Result<(), RuntimeError> {
        let sp = self.registers.get64(RSP);
        if sp < self.memory.stack_barrier + 8 {
            return Err(RuntimeError::StackOverflow);
        }
        let new_sp = sp - 8;
        self.memory.write_u64(new_sp, value, 8)?;
        self.registers.set64(RSP, new_sp);
        Ok(())
    }

    fn pop_u64(&mut self) -> Result<u64, RuntimeError> {
        let sp = self.registers.get64(RSP);
        if sp < self.memory.stack_barrier {
            return Err(RuntimeError::StackOverflow);
        }
        let value = self.memory.read_u64(sp, 8)?;
        self.registers.set64(RSP, sp + 8);
        Ok(value)
    }

    fn dispatch(&mut self, opcode: Opcode) -> Step {
        match exec::execute(self, opcode) {
            Ok(step) => step,
            Err(e) => self.fail(e),
        }
    }

    pub(crate) fn random_bool(&mut self) -> bool {
        self.rng.next_bool()
    }
}

/// The "five modes" shared decode for the `Binary` format: either the destination is a register and the source is a register,
/// immediate, or memory operand, or the destination is memory and the source is a
/// register or immediate.
pub(crate) enum BinaryDest {
    Reg { id: u8, size_code: u8, high: bool },
    Mem { addr: u64, size_bytes: u32 },
}

pub(crate) enum BinarySrc {
    Reg(u8),
    Imm(u64),
    Mem(u64),
}

pub(crate) struct DecodedBinary {
    pub dest: BinaryDest,
    pub src: BinarySrc,
    pub size_bytes: u32,
}

impl Cpu {
    /// Decodes the shared `Binary`-format header starting right after the opcode byte.
    pub(crate) fn decode_binary(&mut self) -> Result<DecodedBinary, RuntimeError> {
        let header1 = self.fetch_u8()?;
        let (dest_reg, involves_mem) = decode_dest_header(header1);
        let header2 = self.fetch_u8()?;
        let mode = OperandMode::from_tag(header2 >> 4).ok_or(RuntimeError::UndefinedBehavior)?;
        let low4 = header2 & 0xF;

        if !involves_mem {
            let size_bytes = size_code_bytes(dest_reg.size_code);
            let dest = BinaryDest::Reg { id: dest_reg.id, size_code: dest_reg.size_code, high: dest_reg.high };
            let src = match mode {
                OperandMode::RegReg => BinarySrc::Reg(low4),
                OperandMode::RegImm => BinarySrc::Imm(self.fetch_u64_sized(size_bytes)?),
                OperandMode::RegMem => {
                    let (addr, _) = self.fetch_address()?;
                    BinarySrc::Mem(addr)
                }
                OperandMode::MemReg | OperandMode::MemImm => return Err(RuntimeError::UndefinedBehavior),
            };
            return Ok(DecodedBinary { dest, src, size_bytes });
        }

        // dest is memory: dest_reg.size_code carries the pointer size code.
        let (addr, ptr_size_code) = self.fetch_address()?;
        let size_bytes = size_code_bytes(ptr_size_code as u8);
        let dest = BinaryDest::Mem { addr, size_bytes };
        let src = match mode {
            OperandMode::MemReg => BinarySrc::Reg(low4),
            OperandMode::MemImm => BinarySrc::Imm(self.fetch_u64_sized(size_bytes)?),
            _ => return Err(RuntimeError::UndefinedBehavior),
        };
        Ok(DecodedBinary { dest, src, size_bytes })
    }

    pub(crate) fn read_binary_src(&self, src: &BinarySrc, size_bytes: u32, size_code: u8, high: bool) -> Result<u64, RuntimeError> {
        Ok(match src {
            BinarySrc::Reg(id) => self.registers.get(*id, size_code, high),
            BinarySrc::Imm(v) => *v,
            BinarySrc::Mem(addr) => self.memory.read_u64(*addr, size_bytes)?,
        })
    }

    pub(crate) fn read_dest(&self, dest: &BinaryDest) -> Result<u64, RuntimeError> {
        match dest {
            BinaryDest::Reg { id, size_code, high } => Ok(self.registers.get(*id, *size_code, *high)),
            BinaryDest::Mem { addr, size_bytes } => self.memory.read_u64(*addr, *size_bytes),
        }
    }

    pub(crate) fn write_dest(&mut self, dest: &BinaryDest, value: u64) -> Result<(), RuntimeError> {
        match dest {
            BinaryDest::Reg { id, size_code, high } => {
                self.registers.set(*id, *size_code, *high, value);
                Ok(())
            }
            BinaryDest::Mem { addr, size_bytes } => self.memory.write_u64(*addr, value, *size_bytes),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembler::encode::Opcode as Op;

    fn exe_from_text(text: Vec<u8>) -> Executable {
        Executable::new(text.len() as u64, 0, 0, 0, text).unwrap()
    }

    #[test]
    fn nop_then_hlt_runs_to_completion() {
        let exe = exe_from_text(vec![Op::Nop as u8, Op::Hlt as u8]);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(10);
        assert!(!cpu.running);
        assert_eq!(cpu.error, None);
    }

    #[test]
    fn executing_past_exe_barrier_is_an_access_violation() {
        let exe = exe_from_text(vec![]);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(1);
        assert_eq!(cpu.error, Some(RuntimeError::AccessViolation));
    }

    #[test]
    fn unknown_opcode_byte_fails_cleanly() {
        let exe = exe_from_text(vec![250]);
        let mut cpu = Cpu::init(&exe, &[], 1).unwrap();
        cpu.tick(1);
        assert_eq!(cpu.error, Some(RuntimeError::UnknownOp));
    }

    #[test]
    fn argv_is_reachable_from_rdi_rsi() {
        let exe = exe_from_text(vec![Op::Hlt as u8]);
        let cpu = Cpu::init(&exe, &["hello".to_string()], 1).unwrap();
        assert_eq!(cpu.registers.get64(RDI), 1);
    }
}
