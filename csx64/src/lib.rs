//! A complete 64-bit virtual machine toolchain: an assembler, a linker, and a virtual
//! CPU modeled loosely on x86-64/x87/SSE.
//!
//! The pipeline is `source text -> Assembler -> ObjectFile -> linker::link -> Executable
//! -> cpu::Cpu`. Each stage has its own closed error taxonomy in [`error`].

pub mod assembler;
pub mod cpu;
pub mod error;
pub mod executable;
pub mod expr;
pub mod linker;
pub mod objfile;
pub mod patch;
pub mod rng;
