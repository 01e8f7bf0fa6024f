//! Syscall dispatch and the fixed-capacity file descriptor table.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::RuntimeError;

pub const FD_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallCode {
    Exit = 0,
    Read = 1,
    Write = 2,
    Open = 3,
    Close = 4,
    Seek = 5,
    Brk = 6,
    Rename = 7,
    Unlink = 8,
    Mkdir = 9,
    Rmdir = 10,
}

impl SyscallCode {
    pub fn from_u64(v: u64) -> Option<SyscallCode> {
        Some(match v {
            0 => SyscallCode::Exit,
            1 => SyscallCode::Read,
            2 => SyscallCode::Write,
            3 => SyscallCode::Open,
            4 => SyscallCode::Close,
            5 => SyscallCode::Seek,
            6 => SyscallCode::Brk,
            7 => SyscallCode::Rename,
            8 => SyscallCode::Unlink,
            9 => SyscallCode::Mkdir,
            10 => SyscallCode::Rmdir,
            _ => return None,
        })
    }
}

/// A single slot in the file descriptor table. `Std{In,Out,Err}` wrap the process's own
/// standard streams; `Regular` wraps a file the program opened itself.
pub enum FileHandle {
    StdIn,
    StdOut,
    StdErr,
    Regular(File),
}

pub struct FdTable {
    slots: [Option<FileHandle>; FD_CAPACITY],
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut slots: [Option<FileHandle>; FD_CAPACITY] = Default::default();
        slots[0] = Some(FileHandle::StdIn);
        slots[1] = Some(FileHandle::StdOut);
        slots[2] = Some(FileHandle::StdErr);
        FdTable { slots }
    }

    pub fn open(&mut self, handle: FileHandle) -> Result<u64, RuntimeError> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(i as u64);
            }
        }
        Err(RuntimeError::InsufficientFDs)
    }

    pub fn get_mut(&mut self, fd: u64) -> Result<&mut FileHandle, RuntimeError> {
        self.slots
            .get_mut(fd as usize)
            .and_then(|s| s.as_mut())
            .ok_or(RuntimeError::FDNotInUse)
    }

    pub fn close(&mut self, fd: u64) -> Result<(), RuntimeError> {
        let slot = self.slots.get_mut(fd as usize).ok_or(RuntimeError::FDNotInUse)?;
        if slot.is_none() {
            return Err(RuntimeError::FDNotInUse);
        }
        *slot = None;
        Ok(())
    }

    /// Closes every open descriptor, run on both normal and error termination.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}

/// `OUT`/`IN` port hooks: two overridable callbacks taking `(port, size_code)` and
/// reading/writing a 64-bit datum, for whatever external hardware the host wants to model.
pub trait PortIo {
    fn port_in(&mut self, port: u16, size_code: u8) -> u64;
    fn port_out(&mut self, port: u16, size_code: u8, value: u64);
}

/// No-op port hooks for environments that don't model any external hardware.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPortIo;

impl PortIo for NullPortIo {
    fn port_in(&mut self, _port: u16, _size_code: u8) -> u64 {
        0
    }
    fn port_out(&mut self, _port: u16, _size_code: u8, _value: u64) {}
}

pub fn read_fd(handle: &mut FileHandle, buf: &mut [u8]) -> std::io::Result<usize> {
    match handle {
        FileHandle::StdIn => std::io::stdin().read(buf),
        FileHandle::StdOut | FileHandle::StdErr => Ok(0),
        FileHandle::Regular(f) => f.read(buf),
    }
}

pub fn write_fd(handle: &mut FileHandle, buf: &[u8]) -> std::io::Result<usize> {
    match handle {
        FileHandle::StdOut => std::io::stdout().write(buf),
        FileHandle::StdErr => std::io::stderr().write(buf),
        FileHandle::StdIn => Ok(0),
        FileHandle::Regular(f) => f.write(buf),
    }
}

pub fn seek_fd(handle: &mut FileHandle, pos: SeekFrom) -> std::io::Result<u64> {
    match handle {
        FileHandle::Regular(f) => f.seek(pos),
        _ => Err(std::io::Error::from(std::io::ErrorKind::Unsupported)),
    }
}

/// Opens a filesystem-modifying path per `sys_open`'s create/truncate flags.
pub fn open_path(path: &str, create: bool, truncate: bool) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .truncate(truncate)
        .open(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn standard_streams_occupy_the_first_three_slots() {
        let mut table = FdTable::new();
        assert!(matches!(table.get_mut(0).unwrap(), FileHandle::StdIn));
        assert!(matches!(table.get_mut(1).unwrap(), FileHandle::StdOut));
        assert!(matches!(table.get_mut(2).unwrap(), FileHandle::StdErr));
    }

    #[test]
    fn open_fails_once_capacity_is_exhausted() {
        let mut table = FdTable::new();
        for _ in 0..(FD_CAPACITY - 3) {
            table.open(FileHandle::StdOut).unwrap();
        }
        assert_eq!(table.open(FileHandle::StdOut), Err(RuntimeError::InsufficientFDs));
    }

    #[test]
    fn closing_an_unused_slot_is_an_error() {
        let mut table = FdTable::new();
        table.close(0).unwrap();
        assert_eq!(table.close(0), Err(RuntimeError::FDNotInUse));
    }

    #[test]
    fn syscall_codes_round_trip() {
        assert_eq!(SyscallCode::from_u64(2), Some(SyscallCode::Write));
        assert_eq!(SyscallCode::from_u64(99), None);
    }
}
