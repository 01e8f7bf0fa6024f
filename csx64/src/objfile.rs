//! In-memory assembled object file container.

use std::collections::HashSet;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::ContainerError;
use crate::expr::{read_string, write_string, Expr, SymbolTable};

pub const MAGIC: &[u8; 8] = b"CSX64obj";
pub const VERSION: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Text,
    RoData,
    Data,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Text, Segment::RoData, Segment::Data];
}

/// A deferred write: the bytes at `address` within a segment depend on `expr`, which was
/// not evaluable at the time the instruction/data directive was assembled.
#[derive(Clone, Debug, PartialEq)]
pub struct Hole {
    pub address: u64,
    pub size: u8,
    pub line: u32,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectFile {
    pub text: Vec<u8>,
    pub text_align: u32,
    pub rodata: Vec<u8>,
    pub rodata_align: u32,
    pub data: Vec<u8>,
    pub data_align: u32,
    pub bss_len: u64,
    pub bss_align: u32,

    pub globals: HashSet<String>,
    pub externals: HashSet<String>,
    pub symbols: SymbolTable,

    pub text_holes: Vec<Hole>,
    pub rodata_holes: Vec<Hole>,
    pub data_holes: Vec<Hole>,

    /// False immediately after construction or after any mutation that invalidates a
    /// previously-assembled/loaded state; set true only by a successful assemble or load.
    pub clean: bool,
}

impl Default for ObjectFile {
    fn default() -> Self {
        ObjectFile::new()
    }
}

impl ObjectFile {
    pub fn new() -> ObjectFile {
        ObjectFile {
            text: Vec::new(),
            text_align: 1,
            rodata: Vec::new(),
            rodata_align: 1,
            data: Vec::new(),
            data_align: 1,
            bss_len: 0,
            bss_align: 1,
            globals: HashSet::new(),
            externals: HashSet::new(),
            symbols: SymbolTable::new(),
            text_holes: Vec::new(),
            rodata_holes: Vec::new(),
            data_holes: Vec::new(),
            clean: false,
        }
    }

    pub fn segment(&self, seg: Segment) -> &Vec<u8> {
        match seg {
            Segment::Text => &self.text,
            Segment::RoData => &self.rodata,
            Segment::Data => &self.data,
        }
    }

    pub fn segment_mut(&mut self, seg: Segment) -> &mut Vec<u8> {
        match seg {
            Segment::Text => &mut self.text,
            Segment::RoData => &mut self.rodata,
            Segment::Data => &mut self.data,
        }
    }

    pub fn align_of(&self, seg: Segment) -> u32 {
        match seg {
            Segment::Text => self.text_align,
            Segment::RoData => self.rodata_align,
            Segment::Data => self.data_align,
        }
    }

    pub fn set_align(&mut self, seg: Segment, align: u32) {
        match seg {
            Segment::Text => self.text_align = align,
            Segment::RoData => self.rodata_align = align,
            Segment::Data => self.data_align = align,
        }
    }

    pub fn holes(&self, seg: Segment) -> &Vec<Hole> {
        match seg {
            Segment::Text => &self.text_holes,
            Segment::RoData => &self.rodata_holes,
            Segment::Data => &self.data_holes,
        }
    }

    pub fn holes_mut(&mut self, seg: Segment) -> &mut Vec<Hole> {
        match seg {
            Segment::Text => &mut self.text_holes,
            Segment::RoData => &mut self.rodata_holes,
            Segment::Data => &mut self.data_holes,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.clean = false;
    }

    /// Checks the structural invariants: every global is a defined symbol, no name is
    /// both global and external, and every alignment is a positive power of two.
    pub fn check_invariants(&self) -> Result<(), String> {
        for g in &self.globals {
            if !self.symbols.contains_key(g) {
                return Err(format!("global '{}' has no definition", g));
            }
            if self.externals.contains(g) {
                return Err(format!("'{}' is both global and external", g));
            }
        }
        for (seg, align) in [
            (Segment::Text, self.text_align),
            (Segment::RoData, self.rodata_align),
            (Segment::Data, self.data_align),
        ] {
            if align == 0 || !align.is_power_of_two() {
                return Err(format!("segment {:?} has invalid alignment {}", seg, align));
            }
        }
        if self.bss_align == 0 || !self.bss_align.is_power_of_two() {
            return Err(format!("bss has invalid alignment {}", self.bss_align));
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), ContainerError> {
        if !self.clean {
            return Err(ContainerError::Corrupt(
                "refusing to save a dirty object file".to_string(),
            ));
        }

        w.write_all(MAGIC)?;
        w.write_u64::<LittleEndian>(VERSION)?;

        write_name_set(w, &self.globals)?;
        write_name_set(w, &self.externals)?;

        w.write_u32::<LittleEndian>(self.symbols.len() as u32)?;
        // Sorted for deterministic output so two assembles of the same source produce
        // byte-identical objects.
        let mut names: Vec<&String> = self.symbols.keys().collect();
        names.sort();
        for name in names {
            write_string(w, name)?;
            self.symbols[name].write_to(w)?;
        }

        w.write_u32::<LittleEndian>(self.text_align)?;
        w.write_u32::<LittleEndian>(self.rodata_align)?;
        w.write_u32::<LittleEndian>(self.data_align)?;
        w.write_u32::<LittleEndian>(self.bss_align)?;

        write_holes(w, &self.text_holes)?;
        write_holes(w, &self.rodata_holes)?;
        write_holes(w, &self.data_holes)?;

        write_blob(w, &self.text)?;
        write_blob(w, &self.rodata)?;
        write_blob(w, &self.data)?;

        w.write_u64::<LittleEndian>(self.bss_len)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<ObjectFile, ContainerError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ContainerError::TypeMismatch);
        }
        let version = r.read_u64::<LittleEndian>()?;
        if version != VERSION {
            return Err(ContainerError::VersionMismatch {
                found: version,
                expected: VERSION,
            });
        }

        let globals = read_name_set(r)?;
        let externals = read_name_set(r)?;

        let symbol_count = r.read_u32::<LittleEndian>()?;
        let mut symbols = SymbolTable::new();
        for _ in 0..symbol_count {
            let name = read_string(r)?;
            let expr = Expr::read_from(r)?;
            symbols.insert(name, expr);
        }

        let text_align = r.read_u32::<LittleEndian>()?;
        let rodata_align = r.read_u32::<LittleEndian>()?;
        let data_align = r.read_u32::<LittleEndian>()?;
        let bss_align = r.read_u32::<LittleEndian>()?;

        let text_holes = read_holes(r)?;
        let rodata_holes = read_holes(r)?;
        let data_holes = read_holes(r)?;

        let text = read_blob(r)?;
        let rodata = read_blob(r)?;
        let data = read_blob(r)?;

        let bss_len = r.read_u64::<LittleEndian>()?;

        // Loaded files are dirty until fully read and re-validated by the caller.
        let obj = ObjectFile {
            text,
            text_align,
            rodata,
            rodata_align,
            data,
            data_align,
            bss_len,
            bss_align,
            globals,
            externals,
            symbols,
            text_holes,
            rodata_holes,
            data_holes,
            clean: false,
        };
        obj.check_invariants()
            .map_err(ContainerError::Corrupt)?;
        Ok(ObjectFile { clean: true, ..obj })
    }
}

fn write_name_set<W: Write>(w: &mut W, names: &HashSet<String>) -> Result<(), ContainerError> {
    w.write_u32::<LittleEndian>(names.len() as u32)?;
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    for name in sorted {
        write_string(w, name)?;
    }
    Ok(())
}

fn read_name_set<R: Read>(r: &mut R) -> Result<HashSet<String>, ContainerError> {
    let count = r.read_u32::<LittleEndian>()?;
    let mut set = HashSet::new();
    for _ in 0..count {
        set.insert(read_string(r)?);
    }
    Ok(set)
}

fn write_holes<W: Write>(w: &mut W, holes: &[Hole]) -> Result<(), ContainerError> {
    w.write_u32::<LittleEndian>(holes.len() as u32)?;
    for hole in holes {
        w.write_u64::<LittleEndian>(hole.address)?;
        w.write_u8(hole.size)?;
        w.write_u32::<LittleEndian>(hole.line)?;
        hole.expr.write_to(w)?;
    }
    Ok(())
}

fn read_holes<R: Read>(r: &mut R) -> Result<Vec<Hole>, ContainerError> {
    let count = r.read_u32::<LittleEndian>()?;
    let mut holes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let address = r.read_u64::<LittleEndian>()?;
        let size = r.read_u8()?;
        let line = r.read_u32::<LittleEndian>()?;
        let expr = Expr::read_from(r)?;
        holes.push(Hole { address, size, line, expr });
    }
    Ok(holes)
}

fn write_blob<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), ContainerError> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>, ContainerError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::Op;

    fn sample() -> ObjectFile {
        let mut obj = ObjectFile::new();
        obj.text = vec![0x90, 0x90];
        obj.text_align = 1;
        obj.data = vec![1, 2, 3, 4];
        obj.data_align = 4;
        obj.bss_len = 16;
        obj.bss_align = 8;
        obj.globals.insert("main".to_string());
        obj.symbols.insert(
            "main".to_string(),
            Expr::binary(Op::Add, Expr::token("#T"), Expr::int(0)),
        );
        obj.text_holes.push(Hole {
            address: 1,
            size: 4,
            line: 10,
            expr: Expr::token("unresolved"),
        });
        obj.clean = true;
        obj
    }

    #[test]
    fn assemble_link_idempotence_on_serialized_form() {
        let obj = sample();
        let mut buf = Vec::new();
        obj.write_to(&mut buf).unwrap();
        let read_back = ObjectFile::read_from(&mut &buf[..]).unwrap();

        assert_eq!(read_back.text, obj.text);
        assert_eq!(read_back.data, obj.data);
        assert_eq!(read_back.bss_len, obj.bss_len);
        assert_eq!(read_back.text_align, obj.text_align);
        assert_eq!(read_back.data_align, obj.data_align);
        assert_eq!(read_back.bss_align, obj.bss_align);
        assert_eq!(read_back.globals, obj.globals);
        assert_eq!(read_back.symbols, obj.symbols);
        assert_eq!(read_back.text_holes, obj.text_holes);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = vec![0u8; 32];
        buf[0] = b'X';
        assert_eq!(ObjectFile::read_from(&mut &buf[..]), Err(ContainerError::TypeMismatch));
    }

    #[test]
    fn dirty_file_refuses_save() {
        let mut obj = sample();
        obj.clean = false;
        let mut buf = Vec::new();
        assert!(obj.write_to(&mut buf).is_err());
    }

    #[test]
    fn invariant_catches_global_without_definition() {
        let mut obj = ObjectFile::new();
        obj.globals.insert("missing".to_string());
        assert!(obj.check_invariants().is_err());
    }

    #[test]
    fn invariant_catches_global_and_external_overlap() {
        let mut obj = ObjectFile::new();
        obj.globals.insert("dual".to_string());
        obj.externals.insert("dual".to_string());
        obj.symbols.insert("dual".to_string(), Expr::int(0));
        assert!(obj.check_invariants().is_err());
    }
}
