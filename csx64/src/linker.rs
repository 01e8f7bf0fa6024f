//! Merges object files into an executable image.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::LinkError;
use crate::executable::Executable;
use crate::expr::{Expr, EvalError, Value};
use crate::objfile::{ObjectFile, Segment};
use crate::patch::drain_patchable;

const SEGMENT_ORIGINS: [&str; 4] = ["#T", "#R", "#D", "#B"];
const SEGMENT_OFFSETS: [&str; 4] = ["#t", "#r", "#d", "#b"];
const HEAP_SYMBOL: &str = "__heap__";

/// A single object file plus the name it was identified by (for diagnostics) while it
/// moves through the link pipeline.
struct Unit {
    name: String,
    obj: ObjectFile,
}

/// Links `files` (the first of which is the `_start` bootstrapping module) into a loadable
/// executable, resolving `_start` to `entry` along the way.
pub fn link(files: Vec<ObjectFile>, entry: &str) -> Result<Executable, LinkError> {
    if files.is_empty() {
        return Err(LinkError::EmptyResult);
    }

    let units: Vec<Unit> = files
        .into_iter()
        .enumerate()
        .map(|(i, obj)| Unit { name: format!("file{}", i), obj })
        .collect();

    // Step 1: global name -> owning file map; duplicates are a hard error.
    let mut owner: HashMap<String, usize> = HashMap::new();
    for (idx, unit) in units.iter().enumerate() {
        for g in &unit.obj.globals {
            if owner.contains_key(g) {
                return Err(LinkError::SymbolRedefinition(g.clone()));
            }
            owner.insert(g.clone(), idx);
        }
    }

    // Step 2: no file may define a reserved synthetic name.
    for unit in &units {
        if unit.obj.globals.contains(HEAP_SYMBOL)
            || SEGMENT_ORIGINS.iter().any(|s| unit.obj.globals.contains(*s))
            || SEGMENT_OFFSETS.iter().any(|s| unit.obj.globals.contains(*s))
        {
            return Err(LinkError::FormatError(format!(
                "'{}' defines a reserved synthetic symbol",
                unit.name
            )));
        }
    }

    let mut units = units;
    // `_start` bootstraps and must itself reference the real entry point under that name.
    if !units[0].obj.externals.contains("_start") {
        return Err(LinkError::FormatError(
            "the bootstrap file must declare '_start' as external".to_string(),
        ));
    }
    units[0].obj.externals.remove("_start");
    units[0].obj.externals.insert(entry.to_string());
    for seg in Segment::ALL {
        for hole in units[0].obj.holes_mut(seg) {
            hole.expr.resolve_token("_start", entry);
        }
    }

    // Step 3: BFS-reachability from the bootstrap file, concatenating segments as files
    // are included.
    let mut included: Vec<usize> = Vec::new();
    let mut included_set: HashSet<usize> = HashSet::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    queue.push_back(0);
    included_set.insert(0);

    let mut text = Vec::new();
    let mut rodata = Vec::new();
    let mut data = Vec::new();
    let mut bss_len: u64 = 0;
    // Per-included-file base offset within each of the four segments, indexed by unit idx.
    let mut bases: HashMap<usize, [u64; 4]> = HashMap::new();

    while let Some(idx) = queue.pop_front() {
        included.push(idx);

        pad_to(&mut text, units[idx].obj.text_align);
        let text_base = text.len() as u64;
        text.extend_from_slice(&units[idx].obj.text);

        pad_to(&mut rodata, units[idx].obj.rodata_align);
        let rodata_base = rodata.len() as u64;
        rodata.extend_from_slice(&units[idx].obj.rodata);

        pad_to(&mut data, units[idx].obj.data_align);
        let data_base = data.len() as u64;
        data.extend_from_slice(&units[idx].obj.data);

        let bss_align = units[idx].obj.bss_align as u64;
        if bss_align > 0 {
            let rem = bss_len % bss_align;
            if rem != 0 {
                bss_len += bss_align - rem;
            }
        }
        let bss_base = bss_len;
        bss_len += units[idx].obj.bss_len;

        bases.insert(idx, [text_base, rodata_base, data_base, bss_base]);

        for ext in units[idx].obj.externals.clone() {
            match owner.get(&ext) {
                Some(&owner_idx) => {
                    if included_set.insert(owner_idx) {
                        queue.push_back(owner_idx);
                    }
                }
                None => return Err(LinkError::MissingSymbol(ext)),
            }
        }
    }

    // Step 4: final alignment padding so rodata/data/bss each begin at the image's
    // maximum observed alignment for that segment, and the image ends 16-byte aligned.
    let max_align = |f: fn(&ObjectFile) -> u32| -> u32 {
        included.iter().map(|&i| f(&units[i].obj)).max().unwrap_or(1)
    };
    pad_to(&mut text, max_align(|o| o.rodata_align));
    pad_to(&mut rodata, max_align(|o| o.data_align));
    let combined_bss_align = max_align(|o| o.bss_align) as u64;
    pad_to(&mut data, combined_bss_align.max(1) as u32);

    let text_size = text.len() as u64;
    let rodata_size = rodata.len() as u64;
    let data_size = data.len() as u64;
    let image_before_bss = text_size + rodata_size + data_size;
    let total_unaligned = image_before_bss + bss_len;
    let aligned_total = align_up(total_unaligned, 16);
    bss_len += aligned_total - total_unaligned;

    let origins = [0u64, text_size, text_size + rodata_size, text_size + rodata_size + data_size];

    // Step 5: define synthetic symbols per included file, then evaluate globals and wire
    // externals to their owning file's symbol under a fresh per-file handle.
    for &idx in &included {
        let base = bases[&idx];
        for (i, name) in SEGMENT_ORIGINS.iter().enumerate() {
            units[idx].obj.symbols.insert(name.to_string(), Expr::int(origins[i]));
        }
        for (i, name) in SEGMENT_OFFSETS.iter().enumerate() {
            units[idx]
                .obj
                .symbols
                .insert(name.to_string(), Expr::int(base[i] + origins[i]));
        }
        units[idx]
            .obj
            .symbols
            .insert(HEAP_SYMBOL.to_string(), Expr::int(aligned_total));
    }

    // Step 6: evaluate every global strictly within its own file.
    let mut global_values: HashMap<String, Value> = HashMap::new();
    for &idx in &included {
        let globals: Vec<String> = units[idx].obj.globals.iter().cloned().collect();
        let mut own_symbols = units[idx].obj.symbols.clone();
        for g in &globals {
            let mut expr = own_symbols
                .get(g)
                .cloned()
                .ok_or_else(|| LinkError::MissingSymbol(g.clone()))?;
            match expr.evaluate_fresh(&mut own_symbols) {
                Ok(value) => {
                    global_values.insert(g.clone(), value);
                }
                Err(EvalError::Unresolved) => {
                    return Err(LinkError::FormatError(format!(
                        "global '{}' depends on another file's symbols",
                        g
                    )))
                }
                Err(EvalError::Message(m)) => return Err(LinkError::FormatError(m)),
            }
        }
        units[idx].obj.symbols = own_symbols;
    }

    for &idx in &included {
        let externals: Vec<String> = units[idx].obj.externals.iter().cloned().collect();
        for ext in externals {
            let value = global_values
                .get(&ext)
                .ok_or_else(|| LinkError::MissingSymbol(ext.clone()))?;
            units[idx].obj.symbols.insert(ext.clone(), Expr::Leaf(*value));
        }
    }

    // Step 7: patch every hole, re-homed to this file's base offset, against the final
    // concatenated segment bytes using each file's now-complete symbol table.
    for &idx in &included {
        let base = bases[&idx];
        let unit = &mut units[idx];
        for (seg_i, seg) in Segment::ALL.iter().enumerate() {
            let mut holes = std::mem::take(unit.obj.holes_mut(*seg));
            for hole in holes.iter_mut() {
                hole.address += base[seg_i];
            }
            let full = match seg {
                Segment::Text => &mut text,
                Segment::RoData => &mut rodata,
                Segment::Data => &mut data,
            };
            drain_patchable(full, &mut unit.obj.symbols, &mut holes).map_err(LinkError::FormatError)?;
            if !holes.is_empty() {
                return Err(LinkError::MissingSymbol(format!(
                    "{} unresolved hole(s) remain in {}",
                    holes.len(),
                    unit.name
                )));
            }
        }
    }

    let content = {
        let mut v = Vec::with_capacity(text.len() + rodata.len() + data.len());
        v.extend_from_slice(&text);
        v.extend_from_slice(&rodata);
        v.extend_from_slice(&data);
        v
    };

    // Step 8: emit the executable image.
    Executable::new(text_size, rodata_size, data_size, bss_len, content)
        .map_err(|e| LinkError::FormatError(e.to_string()))
}

fn pad_to(buf: &mut Vec<u8>, align: u32) {
    if align <= 1 {
        return;
    }
    let rem = buf.len() % align as usize;
    if rem != 0 {
        buf.resize(buf.len() + (align as usize - rem), 0);
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::objfile::Hole;

    fn start_file(entry_external: &str) -> ObjectFile {
        let mut obj = ObjectFile::new();
        obj.externals.insert(entry_external.to_string());
        obj.text = vec![0xFF; 4];
        obj.text_holes.push(Hole {
            address: 0,
            size: 4,
            line: 1,
            expr: Expr::token(entry_external),
        });
        obj.clean = true;
        obj
    }

    fn main_file() -> ObjectFile {
        let mut obj = ObjectFile::new();
        obj.globals.insert("main".to_string());
        obj.symbols.insert("main".to_string(), Expr::int(0xAB));
        obj.text = vec![0x90];
        obj.clean = true;
        obj
    }

    #[test]
    fn links_start_plus_main_and_resolves_entry() {
        let exe = link(vec![start_file("_start"), main_file()], "main").unwrap();
        assert_eq!(exe.text_len, 5);
        // the hole in the bootstrap file now holds main's value (0xAB) little-endian
        assert_eq!(&exe.text()[0..4], &0xABu32.to_le_bytes());
    }

    #[test]
    fn missing_start_declaration_is_a_format_error() {
        let mut obj = ObjectFile::new();
        obj.clean = true;
        assert!(matches!(link(vec![obj], "main"), Err(LinkError::FormatError(_))));
    }

    #[test]
    fn duplicate_global_across_files_is_an_error() {
        let mut a = start_file("_start");
        a.globals.insert("dup".to_string());
        a.symbols.insert("dup".to_string(), Expr::int(1));
        let mut b = main_file();
        b.globals.insert("dup".to_string());
        b.symbols.insert("dup".to_string(), Expr::int(2));
        assert_eq!(
            link(vec![a, b], "main"),
            Err(LinkError::SymbolRedefinition("dup".to_string()))
        );
    }

    #[test]
    fn unresolved_external_is_a_missing_symbol_error() {
        let start = start_file("_start");
        assert!(matches!(link(vec![start], "main"), Err(LinkError::MissingSymbol(_))));
    }

    #[test]
    fn empty_file_list_is_rejected() {
        assert_eq!(link(vec![], "main"), Err(LinkError::EmptyResult));
    }
}
