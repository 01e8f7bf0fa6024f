//! Static tables consulted by the assembler front end: the register file, size
//! keywords, and reserved names.

use std::collections::{HashMap, HashSet};

/// A register reference as written in source: which of the 16 general registers, which
/// size view (0=8-bit, 1=16-bit, 2=32-bit, 3=64-bit), and whether it's the legacy 8-bit
/// high-byte alias (`AH`/`BH`/`CH`/`DH`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterRef {
    pub id: u8,
    pub size_code: u8,
    pub high: bool,
}

pub fn size_code_bytes(size_code: u8) -> u32 {
    match size_code {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        _ => panic!("invalid size code {}", size_code),
    }
}

const GP_NAMES: [[&str; 5]; 16] = [
    ["RAX", "EAX", "AX", "AL", "AH"],
    ["RCX", "ECX", "CX", "CL", "CH"],
    ["RDX", "EDX", "DX", "DL", "DH"],
    ["RBX", "EBX", "BX", "BL", "BH"],
    ["RSP", "ESP", "SP", "SPL", ""],
    ["RBP", "EBP", "BP", "BPL", ""],
    ["RSI", "ESI", "SI", "SIL", ""],
    ["RDI", "EDI", "DI", "DIL", ""],
    ["R8", "R8D", "R8W", "R8B", ""],
    ["R9", "R9D", "R9W", "R9B", ""],
    ["R10", "R10D", "R10W", "R10B", ""],
    ["R11", "R11D", "R11W", "R11B", ""],
    ["R12", "R12D", "R12W", "R12B", ""],
    ["R13", "R13D", "R13W", "R13B", ""],
    ["R14", "R14D", "R14W", "R14B", ""],
    ["R15", "R15D", "R15W", "R15B", ""],
];

pub fn register_table() -> HashMap<String, RegisterRef> {
    let mut map = HashMap::new();
    for (id, names) in GP_NAMES.iter().enumerate() {
        for (size_code, name) in names.iter().enumerate().take(4) {
            map.insert(
                name.to_string(),
                RegisterRef {
                    id: id as u8,
                    size_code: size_code as u8,
                    high: false,
                },
            );
        }
        let high_name = names[4];
        if !high_name.is_empty() {
            map.insert(
                high_name.to_string(),
                RegisterRef {
                    id: id as u8,
                    size_code: 0,
                    high: true,
                },
            );
        }
    }
    map
}

/// Size keywords that may prefix an immediate/address expression.
pub fn size_keyword_bytes(keyword: &str) -> Option<u32> {
    Some(match keyword.to_ascii_uppercase().as_str() {
        "BYTE" => 1,
        "WORD" => 2,
        "DWORD" => 4,
        "QWORD" => 8,
        "OWORD" => 16,
        "TWORD" => 10,
        "XMMWORD" => 16,
        "YMMWORD" => 32,
        "ZMMWORD" => 64,
        _ => return None,
    })
}

const SIZE_KEYWORDS: &[&str] = &[
    "BYTE", "WORD", "DWORD", "QWORD", "OWORD", "TWORD", "XMMWORD", "YMMWORD", "ZMMWORD",
];

/// Names that may never be (re)defined as a label or `EQU` symbol: register names, size
/// keywords, and the `PTR` address-size marker.
pub fn reserved_names() -> HashSet<String> {
    let mut names: HashSet<String> = register_table().keys().cloned().collect();
    for kw in SIZE_KEYWORDS {
        names.insert(kw.to_string());
    }
    names.insert("PTR".to_string());
    names.insert("__heap__".to_string());
    names
}

/// Segment-origin / segment-offset synthetic link-time symbols.
pub const SEGMENT_ORIGINS: [&str; 4] = ["#T", "#R", "#D", "#B"];
pub const SEGMENT_OFFSETS: [&str; 4] = ["#t", "#r", "#d", "#b"];
pub const HEAP_SYMBOL: &str = "__heap__";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn high_byte_aliases_only_exist_for_first_four() {
        let regs = register_table();
        assert!(regs.contains_key("AH"));
        assert!(regs.contains_key("BH"));
        assert!(regs.contains_key("CH"));
        assert!(regs.contains_key("DH"));
        assert!(!regs.contains_key("R8H"));
        assert!(!regs.contains_key("SPH"));
    }

    #[test]
    fn aliases_share_the_same_id() {
        let regs = register_table();
        assert_eq!(regs["RAX"].id, regs["EAX"].id);
        assert_eq!(regs["EAX"].id, regs["AL"].id);
        assert_eq!(regs["AL"].id, regs["AH"].id);
    }

    #[test]
    fn reserved_names_cannot_be_registers_or_sizes() {
        let reserved = reserved_names();
        assert!(reserved.contains("RAX"));
        assert!(reserved.contains("BYTE"));
        assert!(reserved.contains("PTR"));
    }
}
