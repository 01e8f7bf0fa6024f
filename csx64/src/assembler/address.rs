//! Address operand parsing and the `GetAddressAdv` wire
//! encoding/decoding.

use std::collections::HashMap;

use crate::assembler::expr_parser::parse_expr;
use crate::assembler::tables::RegisterRef;
use crate::expr::{Dir, Expr, Op, SymbolTable, Value};

/// A fully-parsed `[... ]` address operand: up to two registers (one with an optional
/// 1/2/4/8 multiplier) plus a pure displacement expression.
#[derive(Debug, Clone, PartialEq)]
pub struct MemOperand {
    pub pointer_size_code: u8,
    pub reg1: Option<(u8, u8)>, // (id, multiplier)
    pub reg2: Option<u8>,
    pub displacement: Expr,
}

pub fn parse_address(arg: &str, registers: &HashMap<String, RegisterRef>) -> Result<MemOperand, String> {
    let s = arg.trim();
    let open = s.find('[').ok_or_else(|| "address operand must contain '[...]'".to_string())?;
    let close = s.rfind(']').ok_or_else(|| "unterminated address operand".to_string())?;
    if close < open {
        return Err("malformed address operand brackets".to_string());
    }
    let prefix = s[..open].trim();
    let trailing = s[close + 1..].trim();
    if !trailing.is_empty() {
        return Err(format!("unexpected trailing text after address: '{}'", trailing));
    }

    let mut explicit_size_code: Option<u8> = None;
    if !prefix.is_empty() {
        let mut words = prefix.split_whitespace();
        let size_word = words.next().ok_or_else(|| "malformed size prefix".to_string())?;
        let ptr_word = words.next().ok_or_else(|| "expected PTR after size keyword".to_string())?;
        if !ptr_word.eq_ignore_ascii_case("PTR") {
            return Err(format!("expected PTR, found '{}'", ptr_word));
        }
        if words.next().is_some() {
            return Err("unexpected tokens between size keyword and PTR".to_string());
        }
        explicit_size_code = Some(match crate::assembler::tables::size_keyword_bytes(size_word) {
            Some(1) => return Err("BYTE PTR addresses are not a valid pointer size".to_string()),
            Some(2) => 1,
            Some(4) => 2,
            Some(8) => 3,
            _ => return Err(format!("unknown size keyword '{}'", size_word)),
        });
    }

    let inner = &s[open + 1..close];
    let parsed = parse_expr(inner)?;
    let mut tree = parsed.expr;

    let mut found_names: Vec<String> = Vec::new();
    for name in tree.token_values() {
        if registers.contains_key(&name.to_ascii_uppercase()) && !found_names.iter().any(|n| n == name) {
            found_names.push(name.to_string());
        }
    }

    let mut reg_hits: Vec<(RegisterRef, i64)> = Vec::new();
    for name in &found_names {
        let reg = registers[&name.to_ascii_uppercase()];
        let paths = tree.find_all_paths(name, false);
        let mut total: i64 = 0;
        for path in &paths {
            let mult = extract_multiplier(&tree, path)?;
            total += mult;
        }
        for path in &paths {
            *tree.at_path_mut(path) = Expr::int(0);
        }
        if total != 0 {
            reg_hits.push((reg, total));
        }
    }

    if reg_hits.len() > 2 {
        return Err("address expression may reference at most two distinct registers".to_string());
    }

    let mut size_codes: Vec<u8> = reg_hits.iter().map(|(r, _)| r.size_code).collect();
    size_codes.dedup();
    if size_codes.len() > 1 {
        return Err("all registers in an address must share the same size".to_string());
    }
    if let Some(&code) = size_codes.first() {
        if code == 0 {
            return Err("8-bit registers cannot be used in an address expression".to_string());
        }
    }

    let non_unit = reg_hits.iter().filter(|(_, k)| *k != 1).count();
    if non_unit > 1 {
        return Err("at most one register may carry a non-unit multiplier".to_string());
    }

    let mut reg1: Option<(u8, u8)> = None;
    let mut reg2: Option<u8> = None;
    // Put the (possibly-scaled) register with the non-unit multiplier, if any, in reg1.
    reg_hits.sort_by_key(|(_, k)| if *k == 1 { 1 } else { 0 });
    for (reg, mult) in &reg_hits {
        if reg1.is_none() {
            let m = match mult {
                1 => 1u8,
                2 => 2,
                4 => 4,
                8 => 8,
                other => return Err(format!("invalid address multiplier {}", other)),
            };
            reg1 = Some((reg.id, m));
        } else {
            reg2 = Some(reg.id);
        }
    }

    let pointer_size_code = explicit_size_code
        .or_else(|| size_codes.first().copied())
        .unwrap_or(3);
    if pointer_size_code == 0 {
        return Err("8-bit pointers are not a valid address size".to_string());
    }

    Ok(MemOperand {
        pointer_size_code,
        reg1,
        reg2,
        displacement: tree,
    })
}

/// Folds the multiplications along `path` from root to the register token, evaluating
/// each sibling subtree the path doesn't continue into as a compile-time integer.
fn extract_multiplier(root: &Expr, path: &[Dir]) -> Result<i64, String> {
    let mut mult: i64 = 1;
    let empty_symbols = SymbolTable::new();
    for depth in 0..path.len() {
        let node = root.at_path(&path[..depth]);
        match node {
            Expr::Binary(Op::Mul, l, r) => {
                let going_left = path[depth] == Dir::Left;
                let sibling = if going_left { r.as_ref() } else { l.as_ref() };
                let mut clone = sibling.clone();
                let mut syms = empty_symbols.clone();
                match clone.evaluate_fresh(&mut syms) {
                    Ok(Value::Int(k)) => mult = mult.wrapping_mul(k as i64),
                    _ => return Err("address register multiplier must be a compile-time integer".to_string()),
                }
            }
            Expr::Binary(Op::Add, _, _) | Expr::Binary(Op::Sub, _, _) => {}
            Expr::Unary(Op::Neg, _) => mult = -mult,
            Expr::Token(_) => {}
            _ => return Err("register used inside an unsupported address sub-expression".to_string()),
        }
    }
    Ok(mult)
}

// -- wire encoding --

pub fn encode_address(operand: &MemOperand, has_imm: bool) -> Vec<u8> {
    let reg1_mult_log2: u8 = match operand.reg1 {
        Some((_, 1)) => 0,
        Some((_, 2)) => 1,
        Some((_, 4)) => 2,
        Some((_, 8)) => 3,
        _ => 0,
    };
    let reg1_present = operand.reg1.is_some();
    let reg2_present = operand.reg2.is_some();

    let byte = ((has_imm as u8) << 7)
        | (0 << 6)
        | (reg1_mult_log2 << 4)
        | ((operand.pointer_size_code & 0b11) << 2)
        | ((reg1_present as u8) << 1)
        | (reg2_present as u8);

    let mut out = vec![byte];
    if reg1_present || reg2_present {
        let r1 = operand.reg1.map(|(id, _)| id).unwrap_or(0);
        let r2 = operand.reg2.unwrap_or(0);
        out.push((r1 << 4) | (r2 & 0xF));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddressHeader {
    pub has_imm: bool,
    pub reg1_mult: u8,
    pub pointer_size_code: u8,
    pub reg1: Option<u8>,
    pub reg2: Option<u8>,
}

/// Decodes the address header byte (and its optional register-pair byte), matching
/// `encode_address`'s layout. Caller is responsible for then reading the trailing
/// immediate, if `has_imm`, using `pointer_size_code`.
pub fn decode_address_header(bytes: &[u8]) -> Result<(DecodedAddressHeader, usize), String> {
    let byte = *bytes.first().ok_or("truncated address")?;
    let has_imm = byte & 0b1000_0000 != 0;
    let reg1_mult_log2 = (byte >> 4) & 0b11;
    let pointer_size_code = (byte >> 2) & 0b11;
    let reg1_present = byte & 0b10 != 0;
    let reg2_present = byte & 0b01 != 0;

    if pointer_size_code == 0 {
        return Err("8-bit pointers are rejected at runtime".to_string());
    }

    let mut consumed = 1;
    let (reg1, reg2) = if reg1_present || reg2_present {
        let packed = *bytes.get(1).ok_or("truncated address register byte")?;
        consumed += 1;
        (
            if reg1_present { Some(packed >> 4) } else { None },
            if reg2_present { Some(packed & 0xF) } else { None },
        )
    } else {
        (None, None)
    };

    Ok((
        DecodedAddressHeader {
            has_imm,
            reg1_mult: 1u8 << reg1_mult_log2,
            pointer_size_code,
            reg1,
            reg2,
        },
        consumed,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembler::tables::register_table;

    #[test]
    fn parses_scaled_index_with_displacement() {
        let regs = register_table();
        let mem = parse_address("[rax + 4*rbx + 8]", &regs).unwrap();
        assert_eq!(mem.reg1, Some((regs["RBX"].id, 4)));
        assert_eq!(mem.reg2, Some(regs["RAX"].id));
        let mut symbols = SymbolTable::new();
        let mut disp = mem.displacement.clone();
        assert_eq!(disp.evaluate_fresh(&mut symbols), Ok(Value::Int(8)));
    }

    #[test]
    fn rejects_more_than_two_registers() {
        let regs = register_table();
        assert!(parse_address("[rax + rbx + rcx]", &regs).is_err());
    }

    #[test]
    fn rejects_two_scaled_registers() {
        let regs = register_table();
        assert!(parse_address("[2*rax + 4*rbx]", &regs).is_err());
    }

    #[test]
    fn rejects_8bit_register() {
        let regs = register_table();
        assert!(parse_address("[al]", &regs).is_err());
    }

    #[test]
    fn repeated_register_sums_multiplier() {
        let regs = register_table();
        let mem = parse_address("[rax + rax]", &regs).unwrap();
        assert_eq!(mem.reg1, Some((regs["RAX"].id, 2)));
    }

    #[test]
    fn address_header_round_trips() {
        let regs = register_table();
        let mem = parse_address("[rax + 4*rbx + 0]", &regs).unwrap();
        let bytes = encode_address(&mem, false);
        let (decoded, consumed) = decode_address_header(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.reg1, Some(mem.reg1.unwrap().0));
        assert_eq!(decoded.reg1_mult, mem.reg1.unwrap().1);
        assert_eq!(decoded.reg2, mem.reg2);
    }
}
