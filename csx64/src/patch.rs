//! `TryPatchHole`: attempts to resolve a single hole's expression and, on
//! success, writes the resulting bits into the owning segment.

use crate::error::PatchOutcome;
use crate::expr::{EvalError, SymbolTable, Value};
use crate::objfile::Hole;

/// Attempts to patch `hole` into `segment`, consulting `symbols` for any unresolved
/// tokens. Returns `Patched` once bytes have been written and the caller should drop the
/// hole from its list, `Unevaluated` if it still depends on an unknown symbol (expected
/// during assembly, fatal at the end of linking), or `Error` for a definite failure.
pub fn try_patch_hole(segment: &mut [u8], symbols: &mut SymbolTable, hole: &Hole) -> PatchOutcome {
    let mut expr = hole.expr.clone();
    let value = match expr.evaluate_fresh(symbols) {
        Ok(v) => v,
        Err(EvalError::Unresolved) => return PatchOutcome::Unevaluated,
        Err(EvalError::Message(m)) => {
            return PatchOutcome::Error(format!("line {}: {}", hole.line, m))
        }
    };

    let addr = hole.address as usize;
    let size = hole.size as usize;
    if addr + size > segment.len() {
        return PatchOutcome::Error(format!(
            "line {}: hole address {} (size {}) out of segment bounds",
            hole.line, hole.address, hole.size
        ));
    }

    let bytes = match value {
        Value::Float(f) => match hole.size {
            4 => (f as f32).to_le_bytes().to_vec(),
            8 => f.to_le_bytes().to_vec(),
            _ => {
                return PatchOutcome::Error(format!(
                    "line {}: floating hole size must be 4 or 8, got {}",
                    hole.line, hole.size
                ))
            }
        },
        Value::Int(i) => {
            if size == 0 || size > 8 {
                return PatchOutcome::Error(format!(
                    "line {}: invalid hole size {}",
                    hole.line, hole.size
                ));
            }
            i.to_le_bytes()[..size].to_vec()
        }
    };

    segment[addr..addr + size].copy_from_slice(&bytes);
    PatchOutcome::Patched
}

/// Repeatedly attempts to patch every hole in `holes`, removing each one that succeeds,
/// until a full pass makes no further progress. Returns the first hard error
/// encountered, if any.
pub fn drain_patchable(
    segment: &mut [u8],
    symbols: &mut SymbolTable,
    holes: &mut Vec<Hole>,
) -> Result<(), String> {
    loop {
        let mut progressed = false;
        let mut i = 0;
        while i < holes.len() {
            match try_patch_hole(segment, symbols, &holes[i]) {
                PatchOutcome::Patched => {
                    holes.remove(i);
                    progressed = true;
                }
                PatchOutcome::Unevaluated => i += 1,
                PatchOutcome::Error(message) => return Err(message),
            }
        }
        if !progressed {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::Expr;
    use std::convert::TryInto;

    #[test]
    fn patches_once_symbol_becomes_known() {
        let mut segment = vec![0xffu8; 8];
        let mut symbols = SymbolTable::new();
        let hole = Hole {
            address: 0,
            size: 4,
            line: 1,
            expr: Expr::token("label"),
        };
        assert_eq!(
            try_patch_hole(&mut segment, &mut symbols, &hole),
            PatchOutcome::Unevaluated
        );
        symbols.insert("label".to_string(), Expr::int(0x11223344));
        assert_eq!(
            try_patch_hole(&mut segment, &mut symbols, &hole),
            PatchOutcome::Patched
        );
        assert_eq!(&segment[0..4], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn float_hole_encodes_ieee754() {
        let mut segment = vec![0u8; 8];
        let mut symbols = SymbolTable::new();
        let hole = Hole {
            address: 0,
            size: 8,
            line: 1,
            expr: Expr::float(1.5),
        };
        assert_eq!(
            try_patch_hole(&mut segment, &mut symbols, &hole),
            PatchOutcome::Patched
        );
        assert_eq!(f64::from_le_bytes(segment[..8].try_into().unwrap()), 1.5);
    }

    #[test]
    fn drain_resolves_chained_dependencies() {
        let mut segment = vec![0u8; 8];
        let mut symbols = SymbolTable::new();
        symbols.insert("b".to_string(), Expr::int(5));
        let mut holes = vec![Hole {
            address: 0,
            size: 4,
            line: 1,
            expr: Expr::token("b"),
        }];
        drain_patchable(&mut segment, &mut symbols, &mut holes).unwrap();
        assert!(holes.is_empty());
        assert_eq!(u32::from_le_bytes(segment[0..4].try_into().unwrap()), 5);
    }
}
