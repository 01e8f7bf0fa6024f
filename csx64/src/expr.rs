//! Lazy, cycle-safe expression DAG shared by the assembler and linker.
//!
//! An [`Expr`] is a small tree: an unevaluated [`Expr::Token`] (symbol name or literal in
//! source form), an evaluated [`Expr::Leaf`], or an [`Expr::Unary`]/[`Expr::Binary`]
//! operator node. Evaluation is memoizing: a node that successfully evaluates is rewritten
//! in place into a `Leaf`, so repeated evaluation of a partially-resolved tree (as holes
//! get patched incrementally) only does the work once per node.
//!
//! Ternary `cond ? then : else` is not its own node kind; it is represented as
//! `Binary(Condition, cond, Binary(Pair, then, else))`, so a stray `Pair` outside of a
//! `Condition` is a format error rather than a distinct variant.

use std::collections::{HashMap, HashSet};
use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::ContainerError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Int(u64),
    Float(f64),
}

impl Value {
    pub fn is_float(self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Value::Int(v) => v as i64,
            Value::Float(v) => v as i64,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            Value::Int(v) => v,
            Value::Float(v) => v as i64 as u64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(v) => v as i64 as f64,
            Value::Float(v) => v,
        }
    }

    pub fn truthy(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
        }
    }

    fn from_bool(b: bool) -> Value {
        Value::Int(if b { 1 } else { 0 })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    SL,
    SR,
    Less,
    LessE,
    Great,
    GreatE,
    Eq,
    Neq,
    BitAnd,
    BitXor,
    BitOr,
    LogAnd,
    LogOr,
    NullCoalesce,
    Condition,
    Pair,
    Neg,
    BitNot,
    LogNot,
    IntCast,
    FloatCast,
}

impl Op {
    fn is_unary(self) -> bool {
        matches!(
            self,
            Op::Neg | Op::BitNot | Op::LogNot | Op::IntCast | Op::FloatCast
        )
    }

    /// 5-bit serialized discriminant. Index 0 is reserved
    /// for the "no operator" (leaf) case, so operators start at 1.
    fn tag(self) -> u8 {
        match self {
            Op::Mul => 1,
            Op::Div => 2,
            Op::Mod => 3,
            Op::Add => 4,
            Op::Sub => 5,
            Op::SL => 6,
            Op::SR => 7,
            Op::Less => 8,
            Op::LessE => 9,
            Op::Great => 10,
            Op::GreatE => 11,
            Op::Eq => 12,
            Op::Neq => 13,
            Op::BitAnd => 14,
            Op::BitXor => 15,
            Op::BitOr => 16,
            Op::LogAnd => 17,
            Op::LogOr => 18,
            Op::NullCoalesce => 19,
            Op::Condition => 20,
            Op::Pair => 21,
            Op::Neg => 22,
            Op::BitNot => 23,
            Op::LogNot => 24,
            Op::IntCast => 25,
            Op::FloatCast => 26,
        }
    }

    fn from_tag(tag: u8) -> Option<Op> {
        Some(match tag {
            1 => Op::Mul,
            2 => Op::Div,
            3 => Op::Mod,
            4 => Op::Add,
            5 => Op::Sub,
            6 => Op::SL,
            7 => Op::SR,
            8 => Op::Less,
            9 => Op::LessE,
            10 => Op::Great,
            11 => Op::GreatE,
            12 => Op::Eq,
            13 => Op::Neq,
            14 => Op::BitAnd,
            15 => Op::BitXor,
            16 => Op::BitOr,
            17 => Op::LogAnd,
            18 => Op::LogOr,
            19 => Op::NullCoalesce,
            20 => Op::Condition,
            21 => Op::Pair,
            22 => Op::Neg,
            23 => Op::BitNot,
            24 => Op::LogNot,
            25 => Op::IntCast,
            26 => Op::FloatCast,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Leaf(Value),
    Token(String),
    Unary(Op, Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

pub type SymbolTable = HashMap<String, Expr>;

/// Result of a single evaluation attempt: either a value, "not yet resolvable" (missing
/// symbol or a cycle — both are benign while a symbol table is still growing), or a
/// definite error (malformed expression).
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    Unresolved,
    Message(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Unresolved => write!(f, "expression not yet resolvable"),
            EvalError::Message(m) => write!(f, "{}", m),
        }
    }
}

pub type EvalResult = Result<Value, EvalError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Left,
    Right,
}

impl Expr {
    pub fn int(v: u64) -> Expr {
        Expr::Leaf(Value::Int(v))
    }

    pub fn float(v: f64) -> Expr {
        Expr::Leaf(Value::Float(v))
    }

    pub fn token(name: impl Into<String>) -> Expr {
        Expr::Token(name.into())
    }

    pub fn binary(op: Op, left: Expr, right: Expr) -> Expr {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn unary(op: Op, arg: Expr) -> Expr {
        Expr::Unary(op, Box::new(arg))
    }

    pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::binary(
            Op::Condition,
            cond,
            Expr::binary(Op::Pair, then, otherwise),
        )
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Expr::Leaf(_))
    }

    pub fn is_evaluated(&self) -> bool {
        self.is_leaf()
    }

    /// Evaluate this node (and cache the result in place). `visiting` tracks symbol names
    /// currently being resolved up the call stack so a cycle degrades to `Unresolved`
    /// rather than infinite recursion.
    pub fn evaluate(&mut self, symbols: &mut SymbolTable, visiting: &mut HashSet<String>) -> EvalResult {
        match self {
            Expr::Leaf(v) => Ok(*v),
            Expr::Token(tok) => {
                if let Some(v) = parse_literal_token(tok) {
                    *self = Expr::Leaf(v);
                    return Ok(v);
                }
                let name = tok.clone();
                if visiting.contains(&name) {
                    return Err(EvalError::Unresolved);
                }
                let mut def = match symbols.remove(&name) {
                    Some(e) => e,
                    None => return Err(EvalError::Unresolved),
                };
                visiting.insert(name.clone());
                let result = def.evaluate(symbols, visiting);
                visiting.remove(&name);
                symbols.insert(name, def);
                match result {
                    Ok(v) => {
                        *self = Expr::Leaf(v);
                        Ok(v)
                    }
                    Err(e) => Err(e),
                }
            }
            Expr::Unary(op, arg) => {
                let v = arg.evaluate(symbols, visiting)?;
                let result = eval_unary(*op, v)?;
                *self = Expr::Leaf(result);
                Ok(result)
            }
            Expr::Binary(Op::Condition, cond, rest) => {
                let cv = cond.evaluate(symbols, visiting)?;
                let (then_expr, else_expr) = match rest.as_mut() {
                    Expr::Binary(Op::Pair, t, e) => (t, e),
                    _ => {
                        return Err(EvalError::Message(
                            "ternary condition missing its pair".to_string(),
                        ))
                    }
                };
                // both branches are evaluated for memoization symmetry, as with the other
                // short-circuit-looking operators.
                let tv = then_expr.evaluate(symbols, visiting)?;
                let fv = else_expr.evaluate(symbols, visiting)?;
                let result = if cv.truthy() { tv } else { fv };
                *self = Expr::Leaf(result);
                Ok(result)
            }
            Expr::Binary(Op::Pair, _, _) => Err(EvalError::Message(
                "pair operator used outside of a ternary condition".to_string(),
            )),
            Expr::Binary(Op::NullCoalesce, left, right) => {
                match left.evaluate(symbols, visiting) {
                    Ok(v) => {
                        *self = Expr::Leaf(v);
                        Ok(v)
                    }
                    Err(_) => {
                        let v = right.evaluate(symbols, visiting)?;
                        *self = Expr::Leaf(v);
                        Ok(v)
                    }
                }
            }
            Expr::Binary(op, left, right) => {
                let lv = left.evaluate(symbols, visiting)?;
                let rv = right.evaluate(symbols, visiting)?;
                let result = eval_binary(*op, lv, rv)?;
                *self = Expr::Leaf(result);
                Ok(result)
            }
        }
    }

    /// Convenience wrapper for the common case of evaluating a fresh tree with no
    /// in-progress visit stack.
    pub fn evaluate_fresh(&mut self, symbols: &mut SymbolTable) -> EvalResult {
        let mut visiting = HashSet::new();
        self.evaluate(symbols, &mut visiting)
    }

    pub fn evaluatable(&self, symbols: &SymbolTable) -> bool {
        self.clone().evaluate_fresh(&mut symbols.clone()).is_ok()
    }

    // -- structural search / substitution --

    pub fn find_path(&self, token: &str, upper: bool) -> Option<Vec<Dir>> {
        let mut out = self.find_all_paths(token, upper);
        if out.is_empty() {
            None
        } else {
            Some(out.remove(0))
        }
    }

    pub fn find_all_paths(&self, token: &str, upper: bool) -> Vec<Vec<Dir>> {
        let mut out = Vec::new();
        let mut cur = Vec::new();
        self.collect_paths(token, upper, &mut cur, &mut out);
        out
    }

    fn collect_paths(&self, token: &str, upper: bool, cur: &mut Vec<Dir>, out: &mut Vec<Vec<Dir>>) {
        let matches = |s: &str| if upper { s.eq_ignore_ascii_case(token) } else { s == token };
        match self {
            Expr::Token(t) if matches(t) => out.push(cur.clone()),
            Expr::Unary(_, l) => {
                cur.push(Dir::Left);
                l.collect_paths(token, upper, cur, out);
                cur.pop();
            }
            Expr::Binary(_, l, r) => {
                cur.push(Dir::Left);
                l.collect_paths(token, upper, cur, out);
                cur.pop();
                cur.push(Dir::Right);
                r.collect_paths(token, upper, cur, out);
                cur.pop();
            }
            _ => {}
        }
    }

    pub fn find(&self, token: &str, upper: bool) -> Option<&Expr> {
        self.find_path(token, upper).map(|p| self.at_path(&p))
    }

    pub fn at_path(&self, path: &[Dir]) -> &Expr {
        let mut cur = self;
        for d in path {
            cur = match (cur, d) {
                (Expr::Unary(_, l), Dir::Left) => l,
                (Expr::Binary(_, l, _), Dir::Left) => l,
                (Expr::Binary(_, _, r), Dir::Right) => r,
                _ => panic!("invalid expr path"),
            };
        }
        cur
    }

    pub fn at_path_mut(&mut self, path: &[Dir]) -> &mut Expr {
        let mut cur = self;
        for d in path {
            cur = match (cur, d) {
                (Expr::Unary(_, l), Dir::Left) => l,
                (Expr::Binary(_, l, _), Dir::Left) => l,
                (Expr::Binary(_, _, r), Dir::Right) => r,
                _ => panic!("invalid expr path"),
            };
        }
        cur
    }

    /// Replaces every occurrence of `token` with an evaluated value.
    pub fn resolve_value(&mut self, token: &str, value: Value) {
        match self {
            Expr::Token(t) if t == token => *self = Expr::Leaf(value),
            Expr::Unary(_, l) => l.resolve_value(token, value),
            Expr::Binary(_, l, r) => {
                l.resolve_value(token, value);
                r.resolve_value(token, value);
            }
            _ => {}
        }
    }

    /// Replaces every occurrence of `token` with another token name (used to alias an
    /// external to the symbol that defines it at link time).
    pub fn resolve_token(&mut self, token: &str, new_name: &str) {
        match self {
            Expr::Token(t) if t == token => *t = new_name.to_string(),
            Expr::Unary(_, l) => l.resolve_token(token, new_name),
            Expr::Binary(_, l, r) => {
                l.resolve_token(token, new_name);
                r.resolve_token(token, new_name);
            }
            _ => {}
        }
    }

    pub fn token_values(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_token_values(&mut out);
        out
    }

    fn collect_token_values<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Token(t) => out.push(t.as_str()),
            Expr::Unary(_, l) => l.collect_token_values(out),
            Expr::Binary(_, l, r) => {
                l.collect_token_values(out);
                r.collect_token_values(out);
            }
            _ => {}
        }
    }

    /// Flattens this tree into `add`/`sub` multisets such that the expression equals
    /// `sum(add) - sum(sub)`, recursing through `+`, `-`, and unary `-`; every other node
    /// (including opaque operators and leaves) is an opaque term pushed as-is.
    pub fn populate_add_sub(&self, add: &mut Vec<Expr>, sub: &mut Vec<Expr>) {
        match self {
            Expr::Binary(Op::Add, l, r) => {
                l.populate_add_sub(add, sub);
                r.populate_add_sub(add, sub);
            }
            Expr::Binary(Op::Sub, l, r) => {
                l.populate_add_sub(add, sub);
                r.populate_add_sub(sub, add);
            }
            Expr::Unary(Op::Neg, l) => {
                l.populate_add_sub(sub, add);
            }
            other => add.push(other.clone()),
        }
    }

    /// Cancels matched `segment_origin [+ k]` terms between `add` and `sub` so that
    /// same-segment label differences collapse to a pure integer before link time. Care is
    /// taken to clone from `sub`, not `add`, when cancelling the subtracted side.
    pub fn ptrdiff_reduce(&mut self, segment_origins: &[&str]) {
        let mut add = Vec::new();
        let mut sub = Vec::new();
        self.populate_add_sub(&mut add, &mut sub);

        for &origin in segment_origins {
            loop {
                let ai = add.iter().position(|e| origin_offset(e, origin).is_some());
                let si = sub.iter().position(|e| origin_offset(e, origin).is_some());
                match (ai, si) {
                    (Some(ai), Some(si)) => {
                        let ka = origin_offset(&add[ai], origin).unwrap();
                        let ks = origin_offset(&sub[si], origin).unwrap();
                        add.remove(ai);
                        sub.remove(si);
                        if ka != 0 {
                            add.push(Expr::int(ka as u64));
                        }
                        if ks != 0 {
                            sub.push(Expr::int(ks as u64));
                        }
                    }
                    _ => break,
                }
            }
        }

        *self = rebuild_add_sub(add, sub);
    }

    // -- binary serialization --

    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Expr::Token(tok) => {
                w.write_u8(0b1000_0000)?;
                write_string(w, tok)
            }
            Expr::Leaf(Value::Int(v)) => {
                w.write_u8(0)?;
                w.write_u64::<LittleEndian>(*v)
            }
            Expr::Leaf(Value::Float(v)) => {
                w.write_u8(0b0100_0000)?;
                w.write_u64::<LittleEndian>(v.to_bits())
            }
            Expr::Unary(op, arg) => {
                w.write_u8(op.tag())?;
                arg.write_to(w)
            }
            Expr::Binary(op, left, right) => {
                w.write_u8(0b0010_0000 | op.tag())?;
                left.write_to(w)?;
                right.write_to(w)
            }
        }
    }

    pub fn read_from<R: std::io::Read>(r: &mut R) -> Result<Expr, ContainerError> {
        let tag = r.read_u8()?;
        let is_token = tag & 0b1000_0000 != 0;
        let is_float = tag & 0b0100_0000 != 0;
        let has_right = tag & 0b0010_0000 != 0;
        let op_tag = tag & 0b0001_1111;

        if is_token {
            let s = read_string(r)?;
            return Ok(Expr::Token(s));
        }

        if op_tag == 0 {
            return if is_float {
                Ok(Expr::float(f64::from_bits(r.read_u64::<LittleEndian>()?)))
            } else {
                Ok(Expr::int(r.read_u64::<LittleEndian>()?))
            };
        }

        let op = Op::from_tag(op_tag)
            .ok_or_else(|| ContainerError::Corrupt(format!("unknown expr op tag {}", op_tag)))?;

        if has_right {
            let left = Expr::read_from(r)?;
            let right = Expr::read_from(r)?;
            Ok(Expr::binary(op, left, right))
        } else {
            let arg = Expr::read_from(r)?;
            Ok(Expr::unary(op, arg))
        }
    }
}

fn origin_offset(e: &Expr, origin: &str) -> Option<i64> {
    match e {
        Expr::Token(t) if t == origin => Some(0),
        Expr::Binary(Op::Add, l, r) => match (l.as_ref(), r.as_ref()) {
            (Expr::Token(t), Expr::Leaf(Value::Int(k))) if t == origin => Some(*k as i64),
            (Expr::Leaf(Value::Int(k)), Expr::Token(t)) if t == origin => Some(*k as i64),
            _ => None,
        },
        _ => None,
    }
}

fn rebuild_add_sub(add: Vec<Expr>, sub: Vec<Expr>) -> Expr {
    let mut iter = add.into_iter();
    let mut result = iter.next().unwrap_or_else(|| Expr::int(0));
    for item in iter {
        result = Expr::binary(Op::Add, result, item);
    }
    for item in sub {
        result = Expr::binary(Op::Sub, result, item);
    }
    result
}

pub(crate) fn write_string<W: std::io::Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    let bytes = s.as_bytes();
    w.write_u16::<LittleEndian>(bytes.len() as u16)?;
    w.write_all(bytes)
}

pub(crate) fn read_string<R: std::io::Read>(r: &mut R) -> Result<String, ContainerError> {
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| ContainerError::Corrupt(e.to_string()))
}

fn eval_unary(op: Op, v: Value) -> Result<Value, EvalError> {
    Ok(match op {
        Op::Neg => match v {
            Value::Int(i) => Value::Int((i as i64).wrapping_neg() as u64),
            Value::Float(f) => Value::Float(-f),
        },
        Op::BitNot => Value::Int(!v.as_u64()),
        Op::LogNot => Value::from_bool(!v.truthy()),
        Op::IntCast => Value::Int(v.as_i64() as u64),
        Op::FloatCast => Value::Float(v.as_f64()),
        _ => return Err(EvalError::Message(format!("{:?} is not a unary operator", op))),
    })
}

fn eval_binary(op: Op, l: Value, r: Value) -> Result<Value, EvalError> {
    let either_float = l.is_float() || r.is_float();
    Ok(match op {
        Op::Mul => {
            if either_float {
                Value::Float(l.as_f64() * r.as_f64())
            } else {
                Value::Int((l.as_i64().wrapping_mul(r.as_i64())) as u64)
            }
        }
        Op::Div => {
            if either_float {
                Value::Float(l.as_f64() / r.as_f64())
            } else {
                let (a, b) = (l.as_i64(), r.as_i64());
                // The expression evaluator never traps on division by zero.
                // Rust's `/` panics on integer zero-divisor, which the reference
                // semantics never did, so this is modeled as saturating to zero rather
                // than aborting the assembler/linker process.
                Value::Int(a.checked_div(b).unwrap_or(0) as u64)
            }
        }
        Op::Mod => {
            if either_float {
                // IEEE remainder-by-truncation, i.e. C's fmod, which is exactly what
                // Rust's `%` computes for floats.
                Value::Float(l.as_f64() % r.as_f64())
            } else {
                let (a, b) = (l.as_i64(), r.as_i64());
                Value::Int(a.checked_rem(b).unwrap_or(0) as u64)
            }
        }
        Op::Add => {
            if either_float {
                Value::Float(l.as_f64() + r.as_f64())
            } else {
                Value::Int(l.as_i64().wrapping_add(r.as_i64()) as u64)
            }
        }
        Op::Sub => {
            if either_float {
                Value::Float(l.as_f64() - r.as_f64())
            } else {
                Value::Int(l.as_i64().wrapping_sub(r.as_i64()) as u64)
            }
        }
        Op::SL => Value::Int(l.as_u64().wrapping_shl((r.as_u64() & 63) as u32)),
        Op::SR => Value::Int(l.as_u64().wrapping_shr((r.as_u64() & 63) as u32)),
        Op::Less => Value::from_bool(compare(l, r, either_float) == std::cmp::Ordering::Less),
        Op::LessE => Value::from_bool(compare(l, r, either_float) != std::cmp::Ordering::Greater),
        Op::Great => Value::from_bool(compare(l, r, either_float) == std::cmp::Ordering::Greater),
        Op::GreatE => Value::from_bool(compare(l, r, either_float) != std::cmp::Ordering::Less),
        Op::Eq => Value::from_bool(if either_float { l.as_f64() == r.as_f64() } else { l.as_i64() == r.as_i64() }),
        Op::Neq => Value::from_bool(if either_float { l.as_f64() != r.as_f64() } else { l.as_i64() != r.as_i64() }),
        Op::BitAnd => Value::Int(l.as_u64() & r.as_u64()),
        Op::BitXor => Value::Int(l.as_u64() ^ r.as_u64()),
        Op::BitOr => Value::Int(l.as_u64() | r.as_u64()),
        Op::LogAnd => Value::from_bool(l.truthy() && r.truthy()),
        Op::LogOr => Value::from_bool(l.truthy() || r.truthy()),
        Op::NullCoalesce | Op::Condition | Op::Pair => {
            return Err(EvalError::Message(format!(
                "{:?} must be handled by evaluate() directly",
                op
            )))
        }
        Op::Neg | Op::BitNot | Op::LogNot | Op::IntCast | Op::FloatCast => {
            return Err(EvalError::Message(format!("{:?} is not a binary operator", op)))
        }
    })
}

fn compare(l: Value, r: Value, either_float: bool) -> std::cmp::Ordering {
    if either_float {
        l.as_f64().partial_cmp(&r.as_f64()).unwrap_or(std::cmp::Ordering::Equal)
    } else {
        l.as_i64().cmp(&r.as_i64())
    }
}

/// Parses a token leaf's source-form literal, if it is one: decimal, `0x`/`0b`/leading-`0`
/// octal integers, C-style floats, or 1..8 character constants in `"`, `'`, or `` ` ``
/// quotes. Returns `None` if the token should instead be looked up as a
/// symbol name.
pub fn parse_literal_token(tok: &str) -> Option<Value> {
    if tok.is_empty() {
        return None;
    }

    let bytes = tok.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'' || bytes[0] == b'`') {
        return parse_char_constant(tok);
    }

    if let Some(rest) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        return u64::from_str_radix(rest, 16).ok().map(Value::Int);
    }
    if let Some(rest) = tok.strip_prefix("0b").or_else(|| tok.strip_prefix("0B")) {
        return u64::from_str_radix(rest, 2).ok().map(Value::Int);
    }
    if tok.len() > 1 && bytes[0] == b'0' && tok[1..].bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return u64::from_str_radix(&tok[1..], 8).ok().map(Value::Int);
    }
    if let Ok(v) = tok.parse::<i64>() {
        return Some(Value::Int(v as u64));
    }
    if let Ok(v) = tok.parse::<u64>() {
        return Some(Value::Int(v));
    }
    if looks_like_float(tok) {
        if let Ok(v) = tok.parse::<f64>() {
            return Some(Value::Float(v));
        }
    }
    None
}

fn looks_like_float(tok: &str) -> bool {
    tok.bytes().any(|b| b == b'.' || b == b'e' || b == b'E')
        && tok.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
}

fn parse_char_constant(tok: &str) -> Option<Value> {
    let quote = tok.as_bytes()[0];
    if !(quote == b'"' || quote == b'\'' || quote == b'`') {
        return None;
    }
    let body = tok.strip_prefix(quote as char)?.strip_suffix(quote as char)?;

    let raw_bytes: Vec<u8> = if quote == b'`' {
        decode_c_escapes(body)?
    } else {
        body.as_bytes().to_vec()
    };

    if raw_bytes.is_empty() || raw_bytes.len() > 8 {
        return None;
    }

    let mut acc: u64 = 0;
    for (i, b) in raw_bytes.iter().enumerate() {
        acc |= (*b as u64) << (8 * i);
    }
    Some(Value::Int(acc))
}

/// Decodes C-style escape sequences (including `\xHH` and up to three-digit `\OOO`) used
/// by backtick-quoted character constants.
fn decode_c_escapes(body: &str) -> Option<Vec<u8>> {
    let chars: Vec<char> = body.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(chars[i].encode_utf8(&mut buf).as_bytes());
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            return None;
        }
        match chars[i] {
            'n' => {
                out.push(b'\n');
                i += 1;
            }
            't' => {
                out.push(b'\t');
                i += 1;
            }
            'r' => {
                out.push(b'\r');
                i += 1;
            }
            '0' if !(i + 1 < chars.len() && chars[i + 1].is_digit(8)) => {
                out.push(0);
                i += 1;
            }
            '\\' => {
                out.push(b'\\');
                i += 1;
            }
            '\'' => {
                out.push(b'\'');
                i += 1;
            }
            '"' => {
                out.push(b'"');
                i += 1;
            }
            '`' => {
                out.push(b'`');
                i += 1;
            }
            'x' => {
                i += 1;
                let start = i;
                while i < chars.len() && i - start < 2 && chars[i].is_ascii_hexdigit() {
                    i += 1;
                }
                if i == start {
                    return None;
                }
                let hex: String = chars[start..i].iter().collect();
                out.push(u8::from_str_radix(&hex, 16).ok()?);
            }
            c if c.is_digit(8) => {
                let start = i;
                while i < chars.len() && i - start < 3 && chars[i].is_digit(8) {
                    i += 1;
                }
                let oct: String = chars[start..i].iter().collect();
                out.push(u8::from_str_radix(&oct, 8).ok()?);
            }
            other => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                i += 1;
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn evaluates_integer_arithmetic() {
        let mut e = Expr::binary(Op::Add, Expr::int(2), Expr::binary(Op::Mul, Expr::int(3), Expr::int(4)));
        let mut symbols = SymbolTable::new();
        assert_eq!(e.evaluate_fresh(&mut symbols), Ok(Value::Int(14)));
        assert!(e.is_leaf());
    }

    #[test]
    fn mixed_float_promotes_result() {
        let mut e = Expr::binary(Op::Add, Expr::int(1), Expr::float(0.5));
        let mut symbols = SymbolTable::new();
        assert_eq!(e.evaluate_fresh(&mut symbols), Ok(Value::Float(1.5)));
    }

    #[test]
    fn cycle_is_unresolved_not_infinite() {
        let mut symbols = SymbolTable::new();
        symbols.insert("a".to_string(), Expr::token("b"));
        symbols.insert("b".to_string(), Expr::token("a"));
        let mut e = Expr::token("a");
        assert_eq!(e.evaluate_fresh(&mut symbols), Err(EvalError::Unresolved));
    }

    #[test]
    fn ternary_picks_branch() {
        let mut symbols = SymbolTable::new();
        let mut e = Expr::ternary(Expr::int(0), Expr::int(111), Expr::int(222));
        assert_eq!(e.evaluate_fresh(&mut symbols), Ok(Value::Int(222)));
    }

    #[test]
    fn null_coalesce_falls_back_on_unresolved() {
        let mut symbols = SymbolTable::new();
        let mut e = Expr::binary(Op::NullCoalesce, Expr::token("missing"), Expr::int(9));
        assert_eq!(e.evaluate_fresh(&mut symbols), Ok(Value::Int(9)));
    }

    #[test]
    fn char_constant_packs_little_endian() {
        assert_eq!(parse_literal_token("'ab'"), Some(Value::Int(0x6261)));
    }

    #[test]
    fn backtick_escape_hex_and_octal() {
        assert_eq!(parse_literal_token("`\\x41\\101`"), Some(Value::Int(0x4141)));
    }

    #[test]
    fn populate_add_sub_flattens_signs() {
        let e = Expr::binary(
            Op::Sub,
            Expr::binary(Op::Add, Expr::token("a"), Expr::token("b")),
            Expr::token("c"),
        );
        let mut add = Vec::new();
        let mut sub = Vec::new();
        e.populate_add_sub(&mut add, &mut sub);
        assert_eq!(add, vec![Expr::token("a"), Expr::token("b")]);
        assert_eq!(sub, vec![Expr::token("c")]);
    }

    #[test]
    fn ptrdiff_reduces_same_segment_label_difference() {
        // (#T + 20) - (#T + 4) reduces to the integer 16
        let mut e = Expr::binary(
            Op::Sub,
            Expr::binary(Op::Add, Expr::token("#T"), Expr::int(20)),
            Expr::binary(Op::Add, Expr::token("#T"), Expr::int(4)),
        );
        e.ptrdiff_reduce(&["#T", "#R", "#D", "#B"]);
        let mut symbols = SymbolTable::new();
        assert_eq!(e.evaluate_fresh(&mut symbols), Ok(Value::Int(16)));
    }

    #[test]
    fn round_trips_through_binary_serialization() {
        let e = Expr::binary(
            Op::Condition,
            Expr::token("flag"),
            Expr::binary(Op::Pair, Expr::int(7), Expr::float(2.5)),
        );
        let mut buf = Vec::new();
        e.write_to(&mut buf).unwrap();
        let round_tripped = Expr::read_from(&mut &buf[..]).unwrap();
        assert_eq!(e, round_tripped);
    }
}
