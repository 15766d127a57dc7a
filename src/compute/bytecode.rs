//! The kernel program and its assembler.
//!
//! Kernel source is a line-oriented listing produced by `codegen`. `assemble` turns it
//! into a `Program`, the Structure-of-Arrays tape the engine executes once per root row.
//! Assembly is deterministic: the same source always yields the same program.

use crate::error::{FlowError, Result};
use crate::graph::Relationship;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCode {
    /// The current root row.
    Row = 0,
    /// Immediate value; registers are pre-filled, so this is a no-op in the row loop.
    Const = 1,
    /// `column[p1][reg p2]`
    Load = 2,
    /// `label_table[p1][reg p2]`
    Label = 3,
    /// `reg p1 + reg p2 * imm`, composing a flat offset from per-dimension positions.
    Stride = 4,
    Neg = 5,
    Not = 6,
    Abs = 7,
    Exp = 8,
    Log = 9,
    Sqrt = 10,
    Add = 11,
    Sub = 12,
    Mul = 13,
    Div = 14,
    Mod = 15,
    Pow = 16,
    Eq = 17,
    Ne = 18,
    Lt = 19,
    Le = 20,
    Gt = 21,
    Ge = 22,
    And = 23,
    Or = 24,
    Min = 25,
    Max = 26,
    Clip = 27,
    Where = 28,
}

impl OpCode {
    const ALL: [OpCode; 29] = [
        OpCode::Row,
        OpCode::Const,
        OpCode::Load,
        OpCode::Label,
        OpCode::Stride,
        OpCode::Neg,
        OpCode::Not,
        OpCode::Abs,
        OpCode::Exp,
        OpCode::Log,
        OpCode::Sqrt,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Pow,
        OpCode::Eq,
        OpCode::Ne,
        OpCode::Lt,
        OpCode::Le,
        OpCode::Gt,
        OpCode::Ge,
        OpCode::And,
        OpCode::Or,
        OpCode::Min,
        OpCode::Max,
        OpCode::Clip,
        OpCode::Where,
    ];

    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Row => "row",
            OpCode::Const => "const",
            OpCode::Load => "load",
            OpCode::Label => "label",
            OpCode::Stride => "stride",
            OpCode::Neg => "neg",
            OpCode::Not => "not",
            OpCode::Abs => "abs",
            OpCode::Exp => "exp",
            OpCode::Log => "log",
            OpCode::Sqrt => "sqrt",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Mod => "mod",
            OpCode::Pow => "pow",
            OpCode::Eq => "eq",
            OpCode::Ne => "ne",
            OpCode::Lt => "lt",
            OpCode::Le => "le",
            OpCode::Gt => "gt",
            OpCode::Ge => "ge",
            OpCode::And => "and",
            OpCode::Or => "or",
            OpCode::Min => "min",
            OpCode::Max => "max",
            OpCode::Clip => "clip",
            OpCode::Where => "where",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.mnemonic() == s)
    }

    /// Number of register operands.
    pub fn arity(&self) -> usize {
        match self {
            OpCode::Row | OpCode::Const => 0,
            OpCode::Load | OpCode::Label => 1,
            OpCode::Stride => 2,
            OpCode::Neg | OpCode::Not | OpCode::Abs | OpCode::Exp | OpCode::Log | OpCode::Sqrt => 1,
            OpCode::Clip | OpCode::Where => 3,
            _ => 2,
        }
    }

    /// Pure scalar operations that can be folded when every operand is constant.
    pub fn is_pure(&self) -> bool {
        !matches!(self, OpCode::Row | OpCode::Const | OpCode::Load | OpCode::Label)
    }
}

/// Evaluation mode; selects the epilogue applied to each row's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Load,
    Dot,
    MnlDraws,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Load => "load",
            Mode::Dot => "dot",
            Mode::MnlDraws => "mnl_draws",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "load" => Some(Mode::Load),
            "dot" => Some(Mode::Dot),
            "mnl_draws" | "mnl" => Some(Mode::MnlDraws),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric variable the kernel reads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub node: String,
    pub var: String,
    pub dims: Vec<String>,
}

/// A label-mode relationship and the dimensions of its source variable, whose
/// flattened length the index table is built over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelRef {
    pub edge: Relationship,
    pub dims: Vec<String>,
}

/// A positional relationship whose source column must be validated at bind time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionalRef {
    pub column: u32,
    pub edge: Relationship,
}

/// A dimension length baked into the program's strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeRef {
    pub node: String,
    pub dim: String,
    pub len: usize,
}

/// Everything a bound source has to provide for a program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    pub root: String,
    pub columns: Vec<ColumnRef>,
    /// Label-mode relationships; each becomes one materialized index table.
    pub labels: Vec<LabelRef>,
    pub positional: Vec<PositionalRef>,
    pub shapes: Vec<ShapeRef>,
}

/// Structure-of-Arrays (SoA) layout for the execution tape.
/// Op i always writes register i; operands always name earlier registers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub mode: Mode,
    pub ops: Vec<OpCode>,
    pub p1: Vec<u32>,
    pub p2: Vec<u32>,
    pub p3: Vec<u32>,
    /// f64 bit patterns for `Const` and strides for `Stride`; 0 otherwise.
    pub imm: Vec<u64>,
    pub outputs: Vec<u32>,
    pub bindings: Bindings,
}

impl Program {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Checks the structural invariants the engine relies on to skip bounds reasoning.
    pub fn verify(&self) -> Result<()> {
        let n = self.ops.len();
        if self.p1.len() != n || self.p2.len() != n || self.p3.len() != n || self.imm.len() != n {
            return Err(FlowError::Internal("program operand arrays have unequal lengths".into()));
        }
        if self.outputs.is_empty() {
            return Err(FlowError::Internal("program has no outputs".into()));
        }
        for (i, op) in self.ops.iter().enumerate() {
            let operands = [self.p1[i], self.p2[i], self.p3[i]];
            let regs: &[u32] = match op {
                OpCode::Load => {
                    if self.p1[i] as usize >= self.bindings.columns.len() {
                        let msg = format!("r{} loads unknown column c{}", i, self.p1[i]);
                        return Err(FlowError::Internal(msg));
                    }
                    &operands[1..2]
                }
                OpCode::Label => {
                    if self.p1[i] as usize >= self.bindings.labels.len() {
                        let msg = format!("r{} reads unknown table t{}", i, self.p1[i]);
                        return Err(FlowError::Internal(msg));
                    }
                    &operands[1..2]
                }
                other => &operands[..other.arity()],
            };
            if let Some(bad) = regs.iter().find(|&&r| r as usize >= i) {
                return Err(FlowError::Internal(format!("r{} reads r{} before it is written", i, bad)));
            }
        }
        if let Some(bad) = self.outputs.iter().find(|&&r| r as usize >= n) {
            return Err(FlowError::Internal(format!("output names missing register r{}", bad)));
        }
        for p in &self.bindings.positional {
            if p.column as usize >= self.bindings.columns.len() {
                let msg = format!("positional check names unknown column c{}", p.column);
                return Err(FlowError::Internal(msg));
            }
        }
        Ok(())
    }
}

/// Assembles kernel source into a verified program.
pub fn assemble(source: &str) -> Result<Program> {
    let mut program = Program::default();
    let mut saw_header = false;

    for (lineno, raw) in source.lines().enumerate() {
        let line = raw.split(';').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fail = |msg: String| {
            FlowError::Internal(format!("kernel source line {}: {} ({})", lineno + 1, msg, line))
        };
        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        if !saw_header {
            if keyword != "kernel" {
                return Err(fail("expected 'kernel' header".into()));
            }
            let mode = rest
                .strip_prefix("mode=")
                .and_then(Mode::parse)
                .ok_or_else(|| fail("unknown mode".into()))?;
            program.mode = mode;
            saw_header = true;
            continue;
        }

        match keyword {
            "root" => program.bindings.root = rest.to_string(),
            "column" => {
                let (id, rest) = split_word(rest).ok_or_else(|| fail("missing column id".into()))?;
                expect_index(id, 'c', program.bindings.columns.len()).map_err(fail)?;
                let (path, dims) = split_word(rest).ok_or_else(|| fail("missing column path".into()))?;
                let (node, var) = path
                    .split_once('.')
                    .ok_or_else(|| fail("column path needs node.var".into()))?;
                let dims = parse_dims(dims).ok_or_else(|| fail("column dims must be bracketed".into()))?;
                program.bindings.columns.push(ColumnRef { node: node.into(), var: var.into(), dims });
            }
            "table" => {
                let (id, rest) = split_word(rest).ok_or_else(|| fail("missing table id".into()))?;
                expect_index(id, 't', program.bindings.labels.len()).map_err(fail)?;
                let (dims, rest) = split_word(rest).ok_or_else(|| fail("missing table dims".into()))?;
                let dims = parse_dims(dims).ok_or_else(|| fail("table dims must be bracketed".into()))?;
                let edge = Relationship::parse(rest).map_err(|e| fail(e.to_string()))?;
                program.bindings.labels.push(LabelRef { edge, dims });
            }
            "check" => {
                let (id, rest) = split_word(rest).ok_or_else(|| fail("missing column id".into()))?;
                let column = parse_index(id, 'c').ok_or_else(|| fail(format!("bad column id '{}'", id)))?;
                let edge = Relationship::parse(rest).map_err(|e| fail(e.to_string()))?;
                program.bindings.positional.push(PositionalRef { column, edge });
            }
            "shape" => {
                let (path, len) = split_word(rest).ok_or_else(|| fail("missing shape".into()))?;
                let (node, dim) = path
                    .split_once('.')
                    .ok_or_else(|| fail("shape path needs node.dim".into()))?;
                let len = len.trim().parse().map_err(|_| fail(format!("bad length '{}'", len)))?;
                program.bindings.shapes.push(ShapeRef { node: node.into(), dim: dim.into(), len });
            }
            "output" => {
                let reg = parse_index(rest, 'r').ok_or_else(|| fail(format!("bad register '{}'", rest)))?;
                program.outputs.push(reg);
            }
            target => {
                expect_index(target, 'r', program.ops.len()).map_err(fail)?;
                let rhs = rest.strip_prefix('=').ok_or_else(|| fail("expected '='".into()))?;
                let mut words = rhs.split_whitespace();
                let mnemonic = words.next().ok_or_else(|| fail("missing opcode".into()))?;
                let op = OpCode::from_mnemonic(mnemonic)
                    .ok_or_else(|| fail(format!("unknown opcode '{}'", mnemonic)))?;
                let args: Vec<&str> = words.collect();
                let (p, imm) = decode_operands(op, &args).map_err(fail)?;
                program.ops.push(op);
                program.p1.push(p[0]);
                program.p2.push(p[1]);
                program.p3.push(p[2]);
                program.imm.push(imm);
            }
        }
    }

    if !saw_header {
        return Err(FlowError::Internal("kernel source is empty".into()));
    }
    program.verify()?;
    Ok(program)
}

fn decode_operands(op: OpCode, args: &[&str]) -> std::result::Result<([u32; 3], u64), String> {
    let reg = |s: &str| parse_index(s, 'r').ok_or_else(|| format!("bad register '{}'", s));
    let mut p = [0u32; 3];
    let imm = match op {
        OpCode::Row => {
            arg_count(args, 0)?;
            0
        }
        OpCode::Const => {
            arg_count(args, 1)?;
            let hex = args[0].strip_prefix("0x").ok_or_else(|| format!("bad immediate '{}'", args[0]))?;
            u64::from_str_radix(hex, 16).map_err(|_| format!("bad immediate '{}'", args[0]))?
        }
        OpCode::Load | OpCode::Label => {
            arg_count(args, 2)?;
            let prefix = if op == OpCode::Load { 'c' } else { 't' };
            p[0] = parse_index(args[0], prefix).ok_or_else(|| format!("bad binding '{}'", args[0]))?;
            p[1] = reg(args[1])?;
            0
        }
        OpCode::Stride => {
            arg_count(args, 3)?;
            p[0] = reg(args[0])?;
            p[1] = reg(args[1])?;
            args[2].parse::<u64>().map_err(|_| format!("bad stride '{}'", args[2]))?
        }
        other => {
            arg_count(args, other.arity())?;
            for (slot, a) in p.iter_mut().zip(args) {
                *slot = reg(a)?;
            }
            0
        }
    };
    Ok((p, imm))
}

fn arg_count(args: &[&str], n: usize) -> std::result::Result<(), String> {
    if args.len() == n {
        Ok(())
    } else {
        Err(format!("expected {} operands, found {}", n, args.len()))
    }
}

fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Some(s.split_once(char::is_whitespace).map_or((s, ""), |(a, b)| (a, b.trim())))
}

/// `[a,b]` to `["a", "b"]`; `[]` is a zero-dimensional variable.
fn parse_dims(word: &str) -> Option<Vec<String>> {
    let inner = word.strip_prefix('[')?.strip_suffix(']')?;
    Some(inner.split(',').map(str::trim).filter(|d| !d.is_empty()).map(String::from).collect())
}

fn parse_index(s: &str, prefix: char) -> Option<u32> {
    s.strip_prefix(prefix)?.parse().ok()
}

fn expect_index(s: &str, prefix: char, expected: usize) -> std::result::Result<(), String> {
    match parse_index(s, prefix) {
        Some(i) if i as usize == expected => Ok(()),
        _ => Err(format!("expected {}{} but found '{}'", prefix, expected, s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
kernel mode=load
root a
column c0 a.x [row]
column c1 a.pos [row]
column c2 b.y [row]
check c1 a.pos -> b.row
shape b.row 10
r0 = row
r1 = load c0 r0
r2 = load c1 r0
r3 = load c2 r2
r4 = add r1 r3
r5 = const 0x3ff0000000000000 ; 1.0
output r4
output r5
";

    #[test]
    fn test_assemble_roundtrip_of_listing() {
        let p = assemble(SOURCE).unwrap();
        assert_eq!(p.mode, Mode::Load);
        assert_eq!(p.len(), 6);
        assert_eq!(p.ops[4], OpCode::Add);
        assert_eq!((p.p1[4], p.p2[4]), (1, 3));
        assert_eq!(f64::from_bits(p.imm[5]), 1.0);
        assert_eq!(p.outputs, vec![4, 5]);
        assert_eq!(p.bindings.columns[2].node, "b");
        assert_eq!(p.bindings.positional[0].column, 1);
        assert_eq!(p.bindings.shapes[0].len, 10);
        // Deterministic.
        assert_eq!(assemble(SOURCE).unwrap(), p);
    }

    #[test]
    fn test_table_records_source_dims() {
        let src = "kernel mode=load\n\
                   root m\n\
                   column c0 z.v [zone]\n\
                   table t0 [r,c] m.lbl @ z.zone\n\
                   r0 = row\n\
                   r1 = label t0 r0\n\
                   r2 = load c0 r1\n\
                   output r2\n";
        let p = assemble(src).unwrap();
        let table = &p.bindings.labels[0];
        assert_eq!(table.dims, vec!["r".to_string(), "c".to_string()]);
        assert_eq!(table.edge.to_string(), "m.lbl @ z.zone");
        assert!(assemble(&src.replace("[r,c] ", "")).unwrap_err().is_internal());
    }

    #[test]
    fn test_forward_reference_is_internal_error() {
        let src = "kernel mode=load\nr0 = add r0 r0\noutput r0\n";
        let err = assemble(src).unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("before it is written"), "{}", err);
    }

    #[test]
    fn test_unknown_opcode_and_gaps_rejected() {
        assert!(assemble("kernel mode=load\nr0 = frob\noutput r0\n").unwrap_err().is_internal());
        assert!(assemble("kernel mode=load\nr1 = row\noutput r1\n").is_err());
        assert!(assemble("kernel mode=warp\n").is_err());
        assert!(assemble("").is_err());
        assert!(assemble("kernel mode=dot\nr0 = row\n").is_err()); // no outputs
    }

    #[test]
    fn test_mnemonics_are_unique() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::from_mnemonic(op.mnemonic()), Some(op));
        }
    }
}
