use crate::compute::bytecode::{OpCode, Program};

#[inline(always)]
fn truth(x: f64) -> bool {
    x != 0.0
}

#[inline(always)]
fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Floor modulo: the result takes the sign of the divisor.
#[inline(always)]
fn floor_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

#[inline(always)]
fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

#[inline(always)]
fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// Scalar semantics of every pure opcode. Constant folding and the row loop both go
/// through here, so a folded constant is bit-identical to the evaluated one.
#[inline(always)]
pub fn apply(op: OpCode, a: f64, b: f64, c: f64) -> f64 {
    match op {
        OpCode::Neg => -a,
        OpCode::Not => flag(!truth(a)),
        OpCode::Abs => a.abs(),
        OpCode::Exp => a.exp(),
        OpCode::Log => a.ln(),
        OpCode::Sqrt => a.sqrt(),
        OpCode::Add => a + b,
        OpCode::Sub => a - b,
        OpCode::Mul => a * b,
        OpCode::Div => a / b,
        OpCode::Mod => floor_mod(a, b),
        OpCode::Pow => a.powf(b),
        OpCode::Eq => flag(a == b),
        OpCode::Ne => flag(a != b),
        OpCode::Lt => flag(a < b),
        OpCode::Le => flag(a <= b),
        OpCode::Gt => flag(a > b),
        OpCode::Ge => flag(a >= b),
        OpCode::And => flag(truth(a) && truth(b)),
        OpCode::Or => flag(truth(a) || truth(b)),
        OpCode::Min => nan_min(a, b),
        OpCode::Max => nan_max(a, b),
        OpCode::Clip => nan_min(nan_max(a, b), c),
        OpCode::Where => {
            if truth(a) {
                b
            } else {
                c
            }
        }
        OpCode::Stride => a + b * c,
        OpCode::Row | OpCode::Const | OpCode::Load | OpCode::Label => f64::NAN,
    }
}

/// Fills constant registers. Done once per worker; the row loop never touches them.
pub fn init_registers(program: &Program) -> Vec<f64> {
    program
        .ops
        .iter()
        .zip(&program.imm)
        .map(|(op, &imm)| if *op == OpCode::Const { f64::from_bits(imm) } else { 0.0 })
        .collect()
}

/// Evaluates the program for one root row.
///
/// Offsets read from registers are trusted: binding validated every column length,
/// label table, and positional source against the program's recorded shapes.
#[inline]
pub fn eval_row(
    program: &Program,
    columns: &[&[f64]],
    tables: &[&[u32]],
    row: usize,
    regs: &mut [f64],
) {
    for i in 0..program.ops.len() {
        let op = program.ops[i];
        let p1 = program.p1[i] as usize;
        let p2 = program.p2[i] as usize;
        regs[i] = match op {
            OpCode::Const => continue,
            OpCode::Row => row as f64,
            OpCode::Load => columns[p1][regs[p2] as usize],
            OpCode::Label => tables[p1][regs[p2] as usize] as f64,
            OpCode::Stride => regs[p1] + regs[p2] * program.imm[i] as f64,
            other => {
                let arity = other.arity();
                let a = regs[p1];
                let b = if arity > 1 { regs[p2] } else { 0.0 };
                let c = if arity > 2 { regs[program.p3[i] as usize] } else { 0.0 };
                apply(other, a, b, c)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OpCode::Mod, 7.0, 3.0, 1.0)]
    #[case(OpCode::Mod, -7.0, 3.0, 2.0)]
    #[case(OpCode::Mod, 7.0, -3.0, -2.0)]
    #[case(OpCode::Div, 1.0, 0.0, f64::INFINITY)]
    #[case(OpCode::Lt, 1.0, 2.0, 1.0)]
    #[case(OpCode::Ge, 1.0, 2.0, 0.0)]
    #[case(OpCode::And, 2.0, 0.0, 0.0)]
    #[case(OpCode::Or, 0.0, -1.0, 1.0)]
    #[case(OpCode::Pow, 2.0, 10.0, 1024.0)]
    fn test_binary_semantics(#[case] op: OpCode, #[case] a: f64, #[case] b: f64, #[case] want: f64) {
        assert_eq!(apply(op, a, b, 0.0), want);
    }

    #[test]
    fn test_nan_propagates_through_min_max_clip() {
        assert!(apply(OpCode::Min, f64::NAN, 1.0, 0.0).is_nan());
        assert!(apply(OpCode::Max, 1.0, f64::NAN, 0.0).is_nan());
        assert!(apply(OpCode::Clip, f64::NAN, 0.0, 1.0).is_nan());
        assert_eq!(apply(OpCode::Clip, 5.0, 0.0, 1.0), 1.0);
        assert_eq!(apply(OpCode::Clip, -5.0, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_where_and_not() {
        assert_eq!(apply(OpCode::Where, 1.0, 10.0, 20.0), 10.0);
        assert_eq!(apply(OpCode::Where, 0.0, 10.0, 20.0), 20.0);
        assert_eq!(apply(OpCode::Not, 0.0, 0.0, 0.0), 1.0);
        assert_eq!(apply(OpCode::Not, f64::NAN, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_eval_row_gathers_through_positions() {
        let program = crate::compute::bytecode::assemble(
            "kernel mode=load\n\
             column c0 a.pos [row]\n\
             column c1 b.y [row]\n\
             r0 = row\n\
             r1 = load c0 r0\n\
             r2 = load c1 r1\n\
             r3 = const 0x4000000000000000\n\
             r4 = mul r2 r3\n\
             output r4\n",
        )
        .unwrap();
        let pos = [2.0, 0.0];
        let y = [10.0, 20.0, 30.0];
        let mut regs = init_registers(&program);
        eval_row(&program, &[&pos, &y], &[], 0, &mut regs);
        assert_eq!(regs[4], 60.0);
        eval_row(&program, &[&pos, &y], &[], 1, &mut regs);
        assert_eq!(regs[4], 20.0);
    }
}
