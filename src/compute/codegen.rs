//! Lowers an analyzed flow graph to kernel source.
//!
//! Only slots some output depends on are emitted, in DFS post-order, and renumbered
//! so instruction i writes register i.

use crate::analysis::flow::SlotId;
use crate::analysis::{topology, Analysis};
use crate::compute::bytecode::{Mode, OpCode};
use crate::error::{FlowError, Result};
use std::collections::HashMap;
use std::fmt::Write;

pub fn emit(analysis: &Analysis, mode: Mode) -> Result<String> {
    let flow = &analysis.flow;
    let order = topology::sort(flow, &analysis.outputs).map_err(FlowError::Internal)?;
    let reg: HashMap<SlotId, usize> = order.iter().enumerate().map(|(i, &s)| (s, i)).collect();
    let r = |s: SlotId| -> Result<usize> {
        reg.get(&s)
            .copied()
            .ok_or_else(|| FlowError::Internal(format!("slot {} used before it was ordered", s.index())))
    };

    let b = &analysis.bindings;
    let mut out = String::new();
    let _ = writeln!(out, "kernel mode={}", mode);
    let _ = writeln!(out, "root {}", b.root);
    for (i, c) in b.columns.iter().enumerate() {
        let _ = writeln!(out, "column c{} {}.{} [{}]", i, c.node, c.var, c.dims.join(","));
    }
    for (i, t) in b.labels.iter().enumerate() {
        let _ = writeln!(out, "table t{} [{}] {}", i, t.dims.join(","), t.edge);
    }
    for p in &b.positional {
        let _ = writeln!(out, "check c{} {}", p.column, p.edge);
    }
    for s in &b.shapes {
        let _ = writeln!(out, "shape {}.{} {}", s.node, s.dim, s.len);
    }

    for (i, &slot) in order.iter().enumerate() {
        let op = flow.ops[slot.index()];
        let operand = flow.operand[slot.index()];
        let parents = flow.get_parents(slot);
        let _ = write!(out, "r{} = {}", i, op.mnemonic());
        match op {
            OpCode::Row => {}
            OpCode::Const => {
                let _ = write!(out, " 0x{:016x} ; {}", operand, f64::from_bits(operand));
            }
            OpCode::Load | OpCode::Label => {
                let prefix = if op == OpCode::Load { 'c' } else { 't' };
                let _ = write!(out, " {}{} r{}", prefix, operand, r(parents[0])?);
            }
            OpCode::Stride => {
                let _ = write!(out, " r{} r{} {}", r(parents[0])?, r(parents[1])?, operand);
            }
            _ => {
                for &p in parents {
                    let _ = write!(out, " r{}", r(p)?);
                }
            }
        }
        out.push('\n');
    }

    for (e, &slot) in analysis.outputs.iter().enumerate() {
        let _ = writeln!(out, "output r{} ; {}", r(slot)?, analysis.normalized[e]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::compute::bytecode::assemble;
    use crate::expr::ExpressionSet;
    use crate::graph::RelationshipGraph;
    use crate::store::{Coords, Dataset};

    fn graph() -> RelationshipGraph {
        let mut g = RelationshipGraph::new();
        g.add_node(
            "a",
            Dataset::from_table("row", Coords::Range(3), [("x", vec![1.0, 2.0, 3.0]), ("p", vec![2.0, 1.0, 0.0])])
                .unwrap(),
        )
        .unwrap();
        g.add_node("b", Dataset::from_table("row", Coords::Range(3), [("y", vec![10.0, 20.0, 30.0])]).unwrap())
            .unwrap();
        g.add_edge("a.p -> b.row").unwrap();
        g
    }

    #[test]
    fn test_emitted_source_assembles() {
        let g = graph();
        let a = analyze(&g, &ExpressionSet::from_exprs(["a.x + b.y", "b.y * 2", "3 - 1"])).unwrap();
        let src = emit(&a, Mode::Load).unwrap();
        assert!(src.starts_with("kernel mode=load\nroot a\n"));
        assert!(src.contains("check c2 a.p -> b.row"));
        assert!(src.contains("shape b.row 3"));

        let program = assemble(&src).unwrap();
        assert_eq!(program.outputs.len(), 3);
        assert_eq!(program.bindings, a.bindings);
        // b.y is gathered once and shared by both expressions.
        let loads = program.ops.iter().filter(|op| **op == OpCode::Load).count();
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_emission_is_deterministic() {
        let g = graph();
        let set = ExpressionSet::from_exprs(["where(a.x > 1, b.y, -b.y)", "clip(a.x, 0, 2)"]);
        let first = emit(&analyze(&g, &set).unwrap(), Mode::Dot).unwrap();
        let second = emit(&analyze(&g, &set).unwrap(), Mode::Dot).unwrap();
        assert_eq!(first, second);
        assert_eq!(assemble(&first).unwrap().mode, Mode::Dot);
    }
}
