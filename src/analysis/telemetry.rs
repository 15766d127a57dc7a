use crate::compute::bytecode::{OpCode, Program};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalityStats {
    /// Reads of a register written 1-2 instructions earlier.
    pub hot: usize,
    /// Reads within 64 registers (one 512-byte window of f64).
    pub near: usize,
    /// Everything further back.
    pub far: usize,
    /// Reads of pre-filled constant registers.
    pub constants: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelReport {
    pub total_ops: usize,
    pub op_counts: BTreeMap<&'static str, usize>,
    /// Column gathers per row.
    pub loads: usize,
    /// Label-table lookups per row.
    pub lookups: usize,
    pub outputs: usize,
    pub locality: LocalityStats,
    /// The average distance of a register read (excluding constants). Lower is better.
    pub avg_jump_distance: f64,
}

impl KernelReport {
    pub fn analyze(program: &Program) -> Self {
        let mut op_counts = BTreeMap::new();
        let mut locality = LocalityStats::default();
        let mut total_distance: u64 = 0;
        let mut read_count: u64 = 0;

        for (i, op) in program.ops.iter().enumerate() {
            *op_counts.entry(op.mnemonic()).or_insert(0) += 1;

            let operands = [program.p1[i], program.p2[i], program.p3[i]];
            let reads: &[u32] = match op {
                OpCode::Load | OpCode::Label => &operands[1..2],
                other => &operands[..other.arity()],
            };
            for &src in reads {
                if program.ops[src as usize] == OpCode::Const {
                    locality.constants += 1;
                    continue;
                }
                let dist = (i as u32).saturating_sub(src);
                total_distance += dist as u64;
                read_count += 1;
                match dist {
                    0..=2 => locality.hot += 1,
                    3..=64 => locality.near += 1,
                    _ => locality.far += 1,
                }
            }
        }

        Self {
            total_ops: program.ops.len(),
            loads: op_counts.get("load").copied().unwrap_or(0),
            lookups: op_counts.get("label").copied().unwrap_or(0),
            outputs: program.outputs.len(),
            op_counts,
            locality,
            avg_jump_distance: if read_count > 0 { total_distance as f64 / read_count as f64 } else { 0.0 },
        }
    }
}
