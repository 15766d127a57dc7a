use crate::compute::bytecode::OpCode;
use crate::compute::kernel;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn new(i: usize) -> Self {
        Self(i as u32)
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

type Signature = (OpCode, SmallVec<[SlotId; 3]>, u64);

/// Shared computation graph of every expression in a set.
///
/// Slots are hash-consed on (opcode, parents, operand): building the same
/// sub-computation twice returns the same slot, so a gather or offset shared by
/// several expressions is evaluated once per row. Pure operations over constants
/// are folded at insertion.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    // Columnar arrays
    pub ops: Vec<OpCode>,
    /// Column index for `Load`, table index for `Label`, f64 bits for `Const`, stride for `Stride`.
    pub operand: Vec<u64>,

    // Topology (CSR)
    pub parents_flat: Vec<SlotId>,
    pub parents_ranges: Vec<(u32, u32)>, // (start, count)

    interned: HashMap<Signature, SlotId>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.ops.len()
    }

    #[inline(always)]
    pub fn get_parents(&self, id: SlotId) -> &[SlotId] {
        let (start, count) = self.parents_ranges[id.index()];
        &self.parents_flat[start as usize..(start + count) as usize]
    }

    /// The value of a slot when it is a known constant.
    pub fn constant_value(&self, id: SlotId) -> Option<f64> {
        (self.ops[id.index()] == OpCode::Const).then(|| f64::from_bits(self.operand[id.index()]))
    }

    pub fn row(&mut self) -> SlotId {
        self.intern(OpCode::Row, &[], 0)
    }

    pub fn constant(&mut self, value: f64) -> SlotId {
        self.intern(OpCode::Const, &[], value.to_bits())
    }

    pub fn load(&mut self, column: u32, offset: SlotId) -> SlotId {
        self.intern(OpCode::Load, &[offset], column as u64)
    }

    pub fn label(&mut self, table: u32, offset: SlotId) -> SlotId {
        self.intern(OpCode::Label, &[offset], table as u64)
    }

    /// `base + pos * stride`
    pub fn stride(&mut self, base: SlotId, pos: SlotId, stride: u64) -> SlotId {
        if stride == 0 {
            return base;
        }
        if self.constant_value(pos) == Some(0.0) {
            return base;
        }
        match (self.constant_value(base), self.constant_value(pos)) {
            (Some(b), Some(p)) => self.constant(b + p * stride as f64),
            _ => self.intern(OpCode::Stride, &[base, pos], stride),
        }
    }

    /// Adds a scalar operation, folding it when it is pure and every argument is constant.
    pub fn apply(&mut self, op: OpCode, args: &[SlotId]) -> SlotId {
        if op.is_pure() {
            let folded: Option<SmallVec<[f64; 3]>> =
                args.iter().map(|&a| self.constant_value(a)).collect();
            if let Some(vals) = folded {
                let get = |i: usize| vals.get(i).copied().unwrap_or(0.0);
                return self.constant(kernel::apply(op, get(0), get(1), get(2)));
            }
        }
        self.intern(op, args, 0)
    }

    fn intern(&mut self, op: OpCode, parents: &[SlotId], operand: u64) -> SlotId {
        let sig: Signature = (op, SmallVec::from_slice(parents), operand);
        if let Some(&id) = self.interned.get(&sig) {
            return id;
        }
        let id = SlotId::new(self.ops.len());

        let start = self.parents_flat.len() as u32;
        self.parents_flat.extend_from_slice(parents);
        self.parents_ranges.push((start, parents.len() as u32));

        self.ops.push(op);
        self.operand.push(operand);
        self.interned.insert(sig, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_subcomputations_share_a_slot() {
        let mut g = FlowGraph::new();
        let r = g.row();
        let a = g.load(0, r);
        let b = g.load(1, r);
        let s1 = g.apply(OpCode::Add, &[a, b]);
        let s2 = g.apply(OpCode::Add, &[a, b]);
        assert_eq!(s1, s2);
        assert_eq!(g.row(), r);
        assert_eq!(g.count(), 4);
        // Argument order matters for non-commutative ops and is preserved.
        let s3 = g.apply(OpCode::Add, &[b, a]);
        assert_ne!(s1, s3);
        assert_eq!(g.get_parents(s3), &[b, a]);
    }

    #[test]
    fn test_constants_fold() {
        let mut g = FlowGraph::new();
        let two = g.constant(2.0);
        let three = g.constant(3.0);
        let five = g.apply(OpCode::Add, &[two, three]);
        assert_eq!(g.constant_value(five), Some(5.0));
        let p = g.apply(OpCode::Pow, &[two, five]);
        assert_eq!(g.constant_value(p), Some(32.0));
        // NaN constants intern by bit pattern.
        let n1 = g.constant(f64::NAN);
        let n2 = g.constant(f64::NAN);
        assert_eq!(n1, n2);
    }

    #[test]
    fn test_impure_ops_never_fold() {
        let mut g = FlowGraph::new();
        let r = g.apply(OpCode::Row, &[]);
        assert_eq!(r, g.row());
        assert_eq!(g.constant_value(r), None);
        let zero = g.constant(0.0);
        let x = g.apply(OpCode::Load, &[zero]);
        assert_eq!(g.ops[x.index()], OpCode::Load);
        assert!(OpCode::Add.is_pure() && !OpCode::Label.is_pure());
    }

    #[test]
    fn test_stride_simplifies() {
        let mut g = FlowGraph::new();
        let r = g.row();
        let zero = g.constant(0.0);
        assert_eq!(g.stride(r, zero, 7), r);
        let one = g.constant(1.0);
        let four = g.constant(4.0);
        let s = g.stride(one, four, 3);
        assert_eq!(g.constant_value(s), Some(13.0));
        let x = g.load(0, r);
        let s = g.stride(x, r, 3);
        assert_eq!(g.ops[s.index()], OpCode::Stride);
    }
}
