//! Name resolution, type/shape annotation and lowering into the shared flow graph.

use crate::analysis::flow::{FlowGraph, SlotId};
use crate::compute::bytecode::{Bindings, ColumnRef, LabelRef, OpCode, PositionalRef, ShapeRef};
use crate::display::truncate;
use crate::error::{FlowError, Result};
use crate::expr::lexer::normalize;
use crate::expr::{parse, BinaryOp, Expr, ExpressionSet, Func, UnaryOp};
use crate::graph::{LinkMode, Relationship, RelationshipGraph};
use crate::store::{Dataset, LabelKind, ValueKind};
use petgraph::graph::EdgeIndex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Number,
    Boolean,
    /// String-valued variable; only usable as a relationship source.
    Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extent {
    /// Same value for every root row.
    Scalar,
    /// Varies per root row.
    Row,
}

impl Extent {
    fn join(self, other: Extent) -> Extent {
        if self == Extent::Row || other == Extent::Row {
            Extent::Row
        } else {
            Extent::Scalar
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Typed {
    pub ty: ValueType,
    pub extent: Extent,
}

/// A variable reference together with the relationships that address it from the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedRef {
    pub node: String,
    pub var: String,
    pub dims: Vec<String>,
    pub path: Vec<String>,
}

/// Output of analysis: everything code generation and key derivation need.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub root: String,
    pub names: Vec<String>,
    /// Token streams joined by single spaces.
    pub normalized: Vec<String>,
    pub types: Vec<Typed>,
    pub references: Vec<ResolvedRef>,
    pub constants: Vec<(String, u64)>,
    pub flow: FlowGraph,
    pub outputs: Vec<SlotId>,
    pub bindings: Bindings,
}

enum Resolved<'a> {
    Constant(f64),
    Variable { node: &'a str, var: &'a str },
}

#[derive(Clone, Copy)]
struct Site<'a> {
    index: usize,
    expr: &'a str,
}

impl Site<'_> {
    fn resolution(&self, name: impl Into<String>) -> FlowError {
        FlowError::Resolution { index: self.index, name: name.into(), expr: truncate(self.expr, 80) }
    }

    fn type_error(&self, msg: impl Into<String>) -> FlowError {
        FlowError::Type { index: self.index, expr: truncate(self.expr, 80), msg: msg.into() }
    }
}

/// Parses, resolves, checks and lowers every expression of `set` against `graph`.
///
/// Graph, parse, resolution and type errors all surface here, before any kernel
/// source is generated.
pub fn analyze(graph: &RelationshipGraph, set: &ExpressionSet) -> Result<Analysis> {
    graph.checked_root()?;
    let root = graph.root()?.name.clone();
    if set.is_empty() {
        return Err(FlowError::compile(None, "", "expression set is empty"));
    }

    let mut parsed = Vec::with_capacity(set.len());
    let mut normalized = Vec::with_capacity(set.len());
    for (i, text) in set.exprs().enumerate() {
        let (ast, tokens) = parse(text).map_err(|e| FlowError::compile(Some(i), text, e.to_string()))?;
        normalized.push(normalize(text, &tokens));
        parsed.push(ast);
    }

    let mut analyzer = Analyzer::new(graph, &root, set.constants())?;

    let mut types = Vec::with_capacity(parsed.len());
    for (i, (ast, text)) in parsed.iter().zip(set.exprs()).enumerate() {
        let site = Site { index: i, expr: text };
        let typed = analyzer.annotate(ast, site)?;
        if typed.ty == ValueType::Label {
            return Err(site.type_error(format!(
                "string-valued variable '{}' cannot be an expression result",
                label_name(ast)
            )));
        }
        types.push(typed);
    }

    let mut outputs = Vec::with_capacity(parsed.len());
    for (i, (ast, text)) in parsed.iter().zip(set.exprs()).enumerate() {
        let site = Site { index: i, expr: text };
        let slot = analyzer.lower(ast, site)?;
        tracing::debug!(index = i, expr = %truncate(text, 80), slot = slot.index(), "lowered expression");
        outputs.push(slot);
    }

    let Analyzer { flow, columns, labels, positional, shapes, references, .. } = analyzer;
    Ok(Analysis {
        root: root.clone(),
        names: set.names().map(String::from).collect(),
        normalized,
        types,
        references,
        constants: set.constants().iter().map(|(k, v)| (k.clone(), v.to_bits())).collect(),
        flow,
        outputs,
        bindings: Bindings { root, columns, labels, positional, shapes: shapes.into_iter().collect() },
    })
}

struct Analyzer<'g> {
    graph: &'g RelationshipGraph,
    root: &'g str,
    root_data: Arc<Dataset>,
    constants: &'g BTreeMap<String, f64>,
    flow: FlowGraph,

    columns: Vec<ColumnRef>,
    column_ids: HashMap<(String, String), u32>,
    labels: Vec<LabelRef>,
    label_ids: HashMap<EdgeIndex, u32>,
    positional: Vec<PositionalRef>,
    positional_seen: HashSet<EdgeIndex>,
    shapes: BTreeSet<ShapeRef>,
    references: Vec<ResolvedRef>,
    reference_seen: HashSet<(String, String)>,
}

impl<'g> Analyzer<'g> {
    fn new(
        graph: &'g RelationshipGraph,
        root: &'g str,
        constants: &'g BTreeMap<String, f64>,
    ) -> Result<Self> {
        let root_data = graph
            .dataset(root)
            .cloned()
            .ok_or_else(|| FlowError::Graph(format!("unknown root node '{}'", root)))?;
        Ok(Self {
            graph,
            root,
            root_data,
            constants,
            flow: FlowGraph::new(),
            columns: Vec::new(),
            column_ids: HashMap::new(),
            labels: Vec::new(),
            label_ids: HashMap::new(),
            positional: Vec::new(),
            positional_seen: HashSet::new(),
            shapes: BTreeSet::new(),
            references: Vec::new(),
            reference_seen: HashSet::new(),
        })
    }

    // --- Resolution ---

    fn resolve<'e>(&self, node: Option<&'e str>, name: &'e str, site: Site) -> Result<Resolved<'e>>
    where
        'g: 'e,
    {
        let node = match node {
            None => {
                if let Some(&v) = self.constants.get(name) {
                    return Ok(Resolved::Constant(v));
                }
                if self.root_data.variable(name).is_some() {
                    return Ok(Resolved::Variable { node: self.root, var: name });
                }
                return Err(site.resolution(name));
            }
            Some(n) => n,
        };
        let qualified = || format!("{}.{}", node, name);
        let ds = self.graph.dataset(node).ok_or_else(|| site.resolution(qualified()))?;
        let var = ds.variable(name).ok_or_else(|| site.resolution(qualified()))?;
        if !var.dim_indices().is_empty() && !self.graph.is_reachable(node) {
            return Err(site.resolution(format!(
                "{} (no relationship path from root '{}')",
                qualified(),
                self.root
            )));
        }
        Ok(Resolved::Variable { node, var: name })
    }

    // --- Type / shape pass ---

    fn annotate(&mut self, expr: &Expr, site: Site) -> Result<Typed> {
        Ok(match expr {
            Expr::Number(_) => Typed { ty: ValueType::Number, extent: Extent::Scalar },
            Expr::Bool(_) => Typed { ty: ValueType::Boolean, extent: Extent::Scalar },
            Expr::Name { node, name, .. } => match self.resolve(node.as_deref(), name, site)? {
                Resolved::Constant(_) => Typed { ty: ValueType::Number, extent: Extent::Scalar },
                Resolved::Variable { node, var } => {
                    let (kind, dims) = self.variable_info(node, var)?;
                    self.record_reference(node, var, &dims)?;
                    let ty = match kind {
                        ValueKind::F64 => ValueType::Number,
                        ValueKind::Str => ValueType::Label,
                    };
                    let extent = if dims.is_empty() { Extent::Scalar } else { Extent::Row };
                    Typed { ty, extent }
                }
            },
            Expr::Unary(op, a) => {
                let t = self.operand(a, site)?;
                let ty = match op {
                    UnaryOp::Neg => ValueType::Number,
                    UnaryOp::Not => ValueType::Boolean,
                };
                Typed { ty, extent: t.extent }
            }
            Expr::Binary(op, a, b) => {
                let ta = self.operand(a, site)?;
                let tb = self.operand(b, site)?;
                let ty = if op.is_comparison() || op.is_logical() {
                    ValueType::Boolean
                } else {
                    ValueType::Number
                };
                Typed { ty, extent: ta.extent.join(tb.extent) }
            }
            Expr::Call { args, .. } => {
                let mut extent = Extent::Scalar;
                for a in args {
                    extent = extent.join(self.operand(a, site)?.extent);
                }
                Typed { ty: ValueType::Number, extent }
            }
        })
    }

    /// Annotates a sub-expression that must produce a number or boolean.
    fn operand(&mut self, expr: &Expr, site: Site) -> Result<Typed> {
        let t = self.annotate(expr, site)?;
        if t.ty == ValueType::Label {
            return Err(site.type_error(format!(
                "string-valued variable '{}' can only be used as a relationship source",
                label_name(expr)
            )));
        }
        Ok(t)
    }

    fn variable_info(&self, node: &str, var: &str) -> Result<(ValueKind, Vec<String>)> {
        let ds = self.dataset(node)?;
        let v = ds
            .variable(var)
            .ok_or_else(|| vanished(node, var))?;
        let dims = v.dim_indices().iter().map(|&d| ds.dims()[d].name.clone()).collect();
        Ok((v.values().kind(), dims))
    }

    fn record_reference(&mut self, node: &str, var: &str, dims: &[String]) -> Result<()> {
        if !self.reference_seen.insert((node.to_string(), var.to_string())) {
            return Ok(());
        }
        let path = self
            .graph
            .resolution_path(node)?
            .into_iter()
            .filter_map(|e| self.graph.relationship(e).map(|r| r.to_string()))
            .collect();
        self.references.push(ResolvedRef { node: node.into(), var: var.into(), dims: dims.to_vec(), path });
        Ok(())
    }

    // --- Lowering ---

    fn lower(&mut self, expr: &Expr, site: Site) -> Result<SlotId> {
        Ok(match expr {
            Expr::Number(v) => self.flow.constant(*v),
            Expr::Bool(b) => self.flow.constant(if *b { 1.0 } else { 0.0 }),
            Expr::Name { node, name, .. } => match self.resolve(node.as_deref(), name, site)? {
                Resolved::Constant(v) => self.flow.constant(v),
                Resolved::Variable { node, var } => self.load_variable(node, var, site)?,
            },
            Expr::Unary(op, a) => {
                let a = self.lower(a, site)?;
                let code = match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                };
                self.flow.apply(code, &[a])
            }
            Expr::Binary(op, a, b) => {
                let a = self.lower(a, site)?;
                let b = self.lower(b, site)?;
                self.flow.apply(binary_opcode(*op), &[a, b])
            }
            Expr::Call { func, args, .. } => {
                let mut slots: SmallVec<[SlotId; 3]> = SmallVec::new();
                for a in args {
                    slots.push(self.lower(a, site)?);
                }
                self.flow.apply(func_opcode(*func), &slots)
            }
        })
    }

    fn load_variable(&mut self, node: &str, var: &str, site: Site) -> Result<SlotId> {
        let ds = self.dataset(node)?;
        let dims: SmallVec<[usize; 4]> = ds
            .variable(var)
            .map(|v| SmallVec::from_slice(v.dim_indices()))
            .ok_or_else(|| vanished(node, var))?;
        let column = self.column(node, var, &ds, &dims);
        let offset = self.offset(node, &ds, &dims, site)?;
        Ok(self.flow.load(column, offset))
    }

    /// Flat row-major offset of one element of a variable with `dims`, for the current root row.
    fn offset(&mut self, node: &str, ds: &Arc<Dataset>, dims: &[usize], site: Site) -> Result<SlotId> {
        let mut acc: Option<SlotId> = None;
        let mut stride: u64 = 1;
        for &d in dims.iter().rev() {
            let pos = self.position(node, ds, d, site)?;
            acc = Some(match acc {
                None => pos,
                Some(inner) => self.flow.stride(inner, pos, stride),
            });
            stride *= ds.dims()[d].len() as u64;
        }
        Ok(match acc {
            Some(slot) => slot,
            None => self.flow.constant(0.0),
        })
    }

    /// Position along dimension `d` of `node` selected by the current root row.
    fn position(&mut self, node: &str, ds: &Arc<Dataset>, d: usize, site: Site) -> Result<SlotId> {
        if node == self.root && d == 0 {
            return Ok(self.flow.row());
        }
        let dim = &ds.dims()[d];
        self.shapes.insert(ShapeRef { node: node.into(), dim: dim.name.clone(), len: dim.len() });

        let (edge, rel) = self.graph.incoming(node, &dim.name).ok_or_else(|| {
            site.type_error(format!(
                "dimension '{}.{}' is not fed by any relationship and cannot broadcast against root '{}'",
                node, dim.name, self.root
            ))
        })?;
        let rel = rel.clone();

        let src = self.dataset(&rel.source_node)?;
        let src_var = src
            .variable(&rel.source_var)
            .ok_or_else(|| FlowError::Graph(format!("relationship '{}' names a missing variable", rel)))?;
        let src_dims: SmallVec<[usize; 4]> = SmallVec::from_slice(src_var.dim_indices());
        let src_kind = src_var.values().kind();
        let src_offset = self.offset(&rel.source_node, &src, &src_dims, site)?;

        match rel.mode {
            LinkMode::Label => {
                let compatible = matches!(
                    (src_kind, dim.coords.kind()),
                    (ValueKind::Str, LabelKind::Str) | (ValueKind::F64, LabelKind::Int)
                );
                if !compatible {
                    return Err(site.type_error(format!(
                        "relationship '{}' looks up {} values against {} coordinates",
                        rel,
                        kind_name(src_kind),
                        label_kind_name(dim.coords.kind())
                    )));
                }
                let table = self.label_table(edge, &rel, &src, &src_dims);
                Ok(self.flow.label(table, src_offset))
            }
            LinkMode::Positional => {
                let column = self.column(&rel.source_node, &rel.source_var, &src, &src_dims);
                if self.positional_seen.insert(edge) {
                    self.positional.push(PositionalRef { column, edge: rel });
                }
                Ok(self.flow.load(column, src_offset))
            }
        }
    }

    fn column(&mut self, node: &str, var: &str, ds: &Dataset, dims: &[usize]) -> u32 {
        let key = (node.to_string(), var.to_string());
        if let Some(&id) = self.column_ids.get(&key) {
            return id;
        }
        let id = self.columns.len() as u32;
        self.columns.push(ColumnRef {
            node: node.into(),
            var: var.into(),
            dims: dims.iter().map(|&d| ds.dims()[d].name.clone()).collect(),
        });
        self.column_ids.insert(key, id);
        id
    }

    fn label_table(
        &mut self,
        edge: EdgeIndex,
        rel: &Relationship,
        src: &Dataset,
        src_dims: &[usize],
    ) -> u32 {
        if let Some(&id) = self.label_ids.get(&edge) {
            return id;
        }
        let id = self.labels.len() as u32;
        self.labels.push(LabelRef {
            edge: rel.clone(),
            dims: src_dims.iter().map(|&d| src.dims()[d].name.clone()).collect(),
        });
        self.label_ids.insert(edge, id);
        id
    }

    fn dataset(&self, node: &str) -> Result<Arc<Dataset>> {
        self.graph
            .dataset(node)
            .cloned()
            .ok_or_else(|| FlowError::Graph(format!("unknown node '{}'", node)))
    }
}

fn vanished(node: &str, var: &str) -> FlowError {
    FlowError::Internal(format!("variable '{}.{}' vanished during analysis", node, var))
}

fn label_name(expr: &Expr) -> String {
    match expr {
        Expr::Name { node: Some(n), name, .. } => format!("{}.{}", n, name),
        Expr::Name { node: None, name, .. } => name.clone(),
        _ => "?".into(),
    }
}

fn kind_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::F64 => "numeric",
        ValueKind::Str => "string",
    }
}

fn label_kind_name(kind: LabelKind) -> &'static str {
    match kind {
        LabelKind::Int => "integer",
        LabelKind::Str => "string",
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Mod => OpCode::Mod,
        BinaryOp::Pow => OpCode::Pow,
        BinaryOp::Eq => OpCode::Eq,
        BinaryOp::Ne => OpCode::Ne,
        BinaryOp::Lt => OpCode::Lt,
        BinaryOp::Le => OpCode::Le,
        BinaryOp::Gt => OpCode::Gt,
        BinaryOp::Ge => OpCode::Ge,
        BinaryOp::And => OpCode::And,
        BinaryOp::Or => OpCode::Or,
    }
}

fn func_opcode(func: Func) -> OpCode {
    match func {
        Func::Abs => OpCode::Abs,
        Func::Exp => OpCode::Exp,
        Func::Log => OpCode::Log,
        Func::Sqrt => OpCode::Sqrt,
        Func::Min => OpCode::Min,
        Func::Max => OpCode::Max,
        Func::Pow => OpCode::Pow,
        Func::Clip => OpCode::Clip,
        Func::Where => OpCode::Where,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Coords;
    use rstest::rstest;

    fn tours() -> Dataset {
        Dataset::from_table(
            "tour",
            Coords::Range(4),
            [
                ("orig", vec![1.0, 2.0, 3.0, 1.0]),
                ("dest", vec![2.0, 2.0, 1.0, 3.0]),
                ("income", vec![10.0, 20.0, 30.0, 40.0]),
            ],
        )
        .unwrap()
        .with_variable("mode", &["tour"], vec!["car", "walk", "car", "bike"])
        .unwrap()
    }

    fn skims() -> Dataset {
        Dataset::new()
            .with_dim("otaz", vec![1i64, 2, 3])
            .unwrap()
            .with_dim("dtaz", vec![1i64, 2, 3])
            .unwrap()
            .with_variable("DIST", &["otaz", "dtaz"], (0..9).map(f64::from).collect::<Vec<_>>())
            .unwrap()
            .with_variable("TIME", &["otaz", "dtaz"], vec![1.0; 9])
            .unwrap()
            .with_variable("k", &[], vec![7.0])
            .unwrap()
    }

    fn graph() -> RelationshipGraph {
        let mut g = RelationshipGraph::new();
        g.add_node("tours", tours()).unwrap();
        g.add_node("skims", skims()).unwrap();
        g.add_edge("tours.orig @ skims.otaz").unwrap();
        g.add_edge("tours.dest @ skims.dtaz").unwrap();
        g
    }

    #[test]
    fn test_shared_references_load_once() {
        let g = graph();
        let set = ExpressionSet::new().with("a", "skims.DIST * 2").with("b", "skims.DIST + skims.TIME");
        let a = analyze(&g, &set).unwrap();

        let dist_loads = a
            .flow
            .ops
            .iter()
            .zip(&a.flow.operand)
            .filter(|(op, &c)| **op == OpCode::Load && a.bindings.columns[c as usize].var == "DIST")
            .count();
        assert_eq!(dist_loads, 1);
        // Both expressions address skims through the same two label tables.
        assert_eq!(a.bindings.labels.len(), 2);
        assert_eq!(a.references.len(), 2);
        assert_eq!(a.references[0].path, vec!["tours.orig @ skims.otaz", "tours.dest @ skims.dtaz"]);
        assert_eq!(a.bindings.shapes.len(), 2);
        assert_eq!(a.normalized, vec!["skims . DIST * 2", "skims . DIST + skims . TIME"]);
    }

    #[test]
    fn test_constants_shadow_root_variables() {
        let g = graph();
        let set = ExpressionSet::new().with("x", "income + 1").constant("income", 5.0);
        let a = analyze(&g, &set).unwrap();
        assert_eq!(a.flow.constant_value(a.outputs[0]), Some(6.0));
        assert_eq!(a.types[0].extent, Extent::Scalar);
        assert!(a.bindings.columns.is_empty());
    }

    #[test]
    fn test_zero_dim_variable_broadcasts() {
        let g = graph();
        let a = analyze(&g, &ExpressionSet::from_exprs(["skims.k + income"])).unwrap();
        assert_eq!(a.types[0], Typed { ty: ValueType::Number, extent: Extent::Row });
    }

    #[rstest]
    #[case("nope + 1", "nope")]
    #[case("skims.NOPE", "skims.NOPE")]
    #[case("ghost.x", "ghost.x")]
    fn test_resolution_errors_name_identifier(#[case] expr: &str, #[case] name: &str) {
        let g = graph();
        let err = analyze(&g, &ExpressionSet::from_exprs(["income", expr])).unwrap_err();
        match err {
            FlowError::Resolution { index, name: n, .. } => {
                assert_eq!(index, 1);
                assert_eq!(n, name);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unreachable_node_is_resolution_error() {
        let mut g = graph();
        g.add_node("other", Dataset::from_table("i", Coords::Range(2), [("v", vec![1.0, 2.0])]).unwrap())
            .unwrap();
        let err = analyze(&g, &ExpressionSet::from_exprs(["other.v"])).unwrap_err();
        assert!(matches!(err, FlowError::Resolution { .. }), "{:?}", err);
    }

    #[test]
    fn test_unfed_dimension_is_type_error() {
        let mut g = RelationshipGraph::new();
        g.add_node("tours", tours()).unwrap();
        g.add_node("skims", skims()).unwrap();
        g.add_edge("tours.orig @ skims.otaz").unwrap();
        let err = analyze(&g, &ExpressionSet::from_exprs(["skims.DIST"])).unwrap_err();
        match err {
            FlowError::Type { msg, .. } => assert!(msg.contains("skims.dtaz"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_variable_in_arithmetic_is_type_error() {
        let g = graph();
        let err = analyze(&g, &ExpressionSet::from_exprs(["mode + 1"])).unwrap_err();
        assert!(matches!(err, FlowError::Type { ref msg, .. } if msg.contains("'mode'")), "{:?}", err);
        let err = analyze(&g, &ExpressionSet::from_exprs(["tours.mode"])).unwrap_err();
        assert!(matches!(err, FlowError::Type { .. }));
    }

    #[test]
    fn test_parse_and_empty_set_are_compile_errors() {
        let g = graph();
        let err = analyze(&g, &ExpressionSet::from_exprs(["income", "income +"])).unwrap_err();
        assert!(matches!(err, FlowError::Compile { index: Some(1), .. }), "{:?}", err);
        let err = analyze(&g, &ExpressionSet::new()).unwrap_err();
        assert!(matches!(err, FlowError::Compile { index: None, .. }));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let g = graph();
        let set = ExpressionSet::from_exprs(["skims.TIME / income", "where(income > 15, skims.DIST, 0)"]);
        let a = analyze(&g, &set).unwrap();
        let b = analyze(&g, &set).unwrap();
        assert_eq!(a.references, b.references);
        assert_eq!(a.bindings, b.bindings);
        assert_eq!(a.flow.ops, b.flow.ops);
        assert_eq!(a.outputs, b.outputs);
    }
}
