//! dag.rs
//! The relationship graph: dataset nodes linked by label/positional edges.
//!
//! Every `(node, dimension)` pair has at most one incoming edge, the graph is acyclic
//! and the root never receives an edge. Together these guarantee that any dimension
//! reachable from the root resolves through exactly one path.

use super::edge::{LinkMode, Relationship};
use super::node::DatasetNode;
use crate::error::{FlowError, Result};
use crate::store::dataset::is_identifier;
use crate::store::{Dataset, ValueKind};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    graph: DiGraph<DatasetNode, Relationship>,
    names: HashMap<String, NodeIndex>,
    root: Option<NodeIndex>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str, dataset: impl Into<Arc<Dataset>>) -> Result<NodeIndex> {
        if !is_identifier(name) {
            return Err(FlowError::Graph(format!("'{}' is not a valid node name", name)));
        }
        if self.contains_node(name) {
            return Err(FlowError::Graph(format!("node '{}' already exists", name)));
        }
        let idx = self.graph.add_node(DatasetNode::new(name, dataset.into()));
        self.names.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Adds an edge from its textual form, e.g. `"tours.otaz @ skims.otaz"`.
    pub fn add_edge(&mut self, spec: &str) -> Result<EdgeIndex> {
        let rel = Relationship::parse(spec)?;
        self.add_relationship(rel)
    }

    pub fn add_relationship(&mut self, rel: Relationship) -> Result<EdgeIndex> {
        let src = self.node_index(&rel.source_node)?;
        let dst = self.node_index(&rel.target_node)?;

        let source_kind = {
            let ds = &self.graph[src].data;
            ds.variable(&rel.source_var)
                .ok_or_else(|| {
                    FlowError::Graph(format!(
                        "'{}': node '{}' has no variable '{}'",
                        rel, rel.source_node, rel.source_var
                    ))
                })?
                .values()
                .kind()
        };

        if self.graph[dst].data.dim(&rel.target_dim).is_none() {
            return Err(FlowError::Graph(format!(
                "'{}': node '{}' has no dimension '{}'",
                rel, rel.target_node, rel.target_dim
            )));
        }

        if rel.mode == LinkMode::Positional && source_kind == ValueKind::Str {
            return Err(FlowError::Graph(format!(
                "'{}': positional links need a numeric source variable",
                rel
            )));
        }

        if let Some((_, existing)) = self.incoming(&rel.target_node, &rel.target_dim) {
            return Err(FlowError::Graph(format!(
                "'{}' is ambiguous: {}.{} is already reached through '{}'",
                rel, rel.target_node, rel.target_dim, existing
            )));
        }

        if Some(dst) == self.root {
            return Err(FlowError::Graph(format!(
                "'{}': the root node '{}' cannot be the target of a relationship",
                rel, rel.target_node
            )));
        }

        if src == dst || has_path_connecting(&self.graph, dst, src, None) {
            return Err(FlowError::Graph(format!(
                "'{}' would create a cycle between '{}' and '{}'",
                rel, rel.source_node, rel.target_node
            )));
        }

        tracing::debug!(edge = %rel, "added relationship");
        Ok(self.graph.add_edge(src, dst, rel))
    }

    /// Designates the node whose leading dimension defines the batch.
    pub fn set_root(&mut self, name: &str) -> Result<()> {
        let idx = self.node_index(name)?;
        if self.graph[idx].data.dims().is_empty() {
            return Err(FlowError::Graph(format!("root node '{}' has no dimensions", name)));
        }
        if self.graph.edges_directed(idx, Direction::Incoming).next().is_some() {
            return Err(FlowError::Graph(format!(
                "node '{}' is the target of a relationship and cannot be the root",
                name
            )));
        }
        self.root = Some(idx);
        Ok(())
    }

    /// Returns a new graph with one node's data swapped; every other node and all
    /// edges are shared handles.
    pub fn replace_node(&self, name: &str, dataset: impl Into<Arc<Dataset>>) -> Result<Self> {
        let idx = self.node_index(name)?;
        let dataset = dataset.into();

        for edge in self.graph.edges(idx).chain(self.graph.edges_directed(idx, Direction::Incoming)) {
            let rel = edge.weight();
            if rel.source_node == name {
                match dataset.variable(&rel.source_var) {
                    Some(v) if rel.mode == LinkMode::Positional && v.values().kind() == ValueKind::Str => {
                        return Err(FlowError::Graph(format!(
                            "replacement for '{}' turns positional source '{}' into strings",
                            name, rel.source_var
                        )))
                    }
                    Some(_) => {}
                    None => {
                        return Err(FlowError::Graph(format!(
                            "replacement for '{}' drops variable '{}' used by '{}'",
                            name, rel.source_var, rel
                        )))
                    }
                }
            }
            if rel.target_node == name && dataset.dim(&rel.target_dim).is_none() {
                return Err(FlowError::Graph(format!(
                    "replacement for '{}' drops dimension '{}' used by '{}'",
                    name, rel.target_dim, rel
                )));
            }
        }
        if Some(idx) == self.root && dataset.dims().is_empty() {
            return Err(FlowError::Graph(format!("replacement for root '{}' has no dimensions", name)));
        }

        let mut next = self.clone();
        next.graph[idx].data = dataset;
        Ok(next)
    }

    // --- Accessors ---

    /// The root node. Defaults to the first node added.
    pub fn root(&self) -> Result<&DatasetNode> {
        Ok(&self.graph[self.root_index()?])
    }

    pub fn root_name(&self) -> Result<&str> {
        Ok(self.root()?.name.as_str())
    }

    pub(crate) fn root_index(&self) -> Result<NodeIndex> {
        match self.root {
            Some(r) => Ok(r),
            None if self.graph.node_count() > 0 => Ok(NodeIndex::new(0)),
            None => Err(FlowError::Graph("graph has no nodes".into())),
        }
    }

    /// The root, verified to have no incoming relationships. An implicit root (first
    /// node) can pick up edges before `set_root` is called, so this is re-checked here.
    pub(crate) fn checked_root(&self) -> Result<NodeIndex> {
        let root = self.root_index()?;
        if let Some(e) = self.graph.edges_directed(root, Direction::Incoming).next() {
            return Err(FlowError::Graph(format!(
                "root node '{}' is the target of '{}'; call set_root with the batch node",
                self.graph[root].name,
                e.weight()
            )));
        }
        if self.graph[root].data.dims().is_empty() {
            return Err(FlowError::Graph(format!("root node '{}' has no dimensions", self.graph[root].name)));
        }
        Ok(root)
    }

    pub fn node_index(&self, name: &str) -> Result<NodeIndex> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| FlowError::Graph(format!("unknown node '{}'", name)))
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&DatasetNode> {
        self.names.get(name).map(|&i| &self.graph[i])
    }

    pub fn dataset(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.node(name).map(|n| &n.data)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|n| n.name.as_str())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Relationship> {
        self.graph.edge_weights()
    }

    pub fn relationship(&self, edge: EdgeIndex) -> Option<&Relationship> {
        self.graph.edge_weight(edge)
    }

    /// The single edge feeding `(node, dim)`, if any.
    pub fn incoming(&self, node: &str, dim: &str) -> Option<(EdgeIndex, &Relationship)> {
        let idx = *self.names.get(node)?;
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .find(|e| e.weight().target_dim == dim)
            .map(|e| (e.id(), e.weight()))
    }

    /// True when the root reaches `node` through relationships (or `node` is the root).
    pub fn is_reachable(&self, node: &str) -> bool {
        match (self.root_index(), self.names.get(node)) {
            (Ok(root), Some(&idx)) => has_path_connecting(&self.graph, root, idx, None),
            _ => false,
        }
    }

    /// All edges needed to address `node` from the root, dependencies first.
    pub fn resolution_path(&self, node: &str) -> Result<Vec<EdgeIndex>> {
        let idx = self.node_index(node)?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_path(idx, &mut seen, &mut out);
        Ok(out)
    }

    fn collect_path(&self, node: NodeIndex, seen: &mut HashSet<EdgeIndex>, out: &mut Vec<EdgeIndex>) {
        let mut incoming: Vec<_> = self.graph.edges_directed(node, Direction::Incoming).collect();
        incoming.sort_by_key(|e| e.id());
        for e in incoming {
            if seen.insert(e.id()) {
                self.collect_path(e.source(), seen, out);
                out.push(e.id());
            }
        }
    }
}
