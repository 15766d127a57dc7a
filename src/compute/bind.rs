//! Attaching a compiled program to concrete data.

use crate::compute::bytecode::{Bindings, ColumnRef, PositionalRef};
use crate::error::{FlowError, Result};
use crate::graph::{LinkMode, Relationship, RelationshipGraph};
use crate::store::{Coords, Dataset, Dimension, Values};
use std::collections::HashMap;
use std::sync::Arc;

/// A label-mode index table and the storage it was derived from.
#[derive(Debug, Clone)]
struct LabelTable {
    source: Values,
    coords: Coords,
    positions: Arc<[u32]>,
}

/// Concrete data for one program: column buffers, validated positional sources and
/// materialized label index tables.
///
/// Everything is shared storage, so a bound source is cheap to clone and `Send + Sync`.
#[derive(Debug, Clone)]
pub struct BoundSource {
    bindings: Bindings,
    rows: usize,
    row_dim: Dimension,
    columns: Vec<Arc<[f64]>>,
    tables: Vec<LabelTable>,
}

impl BoundSource {
    /// Binds `graph` to the layout a program was compiled for.
    pub fn bind(graph: &RelationshipGraph, bindings: &Bindings) -> Result<Self> {
        Self::bind_with(graph, bindings, None)
    }

    /// Re-binds after data changed, reusing every column and label table whose
    /// underlying storage is pointer-identical to what this source already holds.
    pub fn rebind(&self, graph: &RelationshipGraph) -> Result<Self> {
        Self::bind_with(graph, &self.bindings, Some(self))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// The root's batch dimension, used to label output rows.
    pub fn row_dim(&self) -> &Dimension {
        &self.row_dim
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub(crate) fn column_slices(&self) -> Vec<&[f64]> {
        self.columns.iter().map(|c| &c[..]).collect()
    }

    pub(crate) fn table_slices(&self) -> Vec<&[u32]> {
        self.tables.iter().map(|t| &t.positions[..]).collect()
    }

    fn bind_with(
        graph: &RelationshipGraph,
        bindings: &Bindings,
        previous: Option<&BoundSource>,
    ) -> Result<Self> {
        graph.checked_root()?;
        let root = graph.root()?;
        if root.name != bindings.root {
            return Err(FlowError::Shape(format!(
                "kernel iterates root '{}' but the graph's root is '{}'",
                bindings.root, root.name
            )));
        }
        let row_dim = root
            .data
            .dims()
            .first()
            .cloned()
            .ok_or_else(|| FlowError::Shape(format!("root '{}' has no dimensions", root.name)))?;

        for s in &bindings.shapes {
            let ds = dataset(graph, &s.node)?;
            let dim = ds.dim(&s.dim).ok_or_else(|| missing_dim(&s.node, &s.dim))?;
            if dim.len() != s.len {
                return Err(FlowError::Shape(format!(
                    "dimension '{}.{}' has length {} but the kernel was compiled for {}",
                    s.node,
                    s.dim,
                    dim.len(),
                    s.len
                )));
            }
        }

        let mut reused_columns = 0usize;
        let mut columns = Vec::with_capacity(bindings.columns.len());
        for (i, c) in bindings.columns.iter().enumerate() {
            let data = column(graph, c)?;
            if previous.is_some_and(|p| Arc::ptr_eq(&p.columns[i], &data)) {
                reused_columns += 1;
            }
            columns.push(data);
        }

        for p in &bindings.positional {
            let idx = p.column as usize;
            let unchanged =
                previous.is_some_and(|prev| Arc::ptr_eq(&prev.columns[idx], &columns[idx]));
            if !unchanged {
                check_positions(graph, p, &columns[idx])?;
            }
        }

        let mut reused_tables = 0usize;
        let mut tables = Vec::with_capacity(bindings.labels.len());
        for (i, t) in bindings.labels.iter().enumerate() {
            let rel = &t.edge;
            check_edge(graph, rel)?;
            let source = dataset(graph, &rel.source_node)?;
            check_dims(source, &rel.source_node, &rel.source_var, &t.dims)?;
            let source = source
                .variable(&rel.source_var)
                .map(|v| v.values().clone())
                .ok_or_else(|| missing_variable(&rel.source_node, &rel.source_var))?;
            let coords = dataset(graph, &rel.target_node)?
                .dim(&rel.target_dim)
                .map(|d| d.coords.clone())
                .ok_or_else(|| missing_dim(&rel.target_node, &rel.target_dim))?;

            let cached = previous
                .map(|p| &p.tables[i])
                .filter(|t| t.source.same_storage(&source) && t.coords.same_storage(&coords));
            let table = match cached {
                Some(t) => {
                    reused_tables += 1;
                    t.clone()
                }
                None => {
                    let positions = materialize(rel, &source, &coords)?;
                    LabelTable { source, coords, positions }
                }
            };
            tables.push(table);
        }

        for p in &bindings.positional {
            check_edge(graph, &p.edge)?;
        }

        tracing::debug!(
            root = %bindings.root,
            rows = row_dim.len(),
            columns = columns.len(),
            reused_columns,
            tables = tables.len(),
            reused_tables,
            "bound kernel data"
        );

        Ok(Self { bindings: bindings.clone(), rows: row_dim.len(), row_dim, columns, tables })
    }
}

fn dataset<'a>(graph: &'a RelationshipGraph, node: &str) -> Result<&'a Arc<Dataset>> {
    graph
        .dataset(node)
        .ok_or_else(|| FlowError::Shape(format!("node '{}' is missing from the bound graph", node)))
}

fn missing_variable(node: &str, var: &str) -> FlowError {
    FlowError::Shape(format!("variable '{}.{}' is missing", node, var))
}

fn missing_dim(node: &str, dim: &str) -> FlowError {
    FlowError::Shape(format!("dimension '{}.{}' is missing", node, dim))
}

/// The variable must still be laid out over exactly the dimensions the strides were
/// computed for.
fn check_dims(ds: &Dataset, node: &str, var: &str, expected: &[String]) -> Result<()> {
    let dims = ds.variable_dims(var).ok_or_else(|| missing_variable(node, var))?;
    if dims.len() != expected.len() || dims.iter().zip(expected).any(|(a, b)| a != b) {
        return Err(FlowError::Shape(format!(
            "variable '{}.{}' has dimensions ({}) but the kernel expects ({})",
            node,
            var,
            dims.join(", "),
            expected.join(", ")
        )));
    }
    Ok(())
}

fn column(graph: &RelationshipGraph, c: &ColumnRef) -> Result<Arc<[f64]>> {
    let ds = dataset(graph, &c.node)?;
    check_dims(ds, &c.node, &c.var, &c.dims)?;
    ds.variable(&c.var)
        .and_then(|v| v.values().as_f64().cloned())
        .ok_or_else(|| FlowError::Shape(format!("variable '{}.{}' is not numeric", c.node, c.var)))
}

/// The graph must still route `(target_node, target_dim)` through the same relationship.
fn check_edge(graph: &RelationshipGraph, rel: &Relationship) -> Result<()> {
    match graph.incoming(&rel.target_node, &rel.target_dim) {
        Some((_, found)) if found == rel => Ok(()),
        Some((_, found)) => Err(FlowError::Shape(format!(
            "kernel was compiled for relationship '{}' but the graph has '{}'",
            rel, found
        ))),
        None => Err(FlowError::Shape(format!("relationship '{}' is missing from the bound graph", rel))),
    }
}

fn check_positions(graph: &RelationshipGraph, p: &PositionalRef, values: &[f64]) -> Result<()> {
    let rel = &p.edge;
    let len = dataset(graph, &rel.target_node)?
        .dim(&rel.target_dim)
        .map(Dimension::len)
        .ok_or_else(|| missing_dim(&rel.target_node, &rel.target_dim))?;
    let bad = values
        .iter()
        .position(|&v| !(v >= 0.0 && v.fract() == 0.0 && (v as usize) < len));
    match bad {
        None => Ok(()),
        Some(i) => Err(FlowError::Domain(format!(
            "positional relationship '{}': element {} has value {}, not a position in 0..{}",
            rel, i, values[i], len
        ))),
    }
}

fn materialize(rel: &Relationship, source: &Values, coords: &Coords) -> Result<Arc<[u32]>> {
    debug_assert_eq!(rel.mode, LinkMode::Label);
    let unknown = |i: usize, label: String| {
        FlowError::Domain(format!("relationship '{}': element {} has unknown label {}", rel, i, label))
    };
    let duplicate = |label: String| {
        FlowError::Domain(format!(
            "relationship '{}': coordinate label {} appears more than once in '{}.{}'",
            rel, label, rel.target_node, rel.target_dim
        ))
    };

    let positions: Vec<u32> = match (source, coords) {
        (Values::F64(vals), Coords::Range(n)) => vals
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if v >= 0.0 && v.fract() == 0.0 && (v as usize) < *n {
                    Ok(v as u32)
                } else {
                    Err(unknown(i, v.to_string()))
                }
            })
            .collect::<Result<_>>()?,
        (Values::F64(vals), Coords::Int(labels)) => {
            let mut index = HashMap::with_capacity(labels.len());
            for (pos, &l) in labels.iter().enumerate() {
                if index.insert(l, pos as u32).is_some() {
                    return Err(duplicate(l.to_string()));
                }
            }
            vals.iter()
                .enumerate()
                .map(|(i, &v)| {
                    let key = v as i64;
                    match index.get(&key) {
                        Some(&pos) if key as f64 == v => Ok(pos),
                        _ => Err(unknown(i, v.to_string())),
                    }
                })
                .collect::<Result<_>>()?
        }
        (Values::Str(vals), Coords::Str(labels)) => {
            let mut index: HashMap<&str, u32> = HashMap::with_capacity(labels.len());
            for (pos, l) in labels.iter().enumerate() {
                if index.insert(l.as_str(), pos as u32).is_some() {
                    return Err(duplicate(format!("{:?}", l)));
                }
            }
            vals.iter()
                .enumerate()
                .map(|(i, v)| {
                    index.get(v.as_str()).copied().ok_or_else(|| unknown(i, format!("{:?}", v)))
                })
                .collect::<Result<_>>()?
        }
        _ => {
            return Err(FlowError::Shape(format!(
                "relationship '{}' looks up {:?} values against {:?} coordinates",
                rel,
                source.kind(),
                coords.kind()
            )))
        }
    };
    Ok(positions.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze;
    use crate::expr::ExpressionSet;

    fn zones() -> Dataset {
        Dataset::new()
            .with_dim("zone", vec![101i64, 102, 103])
            .unwrap()
            .with_variable("area", &["zone"], vec![1.0, 2.0, 3.0])
            .unwrap()
    }

    fn people(home: Vec<f64>) -> Dataset {
        Dataset::from_table("person", Coords::Range(home.len()), [("home", home)]).unwrap()
    }

    fn graph(home: Vec<f64>, op: &str) -> RelationshipGraph {
        let mut g = RelationshipGraph::new();
        g.add_node("people", people(home)).unwrap();
        g.add_node("zones", zones()).unwrap();
        g.add_edge(&format!("people.home {} zones.zone", op)).unwrap();
        g
    }

    fn bindings(g: &RelationshipGraph) -> Bindings {
        analyze(g, &ExpressionSet::from_exprs(["zones.area"])).unwrap().bindings
    }

    #[test]
    fn test_label_tables_materialize() {
        let g = graph(vec![103.0, 101.0], "@");
        let src = BoundSource::bind(&g, &bindings(&g)).unwrap();
        assert_eq!(src.rows(), 2);
        assert_eq!(src.table_slices(), vec![&[2u32, 0][..]]);
    }

    #[test]
    fn test_unknown_label_is_domain_error() {
        let g = graph(vec![103.0, 999.0], "@");
        let err = BoundSource::bind(&g, &bindings(&g)).unwrap_err();
        assert!(matches!(err, FlowError::Domain(ref m) if m.contains("999")), "{:?}", err);
    }

    #[test]
    fn test_duplicate_coordinates_are_domain_error() {
        let mut g = RelationshipGraph::new();
        g.add_node("people", people(vec![1.0])).unwrap();
        g.add_node(
            "zones",
            Dataset::new()
                .with_dim("zone", vec![1i64, 1])
                .unwrap()
                .with_variable("area", &["zone"], vec![1.0, 2.0])
                .unwrap(),
        )
        .unwrap();
        g.add_edge("people.home @ zones.zone").unwrap();
        let err = BoundSource::bind(&g, &bindings(&g)).unwrap_err();
        assert!(matches!(err, FlowError::Domain(ref m) if m.contains("more than once")), "{:?}", err);
    }

    #[test]
    fn test_positional_out_of_range_is_domain_error() {
        let ok = graph(vec![0.0, 2.0], "->");
        let b = bindings(&ok);
        assert!(BoundSource::bind(&ok, &b).is_ok());

        for bad in [vec![0.0, 3.0], vec![-1.0, 0.0], vec![0.5, 0.0], vec![f64::NAN, 0.0]] {
            let g = graph(bad, "->");
            let err = BoundSource::bind(&g, &b).unwrap_err();
            assert!(matches!(err, FlowError::Domain(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_shape_change_is_rejected() {
        let g = graph(vec![101.0], "@");
        let b = bindings(&g);
        let bigger = Dataset::new()
            .with_dim("zone", vec![101i64, 102, 103, 104])
            .unwrap()
            .with_variable("area", &["zone"], vec![1.0; 4])
            .unwrap();
        let g2 = g.replace_node("zones", bigger).unwrap();
        let err = BoundSource::bind(&g2, &b).unwrap_err();
        assert!(matches!(err, FlowError::Shape(_)), "{:?}", err);
    }

    #[test]
    fn test_label_source_layout_change_is_rejected() {
        let g = graph(vec![103.0, 101.0], "@");
        let b = bindings(&g);
        assert_eq!(b.labels[0].dims, vec!["person".to_string()]);

        // Same root length, but `home` now lives on a side dimension of length 1.
        let moved = Dataset::new()
            .with_dim("person", Coords::Range(2))
            .unwrap()
            .with_dim("one", vec![0i64])
            .unwrap()
            .with_variable("home", &["one"], vec![103.0])
            .unwrap();
        let g2 = g.replace_node("people", moved).unwrap();
        let err = BoundSource::bind(&g2, &b).unwrap_err();
        assert!(matches!(err, FlowError::Shape(ref m) if m.contains("people.home")), "{:?}", err);
        assert!(BoundSource::bind(&g, &b).unwrap().rebind(&g2).is_err());
    }

    #[test]
    fn test_rebind_reuses_unchanged_storage() {
        let g = graph(vec![103.0, 101.0], "@");
        let src = BoundSource::bind(&g, &bindings(&g)).unwrap();

        // Swap only the zone attribute: the label table survives by pointer.
        let zones2 = Dataset::clone(g.dataset("zones").unwrap())
            .with_variable("area", &["zone"], vec![5.0, 6.0, 7.0])
            .unwrap();
        let g2 = g.replace_node("zones", zones2).unwrap();
        let again = src.rebind(&g2).unwrap();
        assert!(Arc::ptr_eq(&src.tables[0].positions, &again.tables[0].positions));
        assert_eq!(again.column_slices()[0], &[5.0, 6.0, 7.0][..]);

        // Swapping the source column forces a new table.
        let g3 = g2.replace_node("people", people(vec![102.0, 102.0])).unwrap();
        let third = again.rebind(&g3).unwrap();
        assert!(!Arc::ptr_eq(&again.tables[0].positions, &third.tables[0].positions));
        assert_eq!(third.table_slices(), vec![&[1u32, 1][..]]);
    }
}
