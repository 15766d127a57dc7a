use crate::compiler::FlowCompiler;
use crate::compute::{BoundKernel, Kernel, Mode};
use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::expr::ExpressionSet;
use crate::graph::RelationshipGraph;
use crate::store::{Array2, Coords, Dataset};
use pyo3::exceptions::{PyOSError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;

fn to_py(e: FlowError) -> PyErr {
    match e {
        FlowError::CacheIo(_) => PyOSError::new_err(e.to_string()),
        FlowError::Internal(_) => PyRuntimeError::new_err(e.to_string()),
        other => PyValueError::new_err(other.to_string()),
    }
}

fn matrix(rows: Vec<Vec<f64>>) -> PyResult<Array2> {
    Array2::from_rows(&rows).map_err(to_py)
}

#[pyclass(name = "_Graph")]
#[derive(Debug, Clone, Default)]
pub struct PyGraph {
    inner: RelationshipGraph,
}

#[pymethods]
impl PyGraph {
    #[new]
    pub fn new() -> Self {
        Self::default()
    }

    /// One-dimensional table; rows are labeled `0..n` unless `index` is given.
    #[pyo3(signature = (name, columns, index_name = "index".to_string(), index = None))]
    pub fn add_table(
        &mut self,
        name: &str,
        columns: HashMap<String, Vec<f64>>,
        index_name: String,
        index: Option<Vec<i64>>,
    ) -> PyResult<()> {
        let n = columns.values().next().map_or(0, Vec::len);
        let coords = match index {
            Some(labels) => Coords::from(labels),
            None => Coords::Range(n),
        };
        let mut names: Vec<_> = columns.into_iter().collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        let ds = Dataset::from_table(&index_name, coords, names).map_err(to_py)?;
        self.inner.add_node(name, ds).map_err(to_py)?;
        Ok(())
    }

    /// Multi-dimensional dataset: `dims` as (name, integer labels), `variables` as
    /// (name, dim names, row-major values).
    pub fn add_array(
        &mut self,
        name: &str,
        dims: Vec<(String, Vec<i64>)>,
        variables: Vec<(String, Vec<String>, Vec<f64>)>,
    ) -> PyResult<()> {
        let mut ds = Dataset::new();
        for (dim, labels) in dims {
            ds = ds.with_dim(&dim, labels).map_err(to_py)?;
        }
        for (var, var_dims, values) in variables {
            let var_dims: Vec<&str> = var_dims.iter().map(String::as_str).collect();
            ds = ds.with_variable(var, &var_dims, values).map_err(to_py)?;
        }
        self.inner.add_node(name, ds).map_err(to_py)?;
        Ok(())
    }

    pub fn add_edge(&mut self, spec: &str) -> PyResult<()> {
        self.inner.add_edge(spec).map_err(to_py)?;
        Ok(())
    }

    pub fn set_root(&mut self, name: &str) -> PyResult<()> {
        self.inner.set_root(name).map_err(to_py)
    }

    /// New graph with one variable of one node swapped; everything else is shared.
    pub fn replace_variable(
        &self,
        node: &str,
        var: &str,
        values: Vec<f64>,
    ) -> PyResult<PyGraph> {
        let ds = self
            .inner
            .dataset(node)
            .ok_or_else(|| PyValueError::new_err(format!("unknown node '{}'", node)))?;
        let dims = ds
            .variable_dims(var)
            .ok_or_else(|| {
                PyValueError::new_err(format!("unknown variable '{}.{}'", node, var))
            })?;
        let next = Dataset::clone(ds).with_variable(var, &dims, values).map_err(to_py)?;
        Ok(PyGraph { inner: self.inner.replace_node(node, next).map_err(to_py)? })
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner.node_names().map(String::from).collect()
    }
}

#[pyclass(name = "_Compiler")]
#[derive(Debug)]
pub struct PyCompiler {
    inner: FlowCompiler,
}

#[pymethods]
impl PyCompiler {
    #[new]
    #[pyo3(signature = (cache_dir = None, track_compilation = false, parallel = true))]
    pub fn new(cache_dir: Option<PathBuf>, track_compilation: bool, parallel: bool) -> Self {
        let config = FlowConfig { cache_dir, track_compilation, parallel, ..FlowConfig::default() };
        Self { inner: FlowCompiler::new(config) }
    }

    #[pyo3(signature = (graph, expressions, mode = "load", constants = None))]
    pub fn compile(
        &self,
        graph: PyRef<'_, PyGraph>,
        expressions: Vec<(String, String)>,
        mode: &str,
        constants: Option<HashMap<String, f64>>,
    ) -> PyResult<PyKernel> {
        let mode = Mode::parse(mode)
            .ok_or_else(|| PyValueError::new_err(format!("unknown mode '{}'", mode)))?;
        let mut set = ExpressionSet::new();
        for (name, expr) in expressions {
            set.push(name, expr);
        }
        for (name, value) in constants.unwrap_or_default() {
            set = set.constant(name, value);
        }
        let kernel = self.inner.compile(&graph.inner, &set, mode).map_err(to_py)?;
        Ok(PyKernel { inner: kernel })
    }

    pub fn last_compile_triggered(&self) -> Option<bool> {
        self.inner.last_compile_triggered()
    }
}

#[pyclass(name = "_Kernel")]
#[derive(Debug, Clone)]
pub struct PyKernel {
    inner: Kernel,
}

#[pymethods]
impl PyKernel {
    #[getter]
    pub fn digest(&self) -> String {
        self.inner.digest().to_string()
    }

    #[getter]
    pub fn mode(&self) -> String {
        self.inner.mode().to_string()
    }

    #[getter]
    pub fn source(&self) -> String {
        self.inner.source().to_string()
    }

    #[getter]
    pub fn names(&self) -> Vec<String> {
        self.inner.names().to_vec()
    }

    pub fn bind(&self, graph: PyRef<'_, PyGraph>) -> PyResult<PyBoundKernel> {
        Ok(PyBoundKernel { inner: self.inner.bind(&graph.inner).map_err(to_py)? })
    }

    pub fn trace(&self, output: usize) -> PyResult<String> {
        self.inner.trace(output).map_err(to_py)
    }
}

#[pyclass(name = "_BoundKernel")]
#[derive(Debug, Clone)]
pub struct PyBoundKernel {
    inner: BoundKernel,
}

#[pymethods]
impl PyBoundKernel {
    pub fn rebind(&self, graph: PyRef<'_, PyGraph>) -> PyResult<PyBoundKernel> {
        Ok(PyBoundKernel { inner: self.inner.rebind(&graph.inner).map_err(to_py)? })
    }

    pub fn run(&self, py: Python<'_>) -> PyResult<Vec<Vec<f64>>> {
        let out = py.detach(|| self.inner.run()).map_err(to_py)?;
        Ok(out.to_nested())
    }

    pub fn run_dot(&self, py: Python<'_>, coefficients: Vec<Vec<f64>>) -> PyResult<Vec<Vec<f64>>> {
        let coefficients = matrix(coefficients)?;
        let out = py.detach(|| self.inner.run_dot(&coefficients)).map_err(to_py)?;
        Ok(out.to_nested())
    }

    pub fn run_mnl(
        &self,
        py: Python<'_>,
        coefficients: Vec<Vec<f64>>,
        draws: Vec<f64>,
    ) -> PyResult<(Vec<usize>, Vec<f64>)> {
        let coefficients = matrix(coefficients)?;
        let out = py.detach(|| self.inner.run_mnl(&coefficients, &draws)).map_err(to_py)?;
        Ok((out.choices, out.probabilities))
    }
}

#[pyfunction]
fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// The `sharrow._core` extension module.
#[pymodule]
pub fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(core_version, m)?)?;
    m.add_class::<PyGraph>()?;
    m.add_class::<PyCompiler>()?;
    m.add_class::<PyKernel>()?;
    m.add_class::<PyBoundKernel>()?;
    Ok(())
}
