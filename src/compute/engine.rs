use crate::analysis::telemetry::KernelReport;
use crate::compiler::KernelArtifact;
use crate::compute::bind::BoundSource;
use crate::compute::bytecode::{Mode, Program};
use crate::compute::kernel;
use crate::compute::output::{LabeledChoices, MnlOutcome, Output, OutputFormat};
use crate::config::FlowConfig;
use crate::display;
use crate::error::{FlowError, Result};
use crate::graph::RelationshipGraph;
use crate::store::Array2;
use rayon::prelude::*;
use std::sync::Arc;
use wide::f64x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExecOptions {
    parallel: bool,
    min_rows_per_task: usize,
}

/// A compiled kernel: the shared immutable artifact plus the expression names it was
/// requested under.
#[derive(Debug, Clone)]
pub struct Kernel {
    artifact: Arc<KernelArtifact>,
    names: Arc<[String]>,
    exec: ExecOptions,
}

impl Kernel {
    pub(crate) fn new(artifact: Arc<KernelArtifact>, names: Vec<String>, config: &FlowConfig) -> Self {
        Self {
            artifact,
            names: names.into(),
            exec: ExecOptions {
                parallel: config.parallel,
                min_rows_per_task: config.min_rows_per_task.max(1),
            },
        }
    }

    pub fn digest(&self) -> &str {
        self.artifact.digest()
    }

    pub fn mode(&self) -> Mode {
        self.artifact.mode()
    }

    /// Generated kernel source, for diagnostics.
    pub fn source(&self) -> &str {
        &self.artifact.source
    }

    pub fn program(&self) -> &Program {
        &self.artifact.program
    }

    pub fn artifact(&self) -> &Arc<KernelArtifact> {
        &self.artifact
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.exec.parallel = parallel;
        self
    }

    pub fn bind(&self, graph: &RelationshipGraph) -> Result<BoundKernel> {
        let source = BoundSource::bind(graph, &self.program().bindings)?;
        Ok(BoundKernel { kernel: self.clone(), source })
    }

    /// Pairs this kernel with an existing bound source, e.g. one bound for another kernel
    /// compiled from the same graph layout.
    pub fn attach(&self, source: BoundSource) -> Result<BoundKernel> {
        if source.bindings() != &self.program().bindings {
            return Err(FlowError::Shape(format!(
                "bound source was prepared for a different data layout than kernel {}",
                &self.digest()[..12.min(self.digest().len())]
            )));
        }
        Ok(BoundKernel { kernel: self.clone(), source })
    }

    pub fn report(&self) -> KernelReport {
        KernelReport::analyze(self.program())
    }

    /// ASCII dependency tree of one output.
    pub fn trace(&self, output: usize) -> Result<String> {
        display::format_trace(self.program(), &self.names, output)
    }

    fn require(&self, requested: Mode) -> Result<()> {
        let compiled = self.mode();
        if compiled != requested {
            return Err(FlowError::ModeMismatch { compiled, requested });
        }
        Ok(())
    }
}

/// A kernel attached to concrete data.
#[derive(Debug, Clone)]
pub struct BoundKernel {
    kernel: Kernel,
    source: BoundSource,
}

impl BoundKernel {
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn source(&self) -> &BoundSource {
        &self.source
    }

    pub fn into_source(self) -> BoundSource {
        self.source
    }

    pub fn rows(&self) -> usize {
        self.source.rows()
    }

    /// Re-binds to changed data, reusing unchanged columns and label tables.
    pub fn rebind(&self, graph: &RelationshipGraph) -> Result<BoundKernel> {
        Ok(BoundKernel { kernel: self.kernel.clone(), source: self.source.rebind(graph)? })
    }

    /// Dense rows x expressions result.
    pub fn run(&self) -> Result<Array2> {
        self.kernel.require(Mode::Load)?;
        let program = self.kernel.program();
        let outputs = &program.outputs;
        let width = outputs.len();
        let data = Engine::drive(program, &self.source, width, self.kernel.exec, || (), |_, regs, _, out| {
            for (dst, &reg) in out.iter_mut().zip(outputs) {
                *dst = regs[reg as usize];
            }
            Ok(())
        })?;
        Array2::from_vec(self.rows(), width, data)
    }

    pub fn run_as(&self, format: OutputFormat) -> Result<Output> {
        let data = self.run()?;
        Ok(Output::wrap(data, self.source.row_dim(), self.kernel.names.clone(), "expressions", format))
    }

    /// Rows x alternatives utilities `values . coefficients`, accumulated without
    /// materializing the per-expression values.
    pub fn run_dot(&self, coefficients: &Array2) -> Result<Array2> {
        self.kernel.require(Mode::Dot)?;
        self.check_coefficients(coefficients)?;
        let program = self.kernel.program();
        let width = coefficients.cols();
        let data = Engine::drive(program, &self.source, width, self.kernel.exec, || (), |_, regs, _, out| {
            dot_row(program, regs, coefficients, out);
            Ok(())
        })?;
        Array2::from_vec(self.rows(), width, data)
    }

    pub fn run_dot_as(
        &self,
        coefficients: &Array2,
        alternatives: &[String],
        format: OutputFormat,
    ) -> Result<Output> {
        let data = self.run_dot(coefficients)?;
        let names = alternative_names(alternatives, coefficients.cols())?;
        Ok(Output::wrap(data, self.source.row_dim(), names, "alternatives", format))
    }

    /// Simulates one multinomial-logit choice per root row.
    ///
    /// Utilities are `values . coefficients`; each row takes the first alternative whose
    /// cumulative softmax probability exceeds that row's draw.
    pub fn run_mnl(&self, coefficients: &Array2, draws: &[f64]) -> Result<MnlOutcome> {
        self.kernel.require(Mode::MnlDraws)?;
        self.check_coefficients(coefficients)?;
        let rows = self.rows();
        if draws.len() != rows {
            return Err(FlowError::Shape(format!("{} draws supplied for {} rows", draws.len(), rows)));
        }
        if let Some(i) = draws.iter().position(|d| !(0.0..1.0).contains(d)) {
            return Err(FlowError::Domain(format!("draw {} at row {} is outside [0, 1)", draws[i], i)));
        }
        let k = coefficients.cols();
        if k == 0 {
            return Err(FlowError::Domain("choice model has no alternatives".into()));
        }

        let program = self.kernel.program();
        let data = Engine::drive(
            program,
            &self.source,
            2,
            self.kernel.exec,
            || vec![0.0; k],
            |utility, regs, row, out| {
                dot_row(program, regs, coefficients, utility);
                let (choice, p) = choose(utility, draws[row])
                    .ok_or_else(|| FlowError::Domain(format!("row {} has no available alternative", row)))?;
                out[0] = choice as f64;
                out[1] = p;
                Ok(())
            },
        )?;

        let (choices, probabilities): (Vec<usize>, Vec<f64>) = data
            .chunks_exact(2)
            .map(|pair| (pair[0] as usize, pair[1]))
            .unzip();
        Ok(MnlOutcome { choices, probabilities })
    }

    pub fn run_mnl_labeled(
        &self,
        coefficients: &Array2,
        draws: &[f64],
        alternatives: &[String],
    ) -> Result<LabeledChoices> {
        let names = alternative_names(alternatives, coefficients.cols())?;
        Ok(self.run_mnl(coefficients, draws)?.labeled(self.source.row_dim(), &names))
    }

    fn check_coefficients(&self, coefficients: &Array2) -> Result<()> {
        let n = self.kernel.program().outputs.len();
        if coefficients.rows() != n {
            return Err(FlowError::Shape(format!(
                "coefficient matrix has {} rows but the kernel has {} expressions",
                coefficients.rows(),
                n
            )));
        }
        Ok(())
    }
}

fn alternative_names(given: &[String], k: usize) -> Result<Arc<[String]>> {
    if given.is_empty() {
        return Ok((0..k).map(|j| j.to_string()).collect());
    }
    if given.len() != k {
        return Err(FlowError::Shape(format!(
            "{} alternative names for {} coefficient columns",
            given.len(),
            k
        )));
    }
    Ok(given.into())
}

/// `out[j] = sum_e value_e * coefficients[e, j]`, four alternatives at a time.
#[inline]
fn dot_row(program: &Program, regs: &[f64], coefficients: &Array2, out: &mut [f64]) {
    out.fill(0.0);
    for (e, &reg) in program.outputs.iter().enumerate() {
        let v = regs[reg as usize];
        let vv = f64x4::splat(v);
        let coef = coefficients.row(e);
        let mut dst = out.chunks_exact_mut(4);
        let mut src = coef.chunks_exact(4);
        for (d, c) in (&mut dst).zip(&mut src) {
            let acc = f64x4::from([d[0], d[1], d[2], d[3]]) + vv * f64x4::from([c[0], c[1], c[2], c[3]]);
            d.copy_from_slice(&acc.to_array());
        }
        for (d, c) in dst.into_remainder().iter_mut().zip(src.remainder()) {
            *d += v * c;
        }
    }
}

/// Picks an alternative from utilities by inverse-CDF sampling of their softmax.
/// NaN utilities are unavailable. Returns `None` when nothing is available.
fn choose(utility: &mut [f64], draw: f64) -> Option<(usize, f64)> {
    let max = utility.iter().copied().filter(|u| !u.is_nan()).fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return None;
    }
    let mut sum = 0.0;
    for u in utility.iter_mut() {
        *u = if u.is_nan() {
            0.0
        } else if max == f64::INFINITY {
            if *u == f64::INFINITY {
                1.0
            } else {
                0.0
            }
        } else {
            (*u - max).exp()
        };
        sum += *u;
    }

    let mut cumulative = 0.0;
    let mut last_available = None;
    for (j, w) in utility.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        let p = w / sum;
        cumulative += p;
        last_available = Some((j, p));
        if cumulative > draw {
            return Some((j, p));
        }
    }
    last_available
}

pub struct Engine;

impl Engine {
    /// Evaluates the program for every root row, handing each row's registers to
    /// `epilogue` together with that row's `width`-wide slice of the output buffer.
    ///
    /// With `parallel` set, the buffer is split into disjoint row blocks, one register
    /// file and one `init()` scratch per block.
    fn drive<S, I, F>(
        program: &Program,
        source: &BoundSource,
        width: usize,
        exec: ExecOptions,
        init: I,
        epilogue: F,
    ) -> Result<Vec<f64>>
    where
        I: Fn() -> S + Sync,
        F: Fn(&mut S, &[f64], usize, &mut [f64]) -> Result<()> + Sync,
    {
        let rows = source.rows();
        Self::validate_layout(program, source)?;

        let mut out = vec![0.0; rows * width];
        if rows == 0 || width == 0 {
            return Ok(out);
        }

        let columns = source.column_slices();
        let tables = source.table_slices();
        let run_block = |first_row: usize, block: &mut [f64]| -> Result<()> {
            let mut regs = kernel::init_registers(program);
            let mut scratch = init();
            for (k, out_row) in block.chunks_mut(width).enumerate() {
                let row = first_row + k;
                kernel::eval_row(program, &columns, &tables, row, &mut regs);
                epilogue(&mut scratch, &regs, row, out_row)?;
            }
            Ok(())
        };

        let per_task = exec.min_rows_per_task;
        if exec.parallel && rows > per_task {
            out.par_chunks_mut(per_task * width)
                .enumerate()
                .try_for_each(|(block, slice)| run_block(block * per_task, slice))?;
        } else {
            run_block(0, &mut out)?;
        }
        Ok(out)
    }

    /// Checked once so the row loop can index without further reasoning.
    fn validate_layout(program: &Program, source: &BoundSource) -> Result<()> {
        if source.bindings() != &program.bindings {
            return Err(FlowError::Internal("bound source does not match the program layout".into()));
        }
        if source.column_slices().len() != program.bindings.columns.len()
            || source.table_slices().len() != program.bindings.labels.len()
        {
            return Err(FlowError::Internal("bound source is missing columns or tables".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::FlowCompiler;
    use crate::expr::ExpressionSet;
    use crate::store::{Coords, Dataset};
    use rstest::rstest;

    /// Four tours looking up a 3x3 distance skim by origin and destination zone label.
    fn tours_graph() -> RelationshipGraph {
        let tours = Dataset::from_table(
            "tour",
            Coords::Range(4),
            [
                ("orig", vec![1.0, 2.0, 3.0, 1.0]),
                ("dest", vec![2.0, 2.0, 1.0, 3.0]),
                ("cost", vec![1.0, 2.0, 3.0, 4.0]),
            ],
        )
        .unwrap();
        let skims = Dataset::new()
            .with_dim("otaz", vec![1i64, 2, 3])
            .unwrap()
            .with_dim("dtaz", vec![1i64, 2, 3])
            .unwrap()
            .with_variable("dist", &["otaz", "dtaz"], (0..9).map(f64::from).collect::<Vec<_>>())
            .unwrap();
        let mut g = RelationshipGraph::new();
        g.add_node("tours", tours).unwrap();
        g.add_node("skims", skims).unwrap();
        g.add_edge("tours.orig @ skims.otaz").unwrap();
        g.add_edge("tours.dest @ skims.dtaz").unwrap();
        g
    }

    fn compile(g: &RelationshipGraph, exprs: &[&str], mode: Mode) -> Kernel {
        let compiler = FlowCompiler::new(FlowConfig::default().with_parallel(false));
        compiler.compile(g, &ExpressionSet::from_exprs(exprs.iter().copied()), mode).unwrap()
    }

    fn coefficients() -> Array2 {
        Array2::from_rows(&[vec![1.0, 0.0, 0.5], vec![0.0, -1.0, 0.25]]).unwrap()
    }

    #[test]
    fn test_two_dimensional_label_lookup() {
        let g = tours_graph();
        let kernel = compile(&g, &["skims.dist", "skims.dist * tours.cost"], Mode::Load);
        let out = kernel.bind(&g).unwrap().run().unwrap();
        assert_eq!(out.column(0).collect::<Vec<_>>(), vec![1.0, 4.0, 6.0, 2.0]);
        assert_eq!(out.column(1).collect::<Vec<_>>(), vec![1.0, 8.0, 18.0, 8.0]);
    }

    #[test]
    fn test_dot_matches_load_times_coefficients() {
        let g = tours_graph();
        let exprs = ["skims.dist", "tours.cost ** 2"];
        let values = compile(&g, &exprs, Mode::Load).bind(&g).unwrap().run().unwrap();
        let fused = compile(&g, &exprs, Mode::Dot).bind(&g).unwrap().run_dot(&coefficients()).unwrap();
        let expected = values.matmul(&coefficients()).unwrap();
        assert_eq!(fused.shape(), (4, 3));
        for (a, b) in fused.as_slice().iter().zip(expected.as_slice()) {
            assert!((a - b).abs() < 1e-12, "{} vs {}", a, b);
        }
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.4)]
    #[case(0.999)]
    fn test_mnl_choice_follows_softmax(#[case] draw: f64) {
        let g = tours_graph();
        let exprs = ["skims.dist", "tours.cost"];
        let utilities = compile(&g, &exprs, Mode::Dot).bind(&g).unwrap().run_dot(&coefficients()).unwrap();
        let probs = utilities.softmax_rows();
        let outcome = compile(&g, &exprs, Mode::MnlDraws)
            .bind(&g)
            .unwrap()
            .run_mnl(&coefficients(), &[draw; 4])
            .unwrap();
        assert_eq!(outcome.len(), 4);
        for r in 0..4 {
            let c = outcome.choices[r];
            assert!((outcome.probabilities[r] - probs.get(r, c)).abs() < 1e-12);
            let below: f64 = probs.row(r)[..c].iter().sum();
            assert!(below <= draw + 1e-12 && draw < below + probs.get(r, c) + 1e-12);
        }
    }

    #[test]
    fn test_mnl_input_checks() {
        let g = tours_graph();
        let bound = compile(&g, &["skims.dist", "tours.cost"], Mode::MnlDraws).bind(&g).unwrap();
        let coef = coefficients();
        assert!(matches!(bound.run_mnl(&coef, &[0.5; 3]), Err(FlowError::Shape(_))));
        assert!(matches!(bound.run_mnl(&coef, &[0.5, 1.0, 0.5, 0.5]), Err(FlowError::Domain(_))));
        assert!(matches!(bound.run_mnl(&coef, &[0.5, f64::NAN, 0.5, 0.5]), Err(FlowError::Domain(_))));
        let empty = Array2::zeros(2, 0);
        assert!(matches!(bound.run_mnl(&empty, &[0.5; 4]), Err(FlowError::Domain(_))));
        let wrong_rows = Array2::zeros(3, 2);
        assert!(matches!(bound.run_mnl(&wrong_rows, &[0.5; 4]), Err(FlowError::Shape(_))));
    }

    #[test]
    fn test_mode_mismatch() {
        let g = tours_graph();
        let bound = compile(&g, &["tours.cost"], Mode::Load).bind(&g).unwrap();
        let err = bound.run_dot(&Array2::zeros(1, 2)).unwrap_err();
        assert_eq!(err, FlowError::ModeMismatch { compiled: Mode::Load, requested: Mode::Dot });
        let dot = compile(&g, &["tours.cost"], Mode::Dot).bind(&g).unwrap();
        assert!(matches!(dot.run(), Err(FlowError::ModeMismatch { .. })));
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let g = tours_graph();
        let bound = compile(&g, &["log(skims.dist + 1) / tours.cost"], Mode::Load).bind(&g).unwrap();
        let first = bound.run().unwrap();
        let second = bound.run().unwrap();
        let bits = |a: &Array2| a.as_slice().iter().map(|v| v.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&first), bits(&second));
    }

    #[test]
    fn test_parallel_blocks_match_serial() {
        let n = 103;
        let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.5).collect();
        let mut g = RelationshipGraph::new();
        g.add_node("hh", Dataset::from_table("hh", Coords::Range(n), [("x", x)]).unwrap()).unwrap();
        let config = FlowConfig { min_rows_per_task: 8, ..FlowConfig::default() };
        let kernel = FlowCompiler::new(config)
            .compile(&g, &ExpressionSet::from_exprs(["x * x - 3", "where(x > 10, 1, 0)"]), Mode::Load)
            .unwrap();
        let parallel = kernel.bind(&g).unwrap().run().unwrap();
        let serial = kernel.clone().with_parallel(false).bind(&g).unwrap().run().unwrap();
        assert_eq!(parallel, serial);
        assert_eq!(parallel.get(n - 1, 0), 51.0 * 51.0 - 3.0);
        assert_eq!(parallel.get(20, 1), 0.0);
        assert_eq!(parallel.get(21, 1), 1.0);
    }

    #[test]
    fn test_positional_index_out_of_range_fails_at_bind() {
        let mut g = RelationshipGraph::new();
        g.add_node("a", Dataset::from_table("row", Coords::Range(2), [("p", vec![0.0, 2.0])]).unwrap()).unwrap();
        g.add_node("b", Dataset::from_table("row", Coords::Range(2), [("y", vec![5.0, 6.0])]).unwrap()).unwrap();
        g.add_edge("a.p -> b.row").unwrap();
        let kernel = compile(&g, &["b.y"], Mode::Load);
        assert!(matches!(kernel.bind(&g), Err(FlowError::Domain(_))));
    }

    #[test]
    fn test_labeled_and_frame_outputs() {
        let g = tours_graph();
        let set = ExpressionSet::new().with("dist", "skims.dist").with("cost", "tours.cost");
        let kernel = FlowCompiler::default().compile(&g, &set, Mode::Load).unwrap();
        let bound = kernel.bind(&g).unwrap();

        match bound.run_as(OutputFormat::Labeled).unwrap() {
            Output::Labeled(l) => {
                assert_eq!(l.column_dim, "expressions");
                assert_eq!(l.get("2", "dist"), Some(6.0));
                assert_eq!(l.get("3", "cost"), Some(4.0));
                assert_eq!(l.get("4", "cost"), None);
            }
            other => panic!("unexpected {:?}", other),
        }
        match bound.run_as(OutputFormat::Frame).unwrap() {
            Output::Frame(f) => {
                assert_eq!(f.column_names(), ["dist".to_string(), "cost".to_string()]);
                assert_eq!(f.column("cost").unwrap().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
                assert_eq!(f.len(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_labeled_choices_and_alternative_names() {
        let g = tours_graph();
        let bound = compile(&g, &["skims.dist", "tours.cost"], Mode::MnlDraws).bind(&g).unwrap();
        let names = vec!["walk".to_string(), "bike".to_string(), "car".to_string()];
        let labeled = bound.run_mnl_labeled(&coefficients(), &[0.0; 4], &names).unwrap();
        assert_eq!(labeled.chosen.len(), 4);
        assert!(labeled.chosen.iter().all(|c| names.contains(c)));
        assert!(bound.run_mnl_labeled(&coefficients(), &[0.0; 4], &names[..2]).is_err());
    }

    #[test]
    fn test_attach_requires_matching_layout() {
        let g = tours_graph();
        let load = compile(&g, &["skims.dist"], Mode::Load);
        let other = compile(&g, &["tours.cost"], Mode::Load);
        let source = load.bind(&g).unwrap().into_source();
        assert!(compile(&g, &["skims.dist * 2"], Mode::Load).attach(source.clone()).is_ok());
        assert!(matches!(other.attach(source), Err(FlowError::Shape(_))));
    }

    #[test]
    fn test_choose_walks_the_cdf() {
        // Equal utilities: each alternative has probability 1/4.
        let mut u = vec![0.0; 4];
        assert_eq!(choose(&mut u.clone(), 0.0), Some((0, 0.25)));
        assert_eq!(choose(&mut u.clone(), 0.3).map(|c| c.0), Some(1));
        assert_eq!(choose(&mut u, 0.99).map(|c| c.0), Some(3));
    }

    #[test]
    fn test_choose_skips_unavailable() {
        let mut u = vec![f64::NEG_INFINITY, 1.0, f64::NAN];
        assert_eq!(choose(&mut u, 0.999_999), Some((1, 1.0)));
        let mut none = vec![f64::NEG_INFINITY, f64::NAN];
        assert_eq!(choose(&mut none, 0.5), None);
        let mut inf = vec![f64::INFINITY, 0.0, f64::INFINITY];
        assert_eq!(choose(&mut inf, 0.6), Some((2, 0.5)));
    }

    #[test]
    fn test_dot_row_handles_remainder_columns() {
        let program = crate::compute::bytecode::assemble(
            "kernel mode=dot\n\
             r0 = const 0x4000000000000000\n\
             r1 = const 0x4008000000000000\n\
             output r0\n\
             output r1\n",
        )
        .unwrap();
        let regs = kernel::init_registers(&program);
        let coef = Array2::from_rows(&[vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![1.0, 0.0, 1.0, 0.0, 1.0]]).unwrap();
        let mut out = vec![9.0; 5];
        dot_row(&program, &regs, &coef, &mut out);
        assert_eq!(out, vec![5.0, 4.0, 9.0, 8.0, 13.0]);
    }
}
