use crate::compute::bytecode::{OpCode, Program};
use crate::error::{FlowError, Result};
use std::collections::HashMap;
use std::fmt::Write;

/// Renders the dependency tree of one kernel output as ASCII.
///
/// Registers shared by several branches are expanded once; later occurrences print a
/// back reference to the level where they were first shown.
pub fn format_trace(program: &Program, names: &[String], output: usize) -> Result<String> {
    let reg = *program.outputs.get(output).ok_or_else(|| {
        FlowError::Shape(format!("kernel has {} outputs, no output {}", program.outputs.len(), output))
    })?;
    let name = names.get(output).map(String::as_str).unwrap_or("?");

    let mut tracer = Tracer { program, visited_at_level: HashMap::new(), output: String::new() };
    let _ = writeln!(tracer.output, "KERNEL TRACE for '{}' (r{}):", super::truncate(name, 60), reg);
    let _ = writeln!(tracer.output, "--------------------------------------------------");
    tracer.trace_reg(reg, 1, "");
    Ok(tracer.output)
}

struct Tracer<'a> {
    program: &'a Program,
    visited_at_level: HashMap<u32, usize>,
    output: String,
}

impl Tracer<'_> {
    fn trace_reg(&mut self, reg: u32, level: usize, prefix: &str) {
        if let Some(&first_seen) = self.visited_at_level.get(&reg) {
            let _ = writeln!(self.output, "{}-> (Ref to L{} r{})", prefix, first_seen, reg);
            return;
        }
        self.visited_at_level.insert(reg, level);

        let _ = writeln!(self.output, "{}[L{}] r{} = {}", prefix, level, reg, self.describe(reg));
        let children = self.children(reg);
        let stem = build_child_stem(prefix);
        for (i, &child) in children.iter().enumerate() {
            let connector = if i == children.len() - 1 { "`--" } else { "|--" };
            let full_prefix = format!("{}{}", stem, connector);
            self.trace_reg(child, level + 1, &full_prefix);
        }
    }

    fn children(&self, reg: u32) -> Vec<u32> {
        let i = reg as usize;
        let p = self.program;
        match p.ops[i] {
            OpCode::Load | OpCode::Label => vec![p.p2[i]],
            op => [p.p1[i], p.p2[i], p.p3[i]][..op.arity()].to_vec(),
        }
    }

    fn describe(&self, reg: u32) -> String {
        let i = reg as usize;
        let p = self.program;
        match p.ops[i] {
            OpCode::Row => format!("row of '{}'", p.bindings.root),
            OpCode::Const => format!("{}", f64::from_bits(p.imm[i])),
            OpCode::Load => match p.bindings.columns.get(p.p1[i] as usize) {
                Some(c) => format!("{}.{}[r{}]", c.node, c.var, p.p2[i]),
                None => format!("c{}[r{}]", p.p1[i], p.p2[i]),
            },
            OpCode::Label => match p.bindings.labels.get(p.p1[i] as usize) {
                Some(t) => format!("position of ({})[r{}]", t.edge, p.p2[i]),
                None => format!("t{}[r{}]", p.p1[i], p.p2[i]),
            },
            OpCode::Stride => format!("r{} + r{} * {}", p.p1[i], p.p2[i], p.imm[i]),
            op => {
                let args: Vec<String> = self.children(reg).iter().map(|r| format!("r{}", r)).collect();
                format!("{}({})", op.mnemonic(), args.join(", "))
            }
        }
    }
}

fn build_child_stem(current_prefix: &str) -> String {
    current_prefix.replace("`--", "   ").replace("|--", "|  ")
}
