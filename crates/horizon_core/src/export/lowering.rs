//! Lowers bytecode programs and numeric data to C.

use std::fmt::{self, Write};

use nalgebra::DMatrix;

use crate::config::Precision;
use crate::equation_engine::{Bytecode, OpCode};
use crate::qp::is_bounded;

/// C spelling of a numeric literal; unbounded values map to `HORIZON_INFTY`.
pub(crate) fn literal(value: f64, precision: Precision) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if !is_bounded(value) {
        return if value > 0.0 { "HORIZON_INFTY" } else { "-HORIZON_INFTY" }.to_string();
    }
    match precision {
        Precision::Double => format!("{value:?}"),
        Precision::Single => format!("{value:?}f"),
    }
}

fn math(name: &str, precision: Precision) -> String {
    match precision {
        Precision::Double => name.to_string(),
        Precision::Single => format!("{name}f"),
    }
}

/// Emits `void name(const real_t* in, real_t* out)` evaluating `program`.
pub(crate) fn emit_program(out: &mut String, name: &str, program: &Bytecode, precision: Precision) -> fmt::Result {
    writeln!(out, "void {name}(const real_t* in, real_t* out)")?;
    writeln!(out, "{{")?;
    if program.outputs.is_empty() {
        writeln!(out, "    (void)in;")?;
        writeln!(out, "    (void)out;")?;
        return writeln!(out, "}}\n");
    }
    writeln!(out, "    real_t a[{}];", program.num_slots().max(1))?;
    if program.num_inputs == 0 {
        writeln!(out, "    (void)in;")?;
    }
    for (i, op) in program.ops.iter().enumerate() {
        let rhs = match *op {
            OpCode::LoadConst(v) => literal(v, precision),
            OpCode::LoadVar(idx) => format!("in[{idx}]"),
            OpCode::Add(a, b) => format!("a[{a}] + a[{b}]"),
            OpCode::Sub(a, b) => format!("a[{a}] - a[{b}]"),
            OpCode::Mul(a, b) => format!("a[{a}] * a[{b}]"),
            OpCode::Div(a, b) => format!("a[{a}] / a[{b}]"),
            OpCode::Pow(a, b) => format!("{}(a[{a}], a[{b}])", math("pow", precision)),
            OpCode::Powi(a, 2) => format!("a[{a}] * a[{a}]"),
            OpCode::Powi(a, n) => format!("horizon_powi(a[{a}], {n})"),
            OpCode::Neg(a) => format!("-a[{a}]"),
            OpCode::Sin(a) => format!("{}(a[{a}])", math("sin", precision)),
            OpCode::Cos(a) => format!("{}(a[{a}])", math("cos", precision)),
            OpCode::Tan(a) => format!("{}(a[{a}])", math("tan", precision)),
            OpCode::Exp(a) => format!("{}(a[{a}])", math("exp", precision)),
            OpCode::Log(a) => format!("{}(a[{a}])", math("log", precision)),
            OpCode::Sqrt(a) => format!("{}(a[{a}])", math("sqrt", precision)),
        };
        writeln!(out, "    a[{i}] = {rhs};")?;
    }
    for (j, slot) in program.outputs.iter().enumerate() {
        writeln!(out, "    out[{j}] = a[{slot}];")?;
    }
    writeln!(out, "}}\n")
}

/// Emits a constant array, eight values per line.
pub(crate) fn emit_array<I>(out: &mut String, ty: &str, name: &str, values: I, precision: Precision) -> fmt::Result
where
    I: IntoIterator<Item = f64>,
{
    let rendered: Vec<String> = values.into_iter().map(|v| literal(v, precision)).collect();
    emit_rendered(out, ty, name, &rendered)
}

pub(crate) fn emit_int_array<I>(out: &mut String, name: &str, values: I) -> fmt::Result
where
    I: IntoIterator<Item = i64>,
{
    let rendered: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    emit_rendered(out, "const int", name, &rendered)
}

fn emit_rendered(out: &mut String, ty: &str, name: &str, rendered: &[String]) -> fmt::Result {
    // C forbids zero-length arrays
    if rendered.is_empty() {
        return writeln!(out, "{ty} {name}[1] = {{ 0 }};\n");
    }
    writeln!(out, "{ty} {name}[{}] = {{", rendered.len())?;
    for chunk in rendered.chunks(8) {
        writeln!(out, "    {},", chunk.join(", "))?;
    }
    writeln!(out, "}};\n")
}

/// Row-major entries of a matrix.
pub(crate) fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    (0..m.nrows())
        .flat_map(|i| (0..m.ncols()).map(move |j| m[(i, j)]))
        .collect()
}
