use crate::error::{OcpError, Result};
use crate::expression::{BinaryOp, ExprGraph, ExprId, Node, SymbolId, UnaryOp};
use crate::traits::Scalar;
use std::collections::HashMap;

/// OpCodes for the register-based Virtual Machine.
/// Instruction `i` writes slot `i`; operands name earlier slots.
/// The VM operates on `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Loads a constant `f64` value.
    LoadConst(f64),
    /// Loads an input (by index into the flattened `[x; u; d]` vector).
    LoadVar(usize),
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Div(usize, usize),
    Pow(usize, usize),
    /// Integer power, emitted for constant integral exponents.
    Powi(usize, i32),
    Neg(usize),
    Sin(usize),
    Cos(usize),
    Tan(usize),
    Exp(usize),
    Log(usize),
    Sqrt(usize),
}

/// Represents a compiled, straight-line program with several outputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    /// Slot holding each output.
    pub outputs: Vec<usize>,
    pub num_inputs: usize,
}

impl Bytecode {
    pub fn num_slots(&self) -> usize {
        self.ops.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }
}

/// Register Virtual Machine for evaluating compiled programs.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `inputs`: Flattened input vector (read-only).
/// - `slots`: A mutable buffer for intermediate values, reused across calls.
pub struct VM;

impl VM {
    /// Executes the bytecode and writes every output into `out`.
    ///
    /// # Type Parameters
    /// * `T`: The scalar type (e.g., `f64` or `Dual`).
    pub fn execute<T: Scalar>(bytecode: &Bytecode, inputs: &[T], slots: &mut Vec<T>, out: &mut [T]) {
        Self::forward(bytecode, inputs, slots);
        for (o, &slot) in out.iter_mut().zip(&bytecode.outputs) {
            *o = slots[slot];
        }
    }

    fn forward<T: Scalar>(bytecode: &Bytecode, inputs: &[T], slots: &mut Vec<T>) {
        slots.clear();
        slots.reserve(bytecode.ops.len());

        for op in &bytecode.ops {
            let value = match *op {
                OpCode::LoadConst(val) => T::constant(val),
                OpCode::LoadVar(idx) => inputs[idx],
                OpCode::Add(a, b) => slots[a] + slots[b],
                OpCode::Sub(a, b) => slots[a] - slots[b],
                OpCode::Mul(a, b) => slots[a] * slots[b],
                OpCode::Div(a, b) => slots[a] / slots[b],
                OpCode::Pow(a, b) => slots[a].powf(slots[b]),
                OpCode::Powi(a, n) => slots[a].powi(n),
                OpCode::Neg(a) => -slots[a],
                OpCode::Sin(a) => slots[a].sin(),
                OpCode::Cos(a) => slots[a].cos(),
                OpCode::Tan(a) => slots[a].tan(),
                OpCode::Exp(a) => slots[a].exp(),
                OpCode::Log(a) => slots[a].ln(),
                OpCode::Sqrt(a) => slots[a].sqrt(),
            };
            slots.push(value);
        }
    }

    /// Reverse-mode gradient of output `output` with respect to every input.
    pub fn gradient(bytecode: &Bytecode, inputs: &[f64], output: usize, slots: &mut Vec<f64>) -> Vec<f64> {
        Self::forward(bytecode, inputs, slots);
        let mut grad = vec![0.0; bytecode.num_inputs];
        let Some(&seed) = bytecode.outputs.get(output) else {
            return grad;
        };
        let mut bar = vec![0.0; bytecode.ops.len()];
        bar[seed] = 1.0;

        for (i, op) in bytecode.ops.iter().enumerate().rev() {
            let w = bar[i];
            if w == 0.0 {
                continue;
            }
            match *op {
                OpCode::LoadConst(_) => {}
                OpCode::LoadVar(idx) => grad[idx] += w,
                OpCode::Add(a, b) => {
                    bar[a] += w;
                    bar[b] += w;
                }
                OpCode::Sub(a, b) => {
                    bar[a] += w;
                    bar[b] -= w;
                }
                OpCode::Mul(a, b) => {
                    bar[a] += w * slots[b];
                    bar[b] += w * slots[a];
                }
                OpCode::Div(a, b) => {
                    bar[a] += w / slots[b];
                    bar[b] -= w * slots[a] / (slots[b] * slots[b]);
                }
                OpCode::Pow(a, b) => {
                    bar[a] += w * slots[b] * slots[a].powf(slots[b] - 1.0);
                    if slots[a] > 0.0 {
                        bar[b] += w * slots[i] * slots[a].ln();
                    }
                }
                OpCode::Powi(a, n) => bar[a] += w * n as f64 * slots[a].powi(n - 1),
                OpCode::Neg(a) => bar[a] -= w,
                OpCode::Sin(a) => bar[a] += w * slots[a].cos(),
                OpCode::Cos(a) => bar[a] -= w * slots[a].sin(),
                OpCode::Tan(a) => bar[a] += w * (1.0 + slots[i] * slots[i]),
                OpCode::Exp(a) => bar[a] += w * slots[i],
                OpCode::Log(a) => bar[a] += w / slots[a],
                OpCode::Sqrt(a) => bar[a] += w * 0.5 / slots[i],
            }
        }
        grad
    }
}

/// Compiles graph nodes into `Bytecode`.
/// Resolves symbol components to offsets in the flattened input vector.
pub struct Compiler<'g> {
    graph: &'g ExprGraph,
    offsets: HashMap<SymbolId, usize>,
    num_inputs: usize,
}

impl<'g> Compiler<'g> {
    /// `layout` lists every input symbol with the offset of its first component.
    pub fn new(graph: &'g ExprGraph, layout: &[(SymbolId, usize)], num_inputs: usize) -> Self {
        Self {
            graph,
            offsets: layout.iter().copied().collect(),
            num_inputs,
        }
    }

    /// Compiles `outputs` into one program. Shared nodes are emitted once.
    pub fn compile(&self, outputs: &[ExprId]) -> Result<Bytecode> {
        let order = self.graph.topological_order(outputs);
        let mut slot_of: HashMap<ExprId, usize> = HashMap::with_capacity(order.len());
        let mut ops = Vec::with_capacity(order.len());

        for id in order {
            let op = match *self.graph.node(id) {
                Node::Constant(bits) => OpCode::LoadConst(f64::from_bits(bits)),
                Node::Variable { symbol, component } => {
                    let offset = self.offsets.get(&symbol).ok_or_else(|| {
                        OcpError::invalid_model(format!(
                            "'{}' is not an input of this function",
                            self.graph.symbol(symbol).name()
                        ))
                    })?;
                    OpCode::LoadVar(offset + component as usize)
                }
                Node::TimeDerivative { symbol, component } => {
                    return Err(OcpError::invalid_model(format!(
                        "{} cannot appear on the right-hand side",
                        self.graph.component_name(symbol, component as usize, true)
                    )));
                }
                Node::Binary(op, a, b) => {
                    let (sa, sb) = (slot_of[&a], slot_of[&b]);
                    match op {
                        BinaryOp::Add => OpCode::Add(sa, sb),
                        BinaryOp::Sub => OpCode::Sub(sa, sb),
                        BinaryOp::Mul => OpCode::Mul(sa, sb),
                        BinaryOp::Div => OpCode::Div(sa, sb),
                        BinaryOp::Pow => match integral_exponent(self.graph.node(b)) {
                            Some(n) => OpCode::Powi(sa, n),
                            None => OpCode::Pow(sa, sb),
                        },
                    }
                }
                Node::Unary(op, a) => {
                    let sa = slot_of[&a];
                    match op {
                        UnaryOp::Neg => OpCode::Neg(sa),
                        UnaryOp::Sin => OpCode::Sin(sa),
                        UnaryOp::Cos => OpCode::Cos(sa),
                        UnaryOp::Tan => OpCode::Tan(sa),
                        UnaryOp::Exp => OpCode::Exp(sa),
                        UnaryOp::Log => OpCode::Log(sa),
                        UnaryOp::Sqrt => OpCode::Sqrt(sa),
                    }
                }
            };
            slot_of.insert(id, ops.len());
            ops.push(op);
        }

        Ok(Bytecode {
            ops,
            outputs: outputs.iter().map(|id| slot_of[id]).collect(),
            num_inputs: self.num_inputs,
        })
    }
}

fn integral_exponent(node: &Node) -> Option<i32> {
    let value = node.constant_value()?;
    if value.fract() == 0.0 && value.abs() <= 64.0 {
        Some(value as i32)
    } else {
        None
    }
}
