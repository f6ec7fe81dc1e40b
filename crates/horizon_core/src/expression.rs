//! Hash-consed expression DAG.
//!
//! Every node lives in an arena owned by [`ExprGraph`] and is referenced by an
//! [`ExprId`]. Structurally identical nodes are interned once, so common
//! subexpressions are shared automatically. Children are always created before
//! their parents, which makes ascending id order a valid topological order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{OcpError, Result};

/// Index of a node in an [`ExprGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a declared symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    DifferentialState,
    Control,
    Disturbance,
}

/// A named vector-valued variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    id: SymbolId,
    name: String,
    kind: SymbolKind,
    dim: usize,
}

impl Symbol {
    pub fn id(&self) -> SymbolId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> SymbolKind {
        self.kind
    }
    pub fn dim(&self) -> usize {
        self.dim
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    fn is_commutative(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
}

impl UnaryOp {
    pub fn apply(self, a: f64) -> f64 {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tan => a.tan(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Log => a.ln(),
            UnaryOp::Sqrt => a.sqrt(),
        }
    }
}

/// Operator accepted by [`ExprGraph::combine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Binary(BinaryOp),
    Unary(UnaryOp),
}

impl Op {
    fn arity(self) -> usize {
        match self {
            Op::Binary(_) => 2,
            Op::Unary(_) => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    /// Constant stored as canonical f64 bits so nodes can be hashed.
    Constant(u64),
    Variable { symbol: SymbolId, component: u32 },
    TimeDerivative { symbol: SymbolId, component: u32 },
    Binary(BinaryOp, ExprId, ExprId),
    Unary(UnaryOp, ExprId),
}

impl Node {
    pub fn constant_value(&self) -> Option<f64> {
        match self {
            Node::Constant(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    fn constant(value: f64) -> Self {
        // -0.0 and every NaN payload collapse onto one node each
        let canonical = if value == 0.0 {
            0.0
        } else if value.is_nan() {
            f64::NAN
        } else {
            value
        };
        Node::Constant(canonical.to_bits())
    }

    fn is_leaf_variable(&self) -> bool {
        matches!(self, Node::Variable { .. } | Node::TimeDerivative { .. })
    }
}

/// An ordered vector of scalar nodes. Scalars are vectors of length one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expression {
    nodes: Vec<ExprId>,
}

impl Expression {
    pub fn from_ids(nodes: Vec<ExprId>) -> Self {
        Self { nodes }
    }

    pub fn dim(&self) -> usize {
        self.nodes.len()
    }

    pub fn ids(&self) -> &[ExprId] {
        &self.nodes
    }

    pub fn get(&self, index: usize) -> Option<ExprId> {
        self.nodes.get(index).copied()
    }

    pub fn is_scalar(&self) -> bool {
        self.nodes.len() == 1
    }
}

/// Arena of interned expression nodes plus the symbols they reference.
#[derive(Debug, Clone, Default)]
pub struct ExprGraph {
    nodes: Vec<Node>,
    interned: HashMap<Node, ExprId>,
    symbols: Vec<Symbol>,
    derivatives: HashMap<(ExprId, ExprId), ExprId>,
}

impl ExprGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: ExprId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    /// Declares a new symbol. Names must be unique and non-empty, and `dim >= 1`.
    pub fn declare_symbol(&mut self, name: &str, kind: SymbolKind, dim: usize) -> Result<Symbol> {
        if name.trim().is_empty() {
            return Err(OcpError::invalid_model("symbol name must not be empty"));
        }
        if dim == 0 {
            return Err(OcpError::invalid_model(format!(
                "symbol '{name}' must have dimension >= 1"
            )));
        }
        if self.symbols.iter().any(|s| s.name == name) {
            return Err(OcpError::invalid_model(format!(
                "symbol '{name}' is already declared"
            )));
        }
        let symbol = Symbol {
            id: SymbolId(self.symbols.len() as u32),
            name: name.to_string(),
            kind,
            dim,
        };
        self.symbols.push(symbol.clone());
        Ok(symbol)
    }

    /// The expression `[s_0, ..., s_{dim-1}]` for a declared symbol.
    pub fn variable(&mut self, symbol: &Symbol) -> Expression {
        let nodes = (0..symbol.dim)
            .map(|component| {
                self.intern(Node::Variable {
                    symbol: symbol.id,
                    component: component as u32,
                })
            })
            .collect();
        Expression { nodes }
    }

    /// The time derivative placeholder `dot(s)` of a differential state.
    pub fn time_derivative(&mut self, symbol: &Symbol) -> Result<Expression> {
        if symbol.kind != SymbolKind::DifferentialState {
            return Err(OcpError::invalid_model(format!(
                "dot() is only defined for differential states, '{}' is a {:?}",
                symbol.name, symbol.kind
            )));
        }
        let nodes = (0..symbol.dim)
            .map(|component| {
                self.intern(Node::TimeDerivative {
                    symbol: symbol.id,
                    component: component as u32,
                })
            })
            .collect();
        Ok(Expression { nodes })
    }

    pub fn constant(&mut self, value: f64) -> Expression {
        Expression {
            nodes: vec![self.constant_id(value)],
        }
    }

    pub fn constant_id(&mut self, value: f64) -> ExprId {
        self.intern(Node::constant(value))
    }

    /// Builds a new expression from `op` and its operands.
    ///
    /// Binary operators work elementwise on equal dimensions, or broadcast a
    /// scalar operand against a vector one.
    pub fn combine(&mut self, op: Op, operands: &[&Expression]) -> Result<Expression> {
        if operands.len() != op.arity() {
            return Err(OcpError::dimension(
                format!("operand count of {op:?}"),
                op.arity(),
                operands.len(),
            ));
        }
        match op {
            Op::Unary(unary) => {
                let nodes = operands[0]
                    .nodes
                    .iter()
                    .map(|&a| self.unary(unary, a))
                    .collect();
                Ok(Expression { nodes })
            }
            Op::Binary(binary) => {
                let (lhs, rhs) = (operands[0], operands[1]);
                let dim = broadcast_dim(binary, lhs.dim(), rhs.dim())?;
                let nodes = (0..dim)
                    .map(|i| {
                        let a = lhs.nodes[if lhs.dim() == 1 { 0 } else { i }];
                        let b = rhs.nodes[if rhs.dim() == 1 { 0 } else { i }];
                        self.binary(binary, a, b)
                    })
                    .collect();
                Ok(Expression { nodes })
            }
        }
    }

    pub fn add(&mut self, a: &Expression, b: &Expression) -> Result<Expression> {
        self.combine(Op::Binary(BinaryOp::Add), &[a, b])
    }

    pub fn sub(&mut self, a: &Expression, b: &Expression) -> Result<Expression> {
        self.combine(Op::Binary(BinaryOp::Sub), &[a, b])
    }

    pub fn mul(&mut self, a: &Expression, b: &Expression) -> Result<Expression> {
        self.combine(Op::Binary(BinaryOp::Mul), &[a, b])
    }

    pub fn div(&mut self, a: &Expression, b: &Expression) -> Result<Expression> {
        self.combine(Op::Binary(BinaryOp::Div), &[a, b])
    }

    pub fn pow(&mut self, a: &Expression, b: &Expression) -> Result<Expression> {
        self.combine(Op::Binary(BinaryOp::Pow), &[a, b])
    }

    pub fn apply(&mut self, op: UnaryOp, a: &Expression) -> Expression {
        let nodes = a.nodes.iter().map(|&id| self.unary(op, id)).collect();
        Expression { nodes }
    }

    pub fn neg(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Neg, a)
    }
    pub fn sin(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Sin, a)
    }
    pub fn cos(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Cos, a)
    }
    pub fn tan(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Tan, a)
    }
    pub fn exp(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Exp, a)
    }
    pub fn log(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Log, a)
    }
    pub fn sqrt(&mut self, a: &Expression) -> Expression {
        self.apply(UnaryOp::Sqrt, a)
    }

    /// `c * a` for a numeric coefficient.
    pub fn scale(&mut self, c: f64, a: &Expression) -> Expression {
        let k = self.constant_id(c);
        let nodes = a
            .nodes
            .iter()
            .map(|&id| self.binary(BinaryOp::Mul, k, id))
            .collect();
        Expression { nodes }
    }

    /// Vertical concatenation.
    pub fn stack(&self, parts: &[&Expression]) -> Expression {
        Expression {
            nodes: parts.iter().flat_map(|p| p.nodes.iter().copied()).collect(),
        }
    }

    pub fn component(&self, expr: &Expression, index: usize) -> Result<Expression> {
        expr.get(index)
            .map(|id| Expression { nodes: vec![id] })
            .ok_or_else(|| OcpError::dimension("component index", expr.dim(), index))
    }

    pub(crate) fn binary(&mut self, op: BinaryOp, a: ExprId, b: ExprId) -> ExprId {
        let ca = self.node(a).constant_value();
        let cb = self.node(b).constant_value();
        if let (Some(x), Some(y)) = (ca, cb) {
            return self.constant_id(op.apply(x, y));
        }
        match op {
            BinaryOp::Add => {
                if ca == Some(0.0) {
                    return b;
                }
                if cb == Some(0.0) {
                    return a;
                }
            }
            BinaryOp::Sub => {
                if cb == Some(0.0) {
                    return a;
                }
                if ca == Some(0.0) {
                    return self.unary(UnaryOp::Neg, b);
                }
                if a == b {
                    return self.constant_id(0.0);
                }
            }
            BinaryOp::Mul => {
                if ca == Some(0.0) || cb == Some(0.0) {
                    return self.constant_id(0.0);
                }
                if ca == Some(1.0) {
                    return b;
                }
                if cb == Some(1.0) {
                    return a;
                }
                if ca == Some(-1.0) {
                    return self.unary(UnaryOp::Neg, b);
                }
                if cb == Some(-1.0) {
                    return self.unary(UnaryOp::Neg, a);
                }
            }
            BinaryOp::Div => {
                if cb == Some(1.0) {
                    return a;
                }
                if ca == Some(0.0) {
                    return self.constant_id(0.0);
                }
            }
            BinaryOp::Pow => {
                if cb == Some(1.0) {
                    return a;
                }
                if cb == Some(0.0) {
                    return self.constant_id(1.0);
                }
            }
        }
        let (a, b) = if op.is_commutative() && b < a {
            (b, a)
        } else {
            (a, b)
        };
        self.intern(Node::Binary(op, a, b))
    }

    pub(crate) fn unary(&mut self, op: UnaryOp, a: ExprId) -> ExprId {
        let node = *self.node(a);
        if let Some(value) = node.constant_value() {
            return self.constant_id(op.apply(value));
        }
        if op == UnaryOp::Neg {
            if let Node::Unary(UnaryOp::Neg, inner) = node {
                return inner;
            }
        }
        self.intern(Node::Unary(op, a))
    }

    fn intern(&mut self, node: Node) -> ExprId {
        if let Some(&id) = self.interned.get(&node) {
            return id;
        }
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.interned.insert(node, id);
        id
    }

    /// Symbolic derivative of `id` with respect to the leaf `wrt`.
    ///
    /// Results are memoized per `(node, wrt)` pair, so shared subexpressions
    /// are differentiated once.
    pub fn differentiate(&mut self, id: ExprId, wrt: ExprId) -> Result<ExprId> {
        if !self.node(wrt).is_leaf_variable() {
            return Err(OcpError::invalid_model(
                "derivatives can only be taken with respect to a symbol component",
            ));
        }
        Ok(self.derivative(id, wrt))
    }

    fn derivative(&mut self, id: ExprId, wrt: ExprId) -> ExprId {
        if let Some(&d) = self.derivatives.get(&(id, wrt)) {
            return d;
        }
        let d = match *self.node(id) {
            Node::Constant(_) => self.constant_id(0.0),
            Node::Variable { .. } | Node::TimeDerivative { .. } => {
                self.constant_id(if id == wrt { 1.0 } else { 0.0 })
            }
            Node::Binary(op, a, b) => {
                let da = self.derivative(a, wrt);
                let db = self.derivative(b, wrt);
                match op {
                    BinaryOp::Add => self.binary(BinaryOp::Add, da, db),
                    BinaryOp::Sub => self.binary(BinaryOp::Sub, da, db),
                    BinaryOp::Mul => {
                        let left = self.binary(BinaryOp::Mul, da, b);
                        let right = self.binary(BinaryOp::Mul, a, db);
                        self.binary(BinaryOp::Add, left, right)
                    }
                    BinaryOp::Div => {
                        let first = self.binary(BinaryOp::Div, da, b);
                        let num = self.binary(BinaryOp::Mul, a, db);
                        let den = self.binary(BinaryOp::Mul, b, b);
                        let second = self.binary(BinaryOp::Div, num, den);
                        self.binary(BinaryOp::Sub, first, second)
                    }
                    BinaryOp::Pow => self.power_derivative(id, a, b, da, db),
                }
            }
            Node::Unary(op, a) => {
                let da = self.derivative(a, wrt);
                let slope = match op {
                    UnaryOp::Neg => self.constant_id(-1.0),
                    UnaryOp::Sin => self.unary(UnaryOp::Cos, a),
                    UnaryOp::Cos => {
                        let s = self.unary(UnaryOp::Sin, a);
                        self.unary(UnaryOp::Neg, s)
                    }
                    UnaryOp::Tan => {
                        let one = self.constant_id(1.0);
                        let sq = self.binary(BinaryOp::Mul, id, id);
                        self.binary(BinaryOp::Add, one, sq)
                    }
                    UnaryOp::Exp => id,
                    UnaryOp::Log => {
                        let one = self.constant_id(1.0);
                        self.binary(BinaryOp::Div, one, a)
                    }
                    UnaryOp::Sqrt => {
                        let half = self.constant_id(0.5);
                        self.binary(BinaryOp::Div, half, id)
                    }
                };
                self.binary(BinaryOp::Mul, slope, da)
            }
        };
        self.derivatives.insert((id, wrt), d);
        d
    }

    fn power_derivative(&mut self, id: ExprId, a: ExprId, b: ExprId, da: ExprId, db: ExprId) -> ExprId {
        if let Some(exponent) = self.node(b).constant_value() {
            // d(a^c) = c * a^(c-1) * da
            let c = self.constant_id(exponent);
            let reduced = self.constant_id(exponent - 1.0);
            let power = self.binary(BinaryOp::Pow, a, reduced);
            let slope = self.binary(BinaryOp::Mul, c, power);
            return self.binary(BinaryOp::Mul, slope, da);
        }
        // d(a^b) = a^b * (db * ln(a) + b * da / a)
        let ln_a = self.unary(UnaryOp::Log, a);
        let first = self.binary(BinaryOp::Mul, db, ln_a);
        let b_da = self.binary(BinaryOp::Mul, b, da);
        let second = self.binary(BinaryOp::Div, b_da, a);
        let sum = self.binary(BinaryOp::Add, first, second);
        self.binary(BinaryOp::Mul, id, sum)
    }

    /// Row-major Jacobian of `outputs` with respect to the leaves `wrt`.
    pub fn jacobian(&mut self, outputs: &Expression, wrt: &[ExprId]) -> Result<Vec<ExprId>> {
        let mut entries = Vec::with_capacity(outputs.dim() * wrt.len());
        for &row in &outputs.nodes {
            for &col in wrt {
                entries.push(self.differentiate(row, col)?);
            }
        }
        Ok(entries)
    }

    /// All nodes reachable from `roots`, children before parents.
    pub fn topological_order(&self, roots: &[ExprId]) -> Vec<ExprId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<ExprId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            match *self.node(id) {
                Node::Binary(_, a, b) => {
                    stack.push(a);
                    stack.push(b);
                }
                Node::Unary(_, a) => stack.push(a),
                _ => {}
            }
        }
        let mut order: Vec<ExprId> = seen.into_iter().collect();
        order.sort_unstable();
        order
    }

    /// Symbols referenced (as values or time derivatives) by `expr`.
    pub fn referenced_symbols(&self, expr: &Expression) -> HashSet<SymbolId> {
        self.topological_order(&expr.nodes)
            .into_iter()
            .filter_map(|id| match *self.node(id) {
                Node::Variable { symbol, .. } | Node::TimeDerivative { symbol, .. } => Some(symbol),
                _ => None,
            })
            .collect()
    }

    pub fn depends_on_kind(&self, expr: &Expression, kind: SymbolKind) -> bool {
        self.referenced_symbols(expr)
            .into_iter()
            .any(|s| self.symbol(s).kind == kind)
    }

    pub fn contains_time_derivative(&self, expr: &Expression) -> bool {
        self.topological_order(&expr.nodes)
            .into_iter()
            .any(|id| matches!(self.node(id), Node::TimeDerivative { .. }))
    }

    /// Human-readable rendering, used in diagnostics.
    pub fn render(&self, id: ExprId) -> String {
        match *self.node(id) {
            Node::Constant(bits) => format!("{:?}", f64::from_bits(bits)),
            Node::Variable { symbol, component } => {
                self.component_name(symbol, component as usize, false)
            }
            Node::TimeDerivative { symbol, component } => {
                self.component_name(symbol, component as usize, true)
            }
            Node::Binary(op, a, b) => {
                let sym = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Pow => "^",
                };
                format!("({} {} {})", self.render(a), sym, self.render(b))
            }
            Node::Unary(UnaryOp::Neg, a) => format!("-{}", self.render(a)),
            Node::Unary(op, a) => {
                format!("{}({})", format!("{op:?}").to_lowercase(), self.render(a))
            }
        }
    }

    pub(crate) fn component_name(&self, symbol: SymbolId, component: usize, dotted: bool) -> String {
        let s = self.symbol(symbol);
        let base = if s.dim == 1 {
            s.name.clone()
        } else {
            format!("{}[{}]", s.name, component)
        };
        if dotted {
            format!("dot({base})")
        } else {
            base
        }
    }
}

fn broadcast_dim(op: BinaryOp, a: usize, b: usize) -> Result<usize> {
    if a == 0 || b == 0 {
        return Err(OcpError::dimension(
            format!("operands of {op:?}"),
            a.max(b).max(1),
            a.min(b),
        ));
    }
    if a == b || b == 1 {
        Ok(a)
    } else if a == 1 {
        Ok(b)
    } else {
        Err(OcpError::dimension(format!("operands of {op:?}"), a, b))
    }
}
