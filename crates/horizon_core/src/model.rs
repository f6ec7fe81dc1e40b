use nalgebra::{DMatrix, DVector};

use crate::autodiff::{forward_jacobian, Seed};
use crate::equation_engine::{Bytecode, Compiler, VM};
use crate::error::{OcpError, Result};
use crate::expression::{ExprGraph, ExprId, Expression, Node, Symbol, SymbolId, SymbolKind};
use crate::traits::{DynamicalSystem, Linearize, Scalar};

/// Which block of a Jacobian to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrt {
    States,
    Controls,
}

/// Dense row-major matrix of expression nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprMatrix {
    pub rows: usize,
    pub cols: usize,
    pub entries: Vec<ExprId>,
}

impl ExprMatrix {
    pub fn get(&self, row: usize, col: usize) -> ExprId {
        self.entries[row * self.cols + col]
    }
}

/// A set of differential equations `dot(x) = f(x, u, d)` under construction.
#[derive(Debug, Clone, Default)]
pub struct DifferentialModel {
    graph: ExprGraph,
    equations: Vec<(ExprId, ExprId)>,
}

impl DifferentialModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    /// Mutable access for building expressions with the graph operators.
    pub fn graph_mut(&mut self) -> &mut ExprGraph {
        &mut self.graph
    }

    pub fn declare_state(&mut self, name: &str, dim: usize) -> Result<Symbol> {
        self.graph.declare_symbol(name, SymbolKind::DifferentialState, dim)
    }

    pub fn declare_control(&mut self, name: &str, dim: usize) -> Result<Symbol> {
        self.graph.declare_symbol(name, SymbolKind::Control, dim)
    }

    pub fn declare_disturbance(&mut self, name: &str, dim: usize) -> Result<Symbol> {
        self.graph.declare_symbol(name, SymbolKind::Disturbance, dim)
    }

    pub fn variable(&mut self, symbol: &Symbol) -> Expression {
        self.graph.variable(symbol)
    }

    pub fn dot(&mut self, symbol: &Symbol) -> Result<Expression> {
        self.graph.time_derivative(symbol)
    }

    /// Appends `lhs == rhs`, where `lhs` is made of `dot(state)` components.
    pub fn add_equation(&mut self, lhs: &Expression, rhs: &Expression) -> Result<()> {
        if lhs.dim() != rhs.dim() {
            return Err(OcpError::dimension("equation sides", lhs.dim(), rhs.dim()));
        }
        if self.graph.contains_time_derivative(rhs) {
            return Err(OcpError::invalid_model(
                "only explicit ODEs are supported: dot() may not appear on the right-hand side",
            ));
        }
        for (i, &id) in lhs.ids().iter().enumerate() {
            let Node::TimeDerivative { symbol, component } = *self.graph.node(id) else {
                return Err(OcpError::invalid_model(format!(
                    "left-hand side '{}' is not the time derivative of a state",
                    self.graph.render(id)
                )));
            };
            let repeated = lhs.ids()[..i].contains(&id);
            if repeated || self.equations.iter().any(|&(l, _)| l == id) {
                return Err(OcpError::invalid_model(format!(
                    "{} is already defined",
                    self.graph.component_name(symbol, component as usize, true)
                )));
            }
        }
        self.equations
            .extend(lhs.ids().iter().copied().zip(rhs.ids().iter().copied()));
        Ok(())
    }

    /// Checks the equation set and compiles the right-hand side and its Jacobians.
    pub fn finalize(mut self) -> Result<OdeModel> {
        let of_kind = |kind| -> Vec<Symbol> {
            self.graph
                .symbols()
                .iter()
                .filter(|s| s.kind() == kind)
                .cloned()
                .collect()
        };
        let states = of_kind(SymbolKind::DifferentialState);
        let controls = of_kind(SymbolKind::Control);
        let disturbances = of_kind(SymbolKind::Disturbance);

        let nx: usize = states.iter().map(Symbol::dim).sum();
        if nx == 0 {
            return Err(OcpError::invalid_model(
                "model declares no differential states",
            ));
        }

        let mut rhs = Vec::with_capacity(nx);
        let mut missing = Vec::new();
        let mut state_leaves = Vec::with_capacity(nx);
        for state in &states {
            let dots = self.graph.time_derivative(state)?;
            let values = self.graph.variable(state);
            state_leaves.extend_from_slice(values.ids());
            for (component, dot) in dots.ids().iter().enumerate() {
                match self.equations.iter().find(|(lhs, _)| lhs == dot) {
                    Some(&(_, f)) => rhs.push(f),
                    None => missing.push(self.graph.component_name(state.id(), component, true)),
                }
            }
        }
        if !missing.is_empty() {
            return Err(OcpError::UnderdeterminedModel {
                states: nx,
                equations: self.equations.len(),
                missing,
            });
        }

        let mut control_leaves = Vec::new();
        for control in &controls {
            let values = self.graph.variable(control);
            control_leaves.extend_from_slice(values.ids());
        }

        let mut layout = Vec::new();
        let mut offset = 0;
        for symbol in states.iter().chain(&controls).chain(&disturbances) {
            layout.push((symbol.id(), offset));
            offset += symbol.dim();
        }

        let nu = control_leaves.len();
        let nd = offset - nx - nu;
        let rhs = Expression::from_ids(rhs);

        let mut model = OdeModel {
            graph: self.graph,
            states,
            controls,
            disturbances,
            nx,
            nu,
            nd,
            layout,
            state_leaves,
            control_leaves,
            rhs: rhs.clone(),
            jacobian_x: ExprMatrix {
                rows: 0,
                cols: 0,
                entries: Vec::new(),
            },
            jacobian_u: ExprMatrix {
                rows: 0,
                cols: 0,
                entries: Vec::new(),
            },
            dynamics: CompiledFunction::default(),
        };
        model.dynamics = model.compile_function(&rhs)?;
        model.jacobian_x = ExprMatrix {
            rows: nx,
            cols: nx,
            entries: model.dynamics.jx_entries.clone(),
        };
        model.jacobian_u = ExprMatrix {
            rows: nx,
            cols: nu,
            entries: model.dynamics.ju_entries.clone(),
        };
        tracing::debug!(
            nx,
            nu,
            nd,
            nodes = model.graph.len(),
            "finalized differential model"
        );
        Ok(model)
    }
}

/// A finalized explicit ODE with compiled evaluation programs.
#[derive(Debug, Clone)]
pub struct OdeModel {
    graph: ExprGraph,
    states: Vec<Symbol>,
    controls: Vec<Symbol>,
    disturbances: Vec<Symbol>,
    nx: usize,
    nu: usize,
    nd: usize,
    layout: Vec<(SymbolId, usize)>,
    state_leaves: Vec<ExprId>,
    control_leaves: Vec<ExprId>,
    rhs: Expression,
    jacobian_x: ExprMatrix,
    jacobian_u: ExprMatrix,
    dynamics: CompiledFunction,
}

impl OdeModel {
    pub fn nx(&self) -> usize {
        self.nx
    }
    pub fn nu(&self) -> usize {
        self.nu
    }
    pub fn nd(&self) -> usize {
        self.nd
    }
    pub fn states(&self) -> &[Symbol] {
        &self.states
    }
    pub fn controls(&self) -> &[Symbol] {
        &self.controls
    }
    pub fn disturbances(&self) -> &[Symbol] {
        &self.disturbances
    }
    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }
    pub fn rhs(&self) -> &Expression {
        &self.rhs
    }
    pub fn dynamics(&self) -> &CompiledFunction {
        &self.dynamics
    }

    /// Position of a state or control component in `x` or `u`.
    pub fn leaf_position(&self, id: ExprId) -> Option<(Wrt, usize)> {
        if let Some(i) = self.state_leaves.iter().position(|&l| l == id) {
            return Some((Wrt::States, i));
        }
        self.control_leaves
            .iter()
            .position(|&l| l == id)
            .map(|i| (Wrt::Controls, i))
    }

    /// Symbolic Jacobian of the right-hand side.
    pub fn jacobian(&self, wrt: Wrt) -> &ExprMatrix {
        match wrt {
            Wrt::States => &self.jacobian_x,
            Wrt::Controls => &self.jacobian_u,
        }
    }

    /// Evaluates `f(x, u)` with all disturbances at zero.
    pub fn evaluate(&self, x: &[f64], u: &[f64]) -> Result<DVector<f64>> {
        self.evaluate_with_disturbance(x, u, &vec![0.0; self.nd])
    }

    pub fn evaluate_with_disturbance(&self, x: &[f64], u: &[f64], d: &[f64]) -> Result<DVector<f64>> {
        self.check_inputs(x, u, d)?;
        Ok(self.dynamics.evaluate(x, u, d))
    }

    /// Evaluates the symbolic Jacobian at a point.
    pub fn jacobian_at(&self, wrt: Wrt, x: &[f64], u: &[f64]) -> Result<DMatrix<f64>> {
        let d = vec![0.0; self.nd];
        self.check_inputs(x, u, &d)?;
        let lin = self.dynamics.linearize(x, u, &d);
        Ok(match wrt {
            Wrt::States => lin.jx,
            Wrt::Controls => lin.ju,
        })
    }

    /// Jacobian by forward-mode dual numbers through the value program.
    pub fn forward_jacobian(&self, wrt: Wrt, x: &[f64], u: &[f64]) -> Result<DMatrix<f64>> {
        let d = vec![0.0; self.nd];
        self.check_inputs(x, u, &d)?;
        let seed = match wrt {
            Wrt::States => Seed::States,
            Wrt::Controls => Seed::Controls,
        };
        Ok(forward_jacobian(&self.view(&d), x, u, seed))
    }

    /// Gradient of `f_row` with respect to `[x; u]` by a reverse adjoint sweep.
    pub fn reverse_gradient(&self, row: usize, x: &[f64], u: &[f64]) -> Result<DVector<f64>> {
        if row >= self.nx {
            return Err(OcpError::dimension("right-hand side row", self.nx, row));
        }
        let d = vec![0.0; self.nd];
        self.check_inputs(x, u, &d)?;
        let inputs = flatten(x, u, &d);
        let mut slots = Vec::new();
        let grad = VM::gradient(&self.dynamics.value, &inputs, row, &mut slots);
        Ok(DVector::from_column_slice(&grad[..self.nx + self.nu]))
    }

    /// Binds a disturbance value so the model can be integrated.
    pub fn view<'a>(&'a self, disturbance: &'a [f64]) -> ModelView<'a> {
        ModelView {
            model: self,
            disturbance,
        }
    }

    /// Compiles a vector function of `(x, u, d)` together with its Jacobians.
    pub fn compile_function(&mut self, expr: &Expression) -> Result<CompiledFunction> {
        let jx_entries = self.graph.jacobian(expr, &self.state_leaves)?;
        let ju_entries = self.graph.jacobian(expr, &self.control_leaves)?;
        let compiler = Compiler::new(&self.graph, &self.layout, self.nx + self.nu + self.nd);
        let value = compiler.compile(expr.ids())?;
        let mut all = expr.ids().to_vec();
        all.extend_from_slice(&jx_entries);
        all.extend_from_slice(&ju_entries);
        let linearization = compiler.compile(&all)?;
        Ok(CompiledFunction {
            dim: expr.dim(),
            nx: self.nx,
            nu: self.nu,
            value,
            linearization,
            jx_entries,
            ju_entries,
        })
    }

    pub(crate) fn check_inputs(&self, x: &[f64], u: &[f64], d: &[f64]) -> Result<()> {
        if x.len() != self.nx {
            return Err(OcpError::dimension("state vector", self.nx, x.len()));
        }
        if u.len() != self.nu {
            return Err(OcpError::dimension("control vector", self.nu, u.len()));
        }
        if d.len() != self.nd {
            return Err(OcpError::dimension("disturbance vector", self.nd, d.len()));
        }
        Ok(())
    }
}

fn flatten<T: Copy>(x: &[T], u: &[T], d: &[T]) -> Vec<T> {
    let mut inputs = Vec::with_capacity(x.len() + u.len() + d.len());
    inputs.extend_from_slice(x);
    inputs.extend_from_slice(u);
    inputs.extend_from_slice(d);
    inputs
}

/// Value of a compiled function and its Jacobians at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionLinearization {
    pub value: DVector<f64>,
    pub jx: DMatrix<f64>,
    pub ju: DMatrix<f64>,
}

/// A vector function of `(x, u, d)` compiled to value and linearization programs.
#[derive(Debug, Clone, Default)]
pub struct CompiledFunction {
    dim: usize,
    nx: usize,
    nu: usize,
    value: Bytecode,
    /// Outputs `[value; vec(d/dx); vec(d/du)]`, Jacobians row-major.
    linearization: Bytecode,
    jx_entries: Vec<ExprId>,
    ju_entries: Vec<ExprId>,
}

impl CompiledFunction {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn value_program(&self) -> &Bytecode {
        &self.value
    }

    pub fn linearization_program(&self) -> &Bytecode {
        &self.linearization
    }

    /// Assumes input dimensions were checked by the caller.
    pub fn evaluate(&self, x: &[f64], u: &[f64], d: &[f64]) -> DVector<f64> {
        let mut out = DVector::zeros(self.dim);
        if self.dim == 0 {
            return out;
        }
        let mut slots = Vec::new();
        VM::execute(&self.value, &flatten(x, u, d), &mut slots, out.as_mut_slice());
        out
    }

    pub fn linearize(&self, x: &[f64], u: &[f64], d: &[f64]) -> FunctionLinearization {
        let (m, nx, nu) = (self.dim, self.nx, self.nu);
        let mut out = vec![0.0; m * (1 + nx + nu)];
        if m > 0 {
            let mut slots = Vec::new();
            VM::execute(&self.linearization, &flatten(x, u, d), &mut slots, &mut out);
        }
        FunctionLinearization {
            value: DVector::from_column_slice(&out[..m]),
            jx: DMatrix::from_row_slice(m, nx, &out[m..m + m * nx]),
            ju: DMatrix::from_row_slice(m, nu, &out[m + m * nx..]),
        }
    }
}

/// An [`OdeModel`] with its disturbance input held at a fixed value.
pub struct ModelView<'a> {
    model: &'a OdeModel,
    disturbance: &'a [f64],
}

impl<'a, T: Scalar> DynamicalSystem<T> for ModelView<'a> {
    fn state_dimension(&self) -> usize {
        self.model.nx
    }

    fn control_dimension(&self) -> usize {
        self.model.nu
    }

    fn apply(&self, x: &[T], u: &[T], out: &mut [T]) {
        let d: Vec<T> = self.disturbance.iter().map(|&v| T::constant(v)).collect();
        let mut slots = Vec::new();
        VM::execute(&self.model.dynamics.value, &flatten(x, u, &d), &mut slots, out);
    }
}

impl<'a> Linearize for ModelView<'a> {
    fn linearize(&self, x: &[f64], u: &[f64], f: &mut [f64], jx: &mut [f64], ju: &mut [f64]) {
        let dynamics = &self.model.dynamics;
        let (nx, nu) = (dynamics.nx, dynamics.nu);
        let mut out = vec![0.0; nx * (1 + nx + nu)];
        let mut slots = Vec::new();
        VM::execute(
            &dynamics.linearization,
            &flatten(x, u, self.disturbance),
            &mut slots,
            &mut out,
        );
        f.copy_from_slice(&out[..nx]);
        jx.copy_from_slice(&out[nx..nx + nx * nx]);
        ju.copy_from_slice(&out[nx + nx * nx..]);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::expression::UnaryOp;
    use approx::assert_relative_eq;

    /// The two-state linear plant used throughout the examples:
    /// dot(x) = -12.44 x + 0.7539 dx + 2 u, dot(dx) = -7.89 x
    pub(crate) fn getting_started_model() -> (DifferentialModel, Symbol, Symbol, Symbol) {
        let mut model = DifferentialModel::new();
        let x = model.declare_state("x", 1).unwrap();
        let dx = model.declare_state("dx", 1).unwrap();
        let u = model.declare_control("u", 1).unwrap();

        let xe = model.variable(&x);
        let dxe = model.variable(&dx);
        let ue = model.variable(&u);
        let g = model.graph_mut();
        let a = g.scale(-12.44, &xe);
        let b = g.scale(0.7539, &dxe);
        let c = g.scale(2.0, &ue);
        let ab = g.add(&a, &b).unwrap();
        let f0 = g.add(&ab, &c).unwrap();
        let f1 = g.scale(-7.89, &xe);

        let dot_x = model.dot(&x).unwrap();
        let dot_dx = model.dot(&dx).unwrap();
        model.add_equation(&dot_x, &f0).unwrap();
        model.add_equation(&dot_dx, &f1).unwrap();
        (model, x, dx, u)
    }

    #[test]
    fn linear_model_has_constant_jacobians() {
        let (model, ..) = getting_started_model();
        let ode = model.finalize().expect("model should finalize");
        assert_eq!(ode.nx(), 2);
        assert_eq!(ode.nu(), 1);

        let jx = ode.jacobian(Wrt::States);
        assert_eq!((jx.rows, jx.cols), (2, 2));
        let ju = ode.jacobian(Wrt::Controls);
        assert_eq!((ju.rows, ju.cols), (2, 1));
        assert_eq!(ode.graph().node(jx.get(0, 0)).constant_value(), Some(-12.44));
        assert_eq!(ode.graph().node(jx.get(1, 1)).constant_value(), Some(0.0));
        assert_eq!(ode.graph().node(ju.get(0, 0)).constant_value(), Some(2.0));

        let f = ode.evaluate(&[1.0, 2.0], &[0.5]).unwrap();
        assert_relative_eq!(f[0], -12.44 + 2.0 * 0.7539 + 1.0, epsilon = 1e-14);
        assert_relative_eq!(f[1], -7.89, epsilon = 1e-14);
    }

    #[test]
    fn nonlinear_jacobians_agree_across_modes() {
        let mut model = DifferentialModel::new();
        let p = model.declare_state("p", 2).unwrap();
        let u = model.declare_control("u", 1).unwrap();
        let pe = model.variable(&p);
        let ue = model.variable(&u);
        let g = model.graph_mut();
        let p0 = g.component(&pe, 0).unwrap();
        let p1 = g.component(&pe, 1).unwrap();
        let s = g.apply(UnaryOp::Sin, &p0);
        let e = g.apply(UnaryOp::Exp, &ue);
        let f0 = g.mul(&p1, &e).unwrap();
        let sp = g.mul(&s, &p1).unwrap();
        let f1 = g.sub(&sp, &ue).unwrap();
        let rhs = g.stack(&[&f0, &f1]);
        let lhs = model.dot(&p).unwrap();
        model.add_equation(&lhs, &rhs).unwrap();
        let ode = model.finalize().unwrap();

        let x = [0.7, -1.3];
        let u = [0.25];
        for wrt in [Wrt::States, Wrt::Controls] {
            let symbolic = ode.jacobian_at(wrt, &x, &u).unwrap();
            let forward = ode.forward_jacobian(wrt, &x, &u).unwrap();
            assert_relative_eq!(symbolic, forward, epsilon = 1e-12);
        }
        for row in 0..2 {
            let grad = ode.reverse_gradient(row, &x, &u).unwrap();
            let jx = ode.jacobian_at(Wrt::States, &x, &u).unwrap();
            let ju = ode.jacobian_at(Wrt::Controls, &x, &u).unwrap();
            assert_relative_eq!(grad[0], jx[(row, 0)], epsilon = 1e-12);
            assert_relative_eq!(grad[1], jx[(row, 1)], epsilon = 1e-12);
            assert_relative_eq!(grad[2], ju[(row, 0)], epsilon = 1e-12);
        }
    }

    #[test]
    fn missing_equations_are_reported() {
        let mut model = DifferentialModel::new();
        let x = model.declare_state("x", 1).unwrap();
        let v = model.declare_state("v", 1).unwrap();
        let ve = model.variable(&v);
        let dot_x = model.dot(&x).unwrap();
        model.add_equation(&dot_x, &ve).unwrap();

        match model.finalize() {
            Err(OcpError::UnderdeterminedModel {
                states,
                equations,
                missing,
            }) => {
                assert_eq!(states, 2);
                assert_eq!(equations, 1);
                assert_eq!(missing, vec!["dot(v)".to_string()]);
            }
            other => panic!("expected underdetermined model, got {other:?}"),
        }
    }

    #[test]
    fn malformed_equations_are_rejected() {
        let mut model = DifferentialModel::new();
        let x = model.declare_state("x", 1).unwrap();
        let xe = model.variable(&x);
        let dot_x = model.dot(&x).unwrap();

        assert!(matches!(
            model.add_equation(&xe, &xe),
            Err(OcpError::InvalidModel(_))
        ));
        assert!(matches!(
            model.add_equation(&dot_x, &dot_x),
            Err(OcpError::InvalidModel(_))
        ));
        model.add_equation(&dot_x, &xe).unwrap();
        assert!(matches!(
            model.add_equation(&dot_x, &xe),
            Err(OcpError::InvalidModel(_))
        ));
    }

    #[test]
    fn repeated_derivative_within_one_equation_is_rejected() {
        let mut model = DifferentialModel::new();
        let x = model.declare_state("x", 1).unwrap();
        let y = model.declare_state("y", 1).unwrap();
        model.declare_control("u", 1).unwrap();
        let xe = model.variable(&x);
        let dot_x = model.dot(&x).unwrap();
        let dot_y = model.dot(&y).unwrap();
        let g = model.graph_mut();
        let lhs = g.stack(&[&dot_x, &dot_x]);
        let twice = g.scale(2.0, &xe);
        let rhs = g.stack(&[&xe, &twice]);

        match model.add_equation(&lhs, &rhs) {
            Err(OcpError::InvalidModel(message)) => assert!(message.contains("already defined"), "{message}"),
            other => panic!("expected invalid model, got {other:?}"),
        }
        // nothing from the rejected equation was kept
        model.add_equation(&dot_x, &twice).unwrap();
        model.add_equation(&dot_y, &xe).unwrap();
        let ode = model.finalize().unwrap();
        let f = ode.evaluate(&[1.5, 0.0], &[0.0]).unwrap();
        assert_relative_eq!(f[0], 3.0);
        assert_relative_eq!(f[1], 1.5);
    }

    #[test]
    fn evaluate_checks_dimensions() {
        let (model, ..) = getting_started_model();
        let ode = model.finalize().unwrap();
        assert!(matches!(
            ode.evaluate(&[1.0], &[0.0]),
            Err(OcpError::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }
}
