use nalgebra::linalg::SymmetricEigen;
use nalgebra::DMatrix;
use serde::Serialize;

use crate::error::{OcpError, Result};
use crate::expression::{ExprId, Expression, SymbolKind};
use crate::model::{CompiledFunction, DifferentialModel, OdeModel, Wrt};

/// Constraint accepted by [`Ocp::subject_to`].
pub enum Constraint {
    /// Attaches the dynamics; the model is finalized on attachment.
    Dynamics(DifferentialModel),
    /// `lower <= expr <= upper`, applied componentwise on every stage.
    Bounds {
        lower: f64,
        expr: Expression,
        upper: f64,
    },
}

impl Constraint {
    pub fn dynamics(model: DifferentialModel) -> Self {
        Constraint::Dynamics(model)
    }

    pub fn bounds(lower: f64, expr: &Expression, upper: f64) -> Self {
        Constraint::Bounds {
            lower,
            expr: expr.clone(),
            upper,
        }
    }
}

/// A constraint row that is a plain bound on one state or control component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundTarget {
    State(usize),
    Control(usize),
}

/// Metadata of one scalar constraint row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintRow {
    pub label: String,
    pub lower: f64,
    pub upper: f64,
    /// The row does not depend on controls.
    pub state_only: bool,
    pub target: Option<BoundTarget>,
}

struct LsqTerm {
    weight: DMatrix<f64>,
    output: Expression,
}

struct BoundRow {
    id: ExprId,
    lower: f64,
    upper: f64,
}

/// Optimal control problem on `[t0, tf]` with a uniform grid of `horizon` intervals.
pub struct Ocp {
    t0: f64,
    tf: f64,
    horizon: usize,
    model: Option<OdeModel>,
    stage_cost: Option<LsqTerm>,
    terminal_cost: Option<LsqTerm>,
    bounds: Vec<BoundRow>,
}

impl Ocp {
    pub fn new(t0: f64, tf: f64, horizon: usize) -> Result<Self> {
        if horizon == 0 {
            return Err(OcpError::invalid_model("horizon must have at least one interval"));
        }
        if !(t0.is_finite() && tf.is_finite() && tf > t0) {
            return Err(OcpError::invalid_model(format!(
                "time horizon [{t0}, {tf}] is empty or not finite"
            )));
        }
        Ok(Self {
            t0,
            tf,
            horizon,
            model: None,
            stage_cost: None,
            terminal_cost: None,
            bounds: Vec::new(),
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn stage_duration(&self) -> f64 {
        (self.tf - self.t0) / self.horizon as f64
    }

    pub fn model(&self) -> Option<&OdeModel> {
        self.model.as_ref()
    }

    pub fn subject_to(&mut self, constraint: Constraint) -> Result<()> {
        match constraint {
            Constraint::Dynamics(model) => {
                if self.model.is_some() {
                    return Err(OcpError::invalid_model("dynamics are already attached"));
                }
                self.model = Some(model.finalize()?);
            }
            Constraint::Bounds { lower, expr, upper } => {
                if lower.is_nan() || upper.is_nan() || lower > upper {
                    return Err(OcpError::invalid_model(format!(
                        "bounds [{lower}, {upper}] are empty"
                    )));
                }
                let model = self.require_model("constraints")?;
                if expr.dim() == 0 {
                    return Err(OcpError::invalid_model("constraint expression is empty"));
                }
                if model.graph().contains_time_derivative(&expr) {
                    return Err(OcpError::invalid_model(
                        "constraints may not contain time derivatives",
                    ));
                }
                self.bounds
                    .extend(expr.ids().iter().map(|&id| BoundRow { id, lower, upper }));
            }
        }
        Ok(())
    }

    /// Adds the stage term `Σ_k ‖h(x_k, u_k) - y_k‖²_W`.
    pub fn minimize_lsq(&mut self, weight: DMatrix<f64>, output: &Expression) -> Result<()> {
        validate_weight(&weight, output.dim(), "stage least-squares")?;
        self.check_output(output, "stage least-squares")?;
        self.stage_cost = Some(LsqTerm {
            weight,
            output: output.clone(),
        });
        Ok(())
    }

    /// Adds the terminal term `‖h_N(x_N) - y_N‖²_{W_N}`. `h_N` may not depend on controls.
    pub fn minimize_lsq_end_term(&mut self, weight: DMatrix<f64>, output: &Expression) -> Result<()> {
        validate_weight(&weight, output.dim(), "terminal least-squares")?;
        self.check_output(output, "terminal least-squares")?;
        let model = self.require_model("terminal least-squares")?;
        if model.graph().depends_on_kind(output, SymbolKind::Control) {
            return Err(OcpError::invalid_model(
                "terminal least-squares term may not depend on controls",
            ));
        }
        self.terminal_cost = Some(LsqTerm {
            weight,
            output: output.clone(),
        });
        Ok(())
    }

    fn require_model(&self, what: &str) -> Result<&OdeModel> {
        self.model.as_ref().ok_or_else(|| {
            OcpError::invalid_model(format!("attach the dynamics before adding {what}"))
        })
    }

    fn check_output(&self, output: &Expression, what: &str) -> Result<()> {
        let model = self.require_model(what)?;
        if output.dim() == 0 {
            return Err(OcpError::invalid_model(format!("{what} output is empty")));
        }
        if model.graph().contains_time_derivative(output) {
            return Err(OcpError::invalid_model(format!(
                "{what} output may not contain time derivatives"
            )));
        }
        Ok(())
    }

    /// Compiles every stage function into a structured NLP.
    pub fn finalize(self) -> Result<StructuredNlp> {
        let mut model = self
            .model
            .ok_or_else(|| OcpError::invalid_model("no dynamics attached"))?;
        if model.nu() == 0 {
            return Err(OcpError::invalid_model("at least one control is required"));
        }
        let stage = self
            .stage_cost
            .ok_or_else(|| OcpError::invalid_model("stage least-squares term is missing"))?;
        let (terminal_weight, terminal_output) = match self.terminal_cost {
            Some(term) => (term.weight, term.output),
            None => (DMatrix::zeros(0, 0), Expression::from_ids(Vec::new())),
        };

        let stage_cost = model.compile_function(&stage.output)?;
        let terminal_cost = model.compile_function(&terminal_output)?;

        let mut path_rows = Vec::with_capacity(self.bounds.len());
        for row in &self.bounds {
            let single = Expression::from_ids(vec![row.id]);
            let state_only = !model.graph().depends_on_kind(&single, SymbolKind::Control);
            let target = model
                .leaf_position(row.id)
                .map(|(wrt, index)| match wrt {
                    Wrt::States => BoundTarget::State(index),
                    Wrt::Controls => BoundTarget::Control(index),
                });
            path_rows.push(ConstraintRow {
                label: model.graph().render(row.id),
                lower: row.lower,
                upper: row.upper,
                state_only,
                target,
            });
        }
        let path_expr = Expression::from_ids(self.bounds.iter().map(|r| r.id).collect());
        let path = model.compile_function(&path_expr)?;

        let terminal_ids: Vec<ExprId> = self
            .bounds
            .iter()
            .zip(&path_rows)
            .filter(|(_, meta)| meta.state_only)
            .map(|(row, _)| row.id)
            .collect();
        let terminal_rows: Vec<ConstraintRow> = path_rows
            .iter()
            .filter(|meta| meta.state_only)
            .cloned()
            .collect();
        let terminal = model.compile_function(&Expression::from_ids(terminal_ids))?;

        tracing::debug!(
            horizon = self.horizon,
            ny = stage_cost.dim(),
            nyn = terminal_cost.dim(),
            path_constraints = path.dim(),
            terminal_constraints = terminal.dim(),
            "finalized optimal control problem"
        );

        Ok(StructuredNlp {
            model,
            t0: self.t0,
            tf: self.tf,
            horizon: self.horizon,
            stage_cost,
            stage_weight: stage.weight,
            terminal_cost,
            terminal_weight,
            path,
            path_rows,
            terminal,
            terminal_rows,
        })
    }
}

pub(crate) fn validate_weight(weight: &DMatrix<f64>, dim: usize, context: &str) -> Result<()> {
    if weight.nrows() != dim {
        return Err(OcpError::dimension(format!("{context} weight rows"), dim, weight.nrows()));
    }
    if weight.ncols() != dim {
        return Err(OcpError::dimension(format!("{context} weight columns"), dim, weight.ncols()));
    }
    if weight.iter().any(|v| !v.is_finite()) {
        return Err(OcpError::InvalidWeight(format!(
            "{context} weight has non-finite entries"
        )));
    }
    if dim == 0 {
        return Ok(());
    }
    let scale = 1.0 + weight.amax();
    if (weight - weight.transpose()).amax() > 1e-9 * scale {
        return Err(OcpError::InvalidWeight(format!("{context} weight is not symmetric")));
    }
    let smallest = SymmetricEigen::new(weight.clone()).eigenvalues.min();
    if smallest < -1e-9 * scale {
        return Err(OcpError::InvalidWeight(format!(
            "{context} weight is not positive semi-definite (smallest eigenvalue {smallest:e})"
        )));
    }
    Ok(())
}

/// Problem dimensions, as reported by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub horizon: usize,
    pub nx: usize,
    pub nu: usize,
    pub nd: usize,
    pub ny: usize,
    pub nyn: usize,
    pub path_constraints: usize,
    pub terminal_constraints: usize,
}

/// Finalized OCP with compiled stage functions, ready for discretization.
#[derive(Debug, Clone)]
pub struct StructuredNlp {
    model: OdeModel,
    t0: f64,
    tf: f64,
    horizon: usize,
    stage_cost: CompiledFunction,
    stage_weight: DMatrix<f64>,
    terminal_cost: CompiledFunction,
    terminal_weight: DMatrix<f64>,
    path: CompiledFunction,
    path_rows: Vec<ConstraintRow>,
    terminal: CompiledFunction,
    terminal_rows: Vec<ConstraintRow>,
}

impl StructuredNlp {
    pub fn model(&self) -> &OdeModel {
        &self.model
    }
    pub fn horizon(&self) -> usize {
        self.horizon
    }
    pub fn start_time(&self) -> f64 {
        self.t0
    }
    pub fn end_time(&self) -> f64 {
        self.tf
    }
    pub fn stage_duration(&self) -> f64 {
        (self.tf - self.t0) / self.horizon as f64
    }
    pub fn stage_cost(&self) -> &CompiledFunction {
        &self.stage_cost
    }
    pub fn stage_weight(&self) -> &DMatrix<f64> {
        &self.stage_weight
    }
    pub fn terminal_cost(&self) -> &CompiledFunction {
        &self.terminal_cost
    }
    pub fn terminal_weight(&self) -> &DMatrix<f64> {
        &self.terminal_weight
    }
    pub fn path_constraints(&self) -> &CompiledFunction {
        &self.path
    }
    pub fn path_rows(&self) -> &[ConstraintRow] {
        &self.path_rows
    }
    pub fn terminal_constraints(&self) -> &CompiledFunction {
        &self.terminal
    }
    pub fn terminal_rows(&self) -> &[ConstraintRow] {
        &self.terminal_rows
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            horizon: self.horizon,
            nx: self.model.nx(),
            nu: self.model.nu(),
            nd: self.model.nd(),
            ny: self.stage_cost.dim(),
            nyn: self.terminal_cost.dim(),
            path_constraints: self.path.dim(),
            terminal_constraints: self.terminal.dim(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::tests::getting_started_model;

    /// The getting-started OCP: N intervals of `ts`, 0 <= u <= 1, -5 <= dx <= 0.
    pub(crate) fn getting_started_ocp(horizon: usize, ts: f64) -> Ocp {
        let (mut model, x, dx, u) = getting_started_model();
        let xe = model.variable(&x);
        let dxe = model.variable(&dx);
        let ue = model.variable(&u);
        let g = model.graph_mut();
        let h = g.stack(&[&xe, &dxe, &ue]);
        let hn = g.stack(&[&xe, &dxe]);

        let mut ocp = Ocp::new(0.0, horizon as f64 * ts, horizon).unwrap();
        ocp.subject_to(Constraint::dynamics(model)).unwrap();
        ocp.minimize_lsq(DMatrix::identity(3, 3), &h).unwrap();
        ocp.minimize_lsq_end_term(DMatrix::identity(2, 2), &hn).unwrap();
        ocp.subject_to(Constraint::bounds(0.0, &ue, 1.0)).unwrap();
        ocp.subject_to(Constraint::bounds(-5.0, &dxe, 0.0)).unwrap();
        ocp
    }

    fn ocp_with_outputs() -> (Ocp, Expression, Expression) {
        let (mut model, x, dx, u) = getting_started_model();
        let xe = model.variable(&x);
        let dxe = model.variable(&dx);
        let ue = model.variable(&u);
        let g = model.graph_mut();
        let h = g.stack(&[&xe, &dxe, &ue]);
        let hu = g.stack(&[&xe, &ue]);
        let mut ocp = Ocp::new(0.0, 1.0, 10).unwrap();
        ocp.subject_to(Constraint::dynamics(model)).unwrap();
        (ocp, h, hu)
    }

    #[test]
    fn finalize_reports_dimensions_and_bound_targets() {
        let nlp = getting_started_ocp(10, 0.1).finalize().unwrap();
        let dims = nlp.dimensions();
        assert_eq!(
            dims,
            Dimensions {
                horizon: 10,
                nx: 2,
                nu: 1,
                nd: 0,
                ny: 3,
                nyn: 2,
                path_constraints: 2,
                terminal_constraints: 1,
            }
        );
        assert_eq!(nlp.path_rows()[0].target, Some(BoundTarget::Control(0)));
        assert!(!nlp.path_rows()[0].state_only);
        assert_eq!(nlp.path_rows()[1].target, Some(BoundTarget::State(1)));
        assert_eq!(nlp.terminal_rows()[0].label, "dx");
        assert!((nlp.stage_duration() - 0.1).abs() < 1e-15);
    }

    #[test]
    fn weight_dimension_mismatch_is_rejected() {
        let (mut ocp, h, _) = ocp_with_outputs();
        for (rows, cols) in [(2, 2), (3, 2), (4, 4)] {
            let err = ocp.minimize_lsq(DMatrix::identity(rows, cols), &h).unwrap_err();
            assert!(
                matches!(err, OcpError::DimensionMismatch { expected: 3, .. }),
                "{rows}x{cols}: {err}"
            );
        }
    }

    #[test]
    fn weights_must_be_symmetric_psd() {
        let (mut ocp, h, _) = ocp_with_outputs();
        let mut skew = DMatrix::identity(3, 3);
        skew[(0, 1)] = 0.5;
        assert!(matches!(
            ocp.minimize_lsq(skew, &h),
            Err(OcpError::InvalidWeight(_))
        ));
        let indefinite = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, -1.0, 1.0]));
        assert!(matches!(
            ocp.minimize_lsq(indefinite, &h),
            Err(OcpError::InvalidWeight(_))
        ));
        let semidefinite = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 0.0, 1.0]));
        ocp.minimize_lsq(semidefinite, &h).unwrap();
    }

    #[test]
    fn terminal_term_may_not_use_controls() {
        let (mut ocp, _, hu) = ocp_with_outputs();
        assert!(matches!(
            ocp.minimize_lsq_end_term(DMatrix::identity(2, 2), &hu),
            Err(OcpError::InvalidModel(_))
        ));
    }

    #[test]
    fn costs_need_dynamics_first() {
        let (mut model, x, ..) = getting_started_model();
        let xe = model.variable(&x);
        let mut ocp = Ocp::new(0.0, 1.0, 10).unwrap();
        assert!(matches!(
            ocp.minimize_lsq(DMatrix::identity(1, 1), &xe),
            Err(OcpError::InvalidModel(_))
        ));
        assert!(matches!(
            ocp.subject_to(Constraint::bounds(1.0, &xe, 0.0)),
            Err(OcpError::InvalidModel(_))
        ));
    }

    #[test]
    fn missing_stage_cost_fails_finalize() {
        let (ocp, ..) = ocp_with_outputs();
        assert!(matches!(ocp.finalize(), Err(OcpError::InvalidModel(_))));
    }

    #[test]
    fn invalid_horizons_are_rejected() {
        assert!(Ocp::new(0.0, 1.0, 0).is_err());
        assert!(Ocp::new(1.0, 1.0, 10).is_err());
    }
}
