//! Real-time iteration: one Gauss-Newton SQP step per sampling instant.
//!
//! The preparation step linearizes around the current nodes before the next state
//! measurement arrives; the feedback step only builds and solves the QP.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::condensing::{build_sparse_qp, condense, CondensedQp, SparseQp};
use crate::config::{Condensing, DiscretizationType, ExportConfig};
use crate::discretization::{Discretization, Linearization, Variables};
use crate::error::{OcpError, Result};
use crate::ocp::{validate_weight, StructuredNlp};
use crate::qp::{solve_structured, QpSolution};

/// Outcome of one feedback step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeedbackReport {
    pub qp_iterations: usize,
    pub kkt_tolerance: f64,
    /// Objective at the updated nodes.
    pub objective: f64,
}

pub struct RtiSolver {
    nlp: StructuredNlp,
    config: ExportConfig,
    discretization: Discretization,
    vars: Variables,
    linearization: Option<Linearization>,
    warm_start: Option<DVector<f64>>,
    kkt_tolerance: f64,
}

impl RtiSolver {
    pub fn new(nlp: StructuredNlp, config: ExportConfig) -> Result<Self> {
        config.validate(nlp.horizon())?;
        let discretization = Discretization::new(&nlp, &config)?;
        let vars = Variables::new(&nlp);
        Ok(Self {
            nlp,
            config,
            discretization,
            vars,
            linearization: None,
            warm_start: None,
            kkt_tolerance: f64::INFINITY,
        })
    }

    pub fn nlp(&self) -> &StructuredNlp {
        &self.nlp
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn variables(&self) -> &Variables {
        &self.vars
    }

    /// Direct access to the nodes; invalidates the current linearization.
    pub fn variables_mut(&mut self) -> &mut Variables {
        self.linearization = None;
        &mut self.vars
    }

    pub fn set_reference(&mut self, stage: usize, y: DVector<f64>) -> Result<()> {
        let n = self.nlp.horizon();
        let slot = self
            .vars
            .y
            .get_mut(stage)
            .ok_or_else(|| OcpError::dimension("reference stage", n, stage))?;
        if y.len() != slot.len() {
            return Err(OcpError::dimension("stage reference", slot.len(), y.len()));
        }
        *slot = y;
        Ok(())
    }

    pub fn set_terminal_reference(&mut self, y_n: DVector<f64>) -> Result<()> {
        if y_n.len() != self.vars.y_n.len() {
            return Err(OcpError::dimension("terminal reference", self.vars.y_n.len(), y_n.len()));
        }
        self.vars.y_n = y_n;
        Ok(())
    }

    /// Replaces the stage weight on every interval.
    pub fn set_weight(&mut self, w: DMatrix<f64>) -> Result<()> {
        validate_weight(&w, self.nlp.stage_cost().dim(), "stage")?;
        for slot in self.vars.w.iter_mut() {
            slot.clone_from(&w);
        }
        Ok(())
    }

    /// Replaces the weight of a single interval; needs `variable_weighting_matrix`.
    pub fn set_stage_weight(&mut self, stage: usize, w: DMatrix<f64>) -> Result<()> {
        if !self.config.variable_weighting_matrix {
            return Err(OcpError::unsupported(
                "per-stage weights need variable_weighting_matrix = yes",
            ));
        }
        let n = self.nlp.horizon();
        validate_weight(&w, self.nlp.stage_cost().dim(), "stage")?;
        let slot = self
            .vars
            .w
            .get_mut(stage)
            .ok_or_else(|| OcpError::dimension("weight stage", n, stage))?;
        *slot = w;
        Ok(())
    }

    pub fn set_disturbance(&mut self, node: usize, d: DVector<f64>) -> Result<()> {
        let n = self.nlp.horizon();
        let slot = self
            .vars
            .d
            .get_mut(node)
            .ok_or_else(|| OcpError::dimension("disturbance node", n + 1, node))?;
        if d.len() != slot.len() {
            return Err(OcpError::dimension("disturbance vector", slot.len(), d.len()));
        }
        *slot = d;
        self.linearization = None;
        Ok(())
    }

    pub fn initialize_nodes_by_forward_simulation(&mut self) -> Result<()> {
        self.discretization.forward_simulation(&self.nlp, &mut self.vars)?;
        self.linearization = None;
        Ok(())
    }

    /// Linearizes every stage around the current nodes.
    pub fn preparation_step(&mut self) -> Result<()> {
        let lin = self.discretization.linearize(&self.nlp, &self.vars)?;
        tracing::debug!(stages = lin.stages.len(), "preparation step finished");
        self.linearization = Some(lin);
        Ok(())
    }

    /// Embeds the measured state, solves the QP and applies the step to the nodes.
    pub fn feedback_step(&mut self, x0: &DVector<f64>) -> Result<FeedbackReport> {
        let nx = self.nlp.model().nx();
        if x0.len() != nx {
            return Err(OcpError::dimension("initial state", nx, x0.len()));
        }
        if self.linearization.is_none() {
            self.preparation_step()?;
        }
        let lin = self
            .linearization
            .take()
            .ok_or_else(|| OcpError::invalid_model("preparation step produced no linearization"))?;
        let qp = build_sparse_qp(
            &self.nlp,
            &self.vars,
            &lin,
            x0,
            self.config.levenberg_marquardt,
        )?;

        let settings = &self.config.interior_point;
        let warm = if self.config.hotstart_qp {
            self.warm_start.as_ref()
        } else {
            None
        };
        let (z, solution) = match self.config.condensing {
            Condensing::Full => {
                let condensed = condense(&qp);
                let warm_w = warm.map(|z| CondensedQp::controls_of(z, qp.nx, qp.nu, qp.horizon()));
                let solution = condensed.dense.solve(settings, warm_w.as_ref())?;
                (condensed.expand(&solution.primal), solution)
            }
            Condensing::Sparse => {
                let solution = solve_structured(&qp, settings, warm)?;
                (solution.primal.clone(), solution)
            }
        };

        self.kkt_tolerance = kkt_tolerance(&qp, &z, &solution);
        self.apply_step(&z, x0)?;
        self.warm_start = Some(z);

        let report = FeedbackReport {
            qp_iterations: solution.iterations,
            kkt_tolerance: self.kkt_tolerance,
            objective: self.objective(),
        };
        tracing::debug!(
            qp_iterations = report.qp_iterations,
            kkt_tolerance = report.kkt_tolerance,
            objective = report.objective,
            "feedback step finished"
        );
        Ok(report)
    }

    fn apply_step(&mut self, z: &DVector<f64>, x0: &DVector<f64>) -> Result<()> {
        let (nx, nu) = (self.nlp.model().nx(), self.nlp.model().nu());
        let nz = nx + nu;
        let n = self.nlp.horizon();
        for k in 0..n {
            self.vars.u[k] += z.rows(k * nz + nx, nu);
        }
        match self.config.discretization_type {
            DiscretizationType::MultipleShooting => {
                for k in 0..=n {
                    self.vars.x[k] += z.rows(k * nz, nx);
                }
                self.vars.x[0] = x0.clone();
            }
            DiscretizationType::SingleShooting => {
                self.vars.x[0] = x0.clone();
                self.discretization.forward_simulation(&self.nlp, &mut self.vars)?;
            }
        }
        Ok(())
    }

    /// Drops the first node; the new last node is `x_end`, or the simulated end of
    /// the last interval when `None`.
    pub fn shift_states(&mut self, x_end: Option<&DVector<f64>>) -> Result<()> {
        let n = self.nlp.horizon();
        let last = match x_end {
            Some(x) => {
                if x.len() != self.nlp.model().nx() {
                    return Err(OcpError::dimension("shifted end state", self.nlp.model().nx(), x.len()));
                }
                x.clone()
            }
            None => self.discretization.integrator().simulate(
                &self.nlp.model().view(self.vars.d[n].as_slice()),
                self.vars.x[n].as_slice(),
                self.vars.u[n - 1].as_slice(),
            )?,
        };
        self.vars.x.rotate_left(1);
        self.vars.x[n] = last;
        self.vars.d.rotate_left(1);
        self.vars.d[n] = self.vars.d[n - 1].clone();
        self.linearization = None;
        self.warm_start = None;
        Ok(())
    }

    /// Drops the first control; the new last control is `u_end` or a copy of the old last one.
    pub fn shift_controls(&mut self, u_end: Option<&DVector<f64>>) -> Result<()> {
        let n = self.nlp.horizon();
        let last = match u_end {
            Some(u) => {
                if u.len() != self.nlp.model().nu() {
                    return Err(OcpError::dimension("shifted end control", self.nlp.model().nu(), u.len()));
                }
                u.clone()
            }
            None => self.vars.u[n - 1].clone(),
        };
        self.vars.u.rotate_left(1);
        self.vars.u[n - 1] = last;
        self.linearization = None;
        self.warm_start = None;
        Ok(())
    }

    /// `Σ ‖h(x_k, u_k) - y_k‖²_W + ‖h_N(x_N) - y_N‖²_{W_N}` at the current nodes.
    pub fn objective(&self) -> f64 {
        let nlp = &self.nlp;
        let vars = &self.vars;
        let stages: f64 = (0..nlp.horizon())
            .map(|k| {
                let r = nlp
                    .stage_cost()
                    .evaluate(vars.x[k].as_slice(), vars.u[k].as_slice(), vars.d[k].as_slice())
                    - &vars.y[k];
                r.dot(&(&vars.w[k] * &r))
            })
            .sum();
        let n = nlp.horizon();
        let no_control = vec![0.0; nlp.model().nu()];
        let r_n = nlp
            .terminal_cost()
            .evaluate(vars.x[n].as_slice(), &no_control, vars.d[n].as_slice())
            - &vars.y_n;
        stages + r_n.dot(&(&vars.w_n * &r_n))
    }

    /// `|gᵀ Δz| + λᵀ s` of the last QP; infinite before the first feedback step.
    pub fn kkt_tolerance(&self) -> f64 {
        self.kkt_tolerance
    }
}

fn kkt_tolerance(qp: &SparseQp, z: &DVector<f64>, solution: &QpSolution) -> f64 {
    let (nx, nu) = (qp.nx, qp.nu);
    let nz = nx + nu;
    let mut gradient_step = 0.0;
    for (k, st) in qp.stages.iter().enumerate() {
        gradient_step += st.q_vec.dot(&z.rows(k * nz, nx)) + st.r_vec.dot(&z.rows(k * nz + nx, nu));
    }
    gradient_step += qp.terminal.q_vec.dot(&z.rows(qp.horizon() * nz, nx));
    gradient_step.abs() + solution.complementarity.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QpBackend;
    use crate::ocp::tests::getting_started_ocp;
    use approx::assert_relative_eq;

    fn solver(config: ExportConfig) -> RtiSolver {
        let nlp = getting_started_ocp(10, 0.1).finalize().unwrap();
        RtiSolver::new(nlp, config).unwrap()
    }

    fn sparse_config() -> ExportConfig {
        ExportConfig {
            condensing: Condensing::Sparse,
            qp_backend: QpBackend::RiccatiInteriorPoint,
            ..ExportConfig::default()
        }
    }

    #[test]
    fn closed_loop_respects_bounds_and_converges() {
        let mut rti = solver(ExportConfig::default());
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        rti.variables_mut().x[0] = x0.clone();
        rti.initialize_nodes_by_forward_simulation().unwrap();
        assert!(rti.kkt_tolerance().is_infinite());

        let mut last = f64::INFINITY;
        for _ in 0..5 {
            rti.preparation_step().unwrap();
            let report = rti.feedback_step(&x0).unwrap();
            last = report.kkt_tolerance;
        }
        assert!(last < 1e-6, "kkt tolerance {last}");
        for u in &rti.variables().u {
            assert!(u[0] >= -1e-6 && u[0] <= 1.0 + 1e-6, "u = {}", u[0]);
        }
        for x in &rti.variables().x[1..] {
            assert!(x[1] <= 1e-6 && x[1] >= -5.0 - 1e-6, "dx = {}", x[1]);
        }
    }

    #[test]
    fn dense_and_sparse_feedback_agree() {
        let x0 = DVector::from_vec(vec![0.5, -0.2]);
        let mut results = Vec::new();
        for config in [ExportConfig::default(), sparse_config()] {
            let mut rti = solver(config);
            rti.variables_mut().x[0] = x0.clone();
            rti.initialize_nodes_by_forward_simulation().unwrap();
            rti.feedback_step(&x0).unwrap();
            results.push(rti.variables().u[0][0]);
        }
        assert_relative_eq!(results[0], results[1], epsilon = 1e-5);
    }

    #[test]
    fn single_shooting_matches_multiple_shooting_from_simulated_nodes() {
        let x0 = DVector::from_vec(vec![0.5, -0.2]);
        let single = ExportConfig {
            discretization_type: DiscretizationType::SingleShooting,
            ..ExportConfig::default()
        };
        let mut results = Vec::new();
        for config in [ExportConfig::default(), single] {
            let mut rti = solver(config);
            rti.variables_mut().x[0] = x0.clone();
            rti.initialize_nodes_by_forward_simulation().unwrap();
            rti.feedback_step(&x0).unwrap();
            results.push(rti.variables().u[0][0]);
        }
        assert_relative_eq!(results[0], results[1], epsilon = 1e-6);
    }

    #[test]
    fn shifting_moves_nodes_forward() {
        let mut rti = solver(ExportConfig::default());
        for (k, u) in rti.variables_mut().u.iter_mut().enumerate() {
            u[0] = k as f64 / 10.0;
        }
        rti.variables_mut().x[0] = DVector::from_vec(vec![1.0, 0.0]);
        rti.initialize_nodes_by_forward_simulation().unwrap();
        let second = rti.variables().x[1].clone();

        rti.shift_controls(None).unwrap();
        rti.shift_states(None).unwrap();
        let vars = rti.variables();
        assert_relative_eq!(vars.u[0][0], 0.1);
        assert_relative_eq!(vars.u[9][0], 0.9);
        assert_eq!(vars.x[0], second);

        let err = rti.shift_states(Some(&DVector::zeros(3))).unwrap_err();
        assert!(matches!(err, OcpError::DimensionMismatch { expected: 2, found: 3, .. }));
    }

    #[test]
    fn objective_is_zero_at_reference() {
        let mut rti = solver(ExportConfig::default());
        // all nodes and references are zero
        assert_eq!(rti.objective(), 0.0);
        rti.set_reference(0, DVector::from_vec(vec![1.0, 0.0, 0.0])).unwrap();
        assert_relative_eq!(rti.objective(), 1.0);
        assert!(rti.set_reference(10, DVector::zeros(3)).is_err());
    }

    #[test]
    fn stage_weights_need_variable_weighting() {
        let mut rti = solver(ExportConfig::default());
        assert!(matches!(
            rti.set_stage_weight(0, DMatrix::identity(3, 3)),
            Err(OcpError::UnsupportedConfiguration(_))
        ));
        rti.set_weight(DMatrix::identity(3, 3) * 2.0).unwrap();

        let mut rti = solver(ExportConfig {
            variable_weighting_matrix: true,
            ..ExportConfig::default()
        });
        rti.set_stage_weight(3, DMatrix::identity(3, 3) * 4.0).unwrap();
        assert_eq!(rti.variables().w[3][(0, 0)], 4.0);
    }

    #[test]
    fn indefinite_weights_are_rejected_at_runtime() {
        let mut rti = solver(ExportConfig {
            variable_weighting_matrix: true,
            ..ExportConfig::default()
        });
        let indefinite = DMatrix::from_diagonal(&DVector::from_vec(vec![-50.0, 1.0, 1.0]));
        assert!(matches!(
            rti.set_weight(indefinite.clone()),
            Err(OcpError::InvalidWeight(_))
        ));
        assert!(matches!(
            rti.set_stage_weight(2, indefinite),
            Err(OcpError::InvalidWeight(_))
        ));
        let mut skewed = DMatrix::identity(3, 3);
        skewed[(0, 1)] = 0.5;
        assert!(matches!(rti.set_weight(skewed), Err(OcpError::InvalidWeight(_))));
        assert!(matches!(
            rti.set_weight(DMatrix::identity(2, 2)),
            Err(OcpError::DimensionMismatch { .. })
        ));

        // rejected weights leave the problem weights in place
        assert!(rti.variables().w.iter().all(|w| w == &DMatrix::identity(3, 3)));
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let nlp = getting_started_ocp(10, 0.1).finalize().unwrap();
        let config = ExportConfig {
            condensing: Condensing::Sparse,
            ..ExportConfig::default()
        };
        assert!(matches!(
            RtiSolver::new(nlp, config),
            Err(OcpError::UnsupportedConfiguration(_))
        ));
    }
}
