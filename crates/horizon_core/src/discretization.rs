//! Shooting discretization of a [`StructuredNlp`].
//!
//! Every interval is integrated independently from its own node, which is what
//! multiple shooting needs and what lets the stages be linearized in parallel.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::config::ExportConfig;
use crate::error::{OcpError, Result};
use crate::integrator::{ButcherTableau, Integrator, IntervalSensitivities};
use crate::model::FunctionLinearization;
use crate::ocp::StructuredNlp;

/// Node values, references and weights for one solver instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Variables {
    /// States at the `N + 1` nodes.
    pub x: Vec<DVector<f64>>,
    /// Controls on the `N` intervals.
    pub u: Vec<DVector<f64>>,
    /// Disturbances at the `N + 1` nodes.
    pub d: Vec<DVector<f64>>,
    /// Stage references.
    pub y: Vec<DVector<f64>>,
    pub y_n: DVector<f64>,
    /// Per-stage weights; all equal to the problem weight unless changed online.
    pub w: Vec<DMatrix<f64>>,
    pub w_n: DMatrix<f64>,
}

impl Variables {
    /// Zero nodes and references, weights taken from the problem.
    pub fn new(nlp: &StructuredNlp) -> Self {
        let dims = nlp.dimensions();
        let n = dims.horizon;
        Self {
            x: vec![DVector::zeros(dims.nx); n + 1],
            u: vec![DVector::zeros(dims.nu); n],
            d: vec![DVector::zeros(dims.nd); n + 1],
            y: vec![DVector::zeros(dims.ny); n],
            y_n: DVector::zeros(dims.nyn),
            w: vec![nlp.stage_weight().clone(); n],
            w_n: nlp.terminal_weight().clone(),
        }
    }

    pub fn check(&self, nlp: &StructuredNlp) -> Result<()> {
        let dims = nlp.dimensions();
        let n = dims.horizon;
        check_nodes("state nodes", &self.x, n + 1, dims.nx)?;
        check_nodes("control nodes", &self.u, n, dims.nu)?;
        check_nodes("disturbance nodes", &self.d, n + 1, dims.nd)?;
        check_nodes("stage references", &self.y, n, dims.ny)?;
        if self.y_n.len() != dims.nyn {
            return Err(OcpError::dimension("terminal reference", dims.nyn, self.y_n.len()));
        }
        if self.w.len() != n {
            return Err(OcpError::dimension("stage weights", n, self.w.len()));
        }
        for w in &self.w {
            if w.shape() != (dims.ny, dims.ny) {
                return Err(OcpError::dimension("stage weight rows", dims.ny, w.nrows()));
            }
        }
        if self.w_n.shape() != (dims.nyn, dims.nyn) {
            return Err(OcpError::dimension("terminal weight rows", dims.nyn, self.w_n.nrows()));
        }
        Ok(())
    }
}

fn check_nodes(context: &str, nodes: &[DVector<f64>], count: usize, dim: usize) -> Result<()> {
    if nodes.len() != count {
        return Err(OcpError::dimension(context, count, nodes.len()));
    }
    match nodes.iter().find(|v| v.len() != dim) {
        Some(bad) => Err(OcpError::dimension(context, dim, bad.len())),
        None => Ok(()),
    }
}

/// Linearization of one shooting interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StageLinearization {
    pub dynamics: IntervalSensitivities,
    /// Least-squares output `h(x_k, u_k)` and its Jacobians.
    pub residual: FunctionLinearization,
    pub constraints: FunctionLinearization,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalLinearization {
    pub residual: FunctionLinearization,
    pub constraints: FunctionLinearization,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    pub stages: Vec<StageLinearization>,
    pub terminal: TerminalLinearization,
}

/// Integrator bound to the stage length of a problem.
#[derive(Debug, Clone)]
pub struct Discretization {
    integrator: Integrator,
}

impl Discretization {
    pub fn new(nlp: &StructuredNlp, config: &ExportConfig) -> Result<Self> {
        let tableau = ButcherTableau::from_integrator(config.integrator_type)?;
        let integrator = Integrator::new(
            tableau,
            nlp.stage_duration(),
            config.steps_per_interval(nlp.horizon()),
            config.newton,
        )?
        .with_max_retries(config.max_integrator_retries);
        Ok(Self { integrator })
    }

    pub fn integrator(&self) -> &Integrator {
        &self.integrator
    }

    /// Linearizes the dynamics, outputs and constraints around the current nodes.
    pub fn linearize(&self, nlp: &StructuredNlp, vars: &Variables) -> Result<Linearization> {
        vars.check(nlp)?;
        let model = nlp.model();
        let stages = (0..nlp.horizon())
            .into_par_iter()
            .map(|k| {
                let (x, u, d) = (vars.x[k].as_slice(), vars.u[k].as_slice(), vars.d[k].as_slice());
                let dynamics = self.integrator.integrate(&model.view(d), x, u)?;
                Ok(StageLinearization {
                    dynamics,
                    residual: nlp.stage_cost().linearize(x, u, d),
                    constraints: nlp.path_constraints().linearize(x, u, d),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            stages = stages.len(),
            newton_iterations = stages.iter().map(|s| s.dynamics.newton_iterations).sum::<usize>(),
            "linearized shooting intervals"
        );

        let n = nlp.horizon();
        let no_control = vec![0.0; model.nu()];
        let (x, d) = (vars.x[n].as_slice(), vars.d[n].as_slice());
        let terminal = TerminalLinearization {
            residual: nlp.terminal_cost().linearize(x, &no_control, d),
            constraints: nlp.terminal_constraints().linearize(x, &no_control, d),
        };
        Ok(Linearization { stages, terminal })
    }

    /// Overwrites `x_1..x_N` by integrating from `x_0` with the current controls.
    pub fn forward_simulation(&self, nlp: &StructuredNlp, vars: &mut Variables) -> Result<()> {
        vars.check(nlp)?;
        let model = nlp.model();
        for k in 0..nlp.horizon() {
            let next = self.integrator.simulate(
                &model.view(vars.d[k].as_slice()),
                vars.x[k].as_slice(),
                vars.u[k].as_slice(),
            )?;
            vars.x[k + 1] = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocp::tests::getting_started_ocp;
    use approx::assert_relative_eq;

    #[test]
    fn forward_simulation_closes_every_defect() {
        let nlp = getting_started_ocp(5, 0.1).finalize().unwrap();
        let disc = Discretization::new(&nlp, &ExportConfig::default()).unwrap();
        let mut vars = Variables::new(&nlp);
        vars.x[0] = DVector::from_vec(vec![1.0, 0.0]);
        for u in vars.u.iter_mut() {
            u[0] = 0.1;
        }
        disc.forward_simulation(&nlp, &mut vars).unwrap();

        let lin = disc.linearize(&nlp, &vars).unwrap();
        assert_eq!(lin.stages.len(), 5);
        for (k, stage) in lin.stages.iter().enumerate() {
            assert_relative_eq!(stage.dynamics.x_next, vars.x[k + 1], epsilon = 1e-12);
        }
        // h = (x, dx, u)
        let third = &lin.stages[3].residual;
        assert_relative_eq!(third.value[0], vars.x[3][0], epsilon = 1e-15);
        assert_relative_eq!(third.ju[(2, 0)], 1.0);
        assert_eq!(lin.terminal.constraints.value.len(), 1);
    }

    #[test]
    fn wrong_node_count_is_a_dimension_error() {
        let nlp = getting_started_ocp(5, 0.1).finalize().unwrap();
        let disc = Discretization::new(&nlp, &ExportConfig::default()).unwrap();
        let mut vars = Variables::new(&nlp);
        vars.u.pop();
        assert!(matches!(
            disc.linearize(&nlp, &vars),
            Err(OcpError::DimensionMismatch { expected: 5, found: 4, .. })
        ));
    }
}
