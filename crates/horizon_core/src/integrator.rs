use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::{CollocationScheme, IntegratorType};
use crate::error::{OcpError, Result};
use crate::traits::Linearize;

/// Settings of the Newton iteration that solves implicit stage equations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-10,
        }
    }
}

/// Runge-Kutta coefficients `(A, b, c)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    name: &'static str,
    order: usize,
    a: DMatrix<f64>,
    b: DVector<f64>,
    c: DVector<f64>,
}

impl ButcherTableau {
    fn new(name: &'static str, order: usize, stages: usize, a: &[f64], b: &[f64]) -> Self {
        let a = DMatrix::from_row_slice(stages, stages, a);
        let c = DVector::from_iterator(stages, a.row_iter().map(|row| row.sum()));
        Self {
            name,
            order,
            a,
            b: DVector::from_column_slice(b),
            c,
        }
    }

    pub fn explicit_euler() -> Self {
        Self::new("explicit_euler", 1, 1, &[0.0], &[1.0])
    }

    pub fn explicit_midpoint() -> Self {
        Self::new("explicit_midpoint", 2, 2, &[0.0, 0.0, 0.5, 0.0], &[0.0, 1.0])
    }

    /// Classic Runge-Kutta 4th order.
    pub fn rk4() -> Self {
        #[rustfmt::skip]
        let a = [
            0.0, 0.0, 0.0, 0.0,
            0.5, 0.0, 0.0, 0.0,
            0.0, 0.5, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        ];
        Self::new("rk4", 4, 4, &a, &[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0])
    }

    /// Gauss-Legendre collocation with `stages` points (order `2 * stages`).
    pub fn gauss_legendre(stages: usize) -> Result<Self> {
        match stages {
            1 => Ok(Self::new("gauss_legendre_2", 2, 1, &[0.5], &[1.0])),
            2 => {
                let r = 3.0_f64.sqrt() / 6.0;
                Ok(Self::new(
                    "gauss_legendre_4",
                    4,
                    2,
                    &[0.25, 0.25 - r, 0.25 + r, 0.25],
                    &[0.5, 0.5],
                ))
            }
            3 => {
                let r = 15.0_f64.sqrt();
                #[rustfmt::skip]
                let a = [
                    5.0 / 36.0,            2.0 / 9.0 - r / 15.0, 5.0 / 36.0 - r / 30.0,
                    5.0 / 36.0 + r / 24.0, 2.0 / 9.0,            5.0 / 36.0 - r / 24.0,
                    5.0 / 36.0 + r / 30.0, 2.0 / 9.0 + r / 15.0, 5.0 / 36.0,
                ];
                Ok(Self::new(
                    "gauss_legendre_6",
                    6,
                    3,
                    &a,
                    &[5.0 / 18.0, 4.0 / 9.0, 5.0 / 18.0],
                ))
            }
            _ => Err(OcpError::unsupported(format!(
                "Gauss-Legendre collocation with {stages} stages is not available"
            ))),
        }
    }

    /// Radau IIA collocation with `stages` points (order `2 * stages - 1`).
    pub fn radau_iia(stages: usize) -> Result<Self> {
        match stages {
            1 => Ok(Self::new("radau_iia_1", 1, 1, &[1.0], &[1.0])),
            2 => Ok(Self::new(
                "radau_iia_3",
                3,
                2,
                &[5.0 / 12.0, -1.0 / 12.0, 0.75, 0.25],
                &[0.75, 0.25],
            )),
            3 => {
                let r = 6.0_f64.sqrt();
                let last = [(16.0 - r) / 36.0, (16.0 + r) / 36.0, 1.0 / 9.0];
                #[rustfmt::skip]
                let a = [
                    (88.0 - 7.0 * r) / 360.0,    (296.0 - 169.0 * r) / 1800.0, (-2.0 + 3.0 * r) / 225.0,
                    (296.0 + 169.0 * r) / 1800.0, (88.0 + 7.0 * r) / 360.0,    (-2.0 - 3.0 * r) / 225.0,
                    last[0],                      last[1],                     last[2],
                ];
                Ok(Self::new("radau_iia_5", 5, 3, &a, &last))
            }
            _ => Err(OcpError::unsupported(format!(
                "Radau IIA collocation with {stages} stages is not available"
            ))),
        }
    }

    /// Resolves a configured integrator type to its tableau.
    pub fn from_integrator(kind: IntegratorType) -> Result<Self> {
        match kind {
            IntegratorType::ExplicitRk { order: 1 } => Ok(Self::explicit_euler()),
            IntegratorType::ExplicitRk { order: 2 } => Ok(Self::explicit_midpoint()),
            IntegratorType::ExplicitRk { order: 4 } => Ok(Self::rk4()),
            IntegratorType::ExplicitRk { order } => Err(OcpError::unsupported(format!(
                "explicit Runge-Kutta of order {order} is not available (use 1, 2 or 4)"
            ))),
            IntegratorType::ImplicitRk {
                scheme: CollocationScheme::GaussLegendre,
                order,
            } if order % 2 == 0 => Self::gauss_legendre(order / 2),
            IntegratorType::ImplicitRk {
                scheme: CollocationScheme::RadauIia,
                order,
            } if order % 2 == 1 => Self::radau_iia((order + 1) / 2),
            IntegratorType::ImplicitRk { scheme, order } => Err(OcpError::unsupported(format!(
                "{scheme:?} collocation has no order {order} variant"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn order(&self) -> usize {
        self.order
    }
    pub fn stages(&self) -> usize {
        self.b.len()
    }
    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }
    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }
    pub fn c(&self) -> &DVector<f64> {
        &self.c
    }

    /// True when `A` is strictly lower triangular.
    pub fn is_explicit(&self) -> bool {
        let s = self.stages();
        (0..s).all(|i| (i..s).all(|j| self.a[(i, j)] == 0.0))
    }
}

/// End state of one shooting interval and its sensitivities.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSensitivities {
    pub x_next: DVector<f64>,
    /// `d x_next / d x`
    pub a: DMatrix<f64>,
    /// `d x_next / d u`
    pub b: DMatrix<f64>,
    pub newton_iterations: usize,
}

struct StepFailure {
    iterations: usize,
    residual: f64,
}

struct StepResult {
    x_next: DVector<f64>,
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    iterations: usize,
}

/// Fixed-step Runge-Kutta integrator with forward sensitivities.
#[derive(Debug, Clone)]
pub struct Integrator {
    tableau: ButcherTableau,
    interval: f64,
    steps: usize,
    newton: NewtonSettings,
    max_retries: usize,
}

impl Integrator {
    /// `steps` substeps of equal length cover one interval of length `interval`.
    pub fn new(tableau: ButcherTableau, interval: f64, steps: usize, newton: NewtonSettings) -> Result<Self> {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(OcpError::unsupported(format!(
                "integration interval must be positive, got {interval}"
            )));
        }
        if steps == 0 {
            return Err(OcpError::unsupported(
                "at least one integrator step per interval is required",
            ));
        }
        Ok(Self {
            tableau,
            interval,
            steps,
            newton,
            max_retries: 3,
        })
    }

    /// How many times a failed interval is retried with halved steps.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }
    pub fn interval(&self) -> f64 {
        self.interval
    }
    pub fn steps(&self) -> usize {
        self.steps
    }
    pub fn newton(&self) -> NewtonSettings {
        self.newton
    }

    /// Integrates over one interval with `u` held constant.
    pub fn integrate<S: Linearize>(&self, system: &S, x: &[f64], u: &[f64]) -> Result<IntervalSensitivities> {
        let nx = system.state_dimension();
        let nu = system.control_dimension();
        if x.len() != nx {
            return Err(OcpError::dimension("integrator state", nx, x.len()));
        }
        if u.len() != nu {
            return Err(OcpError::dimension("integrator control", nu, u.len()));
        }

        let mut steps = self.steps;
        let mut last = StepFailure {
            iterations: 0,
            residual: f64::NAN,
        };
        for attempt in 0..=self.max_retries {
            match self.integrate_with_steps(system, x, u, steps) {
                Ok(result) => return Ok(result),
                Err(failure) => {
                    tracing::warn!(
                        attempt,
                        steps,
                        iterations = failure.iterations,
                        residual = failure.residual,
                        "stage equations did not converge, halving the step size"
                    );
                    last = failure;
                    steps *= 2;
                }
            }
        }
        Err(OcpError::IntegratorDivergence {
            attempts: self.max_retries + 1,
            iterations: last.iterations,
            residual: last.residual,
        })
    }

    /// Value-only convenience wrapper around [`Integrator::integrate`].
    pub fn simulate<S: Linearize>(&self, system: &S, x: &[f64], u: &[f64]) -> Result<DVector<f64>> {
        self.integrate(system, x, u).map(|r| r.x_next)
    }

    fn integrate_with_steps<S: Linearize>(
        &self,
        system: &S,
        x: &[f64],
        u: &[f64],
        steps: usize,
    ) -> std::result::Result<IntervalSensitivities, StepFailure> {
        let nx = x.len();
        let nu = u.len();
        let h = self.interval / steps as f64;
        let mut state = DVector::from_column_slice(x);
        let mut a_total = DMatrix::identity(nx, nx);
        let mut b_total = DMatrix::zeros(nx, nu);
        let mut iterations = 0;

        for _ in 0..steps {
            let step = self.rk_step(system, &state, u, h)?;
            // chain rule across substeps
            b_total = &step.a * &b_total + &step.b;
            a_total = &step.a * &a_total;
            state = step.x_next;
            iterations += step.iterations;
        }
        if !state.iter().all(|v| v.is_finite()) {
            return Err(StepFailure {
                iterations,
                residual: f64::INFINITY,
            });
        }
        Ok(IntervalSensitivities {
            x_next: state,
            a: a_total,
            b: b_total,
            newton_iterations: iterations,
        })
    }

    fn rk_step<S: Linearize>(
        &self,
        system: &S,
        x: &DVector<f64>,
        u: &[f64],
        h: f64,
    ) -> std::result::Result<StepResult, StepFailure> {
        let n = x.len();
        let nu = u.len();
        let s = self.tableau.stages();
        let mut k = DMatrix::zeros(n, s);
        let mut jx = vec![DMatrix::zeros(n, n); s];
        let mut ju = vec![DMatrix::zeros(n, nu); s];
        let mut iterations = 0;

        if self.tableau.is_explicit() {
            for i in 0..s {
                let xi = self.stage_point(x, &k, i, h);
                let (f, jxi, jui) = evaluate(system, &xi, u);
                k.set_column(i, &f);
                jx[i] = jxi;
                ju[i] = jui;
            }
        } else {
            let (f0, _, _) = evaluate(system, x, u);
            for i in 0..s {
                k.set_column(i, &f0);
            }
            loop {
                let mut residual = DVector::zeros(s * n);
                for i in 0..s {
                    let xi = self.stage_point(x, &k, i, h);
                    let (f, jxi, jui) = evaluate(system, &xi, u);
                    residual.rows_mut(i * n, n).copy_from(&(&k.column(i) - &f));
                    jx[i] = jxi;
                    ju[i] = jui;
                }
                let norm = residual.amax();
                if !norm.is_finite() {
                    return Err(StepFailure {
                        iterations,
                        residual: norm,
                    });
                }
                if norm <= self.newton.tolerance {
                    break;
                }
                if iterations >= self.newton.max_steps {
                    return Err(StepFailure {
                        iterations,
                        residual: norm,
                    });
                }
                let delta = self
                    .newton_matrix(&jx, h)
                    .lu()
                    .solve(&residual)
                    .ok_or(StepFailure {
                        iterations,
                        residual: norm,
                    })?;
                for i in 0..s {
                    k.column_mut(i)
                        .axpy(-self.newton.damping, &delta.rows(i * n, n), 1.0);
                }
                iterations += 1;
            }
        }

        // Implicit function theorem on G(K, x, u) = 0
        let lu = self.newton_matrix(&jx, h).lu();
        let mut rhs_x = DMatrix::zeros(s * n, n);
        let mut rhs_u = DMatrix::zeros(s * n, nu);
        for i in 0..s {
            rhs_x.view_mut((i * n, 0), (n, n)).copy_from(&jx[i]);
            rhs_u.view_mut((i * n, 0), (n, nu)).copy_from(&ju[i]);
        }
        let singular = StepFailure {
            iterations,
            residual: f64::INFINITY,
        };
        let dk_dx = lu.solve(&rhs_x).ok_or(singular)?;
        let dk_du = lu.solve(&rhs_u).ok_or(StepFailure {
            iterations,
            residual: f64::INFINITY,
        })?;

        let b = self.tableau.b();
        let mut x_next = x.clone();
        let mut a_step = DMatrix::identity(n, n);
        let mut b_step = DMatrix::zeros(n, nu);
        for i in 0..s {
            let w = h * b[i];
            x_next.axpy(w, &k.column(i), 1.0);
            a_step += dk_dx.rows(i * n, n) * w;
            b_step += dk_du.rows(i * n, n) * w;
        }
        Ok(StepResult {
            x_next,
            a: a_step,
            b: b_step,
            iterations,
        })
    }

    fn stage_point(&self, x: &DVector<f64>, k: &DMatrix<f64>, i: usize, h: f64) -> DVector<f64> {
        let mut xi = x.clone();
        for j in 0..self.tableau.stages() {
            let aij = self.tableau.a[(i, j)];
            if aij != 0.0 {
                xi.axpy(h * aij, &k.column(j), 1.0);
            }
        }
        xi
    }

    /// Block matrix `M_ij = δ_ij I - h a_ij J_i`.
    fn newton_matrix(&self, jx: &[DMatrix<f64>], h: f64) -> DMatrix<f64> {
        let s = self.tableau.stages();
        let n = jx.first().map_or(0, |j| j.nrows());
        let mut m = DMatrix::identity(s * n, s * n);
        for i in 0..s {
            for j in 0..s {
                let aij = self.tableau.a[(i, j)];
                if aij != 0.0 {
                    let mut block = m.view_mut((i * n, j * n), (n, n));
                    block -= &jx[i] * (h * aij);
                }
            }
        }
        m
    }
}

fn evaluate<S: Linearize>(system: &S, x: &DVector<f64>, u: &[f64]) -> (DVector<f64>, DMatrix<f64>, DMatrix<f64>) {
    let n = x.len();
    let nu = u.len();
    let mut f = vec![0.0; n];
    let mut jx = vec![0.0; n * n];
    let mut ju = vec![0.0; n * nu];
    system.linearize(x.as_slice(), u, &mut f, &mut jx, &mut ju);
    (
        DVector::from_vec(f),
        DMatrix::from_row_slice(n, n, &jx),
        DMatrix::from_row_slice(n, nu, &ju),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DynamicalSystem;
    use approx::assert_relative_eq;

    /// x1' = x2, x2' = -x1 + u
    struct Oscillator;

    impl DynamicalSystem<f64> for Oscillator {
        fn state_dimension(&self) -> usize {
            2
        }
        fn control_dimension(&self) -> usize {
            1
        }
        fn apply(&self, x: &[f64], u: &[f64], out: &mut [f64]) {
            out[0] = x[1];
            out[1] = -x[0] + u[0];
        }
    }

    impl Linearize for Oscillator {
        fn linearize(&self, x: &[f64], u: &[f64], f: &mut [f64], jx: &mut [f64], ju: &mut [f64]) {
            self.apply(x, u, f);
            jx.copy_from_slice(&[0.0, 1.0, -1.0, 0.0]);
            ju.copy_from_slice(&[0.0, 1.0]);
        }
    }

    /// x' = -k x^3 + u
    struct Cubic(f64);

    impl DynamicalSystem<f64> for Cubic {
        fn state_dimension(&self) -> usize {
            1
        }
        fn control_dimension(&self) -> usize {
            1
        }
        fn apply(&self, x: &[f64], u: &[f64], out: &mut [f64]) {
            out[0] = -self.0 * x[0].powi(3) + u[0];
        }
    }

    impl Linearize for Cubic {
        fn linearize(&self, x: &[f64], u: &[f64], f: &mut [f64], jx: &mut [f64], ju: &mut [f64]) {
            self.apply(x, u, f);
            jx[0] = -3.0 * self.0 * x[0] * x[0];
            ju[0] = 1.0;
        }
    }

    fn all_tableaus() -> Vec<ButcherTableau> {
        let mut t = vec![
            ButcherTableau::explicit_euler(),
            ButcherTableau::explicit_midpoint(),
            ButcherTableau::rk4(),
        ];
        for s in 1..=3 {
            t.push(ButcherTableau::gauss_legendre(s).unwrap());
            t.push(ButcherTableau::radau_iia(s).unwrap());
        }
        t
    }

    #[test]
    fn tableaus_are_consistent() {
        for tableau in all_tableaus() {
            assert_relative_eq!(tableau.b().sum(), 1.0, epsilon = 1e-14);
            // second order condition: sum b_i c_i = 1/2
            if tableau.order() >= 2 {
                assert_relative_eq!(tableau.b().dot(tableau.c()), 0.5, epsilon = 1e-14);
            }
        }
        assert!(ButcherTableau::rk4().is_explicit());
        assert!(!ButcherTableau::radau_iia(3).unwrap().is_explicit());
        assert_relative_eq!(ButcherTableau::radau_iia(3).unwrap().c()[2], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn oscillator_matches_closed_form() {
        let h: f64 = 0.1;
        let x0 = [0.3, -0.8];
        let u = [0.4];
        let (c, s) = (h.cos(), h.sin());
        let expected_x = [
            u[0] + (x0[0] - u[0]) * c + x0[1] * s,
            -(x0[0] - u[0]) * s + x0[1] * c,
        ];
        let expected_a = DMatrix::from_row_slice(2, 2, &[c, s, -s, c]);
        let expected_b = DMatrix::from_row_slice(2, 1, &[1.0 - c, s]);

        let cases = [
            (ButcherTableau::rk4(), 4),
            (ButcherTableau::radau_iia(3).unwrap(), 2),
            (ButcherTableau::gauss_legendre(3).unwrap(), 1),
        ];
        for (tableau, steps) in cases {
            let name = tableau.name();
            let integrator = Integrator::new(tableau, h, steps, NewtonSettings::default()).unwrap();
            let r = integrator
                .integrate(&Oscillator, &x0, &u)
                .expect("integration should succeed");
            for i in 0..2 {
                assert!((r.x_next[i] - expected_x[i]).abs() < 1e-8, "{name} x[{i}]");
            }
            assert!((&r.a - &expected_a).amax() < 1e-8, "{name} A");
            assert!((&r.b - &expected_b).amax() < 1e-8, "{name} B");
        }
    }

    #[test]
    fn implicit_sensitivities_match_finite_differences() {
        let system = Cubic(2.0);
        let integrator = Integrator::new(
            ButcherTableau::radau_iia(2).unwrap(),
            0.2,
            2,
            NewtonSettings::default(),
        )
        .unwrap();
        let (x, u) = (0.9, 0.3);
        let r = integrator.integrate(&system, &[x], &[u]).unwrap();
        assert!(r.newton_iterations > 0);

        let eps = 1e-5;
        let xp = integrator.simulate(&system, &[x + eps], &[u]).unwrap()[0];
        let xm = integrator.simulate(&system, &[x - eps], &[u]).unwrap()[0];
        let up = integrator.simulate(&system, &[x], &[u + eps]).unwrap()[0];
        let um = integrator.simulate(&system, &[x], &[u - eps]).unwrap()[0];
        assert_relative_eq!(r.a[(0, 0)], (xp - xm) / (2.0 * eps), epsilon = 1e-5);
        assert_relative_eq!(r.b[(0, 0)], (up - um) / (2.0 * eps), epsilon = 1e-5);
    }

    #[test]
    fn capped_newton_iterations_report_divergence() {
        let settings = NewtonSettings {
            max_steps: 1,
            ..NewtonSettings::default()
        };
        let integrator = Integrator::new(ButcherTableau::radau_iia(3).unwrap(), 0.1, 1, settings)
            .unwrap()
            .with_max_retries(2);
        let err = integrator.integrate(&Cubic(5.0), &[2.0], &[0.0]).unwrap_err();
        match err {
            OcpError::IntegratorDivergence {
                attempts,
                iterations,
                residual,
            } => {
                assert_eq!(attempts, 3);
                assert!(iterations >= 1);
                assert!(residual > settings.tolerance);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_orders_are_rejected() {
        let bad = [
            IntegratorType::ExplicitRk { order: 3 },
            IntegratorType::ImplicitRk {
                scheme: CollocationScheme::RadauIia,
                order: 4,
            },
            IntegratorType::ImplicitRk {
                scheme: CollocationScheme::GaussLegendre,
                order: 8,
            },
        ];
        for kind in bad {
            assert!(matches!(
                ButcherTableau::from_integrator(kind),
                Err(OcpError::UnsupportedConfiguration(_))
            ));
        }
        let radau = ButcherTableau::from_integrator(IntegratorType::ImplicitRk {
            scheme: CollocationScheme::RadauIia,
            order: 5,
        })
        .unwrap();
        assert_eq!(radau.stages(), 3);
    }

    #[test]
    fn dimension_errors_are_reported_before_integration() {
        let integrator =
            Integrator::new(ButcherTableau::rk4(), 0.1, 1, NewtonSettings::default()).unwrap();
        assert!(matches!(
            integrator.integrate(&Oscillator, &[1.0], &[0.0]),
            Err(OcpError::DimensionMismatch { .. })
        ));
    }
}
