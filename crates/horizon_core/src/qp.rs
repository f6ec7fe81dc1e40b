//! Primal-dual interior point method for convex QPs
//!
//! ```text
//! minimize  ½ zᵀ H z + gᵀ z   subject to   G z >= d   (and E z = e for the structured form)
//! ```
//!
//! The Mehrotra predictor-corrector loop is shared; only the Newton system differs.
//! The dense backend factorizes `H + Gᵀ D G` with Cholesky, the structured backend
//! runs a Riccati recursion over the stages and keeps the dynamics satisfied exactly.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condensing::SparseQp;

/// Magnitudes at or above this are treated as "no bound".
pub const INFTY: f64 = 1e20;

pub fn is_bounded(value: f64) -> bool {
    value.is_finite() && value.abs() < INFTY
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InteriorPointSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for InteriorPointSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Error)]
pub enum QpError {
    #[error(
        "interior point method did not converge in {iterations} iterations (mu = {mu:e}, primal = {primal:e}, dual = {dual:e})"
    )]
    MaxIterations {
        iterations: usize,
        mu: f64,
        primal: f64,
        dual: f64,
    },
    #[error("singular Newton system: {0}")]
    Singular(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub primal: DVector<f64>,
    /// Multipliers of the one-sided rows `G z >= d`.
    pub multipliers: DVector<f64>,
    pub iterations: usize,
    pub objective: f64,
    /// `λᵀ s` at the solution.
    pub complementarity: f64,
}

/// Linear algebra the interior point loop needs from a QP representation.
pub trait KktSystem {
    fn num_variables(&self) -> usize;
    fn num_rows(&self) -> usize;
    /// Starting primal point; the structured form returns a dynamics-feasible one.
    fn initial_point(&self, warm: Option<&DVector<f64>>) -> DVector<f64>;
    /// `H z + g`
    fn gradient(&self, z: &DVector<f64>) -> DVector<f64>;
    fn objective(&self, z: &DVector<f64>) -> f64;
    /// `G dz`
    fn apply_rows(&self, dz: &DVector<f64>) -> DVector<f64>;
    /// `Gᵀ v`
    fn apply_rows_transpose(&self, v: &DVector<f64>) -> DVector<f64>;
    /// `d`
    fn row_offsets(&self) -> &DVector<f64>;
    /// Solves `(H + Gᵀ diag(w) G) dz = rhs`, restricted to the nullspace of the
    /// equality constraints if there are any.
    fn solve_newton(&self, weights: &DVector<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, QpError>;
    /// Norm of the dual residual `H z + g - Gᵀ λ` after eliminating equality multipliers.
    fn dual_residual_norm(&self, residual: &DVector<f64>) -> f64;
}

/// Runs Mehrotra's predictor-corrector method on `kkt`.
pub fn solve_interior_point<K: KktSystem>(
    kkt: &K,
    settings: &InteriorPointSettings,
    warm: Option<&DVector<f64>>,
) -> Result<QpSolution, QpError> {
    let m = kkt.num_rows();
    let mut z = kkt.initial_point(warm);

    if m == 0 {
        let rd = kkt.gradient(&z);
        let dz = kkt.solve_newton(&DVector::zeros(0), &(-rd))?;
        z += dz;
        return Ok(QpSolution {
            objective: kkt.objective(&z),
            primal: z,
            multipliers: DVector::zeros(0),
            iterations: 1,
            complementarity: 0.0,
        });
    }

    let d = kkt.row_offsets().clone();
    let primal_scale = 1.0 + d.amax();
    let dual_scale = 1.0 + kkt.gradient(&DVector::zeros(kkt.num_variables())).amax();

    let mut s = (kkt.apply_rows(&z) - &d).map(|v| v.max(1.0));
    let mut lambda = DVector::from_element(m, 1.0);
    let mut last = (f64::NAN, f64::NAN, f64::NAN);

    for iteration in 0..settings.max_iterations {
        let rp = kkt.apply_rows(&z) - &d - &s;
        let rd = kkt.gradient(&z) - kkt.apply_rows_transpose(&lambda);
        let mu = s.dot(&lambda) / m as f64;
        let primal = rp.amax() / primal_scale;
        let dual = kkt.dual_residual_norm(&rd) / dual_scale;
        last = (mu, primal, dual);

        if mu <= settings.tolerance && primal <= settings.tolerance && dual <= settings.tolerance {
            tracing::trace!(iteration, mu, primal, dual, "interior point converged");
            let complementarity = s.dot(&lambda);
            return Ok(QpSolution {
                objective: kkt.objective(&z),
                primal: z,
                multipliers: lambda,
                iterations: iteration,
                complementarity,
            });
        }

        let weights = lambda.component_div(&s);

        // predictor
        let rc_aff = s.component_mul(&lambda);
        let (_, ds_aff, dl_aff) = newton_direction(kkt, &s, &lambda, &weights, &rd, &rp, &rc_aff)?;
        let alpha_p = max_step(&s, &ds_aff);
        let alpha_d = max_step(&lambda, &dl_aff);
        let mu_aff = (&s + &ds_aff * alpha_p).dot(&(&lambda + &dl_aff * alpha_d)) / m as f64;
        let sigma = (mu_aff / mu).powi(3).clamp(0.0, 1.0);

        // corrector
        let rc = rc_aff + ds_aff.component_mul(&dl_aff) - DVector::from_element(m, sigma * mu);
        let (dz, ds, dl) = newton_direction(kkt, &s, &lambda, &weights, &rd, &rp, &rc)?;
        let alpha = (0.99 * max_step(&s, &ds).min(max_step(&lambda, &dl))).min(1.0);

        z.axpy(alpha, &dz, 1.0);
        s.axpy(alpha, &ds, 1.0);
        lambda.axpy(alpha, &dl, 1.0);
    }

    Err(QpError::MaxIterations {
        iterations: settings.max_iterations,
        mu: last.0,
        primal: last.1,
        dual: last.2,
    })
}

type Direction = (DVector<f64>, DVector<f64>, DVector<f64>);

fn newton_direction<K: KktSystem>(
    kkt: &K,
    s: &DVector<f64>,
    lambda: &DVector<f64>,
    weights: &DVector<f64>,
    rd: &DVector<f64>,
    rp: &DVector<f64>,
    rc: &DVector<f64>,
) -> Result<Direction, QpError> {
    let t = rc.component_div(s) + weights.component_mul(rp);
    let rhs = -(rd + kkt.apply_rows_transpose(&t));
    let dz = kkt.solve_newton(weights, &rhs)?;
    let ds = kkt.apply_rows(&dz) + rp;
    let dl = -(rc + lambda.component_mul(&ds)).component_div(s);
    Ok((dz, ds, dl))
}

/// Largest `alpha <= 1` keeping `v + alpha dv >= 0`.
fn max_step(v: &DVector<f64>, dv: &DVector<f64>) -> f64 {
    v.iter()
        .zip(dv.iter())
        .filter(|&(_, &d)| d < 0.0)
        .map(|(&x, &d)| -x / d)
        .fold(1.0, f64::min)
}

/// One-sided rows `G z >= d` built from two-sided `lower <= C z <= upper`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OneSidedRows {
    pub matrix: DMatrix<f64>,
    pub offset: DVector<f64>,
}

impl OneSidedRows {
    pub fn from_two_sided(coefficients: &DMatrix<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> Self {
        let cols = coefficients.ncols();
        let mut rows: Vec<DVector<f64>> = Vec::new();
        let mut offset = Vec::new();
        for i in 0..coefficients.nrows() {
            let row = coefficients.row(i).transpose();
            if is_bounded(lower[i]) {
                rows.push(row.clone());
                offset.push(lower[i]);
            }
            if is_bounded(upper[i]) {
                rows.push(-row);
                offset.push(-upper[i]);
            }
        }
        let mut matrix = DMatrix::zeros(rows.len(), cols);
        for (i, row) in rows.iter().enumerate() {
            matrix.row_mut(i).copy_from(&row.transpose());
        }
        Self {
            matrix,
            offset: DVector::from_vec(offset),
        }
    }

    pub fn len(&self) -> usize {
        self.offset.len()
    }
}

/// Dense QP with two-sided general rows and variable bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseQp {
    pub h: DMatrix<f64>,
    pub g: DVector<f64>,
    pub a: DMatrix<f64>,
    pub lower_a: DVector<f64>,
    pub upper_a: DVector<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl DenseQp {
    pub fn num_variables(&self) -> usize {
        self.g.len()
    }

    pub fn solve(&self, settings: &InteriorPointSettings, warm: Option<&DVector<f64>>) -> Result<QpSolution, QpError> {
        let n = self.num_variables();
        let mut coefficients = DMatrix::zeros(self.a.nrows() + n, n);
        coefficients.rows_mut(0, self.a.nrows()).copy_from(&self.a);
        coefficients
            .rows_mut(self.a.nrows(), n)
            .copy_from(&DMatrix::identity(n, n));
        let lower = concat(&self.lower_a, &self.lower);
        let upper = concat(&self.upper_a, &self.upper);
        let kkt = DenseKkt {
            qp: self,
            rows: OneSidedRows::from_two_sided(&coefficients, &lower, &upper),
        };
        solve_interior_point(&kkt, settings, warm)
    }
}

fn concat(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(a.len() + b.len(), a.iter().chain(b.iter()).copied())
}

struct DenseKkt<'a> {
    qp: &'a DenseQp,
    rows: OneSidedRows,
}

impl KktSystem for DenseKkt<'_> {
    fn num_variables(&self) -> usize {
        self.qp.num_variables()
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn initial_point(&self, warm: Option<&DVector<f64>>) -> DVector<f64> {
        match warm {
            Some(w) if w.len() == self.num_variables() => w.clone(),
            _ => DVector::zeros(self.num_variables()),
        }
    }

    fn gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        &self.qp.h * z + &self.qp.g
    }

    fn objective(&self, z: &DVector<f64>) -> f64 {
        0.5 * z.dot(&(&self.qp.h * z)) + self.qp.g.dot(z)
    }

    fn apply_rows(&self, dz: &DVector<f64>) -> DVector<f64> {
        &self.rows.matrix * dz
    }

    fn apply_rows_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        self.rows.matrix.tr_mul(v)
    }

    fn row_offsets(&self) -> &DVector<f64> {
        &self.rows.offset
    }

    fn solve_newton(&self, weights: &DVector<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, QpError> {
        let g = &self.rows.matrix;
        let weighted = DMatrix::from_fn(g.nrows(), g.ncols(), |i, j| weights[i] * g[(i, j)]);
        let m = &self.qp.h + g.tr_mul(&weighted);
        solve_symmetric(m, rhs)
    }

    fn dual_residual_norm(&self, residual: &DVector<f64>) -> f64 {
        residual.amax()
    }
}

fn solve_symmetric(m: DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, QpError> {
    if let Some(chol) = m.clone().cholesky() {
        return Ok(chol.solve(rhs));
    }
    m.lu()
        .solve(rhs)
        .ok_or_else(|| QpError::Singular("reduced KKT matrix is singular".to_string()))
}

/// Structured KKT system over the stage blocks of a [`SparseQp`].
///
/// Variables are ordered `[dx_0, du_0, dx_1, du_1, ..., dx_N]`.
pub(crate) struct RiccatiKkt<'a> {
    qp: &'a SparseQp,
    /// One entry per stage plus the terminal stage.
    rows: Vec<OneSidedRows>,
    row_start: Vec<usize>,
    offsets: DVector<f64>,
}

impl<'a> RiccatiKkt<'a> {
    pub fn new(qp: &'a SparseQp) -> Self {
        let mut rows: Vec<OneSidedRows> = qp
            .stages
            .iter()
            .map(|stage| {
                let mut c = DMatrix::zeros(stage.cx.nrows(), qp.nx + qp.nu);
                c.columns_mut(0, qp.nx).copy_from(&stage.cx);
                c.columns_mut(qp.nx, qp.nu).copy_from(&stage.cu);
                OneSidedRows::from_two_sided(&c, &stage.lower, &stage.upper)
            })
            .collect();
        rows.push(OneSidedRows::from_two_sided(
            &qp.terminal.cx,
            &qp.terminal.lower,
            &qp.terminal.upper,
        ));
        let mut row_start = Vec::with_capacity(rows.len() + 1);
        let mut total = 0;
        for r in &rows {
            row_start.push(total);
            total += r.len();
        }
        row_start.push(total);
        let offsets = DVector::from_iterator(total, rows.iter().flat_map(|r| r.offset.iter().copied()));
        Self {
            qp,
            rows,
            row_start,
            offsets,
        }
    }

    fn nz(&self) -> usize {
        self.qp.nx + self.qp.nu
    }

    fn horizon(&self) -> usize {
        self.qp.stages.len()
    }

    /// Block of `z` belonging to stage `k` (the terminal block has only states).
    fn block_len(&self, k: usize) -> usize {
        if k == self.horizon() {
            self.qp.nx
        } else {
            self.nz()
        }
    }
}

impl KktSystem for RiccatiKkt<'_> {
    fn num_variables(&self) -> usize {
        self.horizon() * self.nz() + self.qp.nx
    }

    fn num_rows(&self) -> usize {
        self.offsets.len()
    }

    fn initial_point(&self, warm: Option<&DVector<f64>>) -> DVector<f64> {
        let (nx, nu, nz) = (self.qp.nx, self.qp.nu, self.nz());
        let mut z = DVector::zeros(self.num_variables());
        let mut x = self.qp.initial.clone();
        for (k, stage) in self.qp.stages.iter().enumerate() {
            let u = match warm {
                Some(w) if w.len() == z.len() => w.rows(k * nz + nx, nu).clone_owned(),
                _ => DVector::zeros(nu),
            };
            z.rows_mut(k * nz, nx).copy_from(&x);
            z.rows_mut(k * nz + nx, nu).copy_from(&u);
            x = &stage.a * &x + &stage.b * &u + &stage.c;
        }
        z.rows_mut(self.horizon() * nz, nx).copy_from(&x);
        z
    }

    fn gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        let (nx, nu, nz) = (self.qp.nx, self.qp.nu, self.nz());
        let mut out = DVector::zeros(z.len());
        for (k, st) in self.qp.stages.iter().enumerate() {
            let x = z.rows(k * nz, nx).clone_owned();
            let u = z.rows(k * nz + nx, nu).clone_owned();
            let gx = &st.q * &x + &st.s * &u + &st.q_vec;
            let gu = st.s.tr_mul(&x) + &st.r * &u + &st.r_vec;
            out.rows_mut(k * nz, nx).copy_from(&gx);
            out.rows_mut(k * nz + nx, nu).copy_from(&gu);
        }
        let n0 = self.horizon() * nz;
        let t = &self.qp.terminal;
        let gx = &t.q * z.rows(n0, nx).clone_owned() + &t.q_vec;
        out.rows_mut(n0, nx).copy_from(&gx);
        out
    }

    fn objective(&self, z: &DVector<f64>) -> f64 {
        let (nx, nu, nz) = (self.qp.nx, self.qp.nu, self.nz());
        let mut total = 0.0;
        for (k, st) in self.qp.stages.iter().enumerate() {
            let x = z.rows(k * nz, nx).clone_owned();
            let u = z.rows(k * nz + nx, nu).clone_owned();
            total += 0.5 * x.dot(&(&st.q * &x)) + x.dot(&(&st.s * &u)) + 0.5 * u.dot(&(&st.r * &u))
                + st.q_vec.dot(&x)
                + st.r_vec.dot(&u);
        }
        let x = z.rows(self.horizon() * nz, nx).clone_owned();
        let t = &self.qp.terminal;
        total + 0.5 * x.dot(&(&t.q * &x)) + t.q_vec.dot(&x)
    }

    fn apply_rows(&self, dz: &DVector<f64>) -> DVector<f64> {
        let nz = self.nz();
        let mut out = DVector::zeros(self.num_rows());
        for (k, rows) in self.rows.iter().enumerate() {
            if rows.len() == 0 {
                continue;
            }
            let block = dz.rows(k * nz, self.block_len(k)).clone_owned();
            out.rows_mut(self.row_start[k], rows.len())
                .copy_from(&(&rows.matrix * &block));
        }
        out
    }

    fn apply_rows_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        let nz = self.nz();
        let mut out = DVector::zeros(self.num_variables());
        for (k, rows) in self.rows.iter().enumerate() {
            if rows.len() == 0 {
                continue;
            }
            let part = rows.matrix.tr_mul(&v.rows(self.row_start[k], rows.len()));
            let mut block = out.rows_mut(k * nz, self.block_len(k));
            block += part;
        }
        out
    }

    fn row_offsets(&self) -> &DVector<f64> {
        &self.offsets
    }

    fn solve_newton(&self, weights: &DVector<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, QpError> {
        let (nx, nu, nz) = (self.qp.nx, self.qp.nu, self.nz());
        let n = self.horizon();

        // stage Hessians with the barrier term folded in
        let weighted = |k: usize, base: DMatrix<f64>| -> DMatrix<f64> {
            let rows = &self.rows[k];
            if rows.len() == 0 || weights.is_empty() {
                return base;
            }
            let w = weights.rows(self.row_start[k], rows.len());
            let g = &rows.matrix;
            let wg = DMatrix::from_fn(g.nrows(), g.ncols(), |i, j| w[i] * g[(i, j)]);
            base + g.tr_mul(&wg)
        };

        let terminal = &self.qp.terminal;
        let mut p = weighted(n, terminal.q.clone());
        let mut p_vec = -rhs.rows(n * nz, nx).clone_owned();
        let mut gains = Vec::with_capacity(n);

        for k in (0..n).rev() {
            let st = &self.qp.stages[k];
            let mut h = DMatrix::zeros(nz, nz);
            h.view_mut((0, 0), (nx, nx)).copy_from(&st.q);
            h.view_mut((0, nx), (nx, nu)).copy_from(&st.s);
            h.view_mut((nx, 0), (nu, nx)).copy_from(&st.s.transpose());
            h.view_mut((nx, nx), (nu, nu)).copy_from(&st.r);
            let m = weighted(k, h);
            let q = m.view((0, 0), (nx, nx)).clone_owned();
            let s = m.view((0, nx), (nx, nu)).clone_owned();
            let r = m.view((nx, nx), (nu, nu)).clone_owned();
            let qv = -rhs.rows(k * nz, nx).clone_owned();
            let rv = -rhs.rows(k * nz + nx, nu).clone_owned();

            let pa = &p * &st.a;
            let pb = &p * &st.b;
            let huu = r + st.b.tr_mul(&pb);
            let hux = s.transpose() + st.b.tr_mul(&pa);
            let hu = rv + st.b.tr_mul(&p_vec);
            let chol = huu.cholesky().ok_or_else(|| {
                QpError::Singular(format!("stage {k} control Hessian is not positive definite"))
            })?;
            let gain = -chol.solve(&hux);
            let feedforward = -chol.solve(&hu);

            let next = q + st.a.tr_mul(&pa) + hux.tr_mul(&gain);
            p = (&next + next.transpose()) * 0.5;
            p_vec = qv + st.a.tr_mul(&p_vec) + hux.tr_mul(&feedforward);
            gains.push((gain, feedforward));
        }
        gains.reverse();

        let mut dz = DVector::zeros(self.num_variables());
        let mut x = DVector::zeros(nx);
        for (k, (gain, feedforward)) in gains.iter().enumerate() {
            let st = &self.qp.stages[k];
            let u = gain * &x + feedforward;
            dz.rows_mut(k * nz, nx).copy_from(&x);
            dz.rows_mut(k * nz + nx, nu).copy_from(&u);
            x = &st.a * &x + &st.b * &u;
        }
        dz.rows_mut(n * nz, nx).copy_from(&x);
        Ok(dz)
    }

    fn dual_residual_norm(&self, residual: &DVector<f64>) -> f64 {
        // costates of the dynamics rows, swept backwards from the terminal stage
        let (nx, nu, nz) = (self.qp.nx, self.qp.nu, self.nz());
        let n = self.horizon();
        let mut nu_next = -residual.rows(n * nz, nx).clone_owned();
        let mut worst: f64 = 0.0;
        for k in (0..n).rev() {
            let st = &self.qp.stages[k];
            let ru = residual.rows(k * nz + nx, nu).clone_owned() - st.b.tr_mul(&nu_next);
            worst = worst.max(ru.amax());
            nu_next = st.a.tr_mul(&nu_next) - residual.rows(k * nz, nx).clone_owned();
        }
        worst
    }
}

/// Solves the stage-structured QP with the Riccati-based interior point method.
pub fn solve_structured(
    qp: &SparseQp,
    settings: &InteriorPointSettings,
    warm: Option<&DVector<f64>>,
) -> Result<QpSolution, QpError> {
    solve_interior_point(&RiccatiKkt::new(qp), settings, warm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn box_qp(lower: f64, upper: f64) -> DenseQp {
        // min (z0 - 3)^2 + (z1 + 1)^2 + z0 z1
        DenseQp {
            h: DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]),
            g: DVector::from_vec(vec![-6.0, 2.0]),
            a: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            lower_a: DVector::from_vec(vec![-INFTY]),
            upper_a: DVector::from_vec(vec![INFTY]),
            lower: DVector::from_element(2, lower),
            upper: DVector::from_element(2, upper),
        }
    }

    #[test]
    fn unconstrained_qp_takes_one_newton_step() {
        let qp = box_qp(-INFTY, INFTY);
        let sol = qp.solve(&InteriorPointSettings::default(), None).unwrap();
        // H z = -g
        assert_eq!(sol.iterations, 1);
        assert_relative_eq!(sol.primal[0], 14.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(sol.primal[1], -10.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn active_bounds_are_respected() {
        let qp = box_qp(-1.0, 1.0);
        let sol = qp.solve(&InteriorPointSettings::default(), None).unwrap();
        // z0 pushed to its upper bound, z1 to its lower bound
        assert_relative_eq!(sol.primal[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(sol.primal[1], -1.0, epsilon = 1e-6);
        assert!(sol.complementarity < 1e-6);
    }

    #[test]
    fn general_row_couples_variables() {
        let mut qp = box_qp(-INFTY, INFTY);
        qp.upper_a[0] = 0.5;
        let sol = qp.solve(&InteriorPointSettings::default(), None).unwrap();
        // unconstrained optimum has z0 + z1 = 4/3, so the row is active
        assert_relative_eq!(sol.primal[0] + sol.primal[1], 0.5, epsilon = 1e-6);
        // stationarity: H z + g = -mu * [1, 1] for the upper row
        let grad = &qp.h * &sol.primal + &qp.g;
        assert_relative_eq!(grad[0], grad[1], epsilon = 1e-6);
        assert!(grad[0] < 0.0);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let qp = box_qp(-1.0, 1.0);
        let settings = InteriorPointSettings {
            max_iterations: 1,
            tolerance: 1e-12,
        };
        assert!(matches!(
            qp.solve(&settings, None),
            Err(QpError::MaxIterations { iterations: 1, .. })
        ));
    }

    #[test]
    fn one_sided_rows_drop_infinite_bounds() {
        let c = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let rows = OneSidedRows::from_two_sided(
            &c,
            &DVector::from_vec(vec![0.0, -INFTY]),
            &DVector::from_vec(vec![1.0, 2.0]),
        );
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.offset.as_slice(), &[0.0, -1.0, -2.0]);
        assert_eq!(rows.matrix.row(2).iter().copied().collect::<Vec<_>>(), vec![0.0, -1.0]);
    }
}
