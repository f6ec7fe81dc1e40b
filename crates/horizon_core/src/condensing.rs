//! Gauss-Newton QP construction and condensing.
//!
//! [`build_sparse_qp`] turns a [`Linearization`] into the stage-structured QP in the
//! deviations `(dx_k, du_k)` from the current nodes. [`condense`] eliminates the
//! states through the linearized dynamics and leaves a dense QP in the controls.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::discretization::{Linearization, Variables};
use crate::error::{OcpError, Result};
use crate::ocp::{BoundTarget, ConstraintRow, StructuredNlp};
use crate::qp::{is_bounded, DenseQp, INFTY};

/// One interval of the structured QP.
///
/// Cost `½ [dx; du]ᵀ [Q S; Sᵀ R] [dx; du] + qᵀ dx + rᵀ du`,
/// dynamics `dx_{k+1} = A dx_k + B du_k + c`,
/// rows `lower <= Cx dx + Cu du <= upper`.
#[derive(Debug, Clone, PartialEq)]
pub struct QpStage {
    pub q: DMatrix<f64>,
    pub s: DMatrix<f64>,
    pub r: DMatrix<f64>,
    pub q_vec: DVector<f64>,
    pub r_vec: DVector<f64>,
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub c: DVector<f64>,
    pub cx: DMatrix<f64>,
    pub cu: DMatrix<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
    pub bound_targets: Vec<Option<BoundTarget>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpTerminal {
    pub q: DMatrix<f64>,
    pub q_vec: DVector<f64>,
    pub cx: DMatrix<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

/// Stage-structured QP; `initial` is the fixed value of `dx_0`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseQp {
    pub nx: usize,
    pub nu: usize,
    pub stages: Vec<QpStage>,
    pub terminal: QpTerminal,
    pub initial: DVector<f64>,
}

fn shift(bound: f64, by: f64) -> f64 {
    if is_bounded(bound) {
        bound - by
    } else if bound > 0.0 {
        INFTY
    } else {
        -INFTY
    }
}

fn relative_bounds(rows: &[&ConstraintRow], value: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
    let lower = DVector::from_iterator(rows.len(), rows.iter().zip(value.iter()).map(|(r, &g)| shift(r.lower, g)));
    let upper = DVector::from_iterator(rows.len(), rows.iter().zip(value.iter()).map(|(r, &g)| shift(r.upper, g)));
    (lower, upper)
}

fn gauss_newton(jacobian: &DMatrix<f64>, weight: &DMatrix<f64>) -> DMatrix<f64> {
    jacobian.tr_mul(&(weight * jacobian))
}

/// Builds the Gauss-Newton QP around `vars` for the measured state `x0`.
///
/// State-only rows are dropped on the first interval since `dx_0` is fixed there.
pub fn build_sparse_qp(
    nlp: &StructuredNlp,
    vars: &Variables,
    lin: &Linearization,
    x0: &DVector<f64>,
    levenberg_marquardt: f64,
) -> Result<SparseQp> {
    let dims = nlp.dimensions();
    let (nx, nu) = (dims.nx, dims.nu);
    if x0.len() != nx {
        return Err(OcpError::dimension("initial state", nx, x0.len()));
    }
    if lin.stages.len() != dims.horizon {
        return Err(OcpError::dimension("stage linearizations", dims.horizon, lin.stages.len()));
    }
    let lm_x = DMatrix::identity(nx, nx) * levenberg_marquardt;
    let lm_u = DMatrix::identity(nu, nu) * levenberg_marquardt;

    let mut stages = Vec::with_capacity(dims.horizon);
    for (k, stage) in lin.stages.iter().enumerate() {
        let w = &vars.w[k];
        let res = &stage.residual;
        let r = &res.value - &vars.y[k];
        let wr = w * &r;

        let keep: Vec<usize> = nlp
            .path_rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| k > 0 || !row.state_only)
            .map(|(i, _)| i)
            .collect();
        let rows: Vec<&ConstraintRow> = keep.iter().map(|&i| &nlp.path_rows()[i]).collect();
        let value = stage.constraints.value.select_rows(keep.iter());
        let (lower, upper) = relative_bounds(&rows, &value);

        stages.push(QpStage {
            q: gauss_newton(&res.jx, w) + &lm_x,
            s: res.jx.tr_mul(&(w * &res.ju)),
            r: gauss_newton(&res.ju, w) + &lm_u,
            q_vec: res.jx.tr_mul(&wr),
            r_vec: res.ju.tr_mul(&wr),
            a: stage.dynamics.a.clone(),
            b: stage.dynamics.b.clone(),
            c: &stage.dynamics.x_next - &vars.x[k + 1],
            cx: stage.constraints.jx.select_rows(keep.iter()),
            cu: stage.constraints.ju.select_rows(keep.iter()),
            lower,
            upper,
            bound_targets: rows.iter().map(|row| row.target).collect(),
        });
    }

    let term = &lin.terminal;
    let r_n = &term.residual.value - &vars.y_n;
    let terminal_rows: Vec<&ConstraintRow> = nlp.terminal_rows().iter().collect();
    let (lower, upper) = relative_bounds(&terminal_rows, &term.constraints.value);
    let terminal = QpTerminal {
        q: gauss_newton(&term.residual.jx, &vars.w_n) + &lm_x,
        q_vec: term.residual.jx.tr_mul(&(&vars.w_n * r_n)),
        cx: term.constraints.jx.clone(),
        lower,
        upper,
    };

    Ok(SparseQp {
        nx,
        nu,
        stages,
        terminal,
        initial: x0 - &vars.x[0],
    })
}

/// The structured QP as sparse matrices over `z = [dx_0, du_0, ..., dx_N]`.
#[derive(Debug, Clone)]
pub struct AssembledQp {
    pub hessian: CscMatrix<f64>,
    pub gradient: DVector<f64>,
    /// Initial-value and dynamics rows, `E z = e`.
    pub equality: CscMatrix<f64>,
    pub equality_rhs: DVector<f64>,
    pub constraints: CscMatrix<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

fn push_block(coo: &mut CooMatrix<f64>, row: usize, col: usize, block: &DMatrix<f64>) {
    for j in 0..block.ncols() {
        for i in 0..block.nrows() {
            let v = block[(i, j)];
            if v != 0.0 {
                coo.push(row + i, col + j, v);
            }
        }
    }
}

impl SparseQp {
    pub fn horizon(&self) -> usize {
        self.stages.len()
    }

    pub fn num_variables(&self) -> usize {
        self.horizon() * (self.nx + self.nu) + self.nx
    }

    pub fn num_constraints(&self) -> usize {
        self.stages.iter().map(|s| s.lower.len()).sum::<usize>() + self.terminal.lower.len()
    }

    pub fn assemble(&self) -> AssembledQp {
        let (nx, nu) = (self.nx, self.nu);
        let nz = nx + nu;
        let n = self.horizon();
        let nv = self.num_variables();

        let mut hessian = CooMatrix::new(nv, nv);
        let mut gradient = DVector::zeros(nv);
        let mut equality = CooMatrix::new((n + 1) * nx, nv);
        let mut equality_rhs = DVector::zeros((n + 1) * nx);
        let mut constraints = CooMatrix::new(self.num_constraints(), nv);
        let mut lower = Vec::with_capacity(self.num_constraints());
        let mut upper = Vec::with_capacity(self.num_constraints());

        push_block(&mut equality, 0, 0, &DMatrix::identity(nx, nx));
        equality_rhs.rows_mut(0, nx).copy_from(&self.initial);

        let mut row = 0;
        for (k, st) in self.stages.iter().enumerate() {
            let col = k * nz;
            push_block(&mut hessian, col, col, &st.q);
            push_block(&mut hessian, col, col + nx, &st.s);
            push_block(&mut hessian, col + nx, col, &st.s.transpose());
            push_block(&mut hessian, col + nx, col + nx, &st.r);
            gradient.rows_mut(col, nx).copy_from(&st.q_vec);
            gradient.rows_mut(col + nx, nu).copy_from(&st.r_vec);

            let eq = (k + 1) * nx;
            push_block(&mut equality, eq, col + nz, &DMatrix::identity(nx, nx));
            push_block(&mut equality, eq, col, &(-&st.a));
            push_block(&mut equality, eq, col + nx, &(-&st.b));
            equality_rhs.rows_mut(eq, nx).copy_from(&st.c);

            push_block(&mut constraints, row, col, &st.cx);
            push_block(&mut constraints, row, col + nx, &st.cu);
            lower.extend(st.lower.iter().copied());
            upper.extend(st.upper.iter().copied());
            row += st.lower.len();
        }
        let col = n * nz;
        push_block(&mut hessian, col, col, &self.terminal.q);
        gradient.rows_mut(col, nx).copy_from(&self.terminal.q_vec);
        push_block(&mut constraints, row, col, &self.terminal.cx);
        lower.extend(self.terminal.lower.iter().copied());
        upper.extend(self.terminal.upper.iter().copied());

        AssembledQp {
            hessian: CscMatrix::from(&hessian),
            gradient,
            equality: CscMatrix::from(&equality),
            equality_rhs,
            constraints: CscMatrix::from(&constraints),
            lower: DVector::from_vec(lower),
            upper: DVector::from_vec(upper),
        }
    }
}

/// Dense QP in `w = [du_0, ..., du_{N-1}]` plus the affine state map
/// `dx_k = X_k w + x̄_k` needed to recover the states.
#[derive(Debug, Clone, PartialEq)]
pub struct CondensedQp {
    pub dense: DenseQp,
    pub state_map: Vec<DMatrix<f64>>,
    pub state_offset: Vec<DVector<f64>>,
}

impl CondensedQp {
    /// Recovers `z = [dx_0, du_0, ..., dx_N]` from the control deviations.
    pub fn expand(&self, w: &DVector<f64>) -> DVector<f64> {
        let n = self.state_map.len() - 1;
        let nx = self.state_offset[0].len();
        let nu = if n == 0 { 0 } else { w.len() / n };
        let nz = nx + nu;
        let mut z = DVector::zeros(n * nz + nx);
        for k in 0..=n {
            let dx = &self.state_map[k] * w + &self.state_offset[k];
            z.rows_mut(k * nz, nx).copy_from(&dx);
            if k < n {
                z.rows_mut(k * nz + nx, nu).copy_from(&w.rows(k * nu, nu));
            }
        }
        z
    }

    pub fn controls_of(z: &DVector<f64>, nx: usize, nu: usize, horizon: usize) -> DVector<f64> {
        let nz = nx + nu;
        DVector::from_iterator(
            horizon * nu,
            (0..horizon).flat_map(|k| z.rows(k * nz + nx, nu).iter().copied().collect::<Vec<_>>()),
        )
    }
}

/// Full condensing: eliminates every state deviation.
///
/// Plain control bounds become variable bounds, every other row becomes a general row
/// of the dense QP.
pub fn condense(qp: &SparseQp) -> CondensedQp {
    let (nx, nu, n) = (qp.nx, qp.nu, qp.horizon());
    let nw = n * nu;
    let mut h = DMatrix::zeros(nw, nw);
    let mut g = DVector::zeros(nw);
    let mut lower = DVector::from_element(nw, -INFTY);
    let mut upper = DVector::from_element(nw, INFTY);

    let mut rows: Vec<DVector<f64>> = Vec::new();
    let mut lower_a = Vec::new();
    let mut upper_a = Vec::new();

    let mut x_map = DMatrix::zeros(nx, nw);
    let mut x_bar = qp.initial.clone();
    let mut state_map = Vec::with_capacity(n + 1);
    let mut state_offset = Vec::with_capacity(n + 1);

    for (k, st) in qp.stages.iter().enumerate() {
        let cols = k * nu;
        h += x_map.tr_mul(&(&st.q * &x_map));
        let cross = x_map.tr_mul(&st.s);
        {
            let mut block = h.columns_mut(cols, nu);
            block += &cross;
        }
        {
            let mut block = h.rows_mut(cols, nu);
            block += cross.transpose();
        }
        {
            let mut block = h.view_mut((cols, cols), (nu, nu));
            block += &st.r;
        }
        g += x_map.tr_mul(&(&st.q * &x_bar + &st.q_vec));
        {
            let mut block = g.rows_mut(cols, nu);
            block += st.s.tr_mul(&x_bar) + &st.r_vec;
        }

        for i in 0..st.lower.len() {
            let offset = st.cx.row(i).dot(&x_bar.transpose());
            match st.bound_targets[i] {
                Some(BoundTarget::Control(j)) => {
                    let idx = cols + j;
                    lower[idx] = lower[idx].max(st.lower[i]);
                    upper[idx] = upper[idx].min(st.upper[i]);
                }
                _ => {
                    let mut coefficients = (st.cx.row(i) * &x_map).transpose();
                    {
                        let mut block = coefficients.rows_mut(cols, nu);
                        block += st.cu.row(i).transpose();
                    }
                    rows.push(coefficients);
                    lower_a.push(shift(st.lower[i], offset));
                    upper_a.push(shift(st.upper[i], offset));
                }
            }
        }

        state_map.push(x_map.clone());
        state_offset.push(x_bar.clone());
        let mut next = &st.a * &x_map;
        {
            let mut block = next.columns_mut(cols, nu);
            block += &st.b;
        }
        x_bar = &st.a * &x_bar + &st.c;
        x_map = next;
    }

    let t = &qp.terminal;
    h += x_map.tr_mul(&(&t.q * &x_map));
    g += x_map.tr_mul(&(&t.q * &x_bar + &t.q_vec));
    for i in 0..t.lower.len() {
        let offset = t.cx.row(i).dot(&x_bar.transpose());
        rows.push((t.cx.row(i) * &x_map).transpose());
        lower_a.push(shift(t.lower[i], offset));
        upper_a.push(shift(t.upper[i], offset));
    }
    state_map.push(x_map);
    state_offset.push(x_bar);

    let mut a = DMatrix::zeros(rows.len(), nw);
    for (i, row) in rows.iter().enumerate() {
        a.row_mut(i).copy_from(&row.transpose());
    }
    let h = (&h + h.transpose()) * 0.5;

    CondensedQp {
        dense: DenseQp {
            h,
            g,
            a,
            lower_a: DVector::from_vec(lower_a),
            upper_a: DVector::from_vec(upper_a),
            lower,
            upper,
        },
        state_map,
        state_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfig;
    use crate::discretization::Discretization;
    use crate::ocp::tests::getting_started_ocp;
    use crate::qp::{solve_structured, InteriorPointSettings};
    use approx::assert_relative_eq;

    fn getting_started_qp(horizon: usize) -> SparseQp {
        let nlp = getting_started_ocp(horizon, 0.1).finalize().unwrap();
        let disc = Discretization::new(&nlp, &ExportConfig::default()).unwrap();
        let mut vars = Variables::new(&nlp);
        for u in vars.u.iter_mut() {
            u[0] = 0.5;
        }
        vars.x[0] = DVector::from_vec(vec![1.0, 0.0]);
        disc.forward_simulation(&nlp, &mut vars).unwrap();
        // perturb one node so the QP carries a nonzero defect
        vars.x[2][0] += 0.05;
        let lin = disc.linearize(&nlp, &vars).unwrap();
        let x0 = DVector::from_vec(vec![1.2, -0.1]);
        build_sparse_qp(&nlp, &vars, &lin, &x0, 1e-10).unwrap()
    }

    #[test]
    fn first_stage_drops_state_only_rows() {
        let qp = getting_started_qp(4);
        assert_eq!(qp.stages[0].lower.len(), 1);
        assert_eq!(qp.stages[0].bound_targets, vec![Some(BoundTarget::Control(0))]);
        assert_eq!(qp.stages[1].lower.len(), 2);
        assert_eq!(qp.terminal.lower.len(), 1);
        assert_eq!(qp.num_constraints(), 1 + 3 * 2 + 1);
        assert_relative_eq!(qp.initial[0], 0.2, epsilon = 1e-15);
        assert_relative_eq!(qp.stages[1].c[0], -0.05, epsilon = 1e-15);
    }

    #[test]
    fn bounds_are_relative_to_the_current_nodes() {
        let qp = getting_started_qp(4);
        // 0 <= u <= 1 around u = 0.5
        assert_relative_eq!(qp.stages[0].lower[0], -0.5, epsilon = 1e-15);
        assert_relative_eq!(qp.stages[0].upper[0], 0.5, epsilon = 1e-15);
    }

    #[test]
    fn unbounded_sides_stay_unbounded_after_shifting() {
        assert_eq!(shift(INFTY, 3.0), INFTY);
        assert_eq!(shift(-f64::INFINITY, 3.0), -INFTY);
        assert_eq!(shift(1.0, 3.0), -2.0);
    }

    #[test]
    fn condensed_and_structured_solutions_agree() {
        let qp = getting_started_qp(6);
        let settings = InteriorPointSettings::default();
        let structured = solve_structured(&qp, &settings, None).unwrap();
        let condensed = condense(&qp);
        let dense = condensed.dense.solve(&settings, None).unwrap();
        let z = condensed.expand(&dense.primal);
        assert_relative_eq!(z, structured.primal, epsilon = 1e-6);
    }

    #[test]
    fn state_map_satisfies_linearized_dynamics() {
        let qp = getting_started_qp(3);
        let condensed = condense(&qp);
        let w = DVector::from_vec(vec![0.1, -0.2, 0.3]);
        let z = condensed.expand(&w);
        let nz = qp.nx + qp.nu;
        assert_relative_eq!(z.rows(0, qp.nx).clone_owned(), qp.initial, epsilon = 1e-15);
        for (k, st) in qp.stages.iter().enumerate() {
            let x = z.rows(k * nz, qp.nx).clone_owned();
            let u = z.rows(k * nz + qp.nx, qp.nu).clone_owned();
            let next = z.rows((k + 1) * nz, qp.nx).clone_owned();
            assert_relative_eq!(next, &st.a * x + &st.b * u + &st.c, epsilon = 1e-12);
        }
        assert_relative_eq!(
            CondensedQp::controls_of(&z, qp.nx, qp.nu, 3),
            w,
            epsilon = 1e-15
        );
    }

    #[test]
    fn assembled_qp_has_the_block_pattern() {
        let qp = getting_started_qp(3);
        let assembled = qp.assemble();
        let nv = qp.num_variables();
        assert_eq!(nv, 3 * 3 + 2);
        assert_eq!(assembled.hessian.nrows(), nv);
        assert_eq!(assembled.equality.nrows(), 4 * 2);
        assert_eq!(assembled.constraints.nrows(), qp.num_constraints());
        // every dynamics row carries the identity on dx_{k+1}
        assert!(assembled.equality.nnz() >= 4 * 2);
    }
}
