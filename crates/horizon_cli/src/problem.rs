//! The getting-started problem: a two-state linear plant tracked to the origin.

use horizon_core::ocp::Constraint;
use horizon_core::{DifferentialModel, Ocp, StructuredNlp};
use nalgebra::DMatrix;

/// Builds and finalizes
///
/// ```text
/// dot x  = -12.44 x + 0.7539 dx + 2 u
/// dot dx = -7.89 x
/// ```
///
/// with LSQ terms on `(x, dx, u)` and `(x, dx)`, `0 <= u <= 1` and `-5 <= dx <= 0`.
pub(crate) fn getting_started(horizon: usize, ts: f64) -> horizon_core::Result<StructuredNlp> {
    let mut model = DifferentialModel::new();
    let x = model.declare_state("x", 1)?;
    let dx = model.declare_state("dx", 1)?;
    let u = model.declare_control("u", 1)?;

    let xe = model.variable(&x);
    let dxe = model.variable(&dx);
    let ue = model.variable(&u);
    let dot_x = model.dot(&x)?;
    let dot_dx = model.dot(&dx)?;

    let g = model.graph_mut();
    let a = g.scale(-12.44, &xe);
    let b = g.scale(0.7539, &dxe);
    let c = g.scale(2.0, &ue);
    let ab = g.add(&a, &b)?;
    let f0 = g.add(&ab, &c)?;
    let f1 = g.scale(-7.89, &xe);
    let h = g.stack(&[&xe, &dxe, &ue]);
    let hn = g.stack(&[&xe, &dxe]);

    model.add_equation(&dot_x, &f0)?;
    model.add_equation(&dot_dx, &f1)?;

    let mut ocp = Ocp::new(0.0, horizon as f64 * ts, horizon)?;
    ocp.subject_to(Constraint::dynamics(model))?;
    ocp.minimize_lsq(DMatrix::identity(3, 3), &h)?;
    ocp.minimize_lsq_end_term(DMatrix::identity(2, 2), &hn)?;
    ocp.subject_to(Constraint::bounds(0.0, &ue, 1.0))?;
    ocp.subject_to(Constraint::bounds(-5.0, &dxe, 0.0))?;
    ocp.finalize()
}
