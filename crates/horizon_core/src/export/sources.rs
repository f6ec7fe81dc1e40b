//! Renders the generated C sources.
//!
//! Algorithms live in the `templates/` directory and only depend on the macros of
//! the common header; everything problem-specific (dimensions, constants, lowered
//! model functions) is rendered here.

use std::fmt::Write;

use crate::config::{Condensing, DiscretizationType, ExportConfig, Precision};
use crate::error::Result;
use crate::integrator::ButcherTableau;
use crate::ocp::{BoundTarget, StructuredNlp};
use crate::qp::INFTY;

use super::lowering::{emit_array, emit_int_array, emit_program, literal, row_major};
use super::{QpDimensions, PREFIX};

const BANNER: &str = "/* Generated by horizon. Do not edit. */\n\n";

const LINALG: &str = include_str!("templates/linalg.c");
const RK_EXPLICIT: &str = include_str!("templates/rk_explicit.c");
const RK_IMPLICIT: &str = include_str!("templates/rk_implicit.c");
const INTEGRATE: &str = include_str!("templates/integrate.c");
const LINEARIZE: &str = include_str!("templates/linearize.c");
const CONDENSE_FULL: &str = include_str!("templates/condense_full.c");
const CONDENSE_SPARSE: &str = include_str!("templates/condense_sparse.c");
const QP_DENSE: &str = include_str!("templates/qp_dense.c");
const QP_SPARSE: &str = include_str!("templates/qp_sparse.c");
const SOLVER: &str = include_str!("templates/solver.c");
const TEST_HARNESS: &str = include_str!("templates/test.c");

pub(crate) struct Sources<'a> {
    pub nlp: &'a StructuredNlp,
    pub config: &'a ExportConfig,
    pub tableau: ButcherTableau,
    pub steps: usize,
    pub qp: QpDimensions,
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl Sources<'_> {
    fn precision(&self) -> Precision {
        self.config.precision
    }

    fn lit(&self, value: f64) -> String {
        literal(value, self.precision())
    }

    pub fn common_header(&self) -> Result<String> {
        let dims = self.nlp.dimensions();
        let config = self.config;
        let guard = format!("{}_COMMON_H", PREFIX.to_ascii_uppercase());
        let mut out = String::from(BANNER);
        writeln!(out, "#ifndef {guard}")?;
        writeln!(out, "#define {guard}\n")?;
        writeln!(out, "#include <math.h>")?;
        writeln!(out, "#include <string.h>\n")?;
        match self.precision() {
            Precision::Double => {
                writeln!(out, "typedef double real_t;")?;
                writeln!(out, "#define HORIZON_FABS fabs\n")?;
            }
            Precision::Single => {
                writeln!(out, "typedef float real_t;")?;
                writeln!(out, "#define HORIZON_FABS fabsf\n")?;
            }
        }

        writeln!(out, "#define HORIZON_N {}", dims.horizon)?;
        writeln!(out, "#define HORIZON_NX {}", dims.nx)?;
        writeln!(out, "#define HORIZON_NU {}", dims.nu)?;
        writeln!(out, "#define HORIZON_ND {}", dims.nd)?;
        writeln!(out, "#define HORIZON_NY {}", dims.ny)?;
        writeln!(out, "#define HORIZON_NYN {}", dims.nyn)?;
        writeln!(out, "#define HORIZON_NPAC {}", dims.path_constraints)?;
        writeln!(out, "#define HORIZON_NTAC {}", dims.terminal_constraints)?;
        writeln!(out, "#define HORIZON_NXU (HORIZON_NX + HORIZON_NU)")?;
        writeln!(out, "#define HORIZON_NIN (HORIZON_NXU + HORIZON_ND)")?;
        writeln!(out, "#define HORIZON_NYMAX (HORIZON_NY > HORIZON_NYN ? HORIZON_NY : HORIZON_NYN)")?;
        writeln!(out, "#define HORIZON_LIN_JX HORIZON_NX")?;
        writeln!(out, "#define HORIZON_LIN_JU (HORIZON_NX + HORIZON_NX * HORIZON_NX)")?;
        writeln!(out, "#define HORIZON_LIN_SIZE (HORIZON_NX * (1 + HORIZON_NXU))\n")?;

        writeln!(out, "/* {} */", self.tableau.name())?;
        writeln!(out, "#define HORIZON_TS {}", self.lit(self.nlp.stage_duration()))?;
        writeln!(out, "#define HORIZON_STAGES {}", self.tableau.stages())?;
        writeln!(out, "#define HORIZON_INTEGRATOR_STEPS {}", self.steps)?;
        writeln!(out, "#define HORIZON_MAX_RETRIES {}", config.max_integrator_retries)?;
        writeln!(out, "#define HORIZON_NEWTON_MAX_STEPS {}", config.newton.max_steps)?;
        writeln!(out, "#define HORIZON_NEWTON_DAMPING {}", self.lit(config.newton.damping))?;
        writeln!(out, "#define HORIZON_NEWTON_TOL {}\n", self.lit(config.newton.tolerance))?;

        writeln!(out, "#define HORIZON_QP_NV {}", self.qp.variables)?;
        writeln!(out, "#define HORIZON_QP_NEQ {}", self.qp.equalities)?;
        writeln!(out, "#define HORIZON_QP_NC {}", self.qp.general_constraints)?;
        writeln!(out, "#define HORIZON_QP_MAX_ITERATIONS {}", config.interior_point.max_iterations)?;
        writeln!(out, "#define HORIZON_QP_TOL {}", self.lit(config.interior_point.tolerance))?;
        writeln!(out, "#define HORIZON_LEVENBERG_MARQUARDT {}\n", self.lit(config.levenberg_marquardt))?;

        writeln!(
            out,
            "#define HORIZON_SINGLE_SHOOTING {}",
            flag(config.discretization_type == DiscretizationType::SingleShooting)
        )?;
        writeln!(out, "#define HORIZON_HOTSTART_QP {}", flag(config.hotstart_qp))?;
        writeln!(out, "#define HORIZON_VARIABLE_WEIGHTING {}", flag(config.variable_weighting_matrix))?;
        writeln!(out, "#define HORIZON_HARDCODED_BOUNDS {}", flag(config.hardcode_constraint_values))?;
        writeln!(out, "#define HORIZON_W_COUNT (HORIZON_VARIABLE_WEIGHTING ? HORIZON_N : 1)\n")?;

        let infty = match self.precision() {
            Precision::Double => format!("{INFTY:e}"),
            Precision::Single => format!("{INFTY:e}f"),
        };
        writeln!(out, "#define HORIZON_INFTY {infty}")?;
        writeln!(out, "#define HORIZON_ALLOC(n) ((n) > 0 ? (n) : 1)\n")?;
        writeln!(out, "#define HORIZON_OK 0")?;
        writeln!(out, "#define HORIZON_ERR_INTEGRATOR 1")?;
        writeln!(out, "#define HORIZON_ERR_QP 2\n")?;

        out.push_str(
            "static inline real_t horizon_powi(real_t base, int n)\n{\n    real_t r = 1;\n    int i, m = n < 0 ? -n : n;\n    for (i = 0; i < m; ++i)\n        r *= base;\n    return n < 0 ? 1 / r : r;\n}\n\n",
        );

        out.push_str("typedef struct horizon_variables {\n");
        out.push_str("    real_t x[(HORIZON_N + 1) * HORIZON_NX];\n");
        out.push_str("    real_t u[HORIZON_N * HORIZON_NU];\n");
        out.push_str("    real_t od[HORIZON_ALLOC((HORIZON_N + 1) * HORIZON_ND)];\n");
        out.push_str("    real_t y[HORIZON_ALLOC(HORIZON_N * HORIZON_NY)];\n");
        out.push_str("    real_t yN[HORIZON_ALLOC(HORIZON_NYN)];\n");
        out.push_str("    real_t W[HORIZON_ALLOC(HORIZON_W_COUNT * HORIZON_NY * HORIZON_NY)];\n");
        out.push_str("    real_t WN[HORIZON_ALLOC(HORIZON_NYN * HORIZON_NYN)];\n");
        out.push_str("    real_t x0[HORIZON_NX];\n");
        if !config.hardcode_constraint_values {
            out.push_str("    real_t lbPath[HORIZON_ALLOC(HORIZON_NPAC)];\n");
            out.push_str("    real_t ubPath[HORIZON_ALLOC(HORIZON_NPAC)];\n");
        }
        out.push_str("} horizon_variables;\n\n");

        out.push_str("typedef struct horizon_workspace {\n");
        out.push_str("    real_t in[HORIZON_NIN];\n");
        out.push_str("    real_t xnext[HORIZON_NX];\n");
        out.push_str("    real_t A[HORIZON_N * HORIZON_NX * HORIZON_NX];\n");
        out.push_str("    real_t B[HORIZON_N * HORIZON_NX * HORIZON_NU];\n");
        out.push_str("    real_t c[HORIZON_N * HORIZON_NX];\n");
        out.push_str("    real_t Q[(HORIZON_N + 1) * HORIZON_NX * HORIZON_NX];\n");
        out.push_str("    real_t S[HORIZON_N * HORIZON_NX * HORIZON_NU];\n");
        out.push_str("    real_t R[HORIZON_N * HORIZON_NU * HORIZON_NU];\n");
        out.push_str("    real_t qv[(HORIZON_N + 1) * HORIZON_NX];\n");
        out.push_str("    real_t rv[HORIZON_N * HORIZON_NU];\n");
        out.push_str("    real_t Cx[HORIZON_ALLOC(HORIZON_N * HORIZON_NPAC * HORIZON_NX)];\n");
        out.push_str("    real_t Cu[HORIZON_ALLOC(HORIZON_N * HORIZON_NPAC * HORIZON_NU)];\n");
        out.push_str("    real_t lbC[HORIZON_ALLOC(HORIZON_N * HORIZON_NPAC)];\n");
        out.push_str("    real_t ubC[HORIZON_ALLOC(HORIZON_N * HORIZON_NPAC)];\n");
        out.push_str("    int rowOf[HORIZON_ALLOC(HORIZON_N * HORIZON_NPAC)];\n");
        out.push_str("    int nC[HORIZON_N];\n");
        out.push_str("    real_t CxN[HORIZON_ALLOC(HORIZON_NTAC * HORIZON_NX)];\n");
        out.push_str("    real_t lbCN[HORIZON_ALLOC(HORIZON_NTAC)];\n");
        out.push_str("    real_t ubCN[HORIZON_ALLOC(HORIZON_NTAC)];\n");
        out.push_str("    real_t dx0[HORIZON_NX];\n");
        out.push_str("    real_t dz[HORIZON_N * HORIZON_NXU + HORIZON_NX];\n");
        if config.condensing == Condensing::Full {
            out.push_str("    real_t H[HORIZON_QP_NV * HORIZON_QP_NV];\n");
            out.push_str("    real_t g[HORIZON_QP_NV];\n");
            out.push_str("    real_t Ac[HORIZON_ALLOC(HORIZON_QP_NC * HORIZON_QP_NV)];\n");
            out.push_str("    real_t lbA[HORIZON_ALLOC(HORIZON_QP_NC)];\n");
            out.push_str("    real_t ubA[HORIZON_ALLOC(HORIZON_QP_NC)];\n");
            out.push_str("    real_t lb[HORIZON_QP_NV];\n");
            out.push_str("    real_t ub[HORIZON_QP_NV];\n");
            out.push_str("    real_t Xmap[(HORIZON_N + 1) * HORIZON_NX * HORIZON_QP_NV];\n");
            out.push_str("    real_t xbar[(HORIZON_N + 1) * HORIZON_NX];\n");
        }
        out.push_str("    real_t primal[HORIZON_QP_NV];\n");
        out.push_str("    real_t complementarity;\n");
        out.push_str("    real_t kkt;\n");
        out.push_str("    int qpIterations;\n");
        out.push_str("    int warm;\n");
        out.push_str("} horizon_workspace;\n\n");

        out.push_str("extern horizon_variables horizon_vars;\n");
        out.push_str("extern horizon_workspace horizon_work;\n\n");

        out.push_str("extern const real_t horizon_default_W[];\n");
        out.push_str("extern const real_t horizon_default_WN[];\n");
        out.push_str("extern const real_t horizon_path_lb_values[];\n");
        out.push_str("extern const real_t horizon_path_ub_values[];\n");
        out.push_str("extern const int horizon_path_state_only[];\n");
        out.push_str("extern const int horizon_path_control_bound[];\n");
        out.push_str("extern const int horizon_terminal_row_of[];\n\n");
        out.push_str("#if HORIZON_HARDCODED_BOUNDS\n");
        out.push_str("#define HORIZON_PATH_LB horizon_path_lb_values\n");
        out.push_str("#define HORIZON_PATH_UB horizon_path_ub_values\n");
        out.push_str("#else\n");
        out.push_str("#define HORIZON_PATH_LB horizon_vars.lbPath\n");
        out.push_str("#define HORIZON_PATH_UB horizon_vars.ubPath\n");
        out.push_str("#endif\n\n");

        out.push_str("/* model functions: in = [x; u; od] */\n");
        for name in MODEL_FUNCTIONS {
            writeln!(out, "void {name}(const real_t* in, real_t* out);")?;
        }
        out.push('\n');
        out.push_str("int horizon_integrate(const real_t* x, const real_t* u, const real_t* od, real_t* x_next, real_t* A, real_t* B);\n");
        out.push_str("int horizon_linearize(void);\n");
        out.push_str("int horizon_build_qp(void);\n");
        out.push_str("int horizon_solve_qp(void);\n\n");
        out.push_str("int horizon_initialize_solver(void);\n");
        out.push_str("int horizon_initialize_nodes_by_forward_simulation(void);\n");
        out.push_str("int horizon_preparation_step(void);\n");
        out.push_str("int horizon_feedback_step(void);\n");
        out.push_str("int horizon_shift_states(const real_t* xEnd);\n");
        out.push_str("void horizon_shift_controls(const real_t* uEnd);\n");
        out.push_str("real_t horizon_get_kkt(void);\n");
        out.push_str("real_t horizon_get_objective(void);\n\n");
        writeln!(out, "#endif /* {guard} */")?;
        Ok(out)
    }

    pub fn integrator_source(&self) -> Result<String> {
        let precision = self.precision();
        let dynamics = self.nlp.model().dynamics();
        let mut out = String::from(BANNER);
        writeln!(out, "#include \"{PREFIX}_common.h\"\n")?;
        emit_array(&mut out, "static const real_t", "horizon_butcher_a", row_major(self.tableau.a()), precision)?;
        emit_array(&mut out, "static const real_t", "horizon_butcher_b", self.tableau.b().iter().copied(), precision)?;
        emit_program(&mut out, "horizon_rhs", dynamics.value_program(), precision)?;
        emit_program(&mut out, "horizon_rhs_linearization", dynamics.linearization_program(), precision)?;
        if self.tableau.is_explicit() {
            out.push_str(RK_EXPLICIT);
        } else {
            out.push_str(LINALG);
            out.push_str(RK_IMPLICIT);
        }
        out.push_str(INTEGRATE);
        Ok(out)
    }

    pub fn condensing_source(&self) -> Result<String> {
        let precision = self.precision();
        let nlp = self.nlp;
        let rows = nlp.path_rows();
        let mut out = String::from(BANNER);
        writeln!(out, "#include \"{PREFIX}_common.h\"\n")?;

        emit_array(&mut out, "const real_t", "horizon_default_W", row_major(nlp.stage_weight()), precision)?;
        emit_array(&mut out, "const real_t", "horizon_default_WN", row_major(nlp.terminal_weight()), precision)?;
        emit_array(&mut out, "const real_t", "horizon_path_lb_values", rows.iter().map(|r| r.lower), precision)?;
        emit_array(&mut out, "const real_t", "horizon_path_ub_values", rows.iter().map(|r| r.upper), precision)?;
        emit_int_array(&mut out, "horizon_path_state_only", rows.iter().map(|r| i64::from(r.state_only)))?;
        emit_int_array(
            &mut out,
            "horizon_path_control_bound",
            rows.iter().map(|r| match r.target {
                Some(BoundTarget::Control(j)) => j as i64,
                _ => -1,
            }),
        )?;
        emit_int_array(
            &mut out,
            "horizon_terminal_row_of",
            rows.iter()
                .enumerate()
                .filter(|(_, r)| r.state_only)
                .map(|(i, _)| i as i64),
        )?;

        for (i, row) in rows.iter().enumerate() {
            writeln!(out, "/* path row {i}: {} <= {} <= {} */", self.lit(row.lower), row.label, self.lit(row.upper))?;
        }
        if !rows.is_empty() {
            out.push('\n');
        }

        emit_program(&mut out, "horizon_eval_residual_value", nlp.stage_cost().value_program(), precision)?;
        emit_program(&mut out, "horizon_eval_residual", nlp.stage_cost().linearization_program(), precision)?;
        emit_program(&mut out, "horizon_eval_residual_n_value", nlp.terminal_cost().value_program(), precision)?;
        emit_program(&mut out, "horizon_eval_residual_n", nlp.terminal_cost().linearization_program(), precision)?;
        emit_program(
            &mut out,
            "horizon_eval_path_constraints",
            nlp.path_constraints().linearization_program(),
            precision,
        )?;
        emit_program(
            &mut out,
            "horizon_eval_terminal_constraints",
            nlp.terminal_constraints().linearization_program(),
            precision,
        )?;

        out.push_str(LINEARIZE);
        out.push_str(match self.config.condensing {
            Condensing::Full => CONDENSE_FULL,
            Condensing::Sparse => CONDENSE_SPARSE,
        });
        Ok(out)
    }

    pub fn qp_interface_header(&self) -> Result<String> {
        let guard = format!("{}_QP_INTERFACE_H", PREFIX.to_ascii_uppercase());
        let mut out = String::from(BANNER);
        writeln!(out, "#ifndef {guard}")?;
        writeln!(out, "#define {guard}\n")?;
        writeln!(out, "#include \"{PREFIX}_common.h\"\n")?;
        match self.config.condensing {
            Condensing::Full => out.push_str(
                "/* Dense interior point backend:\n\
                 \x20*   min 1/2 w'Hw + g'w  s.t.  lbA <= A w <= ubA,  lb <= w <= ub\n\
                 \x20* with row-major H and A. Returns 0 on success. */\n\
                 int horizon_dense_ipm_solve(int nv, int nc, const real_t* H, const real_t* g, const real_t* A,\n\
                 \x20                           const real_t* lbA, const real_t* ubA, const real_t* lb, const real_t* ub,\n\
                 \x20                           real_t* primal, int warm_start, int max_iterations, real_t tolerance,\n\
                 \x20                           int* iterations, real_t* complementarity);\n\n",
            ),
            Condensing::Sparse => out.push_str(
                "/* Riccati interior point backend over z = [dx_0, du_0, ..., dx_N] with\n\
                 \x20* dx_0 fixed, dx_{k+1} = A_k dx_k + B_k du_k + c_k and stage rows\n\
                 \x20* lbC <= Cx dx_k + Cu du_k <= ubC (nc[k] rows, stored with stride row_stride).\n\
                 \x20* Returns 0 on success. */\n\
                 int horizon_riccati_ipm_solve(int N, int nx, int nu, const int* nc, int row_stride,\n\
                 \x20                             const real_t* Q, const real_t* S, const real_t* R,\n\
                 \x20                             const real_t* q, const real_t* r,\n\
                 \x20                             const real_t* A, const real_t* B, const real_t* c,\n\
                 \x20                             const real_t* Cx, const real_t* Cu, const real_t* lbC, const real_t* ubC,\n\
                 \x20                             int ncN, const real_t* CxN, const real_t* lbCN, const real_t* ubCN,\n\
                 \x20                             const real_t* dx0, real_t* primal, int warm_start,\n\
                 \x20                             int max_iterations, real_t tolerance,\n\
                 \x20                             int* iterations, real_t* complementarity);\n\n",
            ),
        }
        writeln!(out, "#endif /* {guard} */")?;
        Ok(out)
    }

    pub fn qp_interface_source(&self) -> Result<String> {
        let mut out = String::from(BANNER);
        writeln!(out, "#include \"{PREFIX}_qp_interface.h\"\n")?;
        out.push_str(match self.config.condensing {
            Condensing::Full => QP_DENSE,
            Condensing::Sparse => QP_SPARSE,
        });
        Ok(out)
    }

    pub fn solver_source(&self) -> Result<String> {
        let mut out = String::from(BANNER);
        writeln!(out, "#include \"{PREFIX}_common.h\"\n")?;
        out.push_str(SOLVER);
        Ok(out)
    }

    pub fn test_source(&self) -> String {
        let mut out = String::from(BANNER);
        out.push_str(TEST_HARNESS);
        out
    }
}

const MODEL_FUNCTIONS: [&str; 8] = [
    "horizon_rhs",
    "horizon_rhs_linearization",
    "horizon_eval_residual_value",
    "horizon_eval_residual",
    "horizon_eval_residual_n_value",
    "horizon_eval_residual_n",
    "horizon_eval_path_constraints",
    "horizon_eval_terminal_constraints",
];
