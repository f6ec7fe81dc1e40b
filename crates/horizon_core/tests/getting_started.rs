//! End-to-end checks on the two-state, one-control getting-started problem.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use approx::assert_relative_eq;
use horizon_core::condensing::{build_sparse_qp, condense};
use horizon_core::discretization::{Discretization, Variables};
use horizon_core::ocp::Constraint;
use horizon_core::{
    CodeExporter, Condensing, DifferentialModel, ExportConfig, Ocp, OcpError, QpBackend, RtiSolver, StructuredNlp,
};
use nalgebra::{DMatrix, DVector};

fn getting_started(horizon: usize, ts: f64) -> StructuredNlp {
    let mut model = DifferentialModel::new();
    let x = model.declare_state("x", 1).unwrap();
    let dx = model.declare_state("dx", 1).unwrap();
    let u = model.declare_control("u", 1).unwrap();
    let xe = model.variable(&x);
    let dxe = model.variable(&dx);
    let ue = model.variable(&u);
    let dot_x = model.dot(&x).unwrap();
    let dot_dx = model.dot(&dx).unwrap();

    let g = model.graph_mut();
    let a = g.scale(-12.44, &xe);
    let b = g.scale(0.7539, &dxe);
    let c = g.scale(2.0, &ue);
    let ab = g.add(&a, &b).unwrap();
    let f0 = g.add(&ab, &c).unwrap();
    let f1 = g.scale(-7.89, &xe);
    let h = g.stack(&[&xe, &dxe, &ue]);
    let hn = g.stack(&[&xe, &dxe]);
    model.add_equation(&dot_x, &f0).unwrap();
    model.add_equation(&dot_dx, &f1).unwrap();

    let mut ocp = Ocp::new(0.0, horizon as f64 * ts, horizon).unwrap();
    ocp.subject_to(Constraint::dynamics(model)).unwrap();
    ocp.minimize_lsq(DMatrix::identity(3, 3), &h).unwrap();
    ocp.minimize_lsq_end_term(DMatrix::identity(2, 2), &hn).unwrap();
    ocp.subject_to(Constraint::bounds(0.0, &ue, 1.0)).unwrap();
    ocp.subject_to(Constraint::bounds(-5.0, &dxe, 0.0)).unwrap();
    ocp.finalize().unwrap()
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("horizon-it-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn read_all(dir: &Path) -> Vec<(String, String)> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().into_owned(),
                fs::read_to_string(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

fn assert_err_contains<T: std::fmt::Debug>(result: horizon_core::Result<T>, needle: &str) {
    let err = result.expect_err("expected error");
    let message = format!("{err}");
    assert!(
        message.contains(needle),
        "expected error to contain \"{needle}\", got \"{message}\""
    );
}

#[test]
fn export_is_reproducible() {
    let root = scratch("reproducible");
    let config = ExportConfig {
        num_integrator_steps: Some(20),
        ..ExportConfig::default()
    };

    let first = root.join("first");
    let second = root.join("second");
    let summary = getting_started(10, 0.1).export_code(&first, &config).unwrap();
    getting_started(10, 0.1).export_code(&second, &config).unwrap();

    assert_eq!(summary.files.len(), 7);
    assert_eq!(summary.qp.variables, 10);
    assert_eq!(summary.dimensions.nx, 2);
    assert_eq!(read_all(&first), read_all(&second));

    // exporting over an existing directory replaces it in place
    getting_started(10, 0.1).export_code(&first, &config).unwrap();
    assert_eq!(read_all(&first), read_all(&second));
    let mut entries: Vec<_> = fs::read_dir(&root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["first", "second"]);
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn rejected_configurations_write_nothing() {
    let root = scratch("rejected");
    let target = root.join("out");
    let nlp = getting_started(10, 0.1);

    let mismatched = ExportConfig {
        qp_backend: QpBackend::RiccatiInteriorPoint,
        ..ExportConfig::default()
    };
    assert_err_contains(nlp.export_code(&target, &mismatched), "cannot consume");

    let uneven = ExportConfig {
        num_integrator_steps: Some(15),
        ..ExportConfig::default()
    };
    assert_err_contains(nlp.export_code(&target, &uneven), "multiple of the horizon");

    let mut unknown = ExportConfig::default();
    assert_err_contains(unknown.set("qp_solver", "qpoases"), "unknown export option");

    assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn io_failures_leave_no_partial_output() {
    let root = scratch("io");
    let blocker = root.join("blocker");
    fs::write(&blocker, "a file, not a directory").unwrap();
    let nlp = getting_started(5, 0.1);

    let err = nlp
        .export_code(blocker.join("out"), &ExportConfig::default())
        .unwrap_err();
    assert!(matches!(err, OcpError::ExportIo { .. }), "{err}");

    let entries: Vec<_> = fs::read_dir(&root).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(fs::read_to_string(&blocker).unwrap(), "a file, not a directory");
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn first_feedback_matches_a_direct_qp_solve() {
    let config = ExportConfig::default();
    let x0 = DVector::from_vec(vec![1.0, -0.5]);

    let nlp = getting_started(10, 0.1);
    let disc = Discretization::new(&nlp, &config).unwrap();
    let mut vars = Variables::new(&nlp);
    vars.x[0] = x0.clone();
    disc.forward_simulation(&nlp, &mut vars).unwrap();
    let lin = disc.linearize(&nlp, &vars).unwrap();
    let qp = build_sparse_qp(&nlp, &vars, &lin, &x0, config.levenberg_marquardt).unwrap();
    let reference = condense(&qp).dense.solve(&config.interior_point, None).unwrap();
    let u_reference = vars.u[0][0] + reference.primal[0];

    let mut rti = RtiSolver::new(getting_started(10, 0.1), config).unwrap();
    rti.variables_mut().x[0] = x0.clone();
    rti.initialize_nodes_by_forward_simulation().unwrap();
    rti.preparation_step().unwrap();
    rti.feedback_step(&x0).unwrap();

    assert_relative_eq!(rti.variables().u[0][0], u_reference, epsilon = 1e-9);
    assert!(u_reference >= -1e-6 && u_reference <= 1.0 + 1e-6);
}

#[test]
fn condensing_choices_agree_in_closed_loop() {
    let x0 = DVector::from_vec(vec![1.0, 0.0]);
    let sparse = ExportConfig {
        condensing: Condensing::Sparse,
        qp_backend: QpBackend::RiccatiInteriorPoint,
        ..ExportConfig::default()
    };

    let mut controls = Vec::new();
    for config in [ExportConfig::default(), sparse] {
        let exporter_nlp = getting_started(10, 0.1);
        let qp = CodeExporter::new(&exporter_nlp).qp_dimensions(&config);
        assert!(qp.variables > 0);

        let mut rti = RtiSolver::new(getting_started(10, 0.1), config).unwrap();
        rti.variables_mut().x[0] = x0.clone();
        rti.initialize_nodes_by_forward_simulation().unwrap();
        for _ in 0..3 {
            rti.preparation_step().unwrap();
            rti.feedback_step(&x0).unwrap();
        }
        controls.push(rti.variables().u.iter().map(|u| u[0]).collect::<Vec<_>>());
    }
    for (dense, structured) in controls[0].iter().zip(&controls[1]) {
        assert_relative_eq!(*dense, *structured, epsilon = 1e-5);
    }
}

/// C compiler for the generated sources, if one is installed.
fn c_compiler() -> Option<String> {
    let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    Command::new(&cc).arg("--version").output().ok()?;
    Some(cc)
}

#[test]
fn generated_sources_compile_as_c99() {
    let Some(cc) = c_compiler() else {
        eprintln!("no C compiler found, skipping syntax check of the generated sources");
        return;
    };
    let root = scratch("cc");
    let sparse = ExportConfig {
        condensing: Condensing::Sparse,
        qp_backend: QpBackend::RiccatiInteriorPoint,
        ..ExportConfig::default()
    };
    let mut single = ExportConfig::default();
    single.set("precision", "single").unwrap();
    single.set("hardcode_constraint_values", "no").unwrap();

    for (name, config) in [("dense", ExportConfig::default()), ("sparse", sparse), ("single", single)] {
        let dir = root.join(name);
        let summary = getting_started(10, 0.1).export_code(&dir, &config).unwrap();
        for file in summary.files.iter().filter(|f| f.ends_with(".c")) {
            let output = Command::new(&cc)
                .args(["-std=c99", "-Wall", "-fsyntax-only"])
                .arg(dir.join(file))
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "{name}/{file} does not compile:\n{}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
    fs::remove_dir_all(&root).unwrap();
}
