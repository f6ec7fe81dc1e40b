//! The `horizon_core` crate builds least-squares optimal control problems and turns
//! them into real-time iteration solvers, either in-process or as generated C.
//!
//! Key components:
//! - **Expression**: hash-consed expression graph with symbolic differentiation.
//! - **Equation Engine**: bytecode VM the model functions are compiled to.
//! - **Model**: `DifferentialModel` (explicit ODEs) and its compiled `OdeModel`.
//! - **Integrator**: Runge-Kutta schemes with Newton stages and sensitivities.
//! - **Ocp / Discretization / Condensing**: multiple shooting and Gauss-Newton QPs.
//! - **Qp**: interior point backends for dense and stage-structured QPs.
//! - **Rti**: preparation/feedback loop driving the above.
//! - **Export**: C code generation.
pub mod autodiff;
pub mod condensing;
pub mod config;
pub mod discretization;
pub mod equation_engine;
pub mod error;
pub mod export;
pub mod expression;
pub mod integrator;
pub mod model;
pub mod ocp;
pub mod qp;
pub mod rti;
pub mod traits;

pub use config::{
    CollocationScheme, Condensing, DiscretizationType, ExportConfig, HessianApproximation, IntegratorType,
    Precision, QpBackend,
};
pub use error::{OcpError, Result};
pub use export::{CodeExporter, ExportSummary, QpDimensions};
pub use expression::{ExprGraph, Expression, Symbol, SymbolKind};
pub use model::{DifferentialModel, OdeModel};
pub use ocp::{Constraint, Dimensions, Ocp, StructuredNlp};
pub use rti::{FeedbackReport, RtiSolver};
