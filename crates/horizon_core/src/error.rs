use std::path::PathBuf;

use thiserror::Error;

use crate::qp::QpError;

/// Errors raised while building, discretizing, solving or exporting an OCP.
#[derive(Debug, Error)]
pub enum OcpError {
    // ─────────────────────────────────────────────────────────────────────────
    // Construction errors (caller mistakes, never retried)
    // ─────────────────────────────────────────────────────────────────────────
    /// Operand, weight or vector dimensions disagree
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// The equation count does not match the state count at finalize time
    #[error(
        "underdetermined model: {states} state components but {equations} equations (missing: {missing:?})"
    )]
    UnderdeterminedModel {
        states: usize,
        equations: usize,
        missing: Vec<String>,
    },

    /// Structural misuse of the modelling API
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A weighting matrix is not symmetric positive semi-definite
    #[error("invalid weighting matrix: {0}")]
    InvalidWeight(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Numerical errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The implicit stage equations could not be solved within the iteration cap
    #[error(
        "integrator diverged after {attempts} attempt(s): {iterations} Newton iterations, residual {residual:e}"
    )]
    IntegratorDivergence {
        attempts: usize,
        iterations: usize,
        residual: f64,
    },

    /// The QP backend failed
    #[error("QP solver failed: {0}")]
    Qp(#[from] QpError),

    // ─────────────────────────────────────────────────────────────────────────
    // Export errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Incompatible or unknown export options
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Filesystem failure while writing generated artifacts
    #[error("failed to write export artifact '{}': {source}", path.display())]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Formatting a generated source failed
    #[error("failed to render generated source")]
    Render(#[from] std::fmt::Error),
}

impl OcpError {
    /// Create a dimension mismatch error
    pub fn dimension(context: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    /// Create an invalid model error
    pub fn invalid_model(message: impl Into<String>) -> Self {
        Self::InvalidModel(message.into())
    }

    /// Create an unsupported configuration error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(message.into())
    }

    /// Wrap an I/O error with the path that caused it
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ExportIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, OcpError>;
