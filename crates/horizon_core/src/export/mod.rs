//! C code generation for the real-time iteration.
//!
//! The exporter validates the configuration, renders every artifact into memory
//! and writes them through an atomic staging directory. Rendering is a pure
//! function of the NLP and the configuration, so re-exporting the same problem
//! yields byte-identical files.

mod lowering;
mod sources;
mod staging;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::{Condensing, ExportConfig};
use crate::error::Result;
use crate::integrator::ButcherTableau;
use crate::ocp::{BoundTarget, ConstraintRow, Dimensions, StructuredNlp};

use sources::Sources;

/// Prefix of every generated file and C symbol.
pub const PREFIX: &str = "horizon";

/// Size of the QP handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QpDimensions {
    pub variables: usize,
    pub equalities: usize,
    pub general_constraints: usize,
    pub variable_bounds: usize,
}

impl QpDimensions {
    pub fn new(nlp: &StructuredNlp, condensing: Condensing) -> Self {
        let dims = nlp.dimensions();
        let n = dims.horizon;
        let rows = nlp.path_rows();
        let terminal = nlp.terminal_rows().len();
        // the first node is fixed, so its state-only rows never reach the QP
        let first_stage = rows.iter().filter(|r| !r.state_only);

        match condensing {
            Condensing::Full => {
                let general = |r: &&ConstraintRow| !matches!(r.target, Some(BoundTarget::Control(_)));
                Self {
                    variables: n * dims.nu,
                    equalities: 0,
                    general_constraints: first_stage.filter(general).count()
                        + (n - 1) * rows.iter().filter(general).count()
                        + terminal,
                    variable_bounds: n * dims.nu,
                }
            }
            Condensing::Sparse => Self {
                variables: n * (dims.nx + dims.nu) + dims.nx,
                equalities: (n + 1) * dims.nx,
                general_constraints: first_stage.count() + (n - 1) * rows.len() + terminal,
                variable_bounds: 0,
            },
        }
    }
}

/// What an export produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub directory: PathBuf,
    pub files: Vec<String>,
    pub dimensions: Dimensions,
    pub qp: QpDimensions,
}

/// Renders and writes the C sources of a structured NLP.
pub struct CodeExporter<'a> {
    nlp: &'a StructuredNlp,
}

impl<'a> CodeExporter<'a> {
    pub fn new(nlp: &'a StructuredNlp) -> Self {
        Self { nlp }
    }

    pub fn qp_dimensions(&self, config: &ExportConfig) -> QpDimensions {
        QpDimensions::new(self.nlp, config.condensing)
    }

    /// Renders every artifact in memory, keyed by file name.
    ///
    /// The configuration is validated first; nothing is rendered for an
    /// unsupported combination.
    pub fn generate(&self, config: &ExportConfig) -> Result<BTreeMap<String, String>> {
        let horizon = self.nlp.horizon();
        config.validate(horizon)?;
        let sources = Sources {
            nlp: self.nlp,
            config,
            tableau: ButcherTableau::from_integrator(config.integrator_type)?,
            steps: config.steps_per_interval(horizon),
            qp: self.qp_dimensions(config),
        };

        let mut files = BTreeMap::new();
        files.insert(format!("{PREFIX}_common.h"), sources.common_header()?);
        files.insert(format!("{PREFIX}_integrator.c"), sources.integrator_source()?);
        files.insert(format!("{PREFIX}_condensing.c"), sources.condensing_source()?);
        files.insert(format!("{PREFIX}_qp_interface.h"), sources.qp_interface_header()?);
        files.insert(format!("{PREFIX}_qp_interface.c"), sources.qp_interface_source()?);
        files.insert(format!("{PREFIX}_solver.c"), sources.solver_source()?);
        if config.emit_test_harness {
            files.insert(format!("{PREFIX}_test.c"), sources.test_source());
        }
        Ok(files)
    }

    /// Generates the sources and writes them to `target`, replacing any previous
    /// export there. On failure the target is left as it was.
    pub fn export_code(&self, target: impl AsRef<Path>, config: &ExportConfig) -> Result<ExportSummary> {
        let target = target.as_ref();
        let files = self.generate(config)?;
        staging::write_atomically(target, &files)?;

        let summary = ExportSummary {
            directory: target.to_path_buf(),
            files: files.into_keys().collect(),
            dimensions: self.nlp.dimensions(),
            qp: self.qp_dimensions(config),
        };
        info!(
            directory = %target.display(),
            files = summary.files.len(),
            qp_variables = summary.qp.variables,
            qp_constraints = summary.qp.general_constraints,
            "exported solver sources"
        );
        Ok(summary)
    }
}

impl StructuredNlp {
    /// Shorthand for [`CodeExporter::export_code`].
    pub fn export_code(&self, target: impl AsRef<Path>, config: &ExportConfig) -> Result<ExportSummary> {
        CodeExporter::new(self).export_code(target, config)
    }
}
