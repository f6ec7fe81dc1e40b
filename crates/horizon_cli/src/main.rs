//! Exports the getting-started tracking problem as C sources.
//!
//! Usage:
//!   horizon --output getting_started_export
//!   horizon --horizon 20 --set condensing=sparse --set qp_backend=riccati_interior_point
//!   horizon --config export.json --json

mod problem;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use horizon_core::{CodeExporter, ExportConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "horizon", about = "Export a real-time iteration solver as C sources")]
struct Args {
    /// Directory the generated sources are written to
    #[arg(long, short, default_value = "horizon_export")]
    output: PathBuf,

    /// JSON export configuration; unknown fields are rejected
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override one export option, e.g. `precision=single`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Number of shooting intervals
    #[arg(long, default_value_t = 10)]
    horizon: usize,

    /// Duration of one shooting interval (s)
    #[arg(long, default_value_t = 0.1)]
    ts: f64,

    /// Print the export summary as JSON
    #[arg(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<ExportConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration {}", path.display()))?;
            ExportConfig::from_json_str(&text)
                .with_context(|| format!("parsing configuration {}", path.display()))?
        }
        None => ExportConfig {
            num_integrator_steps: Some(2 * args.horizon),
            ..ExportConfig::default()
        },
    };
    for entry in &args.overrides {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("option '{entry}' is not of the form KEY=VALUE"))?;
        config
            .set(key, value)
            .with_context(|| format!("applying option '{entry}'"))?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!(horizon = args.horizon, ts = args.ts, "building getting-started problem");

    let nlp = problem::getting_started(args.horizon, args.ts).context("building the optimal control problem")?;
    let summary = CodeExporter::new(&nlp)
        .export_code(&args.output, &config)
        .with_context(|| format!("exporting to {}", args.output.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let qp = summary.qp;
        println!("exported {} files to {}", summary.files.len(), summary.directory.display());
        println!("QP variables:            {}", qp.variables);
        println!("QP equality constraints: {}", qp.equalities);
        println!("QP general constraints:  {}", qp.general_constraints);
        println!("QP variable bounds:      {}", qp.variable_bounds);
    }
    Ok(())
}
