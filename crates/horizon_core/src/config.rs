use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{OcpError, Result};
use crate::integrator::{ButcherTableau, NewtonSettings};
use crate::qp::InteriorPointSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscretizationType {
    MultipleShooting,
    SingleShooting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollocationScheme {
    GaussLegendre,
    RadauIia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegratorType {
    ExplicitRk { order: usize },
    ImplicitRk { scheme: CollocationScheme, order: usize },
}

impl fmt::Display for IntegratorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegratorType::ExplicitRk { order } => write!(f, "explicit_rk({order})"),
            IntegratorType::ImplicitRk { scheme, order } => {
                let scheme = match scheme {
                    CollocationScheme::GaussLegendre => "gauss_legendre",
                    CollocationScheme::RadauIia => "radau_iia",
                };
                write!(f, "implicit_rk({scheme},{order})")
            }
        }
    }
}

impl FromStr for IntegratorType {
    type Err = OcpError;

    /// Accepts `explicit_rk(<order>)` and `implicit_rk(<scheme>,<order>)`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || {
            OcpError::unsupported(format!(
                "invalid integrator '{s}', expected explicit_rk(<order>) or implicit_rk(<scheme>,<order>)"
            ))
        };
        let (family, rest) = s.trim().split_once('(').ok_or_else(bad)?;
        let args: Vec<&str> = rest
            .strip_suffix(')')
            .ok_or_else(bad)?
            .split(',')
            .map(str::trim)
            .collect();
        let order = |text: &str| text.parse::<usize>().map_err(|_| bad());
        match (family.trim(), args.as_slice()) {
            ("explicit_rk", [o]) => Ok(IntegratorType::ExplicitRk { order: order(o)? }),
            ("implicit_rk", [scheme, o]) => Ok(IntegratorType::ImplicitRk {
                scheme: parse_keyword(scheme)?,
                order: order(o)?,
            }),
            _ => Err(bad()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QpBackend {
    /// Interior point on the condensed, dense QP.
    DenseInteriorPoint,
    /// Interior point with a Riccati factorization of the stage-structured QP.
    RiccatiInteriorPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condensing {
    Full,
    Sparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Single,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianApproximation {
    GaussNewton,
}

/// Options accepted by [`ExportConfig::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOption {
    DiscretizationType,
    IntegratorType,
    NumIntegratorSteps,
    QpBackend,
    Condensing,
    Precision,
    HessianApproximation,
    LevenbergMarquardt,
    HotstartQp,
    EmitTestHarness,
    HardcodeConstraintValues,
    VariableWeightingMatrix,
    MaxIntegratorRetries,
}

impl ExportOption {
    const ALL: [(&'static str, ExportOption); 13] = [
        ("discretization_type", ExportOption::DiscretizationType),
        ("integrator_type", ExportOption::IntegratorType),
        ("num_integrator_steps", ExportOption::NumIntegratorSteps),
        ("qp_backend", ExportOption::QpBackend),
        ("condensing", ExportOption::Condensing),
        ("precision", ExportOption::Precision),
        ("hessian_approximation", ExportOption::HessianApproximation),
        ("levenberg_marquardt", ExportOption::LevenbergMarquardt),
        ("hotstart_qp", ExportOption::HotstartQp),
        ("emit_test_harness", ExportOption::EmitTestHarness),
        ("hardcode_constraint_values", ExportOption::HardcodeConstraintValues),
        ("variable_weighting_matrix", ExportOption::VariableWeightingMatrix),
        ("max_integrator_retries", ExportOption::MaxIntegratorRetries),
    ];
}

impl FromStr for ExportOption {
    type Err = OcpError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, option)| *option)
            .ok_or_else(|| OcpError::unsupported(format!("unknown export option '{s}'")))
    }
}

/// Code-generation and runtime options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExportConfig {
    pub discretization_type: DiscretizationType,
    pub integrator_type: IntegratorType,
    /// Total integrator steps over the horizon; `None` means one per interval.
    pub num_integrator_steps: Option<usize>,
    pub qp_backend: QpBackend,
    pub condensing: Condensing,
    pub precision: Precision,
    pub hessian_approximation: HessianApproximation,
    /// Diagonal regularization added to the Gauss-Newton Hessian.
    pub levenberg_marquardt: f64,
    /// Warm start the QP from the previous solution.
    pub hotstart_qp: bool,
    pub emit_test_harness: bool,
    /// Emit bound values as literals instead of runtime arrays.
    pub hardcode_constraint_values: bool,
    /// One weighting matrix per stage instead of a shared one.
    pub variable_weighting_matrix: bool,
    pub max_integrator_retries: usize,
    pub newton: NewtonSettings,
    pub interior_point: InteriorPointSettings,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            discretization_type: DiscretizationType::MultipleShooting,
            integrator_type: IntegratorType::ImplicitRk {
                scheme: CollocationScheme::RadauIia,
                order: 5,
            },
            num_integrator_steps: None,
            qp_backend: QpBackend::DenseInteriorPoint,
            condensing: Condensing::Full,
            precision: Precision::Double,
            hessian_approximation: HessianApproximation::GaussNewton,
            levenberg_marquardt: 1e-10,
            hotstart_qp: true,
            emit_test_harness: true,
            hardcode_constraint_values: true,
            variable_weighting_matrix: false,
            max_integrator_retries: 3,
            newton: NewtonSettings::default(),
            interior_point: InteriorPointSettings::default(),
        }
    }
}

impl ExportConfig {
    /// Parses a JSON document. Unknown fields are rejected.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OcpError::unsupported(format!("invalid export configuration: {e}")))
    }

    /// Sets one option from its textual key and value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let option: ExportOption = key.parse()?;
        let value = value.trim();
        match option {
            ExportOption::DiscretizationType => self.discretization_type = parse_keyword(value)?,
            ExportOption::IntegratorType => self.integrator_type = value.parse()?,
            ExportOption::NumIntegratorSteps => {
                self.num_integrator_steps = Some(parse_number(key, value)?)
            }
            ExportOption::QpBackend => self.qp_backend = parse_keyword(value)?,
            ExportOption::Condensing => self.condensing = parse_keyword(value)?,
            ExportOption::Precision => self.precision = parse_keyword(value)?,
            ExportOption::HessianApproximation => {
                self.hessian_approximation = parse_keyword(value)?
            }
            ExportOption::LevenbergMarquardt => self.levenberg_marquardt = parse_number(key, value)?,
            ExportOption::HotstartQp => self.hotstart_qp = parse_flag(key, value)?,
            ExportOption::EmitTestHarness => self.emit_test_harness = parse_flag(key, value)?,
            ExportOption::HardcodeConstraintValues => {
                self.hardcode_constraint_values = parse_flag(key, value)?
            }
            ExportOption::VariableWeightingMatrix => {
                self.variable_weighting_matrix = parse_flag(key, value)?
            }
            ExportOption::MaxIntegratorRetries => {
                self.max_integrator_retries = parse_number(key, value)?
            }
        }
        Ok(())
    }

    /// Integrator substeps inside one shooting interval.
    pub fn steps_per_interval(&self, horizon: usize) -> usize {
        match self.num_integrator_steps {
            Some(total) if horizon > 0 => (total / horizon).max(1),
            _ => 1,
        }
    }

    /// Cross-field checks. Runs before any generation or file I/O.
    pub fn validate(&self, horizon: usize) -> Result<()> {
        ButcherTableau::from_integrator(self.integrator_type)?;

        if let Some(total) = self.num_integrator_steps {
            if total < horizon || total % horizon.max(1) != 0 {
                return Err(OcpError::unsupported(format!(
                    "num_integrator_steps = {total} must be a positive multiple of the horizon length {horizon}"
                )));
            }
        }

        match (self.condensing, self.qp_backend) {
            (Condensing::Full, QpBackend::DenseInteriorPoint)
            | (Condensing::Sparse, QpBackend::RiccatiInteriorPoint) => {}
            (condensing, backend) => {
                return Err(OcpError::unsupported(format!(
                    "QP backend {backend:?} cannot consume {condensing:?} condensing output"
                )));
            }
        }

        if self.discretization_type == DiscretizationType::SingleShooting
            && self.condensing != Condensing::Full
        {
            return Err(OcpError::unsupported(
                "single shooting eliminates the states and requires full condensing",
            ));
        }

        if !(self.levenberg_marquardt.is_finite() && self.levenberg_marquardt >= 0.0) {
            return Err(OcpError::unsupported(format!(
                "levenberg_marquardt must be a non-negative number, got {}",
                self.levenberg_marquardt
            )));
        }

        let newton = &self.newton;
        if newton.max_steps == 0 || !(newton.tolerance > 0.0) || !(newton.damping > 0.0 && newton.damping <= 1.0) {
            return Err(OcpError::unsupported(format!(
                "invalid Newton settings {newton:?}: need max_steps >= 1, tolerance > 0, 0 < damping <= 1"
            )));
        }

        let ipm = &self.interior_point;
        if ipm.max_iterations == 0 || !(ipm.tolerance > 0.0) {
            return Err(OcpError::unsupported(format!(
                "invalid interior point settings {ipm:?}"
            )));
        }
        if self.precision == Precision::Single && ipm.tolerance < 1e-6 {
            return Err(OcpError::unsupported(format!(
                "single precision cannot reach the QP tolerance {:e}; use 1e-6 or larger",
                ipm.tolerance
            )));
        }
        Ok(())
    }
}

fn parse_keyword<T: for<'de> Deserialize<'de>>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| OcpError::unsupported(format!("unsupported option value '{value}'")))
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| OcpError::unsupported(format!("option '{key}' expects a number, got '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(OcpError::unsupported(format!(
            "option '{key}' expects yes/no, got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unsupported(result: Result<()>, needle: &str) {
        match result {
            Err(OcpError::UnsupportedConfiguration(message)) => assert!(
                message.contains(needle),
                "expected error containing '{needle}', got '{message}'"
            ),
            other => panic!("expected unsupported configuration, got {other:?}"),
        }
    }

    #[test]
    fn defaults_validate_with_twice_the_horizon_in_steps() {
        let mut config = ExportConfig::default();
        config.set("num_integrator_steps", "20").unwrap();
        config.validate(10).expect("defaults should validate");
        assert_eq!(config.steps_per_interval(10), 2);
    }

    #[test]
    fn string_options_update_fields() {
        let mut config = ExportConfig::default();
        config.set("integrator_type", "implicit_rk(gauss_legendre, 4)").unwrap();
        config.set("QP_BACKEND", "riccati_interior_point").unwrap();
        config.set("condensing", "sparse").unwrap();
        config.set("hotstart_qp", "no").unwrap();
        config.set("levenberg_marquardt", "1e-6").unwrap();

        assert_eq!(
            config.integrator_type,
            IntegratorType::ImplicitRk {
                scheme: CollocationScheme::GaussLegendre,
                order: 4
            }
        );
        assert_eq!(config.qp_backend, QpBackend::RiccatiInteriorPoint);
        assert!(!config.hotstart_qp);
        assert_eq!(config.levenberg_marquardt, 1e-6);
        config.validate(10).unwrap();
    }

    #[test]
    fn unknown_keys_and_values_fail() {
        let mut config = ExportConfig::default();
        assert_unsupported(config.set("use_matlab_interface", "yes"), "unknown export option");
        assert_unsupported(config.set("condensing", "partial"), "partial");
        assert_unsupported(config.set("hotstart_qp", "maybe"), "yes/no");
        assert_unsupported(config.set("integrator_type", "rk4"), "invalid integrator");
    }

    #[test]
    fn single_shooting_requires_full_condensing() {
        let mut config = ExportConfig::default();
        config.set("discretization_type", "single_shooting").unwrap();
        config.validate(10).unwrap();
        config.set("condensing", "sparse").unwrap();
        config.set("qp_backend", "riccati_interior_point").unwrap();
        assert_unsupported(config.validate(10), "single shooting");
    }

    #[test]
    fn backend_must_match_condensing() {
        let mut config = ExportConfig::default();
        config.set("qp_backend", "riccati_interior_point").unwrap();
        assert_unsupported(config.validate(10), "cannot consume");
    }

    #[test]
    fn integrator_steps_must_divide_evenly() {
        let mut config = ExportConfig::default();
        config.set("num_integrator_steps", "15").unwrap();
        assert_unsupported(config.validate(10), "multiple");
        config.set("num_integrator_steps", "5").unwrap();
        assert_unsupported(config.validate(10), "multiple");
    }

    #[test]
    fn invalid_integrator_order_is_rejected() {
        let mut config = ExportConfig::default();
        config.set("integrator_type", "implicit_rk(radau_iia,4)").unwrap();
        assert_unsupported(config.validate(10), "order 4");
    }

    #[test]
    fn single_precision_limits_tolerance() {
        let mut config = ExportConfig::default();
        config.set("precision", "single").unwrap();
        assert_unsupported(config.validate(10), "single precision");
        config.interior_point.tolerance = 1e-5;
        config.validate(10).unwrap();
    }

    #[test]
    fn json_rejects_unknown_fields_and_fills_defaults() {
        let config = ExportConfig::from_json_str(
            r#"{ "condensing": "sparse", "qp_backend": "riccati_interior_point",
                 "integrator_type": { "kind": "explicit_rk", "order": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.condensing, Condensing::Sparse);
        assert_eq!(config.integrator_type, IntegratorType::ExplicitRk { order: 4 });
        assert!(config.hotstart_qp);

        assert!(ExportConfig::from_json_str(r#"{ "generate_make_file": true }"#).is_err());
    }

    #[test]
    fn integrator_type_display_parses_back() {
        let kind = IntegratorType::ImplicitRk {
            scheme: CollocationScheme::RadauIia,
            order: 5,
        };
        assert_eq!(kind.to_string().parse::<IntegratorType>().unwrap(), kind);
    }
}
