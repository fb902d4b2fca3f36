//! Gate configuration file.
//!
//! The TOML document is parsed into raw serde types first, then validated
//! into [`GateConfig`]. Every problem is reported as a
//! [`gates::ConfigError`], which the binary maps to exit status `2`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gates::{
    CollaboratorName, ConfigError, GateDefinition, GateId, Points, ReleaseVersion, SectionCode,
};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    engine: RawEngine,
    #[serde(default)]
    collaborators: BTreeMap<String, RawCollaborator>,
    #[serde(default)]
    gates: Vec<RawGate>,
    #[serde(default)]
    retired_gates: Vec<String>,
    #[serde(default)]
    deductions: Vec<RawDeduction>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngine {
    max_variance: Option<f64>,
    #[serde(default = "default_baseline")]
    score_baseline: f64,
    worker_slots: Option<i64>,
    #[serde(default = "default_gate_timeout_ms")]
    gate_timeout_ms: i64,
    #[serde(default = "default_deadline_ms")]
    evaluation_deadline_ms: i64,
    #[serde(default)]
    collaborator_retries: u32,
    #[serde(default = "default_backoff_ms")]
    retry_backoff_ms: u64,
    default_collaborator: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum RawCollaborator {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    Evidence,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGate {
    id: String,
    suite: String,
    expected_tests: u32,
    blocking: bool,
    origin_version: String,
    collaborator: Option<String>,
    timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDeduction {
    section: String,
    standard: f64,
    conservative: f64,
    rationale: String,
}

const GATE_ID_RULE: &str =
    "must be non-empty ASCII letters, digits, '.', '_' or '-' without '..'";

fn default_baseline() -> f64 {
    500.0
}

fn default_gate_timeout_ms() -> i64 {
    60_000
}

fn default_deadline_ms() -> i64 {
    600_000
}

fn default_backoff_ms() -> u64 {
    250
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum allowed score variance.
    pub max_variance: Points,
    /// Baseline both scores start from.
    pub score_baseline: Points,
    /// Worker pool size.
    pub worker_slots: usize,
    /// Default per-gate timeout.
    pub gate_timeout: Duration,
    /// Deadline for the whole evaluation.
    pub evaluation_deadline: Duration,
    /// Extra attempts for unavailable collaborators.
    pub collaborator_retries: u32,
    /// Delay between attempts.
    pub retry_backoff: Duration,
    /// Collaborator for gates without their own, including inherited ones.
    pub default_collaborator: Option<CollaboratorName>,
}

/// How a named collaborator obtains outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorConfig {
    /// Run an external program.
    Command {
        /// Executable.
        program: String,
        /// Arguments.
        args: Vec<String>,
        /// Working directory, if not the current one.
        working_dir: Option<PathBuf>,
    },
    /// Read recorded outcomes from the evidence directory.
    Evidence,
}

/// A declared gate and how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateEntry {
    /// The gate.
    pub definition: GateDefinition,
    /// Its collaborator; `None` uses the default.
    pub collaborator: Option<CollaboratorName>,
    /// Timeout override.
    pub timeout: Option<Duration>,
}

/// A deduction to seed the score ledger with.
#[derive(Debug, Clone, PartialEq)]
pub struct Deduction {
    /// Section code.
    pub section: SectionCode,
    /// Standard-score deduction.
    pub standard: Points,
    /// Conservative-score deduction.
    pub conservative: Points,
    /// Why it applies.
    pub rationale: String,
}

/// A validated gate configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Named collaborators.
    pub collaborators: BTreeMap<CollaboratorName, CollaboratorConfig>,
    /// Declared gates (the delta plus any redeclarations), in file order.
    pub gates: Vec<GateEntry>,
    /// Inherited gates explicitly retired.
    pub retired: Vec<GateId>,
    /// Score deductions, in file order.
    pub deductions: Vec<Deduction>,
}

impl GateConfig {
    /// Reads and validates the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Malformed {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&text)
    }

    /// Parses and validates a TOML document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|e| ConfigError::Malformed {
            message: e.to_string(),
        })?;

        let mut collaborators = BTreeMap::new();
        for (name, raw) in raw.collaborators {
            let field = format!("collaborators.{name}");
            let name = CollaboratorName::new(name).ok_or_else(|| invalid(&field, "empty name"))?;
            let config = match raw {
                RawCollaborator::Command {
                    program,
                    args,
                    working_dir,
                } => {
                    if program.trim().is_empty() {
                        return Err(invalid(&format!("{field}.program"), "must not be empty"));
                    }
                    CollaboratorConfig::Command {
                        program,
                        args,
                        working_dir,
                    }
                }
                RawCollaborator::Evidence => CollaboratorConfig::Evidence,
            };
            collaborators.insert(name, config);
        }

        let engine = engine_config(raw.engine, &collaborators)?;

        let mut seen = BTreeSet::new();
        let mut gates = Vec::with_capacity(raw.gates.len());
        for (index, gate) in raw.gates.into_iter().enumerate() {
            let field = format!("gates[{index}]");
            let id = GateId::new(gate.id).ok_or_else(|| invalid(&format!("{field}.id"), GATE_ID_RULE))?;
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateGateId { id });
            }
            let origin_version = ReleaseVersion::parse(&gate.origin_version).ok_or_else(|| {
                invalid(
                    &format!("{field}.origin_version"),
                    &format!("'{}' is not a semantic version", gate.origin_version),
                )
            })?;
            let collaborator = match gate.collaborator {
                Some(name) => {
                    let known = CollaboratorName::new(name.clone())
                        .filter(|n| collaborators.contains_key(n))
                        .ok_or_else(|| ConfigError::UnknownCollaborator {
                            gate: id.clone(),
                            collaborator: name,
                        })?;
                    Some(known)
                }
                None if engine.default_collaborator.is_some() => None,
                None => return Err(ConfigError::UnboundGate { gate: id }),
            };
            let timeout = gate
                .timeout_ms
                .map(|ms| positive_ms(&format!("{field}.timeout_ms"), ms))
                .transpose()?;
            gates.push(GateEntry {
                definition: GateDefinition {
                    id,
                    suite: gate.suite,
                    expected_tests: gate.expected_tests,
                    blocking: gate.blocking,
                    origin_version,
                },
                collaborator,
                timeout,
            });
        }

        let retired = raw
            .retired_gates
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                GateId::new(id).ok_or_else(|| invalid(&format!("retired_gates[{i}]"), GATE_ID_RULE))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let deductions = raw
            .deductions
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                let field = format!("deductions[{i}]");
                Ok(Deduction {
                    section: SectionCode::new(d.section)
                        .ok_or_else(|| invalid(&format!("{field}.section"), "must not be empty"))?,
                    standard: points(&format!("{field}.standard"), d.standard)?,
                    conservative: points(&format!("{field}.conservative"), d.conservative)?,
                    rationale: d.rationale,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            engine,
            collaborators,
            gates,
            retired,
            deductions,
        })
    }
}

fn engine_config(
    raw: RawEngine,
    collaborators: &BTreeMap<CollaboratorName, CollaboratorConfig>,
) -> Result<EngineConfig, ConfigError> {
    let max_variance = raw
        .max_variance
        .ok_or_else(|| invalid("engine.max_variance", "is required"))?;
    let max_variance = points("engine.max_variance", max_variance)?;
    if max_variance.is_negative() {
        return Err(invalid("engine.max_variance", "must not be negative"));
    }
    let score_baseline = points("engine.score_baseline", raw.score_baseline)?;

    let worker_slots = match raw.worker_slots {
        Some(slots) if slots > 0 => usize::try_from(slots)
            .map_err(|_| invalid("engine.worker_slots", "is too large"))?,
        Some(_) => return Err(invalid("engine.worker_slots", "must be positive")),
        None => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
    };

    let default_collaborator = match raw.default_collaborator {
        Some(name) => Some(
            CollaboratorName::new(name.clone())
                .filter(|n| collaborators.contains_key(n))
                .ok_or_else(|| invalid("engine.default_collaborator", &format!("'{name}' is not declared")))?,
        ),
        None => None,
    };

    Ok(EngineConfig {
        max_variance,
        score_baseline,
        worker_slots,
        gate_timeout: positive_ms("engine.gate_timeout_ms", raw.gate_timeout_ms)?,
        evaluation_deadline: positive_ms("engine.evaluation_deadline_ms", raw.evaluation_deadline_ms)?,
        collaborator_retries: raw.collaborator_retries,
        retry_backoff: Duration::from_millis(raw.retry_backoff_ms),
        default_collaborator,
    })
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn positive_ms(field: &str, ms: i64) -> Result<Duration, ConfigError> {
    u64::try_from(ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(field, "must be a positive number of milliseconds"))
}

fn points(field: &str, value: f64) -> Result<Points, ConfigError> {
    Points::from_f64(value).ok_or_else(|| invalid(field, "must be a finite number within range"))
}
