//! promotion-gate CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load the gate configuration TOML and validate it.
//! 2. **Wire observability**: configure `tracing-subscriber` with a JSON layer
//!    on stderr and, when an endpoint is set, an OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the filesystem floor ledger and report
//!    sink from `audit`, and the collaborators from `checks` wrapped in the
//!    engine's retry policy.
//! 4. **Run one command**:
//!    - `evaluate` runs one promotion evaluation and prints the decision.
//!    - `verify-report` re-hashes a report artefact.
//!
//! ## Exit status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `0` | approved / report intact |
//! | `1` | rejected / report tampered |
//! | `2` | configuration or input error |

mod config;
mod telemetry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use audit::{FsFloorStore, FsReportSink};
use checks::{CommandCollaborator, EvidenceCollaborator};
use clap::{Args, Parser, Subcommand};
use engine::{
    CancellationHandle, EngineSettings, GateCollaborator, PromotionEngine, PromotionInputs,
    RetryingCollaborator,
};
use gates::{
    BranchName, CandidateId, CollaboratorName, ConfigError, CorrelationId, Criterion,
    CriterionName, ExplicitCriteria, FloorDelta, FloorStore, FloorTracker, PromotionDecision,
    ReleaseVersion, ReportArtifact, ReportExporter,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{CollaboratorConfig, GateConfig};
use crate::telemetry::{LogFormat, Telemetry};

const INPUT_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "promotion-gate", version, about = "Evaluates release candidates against the promotion gates")]
struct Cli {
    /// Log format on stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    /// OTLP gRPC endpoint for span export.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a release candidate and decide whether it may be promoted
    Evaluate(EvaluateArgs),

    /// Check a report artefact against its manifest hash
    VerifyReport {
        /// Report file to verify.
        path: PathBuf,
    },
}

#[derive(Args)]
struct EvaluateArgs {
    /// Gate configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Candidate commit or tag.
    #[arg(long)]
    candidate: String,

    /// Protected branch the candidate would be merged into.
    #[arg(long)]
    target_branch: String,

    /// Directory holding the sealed floor ledger.
    #[arg(long, default_value = ".promotion-gate/floor")]
    floor_dir: PathBuf,

    /// Evidence bundle reference handed to collaborators.
    #[arg(long, default_value = "")]
    evidence: String,

    /// Directory receiving report artefacts.
    #[arg(long, default_value = ".promotion-gate/reports")]
    report_dir: PathBuf,

    /// Explicit criterion, as NAME=true or NAME=false. Repeatable.
    #[arg(long = "criterion", value_parser = parse_criterion)]
    criteria: Vec<Criterion>,

    /// Correlation id to reuse instead of a random one.
    #[arg(long)]
    correlation_id: Option<uuid::Uuid>,

    /// Version sealed on approval; defaults to the highest origin version.
    #[arg(long)]
    release_version: Option<String>,
}

/// What `evaluate` prints on stdout.
#[derive(Serialize)]
struct EvaluationSummary<'a> {
    decision: &'a PromotionDecision,
    report: &'a Path,
    sealed_version: Option<&'a ReleaseVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seal_error: Option<String>,
}

/// What `verify-report` prints on stdout.
#[derive(Serialize)]
struct VerificationSummary<'a> {
    path: &'a Path,
    intact: bool,
    body_sha256: &'a str,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let telemetry = match Telemetry::init(cli.log_format, cli.otlp_endpoint.as_deref()) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(INPUT_ERROR);
        }
    };

    let status = match cli.command {
        Command::Evaluate(args) => evaluate(args).await,
        Command::VerifyReport { path } => verify_report(&path),
    };
    let code = status.unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), "promotion-gate failed");
        eprintln!("error: {e:#}");
        INPUT_ERROR
    });

    telemetry.shutdown();
    ExitCode::from(code)
}

async fn evaluate(args: EvaluateArgs) -> anyhow::Result<u8> {
    let config = GateConfig::load_from(&args.config)?;

    let store = Arc::new(FsFloorStore::new(&args.floor_dir));
    let snapshots = store
        .load()
        .with_context(|| format!("loading floor ledger from {}", args.floor_dir.display()))?;
    let floor = Arc::new(FloorTracker::from_snapshots(snapshots)?);
    info!(
        head = ?floor.head().map(|h| h.version.to_string()),
        "floor ledger restored"
    );

    let settings = EngineSettings {
        worker_slots: config.engine.worker_slots,
        gate_timeout: config.engine.gate_timeout,
        evaluation_deadline: config.engine.evaluation_deadline,
        max_variance: config.engine.max_variance,
    };
    let mut engine = PromotionEngine::new(
        settings,
        floor,
        config.engine.score_baseline,
        ReportExporter::new(FsReportSink::new(&args.report_dir)),
    )
    .with_floor_store(store);

    let collaborators = build_collaborators(&config);
    if let Some(name) = &config.engine.default_collaborator {
        if let Some(collaborator) = collaborators.get(name) {
            engine = engine.with_default_collaborator(Arc::clone(collaborator));
        }
    }
    for gate in &config.gates {
        if let Some(collaborator) = gate.collaborator.as_ref().and_then(|n| collaborators.get(n)) {
            engine.bind(gate.definition.id.clone(), Arc::clone(collaborator), gate.timeout);
        }
    }
    for deduction in &config.deductions {
        engine.record_deduction(
            deduction.section.clone(),
            deduction.standard,
            deduction.conservative,
            deduction.rationale.clone(),
        )?;
    }

    let inputs = PromotionInputs {
        candidate: CandidateId::new(args.candidate).ok_or_else(|| empty("--candidate"))?,
        target_branch: BranchName::new(args.target_branch).ok_or_else(|| empty("--target-branch"))?,
        evidence: args.evidence,
        delta: FloorDelta {
            definitions: config.gates.iter().map(|g| g.definition.clone()).collect(),
            retired: config.retired.clone(),
        },
        criteria: ExplicitCriteria::new(args.criteria)?,
        release_version: args
            .release_version
            .map(|raw| {
                ReleaseVersion::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                    field: "--release-version".into(),
                    message: format!("'{raw}' is not a semantic version"),
                })
            })
            .transpose()?,
        correlation_id: args
            .correlation_id
            .map_or_else(CorrelationId::new_random, CorrelationId::from_uuid),
        decided_at: None,
    };

    let (handle, signal) = CancellationHandle::new();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling evaluation");
            handle.cancel();
        }
    });
    let outcome = engine.evaluate(inputs, &signal).await;
    interrupt.abort();
    let outcome = outcome?;

    let summary = EvaluationSummary {
        decision: &outcome.decision,
        report: &outcome.report,
        sealed_version: outcome.sealed.as_ref().map(|s| &s.version),
        seal_error: outcome.seal_error.as_ref().map(ToString::to_string),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(u8::try_from(outcome.exit_code()).unwrap_or(INPUT_ERROR))
}

fn verify_report(path: &Path) -> anyhow::Result<u8> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let artifact: ReportArtifact = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not a report artefact", path.display()))?;
    let intact = artifact.verify()?;
    if !intact {
        warn!(path = %path.display(), "report does not match its manifest");
    }
    let summary = VerificationSummary {
        path,
        intact,
        body_sha256: &artifact.manifest.body_sha256,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(if intact { 0 } else { 1 })
}

/// One shared instance per named collaborator, wrapped in the retry policy.
fn build_collaborators(config: &GateConfig) -> BTreeMap<CollaboratorName, Arc<dyn GateCollaborator>> {
    config
        .collaborators
        .iter()
        .map(|(name, collaborator)| {
            let inner: Arc<dyn GateCollaborator> = match collaborator {
                CollaboratorConfig::Command {
                    program,
                    args,
                    working_dir,
                } => {
                    let command = CommandCollaborator::new(program.clone(), args.clone());
                    Arc::new(match working_dir {
                        Some(dir) => command.in_dir(dir),
                        None => command,
                    })
                }
                CollaboratorConfig::Evidence => Arc::new(EvidenceCollaborator),
            };
            let retrying: Arc<dyn GateCollaborator> = Arc::new(RetryingCollaborator::new(
                inner,
                config.engine.collaborator_retries,
                config.engine.retry_backoff,
            ));
            (name.clone(), retrying)
        })
        .collect()
}

fn parse_criterion(raw: &str) -> Result<Criterion, String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=BOOL, got '{raw}'"))?;
    let name = CriterionName::new(name.trim()).ok_or("criterion name must not be empty")?;
    let satisfied = value
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("'{value}' is not true or false"))?;
    Ok(Criterion { name, satisfied })
}

fn empty(field: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: "must not be empty".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_parse_from_name_value_pairs() {
        let criterion = parse_criterion("clean-room-reproducibility=true").unwrap();
        assert_eq!(criterion.name.as_str(), "clean-room-reproducibility");
        assert!(criterion.satisfied);
        assert!(!parse_criterion("bundle-hash = false").unwrap().satisfied);
        assert!(parse_criterion("bundle-hash").is_err());
        assert!(parse_criterion("bundle-hash=maybe").is_err());
        assert!(parse_criterion("=true").is_err());
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from([
            "promotion-gate",
            "evaluate",
            "--config",
            "gates.toml",
            "--candidate",
            "v1.2.0",
            "--target-branch",
            "release",
            "--criterion",
            "a=true",
            "--criterion",
            "b=false",
            "--log-format",
            "text",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        match cli.command {
            Command::Evaluate(args) => {
                assert_eq!(args.criteria.len(), 2);
                assert_eq!(args.floor_dir, PathBuf::from(".promotion-gate/floor"));
            }
            Command::VerifyReport { .. } => panic!("expected evaluate"),
        }
    }

    #[test]
    fn verify_report_rejects_unreadable_input() {
        let dir = tempfile::tempdir().unwrap();
        let missing = verify_report(&dir.path().join("missing.json"));
        assert!(missing.is_err());

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"not json").unwrap();
        assert!(verify_report(&garbage).is_err());
    }
}
