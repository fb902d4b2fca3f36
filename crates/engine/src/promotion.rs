//! One promotion evaluation from declared delta to sealed floor.
//!
//! [`PromotionEngine::evaluate`] is the only place where the domain pieces
//! meet the runtime:
//!
//! 1. union the sealed floor head with the declared delta (regressions abort here);
//! 2. build the gate catalog for this evaluation and resolve the combined set;
//! 3. bind every gate to a collaborator and run them all concurrently;
//! 4. check inherited gates, the score variance, and the explicit criteria;
//! 5. decide, export the report, and seal the floor if the verdict allows it.
//!
//! Configuration-class failures (steps 1 and 2, unbound gates) stop the
//! evaluation before any gate runs and map to exit status `2`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gates::{
    decide, BranchName, CandidateId, CombinedGateSet, ConfigError, CorrelationId,
    DecisionContext, ExplicitCriteria, ExportError, FloorDelta, FloorError, FloorSnapshot,
    FloorStore, FloorStoreError, FloorTracker, GateError, GateId, GateRegistry, GateResult, Points,
    PromotionDecision, PromotionRequest, ReleaseVersion, ReportExporter, ReportSink,
    ScoreInvariantError, ScoreLedger, SectionCode, Timestamp, VarianceCheck,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{evaluate_gates, CancellationSignal, EvaluationLimits, GateBinding, GateCollaborator};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that prevent an evaluation from producing a decision.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or contradictory input.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The gate catalog rejected or could not resolve the gate set.
    #[error(transparent)]
    Registry(#[from] GateError),

    /// The delta weakens the sealed floor.
    #[error(transparent)]
    Floor(#[from] FloorError),

    /// A deduction broke a score invariant.
    #[error(transparent)]
    Score(#[from] ScoreInvariantError),

    /// The report could not be written.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// The sealed snapshot could not be persisted.
    #[error("floor snapshot for {version} could not be persisted: {source}")]
    FloorStore {
        /// Version that was to be sealed. The in-memory ledger did not move.
        version: ReleaseVersion,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Process exit status for this error. Every engine error is an
    /// input or infrastructure error.
    pub fn exit_code(&self) -> i32 {
        2
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Evaluation-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Maximum number of gates running at once.
    pub worker_slots: usize,
    /// Timeout for gates without their own override.
    pub gate_timeout: Duration,
    /// Deadline for the whole evaluation.
    pub evaluation_deadline: Duration,
    /// Maximum allowed score variance.
    pub max_variance: Points,
}

/// What one evaluation is asked to decide.
#[derive(Debug, Clone)]
pub struct PromotionInputs {
    /// Candidate commit or tag.
    pub candidate: CandidateId,
    /// Protected target branch.
    pub target_branch: BranchName,
    /// Evidence bundle reference handed to collaborators.
    pub evidence: String,
    /// Gates this version declares against the sealed floor.
    pub delta: FloorDelta,
    /// Named boolean criteria.
    pub criteria: ExplicitCriteria,
    /// Version to seal on approval. Defaults to the highest origin version
    /// in the combined gate set.
    pub release_version: Option<ReleaseVersion>,
    /// Correlation id threaded through results and the report.
    pub correlation_id: CorrelationId,
    /// Decision timestamp. Defaults to now.
    pub decided_at: Option<Timestamp>,
}

/// Everything an evaluation produced.
#[derive(Debug)]
pub struct PromotionOutcome {
    /// The decision, carrying its report hash.
    pub decision: PromotionDecision,
    /// Where the report was written.
    pub report: PathBuf,
    /// One result per evaluated gate.
    pub results: BTreeMap<GateId, GateResult>,
    /// The snapshot sealed by this evaluation, if any.
    pub sealed: Option<Arc<FloorSnapshot>>,
    /// Why an approved evaluation could not seal, if it could not.
    pub seal_error: Option<FloorError>,
}

impl PromotionOutcome {
    /// Process exit status for the decision.
    pub fn exit_code(&self) -> i32 {
        self.decision.verdict.exit_code()
    }
}

struct Binding {
    collaborator: Arc<dyn GateCollaborator>,
    timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives promotion evaluations against one floor ledger and score ledger.
pub struct PromotionEngine<S> {
    settings: EngineSettings,
    bindings: BTreeMap<GateId, Binding>,
    fallback: Option<Arc<dyn GateCollaborator>>,
    floor: Arc<FloorTracker>,
    floor_store: Option<Arc<dyn FloorStore>>,
    scores: ScoreLedger,
    exporter: ReportExporter<S>,
}

impl<S: ReportSink> PromotionEngine<S> {
    /// Creates an engine over `floor`, scoring against `baseline`.
    pub fn new(
        settings: EngineSettings,
        floor: Arc<FloorTracker>,
        baseline: Points,
        exporter: ReportExporter<S>,
    ) -> Self {
        Self {
            settings,
            bindings: BTreeMap::new(),
            fallback: None,
            floor,
            floor_store: None,
            scores: ScoreLedger::new(baseline),
            exporter,
        }
    }

    /// Persists every sealed snapshot to `store`.
    #[must_use]
    pub fn with_floor_store(mut self, store: Arc<dyn FloorStore>) -> Self {
        self.floor_store = Some(store);
        self
    }

    /// Collaborator used for gates without an explicit binding.
    #[must_use]
    pub fn with_default_collaborator(mut self, collaborator: Arc<dyn GateCollaborator>) -> Self {
        self.fallback = Some(collaborator);
        self
    }

    /// Binds `gate` to `collaborator`, optionally overriding the gate timeout.
    pub fn bind(
        &mut self,
        gate: GateId,
        collaborator: Arc<dyn GateCollaborator>,
        timeout: Option<Duration>,
    ) {
        self.bindings.insert(
            gate,
            Binding {
                collaborator,
                timeout,
            },
        );
    }

    /// Appends a deduction to the score ledger.
    pub fn record_deduction(
        &mut self,
        section: SectionCode,
        standard: Points,
        conservative: Points,
        rationale: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.scores
            .record_deduction(section, standard, conservative, rationale)?;
        Ok(())
    }

    /// The score ledger.
    pub fn scores(&self) -> &ScoreLedger {
        &self.scores
    }

    /// The floor ledger.
    pub fn floor(&self) -> &Arc<FloorTracker> {
        &self.floor
    }

    /// Runs one evaluation to a decision.
    #[instrument(
        name = "promotion",
        skip_all,
        fields(correlation_id = %inputs.correlation_id, candidate = %inputs.candidate)
    )]
    pub async fn evaluate(
        &self,
        inputs: PromotionInputs,
        cancel: &CancellationSignal,
    ) -> Result<PromotionOutcome, EngineError> {
        reject_duplicate_ids(&inputs.delta)?;

        let head = self.floor.head();
        let combined = FloorTracker::combined_gate_set(head.as_deref(), &inputs.delta)?;
        let catalog = self.catalog(&combined)?;
        let ids: Vec<&GateId> = combined.gates.iter().map(|g| &g.id).collect();
        let definitions = catalog.resolve(ids)?;
        let bindings = definitions
            .iter()
            .map(|definition| self.binding_for(definition))
            .collect::<Result<Vec<_>, _>>()?;

        let request = PromotionRequest {
            candidate: inputs.candidate,
            target_branch: inputs.target_branch,
            gates: definitions,
            evidence: inputs.evidence,
            correlation_id: inputs.correlation_id,
        };
        info!(
            gates = request.gates.len(),
            inherited = combined.inherited.len(),
            "evaluation started"
        );

        let run = evaluate_gates(
            bindings,
            EvaluationLimits {
                worker_slots: self.settings.worker_slots,
                deadline: self.settings.evaluation_deadline,
            },
            request.correlation_id,
            &request.evidence,
            cancel,
        )
        .await;

        let floor_check = FloorTracker::check_inherited(head.as_deref(), &run.results);
        let variance_check =
            VarianceCheck::new(self.scores.current_totals(), self.settings.max_variance);
        let decision = decide(
            &request,
            &run.results,
            &floor_check,
            &variance_check,
            &inputs.criteria,
            DecisionContext {
                cancelled: run.cancelled,
                decided_at: inputs.decided_at.unwrap_or_else(Timestamp::now),
            },
        );

        let exported = self.exporter.export(decision, &run.results, &request)?;
        let decision = exported.decision;
        info!(
            verdict = ?decision.verdict,
            reasons = decision.reasons.len(),
            warnings = decision.warnings.len(),
            variance = %decision.variance,
            "promotion decided"
        );

        let (sealed, seal_error) = if decision.is_approved() && !run.cancelled {
            let version = inputs
                .release_version
                .or_else(|| combined.highest_origin().cloned());
            match version {
                Some(version) => self.seal(head.as_deref(), version, &combined, &run.results)?,
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(PromotionOutcome {
            decision,
            report: exported.location,
            results: run.results,
            sealed,
            seal_error,
        })
    }

    /// Builds the gate catalog for one evaluation.
    ///
    /// Floor gates register first, then every sealed version is frozen, then
    /// the new delta gates register. A delta gate that claims a sealed
    /// version as its origin is therefore refused.
    fn catalog(&self, combined: &CombinedGateSet) -> Result<GateRegistry, GateError> {
        let mut catalog = GateRegistry::new();
        for gate in combined
            .gates
            .iter()
            .filter(|g| combined.inherited.contains(&g.id))
        {
            catalog.register(gate.clone())?;
        }
        for snapshot in self.floor.history() {
            catalog.freeze(snapshot.version.clone());
        }
        for gate in combined
            .gates
            .iter()
            .filter(|g| !combined.inherited.contains(&g.id))
        {
            catalog.register(gate.clone())?;
        }
        Ok(catalog)
    }

    fn binding_for(&self, definition: &gates::GateDefinition) -> Result<GateBinding, ConfigError> {
        let (collaborator, timeout) = match self.bindings.get(&definition.id) {
            Some(binding) => (Arc::clone(&binding.collaborator), binding.timeout),
            None => match &self.fallback {
                Some(fallback) => (Arc::clone(fallback), None),
                None => {
                    return Err(ConfigError::UnboundGate {
                        gate: definition.id.clone(),
                    })
                }
            },
        };
        Ok(GateBinding {
            definition: definition.clone(),
            collaborator,
            timeout: timeout.unwrap_or(self.settings.gate_timeout),
        })
    }

    /// Seals, persists, then commits. A refused seal is reported, not
    /// raised; a persistence failure is raised. The in-memory ledger only
    /// moves once the store has accepted the snapshot.
    fn seal(
        &self,
        head: Option<&FloorSnapshot>,
        version: ReleaseVersion,
        combined: &CombinedGateSet,
        results: &BTreeMap<GateId, GateResult>,
    ) -> Result<(Option<Arc<FloorSnapshot>>, Option<FloorError>), EngineError> {
        let expected = head.map(|h| &h.seal_token);
        let snapshot = match self.floor.prepare_seal(expected, version, combined, results) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(error = %error, "approved evaluation was not sealed");
                return Ok((None, Some(error)));
            }
        };
        if let Some(store) = &self.floor_store {
            match store.append(&snapshot) {
                Ok(location) => info!(location = %location.display(), "floor snapshot persisted"),
                Err(FloorStoreError::HeadMoved { expected, actual }) => {
                    let error = FloorError::SealConflict { expected, actual };
                    warn!(error = %error, "approved evaluation was not sealed");
                    return Ok((None, Some(error)));
                }
                Err(FloorStoreError::Io(source)) => {
                    return Err(EngineError::FloorStore {
                        version: snapshot.version,
                        source,
                    })
                }
            }
        }
        match self.floor.commit(snapshot) {
            Ok(snapshot) => Ok((Some(snapshot), None)),
            Err(error) => {
                warn!(error = %error, "approved evaluation was not sealed");
                Ok((None, Some(error)))
            }
        }
    }
}

fn reject_duplicate_ids(delta: &FloorDelta) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for definition in &delta.definitions {
        if !seen.insert(&definition.id) {
            return Err(ConfigError::DuplicateGateId {
                id: definition.id.clone(),
            });
        }
    }
    Ok(())
}
