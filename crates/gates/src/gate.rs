//! Gate definitions, per-gate results, and the promotion request.

use serde::{Deserialize, Serialize};

use crate::{
    BranchName, CandidateId, ConfigError, CorrelationId, CriterionName, GateId, ReleaseVersion,
};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// A single automated check a release candidate must pass.
///
/// Immutable once registered. The `suite` is an opaque locator handed to the
/// gate's collaborator; the engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GateDefinition {
    /// Stable identifier, unique within a registry.
    pub id: GateId,
    /// Opaque locator passed to the collaborator.
    pub suite: String,
    /// Number of tests the gate is expected to run.
    #[serde(alias = "expectedTests")]
    pub expected_tests: u32,
    /// Whether failure alone rejects the promotion.
    pub blocking: bool,
    /// Version that introduced the gate.
    #[serde(alias = "originVersion")]
    pub origin_version: ReleaseVersion,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome status of one gate in one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// The collaborator reported success and the expected tests ran.
    Passed,
    /// The collaborator reported failure.
    Failed,
    /// The per-gate timeout or the evaluation deadline elapsed first.
    TimedOut,
    /// The collaborator raised, panicked, or was cancelled.
    Error,
}

impl GateStatus {
    /// Only `Passed` counts as passing; every other status is a failure for
    /// decision purposes.
    pub fn is_passed(self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Distinguishing kind for a gate that did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The collaborator reported failure (or fewer tests than expected).
    GateFailure,
    /// A per-gate timeout or the outer deadline elapsed.
    Timeout,
    /// The collaborator stayed unreachable after the bounded retries.
    CollaboratorUnavailable,
    /// The collaborator raised an error or panicked.
    CollaboratorFault,
    /// The evaluation was cancelled before the gate reported.
    Cancelled,
}

/// What a collaborator reports for one evaluation.
///
/// This is the wire shape external checks emit (camelCase keys).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    /// Whether the check succeeded.
    pub passed: bool,
    /// Tests executed.
    pub tests_run: u32,
    /// Tests that passed.
    pub tests_passed: u32,
    /// Wall-clock time the check reports for itself.
    pub duration_ms: u64,
    /// Free-form detail.
    #[serde(default)]
    pub detail: String,
}

/// The structured result of one gate in one evaluation.
///
/// Produced exactly once per gate per evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// The gate this result belongs to.
    pub gate_id: GateId,
    /// Outcome status.
    pub status: GateStatus,
    /// Tests executed.
    pub tests_run: u32,
    /// Tests that passed.
    pub tests_passed: u32,
    /// Elapsed time in milliseconds.
    pub duration_ms: u64,
    /// Free-form detail.
    pub detail: String,
    /// Why the gate did not pass; `None` when it passed.
    pub error_kind: Option<ErrorKind>,
    /// Evaluation this result belongs to.
    pub correlation_id: CorrelationId,
}

impl GateResult {
    /// Classifies a collaborator outcome against the gate's definition.
    ///
    /// A reported pass only counts when at least `expected_tests` tests ran
    /// and the passed count does not exceed the run count.
    pub fn from_outcome(
        definition: &GateDefinition,
        outcome: CheckOutcome,
        correlation_id: CorrelationId,
    ) -> Self {
        let mut detail = outcome.detail;
        let status = if outcome.tests_passed > outcome.tests_run {
            detail = format!(
                "reported {} passed of {} run; {}",
                outcome.tests_passed, outcome.tests_run, detail
            );
            GateStatus::Failed
        } else if !outcome.passed {
            GateStatus::Failed
        } else if outcome.tests_run < definition.expected_tests {
            detail = format!(
                "ran {} of {} expected tests; {}",
                outcome.tests_run, definition.expected_tests, detail
            );
            GateStatus::Failed
        } else {
            GateStatus::Passed
        };
        Self {
            gate_id: definition.id.clone(),
            status,
            tests_run: outcome.tests_run,
            tests_passed: outcome.tests_passed,
            duration_ms: outcome.duration_ms,
            detail,
            error_kind: (!status.is_passed()).then_some(ErrorKind::GateFailure),
            correlation_id,
        }
    }

    /// A result with no test counts, for gates that never produced an outcome.
    pub fn without_outcome(
        gate_id: GateId,
        status: GateStatus,
        kind: ErrorKind,
        duration_ms: u64,
        detail: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            gate_id,
            status,
            tests_run: 0,
            tests_passed: 0,
            duration_ms,
            detail: detail.into(),
            error_kind: Some(kind),
            correlation_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A named boolean predicate that must hold for promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    /// Criterion name (e.g. `"clean-room-reproducibility"`).
    pub name: CriterionName,
    /// Whether it is satisfied.
    pub satisfied: bool,
}

/// Ordered, name-unique set of explicit promotion criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExplicitCriteria(Vec<Criterion>);

impl ExplicitCriteria {
    /// Builds the set, preserving order and rejecting duplicate names.
    pub fn new(criteria: Vec<Criterion>) -> Result<Self, ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for c in &criteria {
            if !seen.insert(c.name.clone()) {
                return Err(ConfigError::DuplicateCriterion {
                    name: c.name.to_string(),
                });
            }
        }
        Ok(Self(criteria))
    }

    /// Iterates criteria in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Criterion> {
        self.0.iter()
    }

    /// Returns `true` if no criteria were declared.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything needed to evaluate one promotion.
///
/// `gates` is the combined gate set: the sealed floor plus the declared delta,
/// in floor order followed by delta order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRequest {
    /// Candidate commit or tag.
    pub candidate: CandidateId,
    /// Protected branch the candidate would be merged into.
    pub target_branch: BranchName,
    /// Gates to evaluate.
    pub gates: Vec<GateDefinition>,
    /// Reference to the evidence bundle handed to collaborators.
    pub evidence: String,
    /// Evaluation correlation id.
    pub correlation_id: CorrelationId,
}

impl PromotionRequest {
    /// Looks up a gate definition in the request's gate set.
    pub fn gate(&self, id: &GateId) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| &g.id == id)
    }
}
