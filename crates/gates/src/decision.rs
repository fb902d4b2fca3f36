//! The promotion decision: a pure function from evaluation inputs to a verdict.
//!
//! The decision never short-circuits. Every failing blocking gate, every floor
//! violation, an excessive variance, and every unsatisfied criterion are
//! collected so a single rerun can address all of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    CandidateId, CorrelationId, CriterionName, ErrorKind, ExplicitCriteria, FloorCheck,
    FloorViolation, GateId, GateResult, GateStatus, Points, PromotionRequest, Timestamp,
    VarianceCheck,
};

/// Final outcome of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The candidate may be promoted.
    Approved,
    /// The candidate may not be promoted.
    Rejected,
}

impl Verdict {
    /// Process exit status for this verdict (`0` approved, `1` rejected).
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Approved => 0,
            Self::Rejected => 1,
        }
    }
}

/// One reason a promotion was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The evaluation was aborted before every gate reported.
    EvaluationCancelled,
    /// A blocking gate did not pass.
    BlockingGateFailed {
        /// The gate.
        gate: GateId,
        /// Its status.
        status: GateStatus,
        /// Distinguishing kind, if recorded.
        error_kind: Option<ErrorKind>,
    },
    /// An inherited gate regressed.
    FloorRegression {
        /// The violation.
        violation: FloorViolation,
    },
    /// Standard and conservative scores disagree by more than allowed.
    VarianceExceeded {
        /// Measured variance.
        variance: Points,
        /// Allowed maximum.
        threshold: Points,
    },
    /// An explicit criterion is not satisfied.
    CriterionUnsatisfied {
        /// The criterion.
        criterion: CriterionName,
    },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EvaluationCancelled => f.write_str("evaluation cancelled"),
            Self::BlockingGateFailed { gate, status, .. } => {
                write!(f, "blocking gate '{gate}' {status}")
            }
            Self::FloorRegression { violation } => write!(f, "floor regression: {violation}"),
            Self::VarianceExceeded {
                variance,
                threshold,
            } => write!(f, "score variance {variance} exceeds {threshold}"),
            Self::CriterionUnsatisfied { criterion } => {
                write!(f, "criterion '{criterion}' not satisfied")
            }
        }
    }
}

/// A non-blocking gate that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateWarning {
    /// The gate.
    pub gate: GateId,
    /// Its status.
    pub status: GateStatus,
    /// Distinguishing kind, if recorded.
    pub error_kind: Option<ErrorKind>,
    /// Collaborator detail.
    pub detail: String,
}

/// The verdict with itemised reasons.
///
/// Created fresh per evaluation and never edited: attaching the report hash
/// consumes the value and returns a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionDecision {
    /// Approved or rejected.
    pub verdict: Verdict,
    /// Evaluation correlation id.
    pub correlation_id: CorrelationId,
    /// Candidate the decision is about.
    pub candidate: CandidateId,
    /// Every blocking gate that did not pass, in request order.
    pub failed_blocking_gates: Vec<GateId>,
    /// Every rejection reason; empty when approved.
    pub reasons: Vec<RejectionReason>,
    /// Non-blocking gates that did not pass.
    pub warnings: Vec<GateWarning>,
    /// `|standard - conservative|`.
    pub variance: Points,
    /// When the decision was made.
    pub decided_at: Timestamp,
    /// SHA-256 of the exported report body; `None` until exported.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub report_hash: Option<String>,
}

impl PromotionDecision {
    /// Returns `true` if the verdict is approved.
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approved
    }

    /// Supersedes this decision with one that carries the report hash.
    #[must_use]
    pub fn with_report_hash(self, hash: impl Into<String>) -> Self {
        Self {
            report_hash: Some(hash.into()),
            ..self
        }
    }
}

/// Evaluation facts that are not gate results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionContext {
    /// The evaluation was cancelled before completion.
    pub cancelled: bool,
    /// Decision timestamp; an input so identical inputs give identical decisions.
    pub decided_at: Timestamp,
}

/// Derives the promotion decision.
///
/// Gates are partitioned by their definition in `request`. A gate in the
/// request without a result counts as `timed_out`; results for gates outside
/// the request are ignored.
pub fn decide(
    request: &PromotionRequest,
    results: &BTreeMap<GateId, GateResult>,
    floor_check: &FloorCheck,
    variance_check: &VarianceCheck,
    criteria: &ExplicitCriteria,
    context: DecisionContext,
) -> PromotionDecision {
    let mut reasons = Vec::new();
    let mut failed_blocking_gates = Vec::new();
    let mut warnings = Vec::new();

    if context.cancelled {
        reasons.push(RejectionReason::EvaluationCancelled);
    }

    for gate in &request.gates {
        let (status, error_kind, detail) = match results.get(&gate.id) {
            Some(r) => (r.status, r.error_kind, r.detail.as_str()),
            None => (
                GateStatus::TimedOut,
                Some(ErrorKind::Timeout),
                "no result recorded",
            ),
        };
        if status.is_passed() {
            continue;
        }
        if gate.blocking {
            failed_blocking_gates.push(gate.id.clone());
            reasons.push(RejectionReason::BlockingGateFailed {
                gate: gate.id.clone(),
                status,
                error_kind,
            });
        } else {
            warnings.push(GateWarning {
                gate: gate.id.clone(),
                status,
                error_kind,
                detail: detail.to_string(),
            });
        }
    }

    reasons.extend(
        floor_check
            .violations
            .iter()
            .cloned()
            .map(|violation| RejectionReason::FloorRegression { violation }),
    );

    if variance_check.exceeded() {
        reasons.push(RejectionReason::VarianceExceeded {
            variance: variance_check.variance,
            threshold: variance_check.threshold,
        });
    }

    reasons.extend(
        criteria
            .iter()
            .filter(|c| !c.satisfied)
            .map(|c| RejectionReason::CriterionUnsatisfied {
                criterion: c.name.clone(),
            }),
    );

    let verdict = if reasons.is_empty() {
        Verdict::Approved
    } else {
        Verdict::Rejected
    };

    PromotionDecision {
        verdict,
        correlation_id: request.correlation_id,
        candidate: request.candidate.clone(),
        failed_blocking_gates,
        reasons,
        warnings,
        variance: variance_check.variance,
        decided_at: context.decided_at,
        report_hash: None,
    }
}
