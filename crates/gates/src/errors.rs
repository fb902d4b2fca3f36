//! Error taxonomy and retry-policy types for the promotion gate domain.
//!
//! Errors here are the *fatal* conditions: they stop a request before or
//! after execution. Per-gate outcomes (a gate failing, timing out, or its
//! collaborator being unreachable) are not Rust errors at the evaluation
//! level; they are recorded on each [`crate::GateResult`] as an
//! [`crate::ErrorKind`] so that nothing is swallowed and the report can
//! distinguish them.
//!
//! [`RetryPolicy`] is a cross-cutting concern: collaborator errors carry one
//! so the caller-side retry decorator knows whether another attempt is safe.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{GateId, Points, ReleaseVersion};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// - `Retryable`: the collaborator's infrastructure could not be reached
///   (process spawn failure, transient I/O).
/// - `NonRetryable`: the collaborator was reached and reported a fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Malformed or contradictory registry or request input.
///
/// Fatal: the evaluation never starts. Maps to exit status `2`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("configuration could not be parsed: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },

    /// Two gate entries share an id.
    #[error("gate '{id}' is declared more than once")]
    DuplicateGateId {
        /// The repeated id.
        id: GateId,
    },

    /// A gate references a collaborator that is not declared.
    #[error("gate '{gate}' references unknown collaborator '{collaborator}'")]
    UnknownCollaborator {
        /// Referencing gate.
        gate: GateId,
        /// The undeclared collaborator name.
        collaborator: String,
    },

    /// A gate in the evaluated set has no collaborator bound to it.
    #[error("gate '{gate}' has no collaborator binding")]
    UnboundGate {
        /// The unbound gate.
        gate: GateId,
    },

    /// Two explicit criteria share a name.
    #[error("criterion '{name}' is declared more than once")]
    DuplicateCriterion {
        /// The repeated name.
        name: String,
    },

    /// A field holds a value outside its allowed range.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Gate registry resolution and registration failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GateError {
    /// The id is already registered with a different definition body.
    #[error("gate '{id}' is already registered with a different definition")]
    DuplicateGate {
        /// Conflicting id.
        id: GateId,
    },

    /// One or more requested ids are not registered. Lists every missing id.
    #[error("unknown gates: {}", join_ids(.missing))]
    UnknownGates {
        /// All ids that could not be resolved, in request order.
        missing: Vec<GateId>,
    },

    /// The definition's origin version has already been sealed.
    #[error("gate '{id}' cannot be registered: version {version} is frozen")]
    VersionFrozen {
        /// Rejected id.
        id: GateId,
        /// The sealed version.
        version: ReleaseVersion,
    },
}

// ---------------------------------------------------------------------------
// Floor
// ---------------------------------------------------------------------------

/// One way in which a delta weakens the inherited floor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FloorViolation {
    /// An inherited gate was removed.
    Removed {
        /// The removed gate.
        gate: GateId,
    },
    /// An inherited gate was redeclared with fewer expected tests.
    Shrunk {
        /// The redeclared gate.
        gate: GateId,
        /// Expected tests in the sealed floor.
        inherited: u32,
        /// Expected tests in the redeclaration.
        declared: u32,
    },
    /// An inherited blocking gate was redeclared as non-blocking.
    Downgraded {
        /// The redeclared gate.
        gate: GateId,
    },
    /// An inherited gate did not pass in the current evaluation.
    NotPassed {
        /// The inherited gate.
        gate: GateId,
    },
}

impl std::fmt::Display for FloorViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Removed { gate } => write!(f, "inherited gate '{gate}' removed"),
            Self::Shrunk {
                gate,
                inherited,
                declared,
            } => write!(
                f,
                "inherited gate '{gate}' shrinks from {inherited} to {declared} expected tests"
            ),
            Self::Downgraded { gate } => {
                write!(f, "inherited blocking gate '{gate}' redeclared as non-blocking")
            }
            Self::NotPassed { gate } => write!(f, "inherited gate '{gate}' did not pass"),
        }
    }
}

/// Floor tracker failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FloorError {
    /// The delta would shrink or remove inherited coverage.
    ///
    /// Fatal to sealing and forces rejection of the promotion.
    #[error("floor regression: {}", join_display(.violations))]
    Regression {
        /// Every violation found, in floor order.
        violations: Vec<FloorViolation>,
    },

    /// Sealing was refused because inherited gates did not pass.
    #[error("cannot seal {version}: {}", join_display(.violations))]
    InheritedGateNotPassed {
        /// The version that was to be sealed.
        version: ReleaseVersion,
        /// The inherited gates that did not pass.
        violations: Vec<FloorViolation>,
    },

    /// The caller's view of the floor is stale: another seal happened first.
    #[error("seal conflict: expected head {expected}, found {actual}")]
    SealConflict {
        /// Token the caller presented (`"none"` for an empty ledger).
        expected: String,
        /// Token of the actual head (`"none"` for an empty ledger).
        actual: String,
    },

    /// A persisted snapshot does not match its seal token or breaks the
    /// append-only chain.
    #[error("floor ledger is corrupt at {version}: {message}")]
    CorruptLedger {
        /// Version of the offending snapshot.
        version: ReleaseVersion,
        /// What does not match.
        message: String,
    },

    /// The version is already sealed, or does not follow the current head.
    #[error("version {version} cannot be sealed after {head}")]
    VersionNotAfterHead {
        /// Requested version.
        version: ReleaseVersion,
        /// Current head version.
        head: ReleaseVersion,
    },
}

/// Failures appending a sealed snapshot to durable storage.
#[derive(Debug, Error)]
pub enum FloorStoreError {
    /// The stored ledger no longer ends at the snapshot's predecessor, or
    /// another writer has already claimed the successor slot.
    #[error("stored floor head moved: expected {expected}, found {actual}")]
    HeadMoved {
        /// Predecessor token the snapshot chains to (`"none"` for the first seal).
        expected: String,
        /// What the store holds instead.
        actual: String,
    },

    /// The store could not be read or written.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// A deduction would let the conservative score credit more than the
/// standard score does. Never clamped; surfaced immediately.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("score invariant violated for section '{section}': {message}")]
pub struct ScoreInvariantError {
    /// Section of the rejected record.
    pub section: String,
    /// Which invariant failed.
    pub message: String,
    /// Standard total the insert would have produced.
    pub standard: Points,
    /// Conservative total the insert would have produced.
    pub conservative: Points,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Report export failures. Only sink I/O can fail; it is surfaced as-is.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The report body could not be serialised.
    #[error("report serialisation failed: {0}")]
    Serialise(#[from] serde_json::Error),

    /// The sink failed to persist the artefact.
    #[error("report sink failed: {0}")]
    Io(#[from] std::io::Error),
}

fn join_ids(ids: &[GateId]) -> String {
    ids.iter().map(GateId::as_str).collect::<Vec<_>>().join(", ")
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
