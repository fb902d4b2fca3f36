//! Core domain for the release promotion gate.
//!
//! This crate contains every domain concept used to decide whether a release
//! candidate may be merged into a protected branch: the gate catalog, the
//! append-only inherited floor, the dual score ledger, the decision function,
//! and the audit report. Infrastructure crates implement the ports defined
//! here ([`ReportSink`], [`FloorStore`]); they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate performs no I/O and has
//! no async runtime. Running gates concurrently is the `engine` crate's job.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`GateId`, `CorrelationId`, etc.) |
//! | [`types`] | Value types (`Points`, `ReleaseVersion`, `Timestamp`) |
//! | [`errors`] | Error taxonomy and `RetryPolicy` |
//! | [`gate`] | Gate definitions, results, criteria, and the promotion request |
//! | [`registry`] | Gate registry |
//! | [`floor`] | Floor tracker, snapshots, seal tokens |
//! | [`scoring`] | Standard/conservative score ledger and variance check |
//! | [`decision`] | Promotion decision function |
//! | [`report`] | Canonical report body, manifest hash, exporter |

pub mod decision;
pub mod errors;
pub mod floor;
pub mod gate;
pub mod identifiers;
pub mod registry;
pub mod report;
pub mod scoring;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use decision::{
    decide, DecisionContext, GateWarning, PromotionDecision, RejectionReason, Verdict,
};
pub use errors::{
    ConfigError, ExportError, FloorError, FloorStoreError, FloorViolation, GateError, RetryPolicy,
    ScoreInvariantError,
};
pub use floor::{
    CombinedGateSet, FloorCheck, FloorDelta, FloorSnapshot, FloorStore, FloorTracker, SealToken,
};
pub use gate::{
    CheckOutcome, Criterion, ErrorKind, ExplicitCriteria, GateDefinition, GateResult, GateStatus,
    PromotionRequest,
};
pub use identifiers::{
    BranchName, CandidateId, CollaboratorName, CorrelationId, CriterionName, GateId, SectionCode,
};
pub use registry::GateRegistry;
pub use report::{
    ExportedReport, ReportArtifact, ReportBody, ReportExporter, ReportManifest, ReportSink,
    REPORT_SCHEMA_VERSION,
};
pub use scoring::{DeductionRecord, ScoreLedger, ScoreTotals, VarianceCheck};
pub use types::{Points, ReleaseVersion, Timestamp};
