//! Promotion gate orchestration.
//!
//! This crate runs gates. It owns the collaborator port every concrete check
//! implements, the per-gate executor, the bounded concurrent evaluation with
//! its outer deadline and cancellation, the caller-side retry decorator, and
//! the end-to-end [`PromotionEngine`] that turns a declared delta into a
//! decision, a report, and (on approval) a sealed floor.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between the domain
//! rules in the [`gates`] crate and infrastructure behind the
//! [`GateCollaborator`], [`gates::ReportSink`] and [`gates::FloorStore`]
//! ports. It contains no domain rules of its own.

mod cancel;
mod collaborator;
mod evaluation;
mod executor;
mod promotion;
mod retry;

pub use cancel::{CancellationHandle, CancellationSignal};
pub use collaborator::{CollaboratorError, GateCollaborator, GateContext};
pub use evaluation::{evaluate_gates, EvaluationLimits, EvaluationRun, GateBinding};
pub use executor::GateExecutor;
pub use promotion::{
    EngineError, EngineSettings, PromotionEngine, PromotionInputs, PromotionOutcome,
};
pub use retry::RetryingCollaborator;
