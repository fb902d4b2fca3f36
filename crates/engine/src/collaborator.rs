//! The single capability every gate check implements.
//!
//! A regression-suite runner, a circuit-breaker inspector, and a
//! backup/restore verifier all look the same to the engine: something that
//! can be asked to evaluate once and report a [`CheckOutcome`].

use async_trait::async_trait;
use gates::{CheckOutcome, CorrelationId, GateDefinition, RetryPolicy};
use thiserror::Error;

use crate::CancellationSignal;

/// Everything a collaborator is told about the gate it evaluates.
#[derive(Debug, Clone)]
pub struct GateContext {
    /// The gate being evaluated.
    pub definition: GateDefinition,
    /// Evaluation correlation id, for the collaborator's own logs.
    pub correlation_id: CorrelationId,
    /// Evidence bundle reference from the request.
    pub evidence: String,
    /// Fires when the evaluation is cancelled or its deadline elapses.
    pub cancel: CancellationSignal,
}

/// Why a collaborator could not produce an outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    /// The collaborator's infrastructure could not be reached.
    #[error("collaborator unavailable: {message}")]
    Unavailable {
        /// What failed.
        message: String,
        /// Whether another attempt may help.
        retry: RetryPolicy,
    },

    /// The collaborator was reached but raised an error.
    #[error("collaborator fault: {message}")]
    Fault {
        /// What failed.
        message: String,
    },
}

impl CollaboratorError {
    /// Retry policy for this error. Faults are never retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Unavailable { retry, .. } => retry.clone(),
            Self::Fault { .. } => RetryPolicy::NonRetryable,
        }
    }
}

/// A black-box check behind one gate.
///
/// Implementations must be safe to invoke concurrently with other
/// collaborators, must not retry internally unless that is their own
/// documented policy, and should stop promptly when `ctx.cancel` fires.
#[async_trait]
pub trait GateCollaborator: Send + Sync {
    /// Runs the check once.
    async fn evaluate(&self, ctx: &GateContext) -> Result<CheckOutcome, CollaboratorError>;
}
