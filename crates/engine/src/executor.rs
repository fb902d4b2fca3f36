//! Runs one gate's collaborator under a timeout and turns whatever happens
//! into a [`GateResult`].
//!
//! The executor never retries. A collaborator error, a panic, a timeout, and
//! a cancellation each map to a distinct status and [`ErrorKind`]:
//!
//! | What happened | Status | Kind |
//! |---------------|--------|------|
//! | outcome reported | `passed` / `failed` | `gate_failure` if failed |
//! | `Unavailable` | `failed` | `collaborator_unavailable` |
//! | `Fault` or panic | `error` | `collaborator_fault` |
//! | timeout elapsed | `timed_out` | `timeout` |
//! | cancelled | `error` | `cancelled` |

use std::sync::Arc;
use std::time::{Duration, Instant};

use gates::{ErrorKind, GateResult, GateStatus};
use tokio::task::JoinError;
use tracing::{info, instrument, warn};

use crate::{CollaboratorError, GateCollaborator, GateContext};

enum Completion {
    Returned(Result<gates::CheckOutcome, CollaboratorError>),
    Panicked(JoinError),
    TimedOut,
    Cancelled,
}

/// Executes single gates.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateExecutor;

impl GateExecutor {
    /// Invokes `collaborator` once for `ctx.definition`, bounded by `timeout`.
    ///
    /// The collaborator runs on its own task so a panic or a hung future is
    /// contained; on timeout or cancellation that task is aborted.
    #[instrument(
        name = "gate",
        skip_all,
        fields(gate_id = %ctx.definition.id, correlation_id = %ctx.correlation_id)
    )]
    pub async fn run(
        &self,
        collaborator: Arc<dyn GateCollaborator>,
        ctx: GateContext,
        timeout: Duration,
    ) -> GateResult {
        let started = Instant::now();
        let definition = ctx.definition.clone();
        let correlation_id = ctx.correlation_id;
        let cancel = ctx.cancel.clone();

        let mut handle = tokio::spawn(async move { collaborator.evaluate(&ctx).await });
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = tokio::time::timeout(timeout, &mut handle) => Some(joined),
        };
        let completion = match joined {
            None => {
                handle.abort();
                Completion::Cancelled
            }
            Some(Err(_elapsed)) => {
                handle.abort();
                Completion::TimedOut
            }
            Some(Ok(Ok(returned))) => Completion::Returned(returned),
            Some(Ok(Err(join_error))) => Completion::Panicked(join_error),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let without_outcome = |status, kind, detail: String| {
            GateResult::without_outcome(
                definition.id.clone(),
                status,
                kind,
                elapsed_ms,
                detail,
                correlation_id,
            )
        };
        let result = match completion {
            Completion::Returned(Ok(mut outcome)) => {
                if outcome.duration_ms == 0 {
                    outcome.duration_ms = elapsed_ms;
                }
                GateResult::from_outcome(&definition, outcome, correlation_id)
            }
            Completion::Returned(Err(CollaboratorError::Unavailable { message, .. })) => {
                without_outcome(
                    GateStatus::Failed,
                    ErrorKind::CollaboratorUnavailable,
                    message,
                )
            }
            Completion::Returned(Err(CollaboratorError::Fault { message })) => {
                without_outcome(GateStatus::Error, ErrorKind::CollaboratorFault, message)
            }
            Completion::Panicked(join_error) => without_outcome(
                GateStatus::Error,
                ErrorKind::CollaboratorFault,
                format!("collaborator task failed: {join_error}"),
            ),
            Completion::TimedOut => without_outcome(
                GateStatus::TimedOut,
                ErrorKind::Timeout,
                format!("no outcome within {} ms", timeout.as_millis()),
            ),
            Completion::Cancelled => without_outcome(
                GateStatus::Error,
                ErrorKind::Cancelled,
                "evaluation cancelled".to_string(),
            ),
        };

        if result.status.is_passed() {
            info!(duration_ms = result.duration_ms, tests_run = result.tests_run, "gate passed");
        } else {
            warn!(
                status = %result.status,
                kind = ?result.error_kind,
                detail = %result.detail,
                "gate did not pass"
            );
        }
        result
    }
}
