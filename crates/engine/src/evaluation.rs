//! Concurrent evaluation of a gate set under a bounded worker pool.
//!
//! Gates are independent, so all of them are spawned at once and a semaphore
//! limits how many run at a time. Results are keyed by gate id, never by
//! completion order.
//!
//! The whole evaluation is bounded by an outer deadline and by the caller's
//! cancellation signal. When either fires first, the remaining gates are
//! told to stop, their tasks are aborted, and every unresolved gate is
//! recorded (`timed_out` for the deadline, `error`/`cancelled` for an abort).
//! No gate is ever left without a result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gates::{CorrelationId, ErrorKind, GateDefinition, GateId, GateResult, GateStatus};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::{CancellationHandle, CancellationSignal, GateCollaborator, GateContext, GateExecutor};

/// How long stopped gates get to unwind before their tasks are aborted.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// A gate together with the collaborator that evaluates it.
#[derive(Clone)]
pub struct GateBinding {
    /// The gate.
    pub definition: GateDefinition,
    /// Its collaborator.
    pub collaborator: Arc<dyn GateCollaborator>,
    /// Per-gate timeout.
    pub timeout: Duration,
}

/// Limits for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationLimits {
    /// Maximum number of gates running at once.
    pub worker_slots: usize,
    /// Deadline for the whole evaluation.
    pub deadline: Duration,
}

/// What came back from an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRun {
    /// Exactly one result per bound gate.
    pub results: BTreeMap<GateId, GateResult>,
    /// The caller cancelled before every gate reported.
    pub cancelled: bool,
    /// The outer deadline elapsed before every gate reported.
    pub deadline_elapsed: bool,
}

/// Runs every binding concurrently and collects one result per gate.
#[instrument(skip_all, fields(correlation_id = %correlation_id, gates = bindings.len()))]
pub async fn evaluate_gates(
    bindings: Vec<GateBinding>,
    limits: EvaluationLimits,
    correlation_id: CorrelationId,
    evidence: &str,
    cancel: &CancellationSignal,
) -> EvaluationRun {
    let expected: Vec<GateId> = bindings.iter().map(|b| b.definition.id.clone()).collect();
    let slots = Arc::new(Semaphore::new(limits.worker_slots.max(1)));
    let (stop, stop_signal) = CancellationHandle::new();

    let mut tasks = JoinSet::new();
    for binding in bindings {
        let slots = Arc::clone(&slots);
        let ctx = GateContext {
            definition: binding.definition.clone(),
            correlation_id,
            evidence: evidence.to_string(),
            cancel: stop_signal.clone(),
        };
        tasks.spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return GateResult::without_outcome(
                        binding.definition.id,
                        GateStatus::Error,
                        ErrorKind::CollaboratorFault,
                        0,
                        "worker pool closed",
                        correlation_id,
                    )
                }
            };
            GateExecutor
                .run(binding.collaborator, ctx, binding.timeout)
                .await
        });
    }

    let deadline = tokio::time::sleep(limits.deadline);
    tokio::pin!(deadline);

    let mut results = BTreeMap::new();
    let mut cancelled = false;
    let mut deadline_elapsed = false;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            _ = &mut deadline => {
                deadline_elapsed = true;
                break;
            }
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Ok(result)) => {
                    results.insert(result.gate_id.clone(), result);
                }
                Some(Err(join_error)) => {
                    warn!(error = %join_error, "gate task did not complete");
                }
            },
        }
    }

    if cancelled || deadline_elapsed {
        // Executors abort their collaborator tasks once they observe the
        // stop signal; give them a moment before dropping the rest.
        stop.cancel();
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
            tasks.shutdown().await;
        }
    }

    for id in expected {
        if results.contains_key(&id) {
            continue;
        }
        let result = if cancelled {
            GateResult::without_outcome(
                id.clone(),
                GateStatus::Error,
                ErrorKind::Cancelled,
                0,
                "evaluation cancelled before the gate reported",
                correlation_id,
            )
        } else {
            GateResult::without_outcome(
                id.clone(),
                GateStatus::TimedOut,
                ErrorKind::Timeout,
                u64::try_from(limits.deadline.as_millis()).unwrap_or(u64::MAX),
                if deadline_elapsed {
                    "evaluation deadline elapsed before the gate reported"
                } else {
                    "gate task ended without a result"
                },
                correlation_id,
            )
        };
        results.insert(id, result);
    }

    let passed = results.values().filter(|r| r.status.is_passed()).count();
    info!(
        passed,
        total = results.len(),
        cancelled,
        deadline_elapsed,
        "gate evaluation finished"
    );
    EvaluationRun {
        results,
        cancelled,
        deadline_elapsed,
    }
}
