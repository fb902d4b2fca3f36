//! Caller-side retry policy for collaborators whose infrastructure is flaky.
//!
//! The executor itself never retries. Wrapping a collaborator in
//! [`RetryingCollaborator`] re-invokes it a bounded number of times while it
//! reports [`CollaboratorError::Unavailable`] with a retryable policy. When
//! the attempts run out, the last unavailability is returned as
//! non-retryable, which the executor records as a gate failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gates::{CheckOutcome, RetryPolicy};
use tracing::warn;

use crate::{CollaboratorError, GateCollaborator, GateContext};

/// Bounded-retry decorator around another collaborator.
pub struct RetryingCollaborator {
    inner: Arc<dyn GateCollaborator>,
    max_retries: u32,
    backoff: Duration,
}

impl RetryingCollaborator {
    /// Retries `inner` up to `max_retries` extra times, waiting `backoff`
    /// between attempts unless the error names its own delay.
    pub fn new(inner: Arc<dyn GateCollaborator>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }
}

#[async_trait]
impl GateCollaborator for RetryingCollaborator {
    async fn evaluate(&self, ctx: &GateContext) -> Result<CheckOutcome, CollaboratorError> {
        let mut retries = 0;
        loop {
            match self.inner.evaluate(ctx).await {
                Err(CollaboratorError::Unavailable {
                    message,
                    retry: RetryPolicy::Retryable { after },
                }) if retries < self.max_retries => {
                    retries += 1;
                    let delay = after.unwrap_or(self.backoff);
                    warn!(
                        gate_id = %ctx.definition.id,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "collaborator unavailable, retrying"
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            return Err(CollaboratorError::Unavailable {
                                message: format!("{message} (retry abandoned: cancelled)"),
                                retry: RetryPolicy::NonRetryable,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(CollaboratorError::Unavailable { message, .. }) => {
                    return Err(CollaboratorError::Unavailable {
                        message: format!("{message} (after {} attempts)", retries + 1),
                        retry: RetryPolicy::NonRetryable,
                    });
                }
                other => return other,
            }
        }
    }
}
