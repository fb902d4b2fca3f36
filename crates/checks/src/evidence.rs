//! Reads gate outcomes recorded by an earlier CI run.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use engine::{CollaboratorError, GateCollaborator, GateContext};
use gates::{CheckOutcome, RetryPolicy};
use tracing::debug;

/// Reads `<evidence>/<gate-id>.json`, where `<evidence>` is the request's
/// evidence reference.
///
/// A missing file means the run never produced the gate's outcome and is a
/// fault. Any other I/O failure is retryable unavailability.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceCollaborator;

impl EvidenceCollaborator {
    /// Location of the recorded outcome for `ctx`.
    pub fn outcome_path(ctx: &GateContext) -> PathBuf {
        Path::new(&ctx.evidence).join(format!("{}.json", ctx.definition.id))
    }
}

#[async_trait]
impl GateCollaborator for EvidenceCollaborator {
    async fn evaluate(&self, ctx: &GateContext) -> Result<CheckOutcome, CollaboratorError> {
        let path = Self::outcome_path(ctx);
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => CollaboratorError::Fault {
                message: format!("no recorded outcome at {}", path.display()),
            },
            _ => CollaboratorError::Unavailable {
                message: format!("cannot read {}: {e}", path.display()),
                retry: RetryPolicy::Retryable { after: None },
            },
        })?;
        debug!(gate_id = %ctx.definition.id, path = %path.display(), "recorded outcome read");
        serde_json::from_slice(&bytes).map_err(|e| CollaboratorError::Fault {
            message: format!("malformed outcome in {}: {e}", path.display()),
        })
    }
}
