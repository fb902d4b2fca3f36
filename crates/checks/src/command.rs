//! Runs an external program as a gate check.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use engine::{CollaboratorError, GateCollaborator, GateContext};
use gates::{CheckOutcome, RetryPolicy};
use tracing::{debug, instrument};

/// Spawns a configured program once per gate evaluation.
///
/// The child sees `GATE_ID`, `GATE_SUITE`, `GATE_CORRELATION_ID` and
/// `GATE_EVIDENCE`. The last stdout line that parses as a check outcome is
/// the result; without one, the exit status decides and no tests are counted.
/// The child is killed when the evaluation stops waiting for it.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandCollaborator {
    /// Creates a collaborator running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    /// Runs the program from `dir` instead of the current directory.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl GateCollaborator for CommandCollaborator {
    #[instrument(skip_all, fields(gate_id = %ctx.definition.id, program = %self.program))]
    async fn evaluate(&self, ctx: &GateContext) -> Result<CheckOutcome, CollaboratorError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("GATE_ID", ctx.definition.id.as_str())
            .env("GATE_SUITE", &ctx.definition.suite)
            .env("GATE_CORRELATION_ID", ctx.correlation_id.to_string())
            .env("GATE_EVIDENCE", &ctx.evidence)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| CollaboratorError::Unavailable {
                message: format!("failed to spawn '{}': {e}", self.program),
                retry: RetryPolicy::Retryable { after: None },
            })?;
        debug!(pid = child.id(), "gate command started");

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(CollaboratorError::Fault {
                    message: format!("'{}' stopped before it finished", self.program),
                });
            }
            output = child.wait_with_output() => output.map_err(|e| CollaboratorError::Unavailable {
                message: format!("lost contact with '{}': {e}", self.program),
                retry: RetryPolicy::NonRetryable,
            })?,
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(classify(output.status, &stdout, &stderr, elapsed_ms))
    }
}

fn classify(status: ExitStatus, stdout: &str, stderr: &str, elapsed_ms: u64) -> CheckOutcome {
    match last_outcome(stdout) {
        Some(mut outcome) => {
            if outcome.passed && !status.success() {
                outcome.passed = false;
                outcome.detail = format!("reported a pass but exited with {status}; {}", outcome.detail);
            }
            if outcome.duration_ms == 0 {
                outcome.duration_ms = elapsed_ms;
            }
            outcome
        }
        None => CheckOutcome {
            passed: status.success(),
            tests_run: 0,
            tests_passed: 0,
            duration_ms: elapsed_ms,
            detail: stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map_or_else(|| format!("exited with {status}"), str::to_string),
        },
    }
}

fn last_outcome(stdout: &str) -> Option<CheckOutcome> {
    stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<CheckOutcome>(line.trim()).ok())
}
