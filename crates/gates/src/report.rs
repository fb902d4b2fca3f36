//! Content-addressed audit artefact for one evaluation.
//!
//! The artefact is an envelope `{ manifest, body }`. The body is serialised
//! canonically (struct field order, `BTreeMap` keys, fixed-point scores,
//! results in request order) and its SHA-256 is recorded in the manifest.
//! Identical inputs therefore always produce the same hash.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::{
    CorrelationId, ExportError, GateId, GateResult, PromotionDecision, PromotionRequest,
};

/// Version of the report body layout.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Where artefacts are persisted.
///
/// Implementations must surface I/O failures rather than swallow them.
pub trait ReportSink: Send + Sync {
    /// Persists `contents` under `name` and returns the final location.
    fn persist(&self, name: &str, contents: &[u8]) -> std::io::Result<PathBuf>;
}

impl<S: ReportSink + ?Sized> ReportSink for std::sync::Arc<S> {
    fn persist(&self, name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        (**self).persist(name, contents)
    }
}

/// Canonical report body; this is what the manifest hash covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBody {
    /// Body layout version.
    pub schema_version: u32,
    /// Evaluation correlation id.
    pub correlation_id: CorrelationId,
    /// The evaluated request.
    pub request: PromotionRequest,
    /// Every gate result, in request order.
    pub results: Vec<GateResult>,
    /// The decision, without its report hash.
    pub decision: PromotionDecision,
}

/// Integrity manifest carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    /// Always `"sha256"`.
    pub algorithm: String,
    /// Hex digest of the canonical body bytes.
    pub body_sha256: String,
}

/// The persisted artefact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifact {
    /// Integrity manifest.
    pub manifest: ReportManifest,
    /// Canonical body.
    pub body: ReportBody,
}

/// What [`ReportExporter::export`] hands back.
#[derive(Debug, Clone)]
pub struct ExportedReport {
    /// Where the sink put the artefact.
    pub location: PathBuf,
    /// Hex SHA-256 of the canonical body.
    pub hash: String,
    /// The decision, superseded with its report hash.
    pub decision: PromotionDecision,
}

impl ReportBody {
    /// Assembles the body. Results are ordered by the request's gate order;
    /// any result for a gate outside the request follows in id order.
    pub fn new(
        decision: &PromotionDecision,
        results: &BTreeMap<GateId, GateResult>,
        request: &PromotionRequest,
    ) -> Self {
        let mut ordered: Vec<GateResult> = request
            .gates
            .iter()
            .filter_map(|g| results.get(&g.id).cloned())
            .collect();
        ordered.extend(
            results
                .values()
                .filter(|r| request.gate(&r.gate_id).is_none())
                .cloned(),
        );
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            correlation_id: request.correlation_id,
            request: request.clone(),
            results: ordered,
            decision: PromotionDecision {
                report_hash: None,
                ..decision.clone()
            },
        }
    }

    /// Canonical bytes and their hex SHA-256.
    pub fn canonical(&self) -> Result<(Vec<u8>, String), serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        let hash = hex::encode(Sha256::digest(&bytes));
        Ok((bytes, hash))
    }
}

impl ReportArtifact {
    /// Recomputes the body hash and compares it with the manifest.
    ///
    /// Returns `Ok(true)` when intact, `Ok(false)` when tampered.
    pub fn verify(&self) -> Result<bool, serde_json::Error> {
        let (_, hash) = self.body.canonical()?;
        Ok(self.manifest.algorithm == "sha256" && hash == self.manifest.body_sha256)
    }
}

/// Serialises evaluations into artefacts and hands them to a sink.
#[derive(Debug, Clone)]
pub struct ReportExporter<S> {
    sink: S,
}

impl<S: ReportSink> ReportExporter<S> {
    /// Creates an exporter writing to `sink`.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Builds, hashes, and persists the report.
    ///
    /// The artefact name is `<decision timestamp>-<candidate>.json`. Sink
    /// failures are returned as [`ExportError::Io`].
    #[instrument(skip_all, fields(correlation_id = %request.correlation_id, candidate = %request.candidate))]
    pub fn export(
        &self,
        decision: PromotionDecision,
        results: &BTreeMap<GateId, GateResult>,
        request: &PromotionRequest,
    ) -> Result<ExportedReport, ExportError> {
        let body = ReportBody::new(&decision, results, request);
        let (_, hash) = body.canonical()?;
        let artifact = ReportArtifact {
            manifest: ReportManifest {
                algorithm: "sha256".to_string(),
                body_sha256: hash.clone(),
            },
            body,
        };
        let contents = serde_json::to_vec_pretty(&artifact)?;
        let name = format!(
            "{}-{}.json",
            decision.decided_at.file_stamp(),
            file_safe(request.candidate.as_str())
        );
        let location = self.sink.persist(&name, &contents)?;
        info!(location = %location.display(), report_hash = %hash, "report exported");
        Ok(ExportedReport {
            location,
            decision: decision.with_report_hash(hash.clone()),
            hash,
        })
    }
}

/// Replaces characters that are unsafe in file names (e.g. `/` in tags).
fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
