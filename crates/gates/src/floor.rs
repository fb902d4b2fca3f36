//! The inherited floor: an append-only, version-sealed ledger of gate sets.
//!
//! Every sealed [`FloorSnapshot`] is an immutable value built from its
//! predecessor plus a validated delta. A later snapshot always contains every
//! gate of every earlier one, with an expected test count at least as large
//! and a blocking flag at least as strict.
//!
//! Sealing is the only write. It uses optimistic concurrency: the caller
//! presents the [`SealToken`] of the head it evaluated against, and the seal
//! is refused if another evaluation sealed first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::{
    FloorError, FloorStoreError, FloorViolation, GateDefinition, GateId, GateResult,
    ReleaseVersion,
};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Hex-encoded SHA-256 over a snapshot's predecessor token, version, and gates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealToken(String);

impl SealToken {
    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Printable form of an optional token; `"none"` stands for an empty ledger.
    pub fn label(token: Option<&SealToken>) -> String {
        token.map_or_else(|| "none".to_string(), |t| t.to_string())
    }

    fn compute(
        previous: Option<&SealToken>,
        version: &ReleaseVersion,
        gates: &[GateDefinition],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(previous.map(SealToken::as_str).unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(version.to_string().as_bytes());
        for gate in gates {
            hasher.update([0u8]);
            hasher.update(gate.id.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(gate.suite.as_bytes());
            hasher.update([0u8]);
            hasher.update(gate.expected_tests.to_be_bytes());
            hasher.update([u8::from(gate.blocking)]);
            hasher.update(gate.origin_version.to_string().as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

impl std::fmt::Display for SealToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable, sealed gate set for one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorSnapshot {
    /// Version this floor was sealed for.
    pub version: ReleaseVersion,
    /// Gates in floor order: inherited first, then the delta sealed with this version.
    pub gates: Vec<GateDefinition>,
    /// Sum of expected test counts.
    pub total_tests: u64,
    /// Always `true` for snapshots produced by [`FloorTracker::seal`].
    pub sealed: bool,
    /// Token of the predecessor snapshot, if any.
    pub previous: Option<SealToken>,
    /// This snapshot's seal token.
    pub seal_token: SealToken,
}

impl FloorSnapshot {
    fn sealed(
        version: ReleaseVersion,
        gates: Vec<GateDefinition>,
        previous: Option<SealToken>,
    ) -> Self {
        let seal_token = SealToken::compute(previous.as_ref(), &version, &gates);
        Self {
            total_tests: gates.iter().map(|g| u64::from(g.expected_tests)).sum(),
            version,
            gates,
            sealed: true,
            previous,
            seal_token,
        }
    }

    /// Ids in floor order.
    pub fn gate_ids(&self) -> impl Iterator<Item = &GateId> {
        self.gates.iter().map(|g| &g.id)
    }

    /// Looks up an inherited gate.
    pub fn gate(&self, id: &GateId) -> Option<&GateDefinition> {
        self.gates.iter().find(|g| &g.id == id)
    }

    /// Recomputes the seal token and checks the snapshot's own invariants.
    pub fn verify(&self) -> Result<(), FloorError> {
        let corrupt = |message: &str| FloorError::CorruptLedger {
            version: self.version.clone(),
            message: message.to_string(),
        };
        if !self.sealed {
            return Err(corrupt("snapshot is not sealed"));
        }
        let total: u64 = self.gates.iter().map(|g| u64::from(g.expected_tests)).sum();
        if total != self.total_tests {
            return Err(corrupt("total test count does not match gates"));
        }
        let ids: BTreeSet<&GateId> = self.gate_ids().collect();
        if ids.len() != self.gates.len() {
            return Err(corrupt("duplicate gate id"));
        }
        let expected = SealToken::compute(self.previous.as_ref(), &self.version, &self.gates);
        if expected != self.seal_token {
            return Err(corrupt("seal token mismatch"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delta and combined set
// ---------------------------------------------------------------------------

/// Changes a version declares against the sealed floor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloorDelta {
    /// New gates, and redeclarations of inherited ones.
    pub definitions: Vec<GateDefinition>,
    /// Inherited ids explicitly retired. Any entry here is a regression.
    pub retired: Vec<GateId>,
}

/// The gate set an evaluation runs: sealed floor plus validated delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedGateSet {
    /// All gates, inherited first in floor order, then new gates in delta order.
    pub gates: Vec<GateDefinition>,
    /// Ids carried over from the prior floor.
    pub inherited: BTreeSet<GateId>,
}

impl CombinedGateSet {
    /// Ids of gates that are new in this delta.
    pub fn delta_ids(&self) -> impl Iterator<Item = &GateId> {
        self.gates
            .iter()
            .map(|g| &g.id)
            .filter(|id| !self.inherited.contains(*id))
    }

    /// Highest origin version across the set.
    pub fn highest_origin(&self) -> Option<&ReleaseVersion> {
        self.gates.iter().map(|g| &g.origin_version).max()
    }
}

/// Outcome of checking inherited blocking gates against an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloorCheck {
    /// Inherited blocking gates that did not pass.
    pub violations: Vec<FloorViolation>,
}

impl FloorCheck {
    /// Returns `true` if no inherited blocking gate regressed.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Persistence port
// ---------------------------------------------------------------------------

/// Durable storage for sealed snapshots.
///
/// Implementations must never overwrite or delete a stored snapshot. The
/// store is the arbiter between writers that do not share a
/// [`FloorTracker`]: `append` must refuse, atomically with respect to every
/// other writer, a snapshot whose `previous` token is not the stored head.
pub trait FloorStore: Send + Sync {
    /// Loads every stored snapshot, oldest version first.
    fn load(&self) -> std::io::Result<Vec<FloorSnapshot>>;

    /// Stores a newly sealed snapshot on top of the stored head and returns
    /// its location. Fails with [`FloorStoreError::HeadMoved`] if the head is
    /// not the snapshot's predecessor.
    fn append(&self, snapshot: &FloorSnapshot) -> Result<std::path::PathBuf, FloorStoreError>;
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owns the sealed floor ledger.
///
/// Readers take cheap `Arc` clones of snapshots. Writing is split in two so
/// a snapshot can be persisted before it becomes visible:
/// [`FloorTracker::prepare_seal`] validates and builds it against the head,
/// and [`FloorTracker::commit`] appends it under the ledger lock only if its
/// predecessor is still the head. [`FloorTracker::seal`] does both.
#[derive(Debug, Default)]
pub struct FloorTracker {
    ledger: RwLock<Vec<Arc<FloorSnapshot>>>,
}

impl FloorTracker {
    /// Creates a tracker with an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a tracker from persisted snapshots in version order.
    ///
    /// Every snapshot is re-verified, must chain to its predecessor's token,
    /// and must be a non-shrinking superset of it.
    pub fn from_snapshots(snapshots: Vec<FloorSnapshot>) -> Result<Self, FloorError> {
        let mut ledger: Vec<Arc<FloorSnapshot>> = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            snapshot.verify()?;
            let prior = ledger.last().map(Arc::as_ref);
            let prior_token = prior.map(|p| &p.seal_token);
            if snapshot.previous.as_ref() != prior_token {
                return Err(FloorError::CorruptLedger {
                    version: snapshot.version.clone(),
                    message: "snapshot does not chain to its predecessor".into(),
                });
            }
            if let Some(prior) = prior {
                if snapshot.version <= prior.version {
                    return Err(FloorError::VersionNotAfterHead {
                        version: snapshot.version.clone(),
                        head: prior.version.clone(),
                    });
                }
                let violations = append_only_violations(prior, &snapshot.gates, &[], Declared::Complete);
                if !violations.is_empty() {
                    return Err(FloorError::Regression { violations });
                }
            }
            ledger.push(Arc::new(snapshot));
        }
        Ok(Self {
            ledger: RwLock::new(ledger),
        })
    }

    /// The most recently sealed snapshot.
    pub fn head(&self) -> Option<Arc<FloorSnapshot>> {
        self.read().last().cloned()
    }

    /// All sealed snapshots, oldest first.
    pub fn history(&self) -> Vec<Arc<FloorSnapshot>> {
        self.read().clone()
    }

    /// Unions the prior floor with a delta.
    ///
    /// Fails with [`FloorError::Regression`] listing every inherited gate the
    /// delta removes, shrinks, or downgrades from blocking.
    pub fn combined_gate_set(
        prior: Option<&FloorSnapshot>,
        delta: &FloorDelta,
    ) -> Result<CombinedGateSet, FloorError> {
        let Some(prior) = prior else {
            return Ok(CombinedGateSet {
                gates: delta.definitions.clone(),
                inherited: BTreeSet::new(),
            });
        };

        let violations = append_only_violations(prior, &delta.definitions, &delta.retired, Declared::Delta);
        if !violations.is_empty() {
            return Err(FloorError::Regression { violations });
        }

        let redeclared: BTreeMap<&GateId, &GateDefinition> =
            delta.definitions.iter().map(|d| (&d.id, d)).collect();
        let mut gates: Vec<GateDefinition> = prior
            .gates
            .iter()
            .map(|g| (*redeclared.get(&g.id).unwrap_or(&g)).clone())
            .collect();
        let inherited: BTreeSet<GateId> = prior.gate_ids().cloned().collect();
        gates.extend(
            delta
                .definitions
                .iter()
                .filter(|d| !inherited.contains(&d.id))
                .cloned(),
        );
        Ok(CombinedGateSet { gates, inherited })
    }

    /// Reports inherited blocking gates that did not pass.
    ///
    /// An inherited gate without a result counts as not passed.
    pub fn check_inherited(
        prior: Option<&FloorSnapshot>,
        results: &BTreeMap<GateId, GateResult>,
    ) -> FloorCheck {
        let violations = prior
            .map(|p| {
                p.gates
                    .iter()
                    .filter(|g| g.blocking)
                    .filter(|g| !results.get(&g.id).is_some_and(|r| r.status.is_passed()))
                    .map(|g| FloorViolation::NotPassed { gate: g.id.clone() })
                    .collect()
            })
            .unwrap_or_default();
        FloorCheck { violations }
    }

    /// Seals `combined` as the floor for `version` and commits it.
    ///
    /// Equivalent to [`FloorTracker::prepare_seal`] followed by
    /// [`FloorTracker::commit`].
    pub fn seal(
        &self,
        expected_head: Option<&SealToken>,
        version: ReleaseVersion,
        combined: &CombinedGateSet,
        results: &BTreeMap<GateId, GateResult>,
    ) -> Result<Arc<FloorSnapshot>, FloorError> {
        let snapshot = self.prepare_seal(expected_head, version, combined, results)?;
        self.commit(snapshot)
    }

    /// Builds the snapshot sealing `combined` as the floor for `version`
    /// without adding it to the ledger.
    ///
    /// Requires that `expected_head` is the current head's token, that
    /// `version` is newer than the head, that `combined` does not weaken the
    /// head, and that every inherited gate passed in `results`, blocking or
    /// not. Sealing is judged independently of the promotion decision.
    #[instrument(skip_all, fields(version = %version))]
    pub fn prepare_seal(
        &self,
        expected_head: Option<&SealToken>,
        version: ReleaseVersion,
        combined: &CombinedGateSet,
        results: &BTreeMap<GateId, GateResult>,
    ) -> Result<FloorSnapshot, FloorError> {
        let head = self.head();
        let head_token = head.as_ref().map(|h| &h.seal_token);
        if head_token != expected_head {
            warn!("seal refused: floor head moved");
            return Err(FloorError::SealConflict {
                expected: SealToken::label(expected_head),
                actual: SealToken::label(head_token),
            });
        }

        if let Some(head) = head.as_deref() {
            if version <= head.version {
                return Err(FloorError::VersionNotAfterHead {
                    version,
                    head: head.version.clone(),
                });
            }
            let violations = append_only_violations(head, &combined.gates, &[], Declared::Complete);
            if !violations.is_empty() {
                return Err(FloorError::Regression { violations });
            }
            let not_passed: Vec<FloorViolation> = head
                .gates
                .iter()
                .filter(|g| !results.get(&g.id).is_some_and(|r| r.status.is_passed()))
                .map(|g| FloorViolation::NotPassed { gate: g.id.clone() })
                .collect();
            if !not_passed.is_empty() {
                warn!(count = not_passed.len(), "seal refused: inherited gates did not pass");
                return Err(FloorError::InheritedGateNotPassed {
                    version,
                    violations: not_passed,
                });
            }
        }

        Ok(FloorSnapshot::sealed(
            version,
            combined.gates.clone(),
            head.map(|h| h.seal_token.clone()),
        ))
    }

    /// Appends a prepared snapshot if it still chains to the head.
    ///
    /// Fails with [`FloorError::SealConflict`] if another seal was committed
    /// since the snapshot was prepared; the ledger is unchanged.
    #[instrument(skip_all, fields(version = %snapshot.version))]
    pub fn commit(&self, snapshot: FloorSnapshot) -> Result<Arc<FloorSnapshot>, FloorError> {
        let mut ledger = self
            .ledger
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let head_token = ledger.last().map(|h| &h.seal_token);
        if head_token != snapshot.previous.as_ref() {
            warn!("commit refused: floor head moved");
            return Err(FloorError::SealConflict {
                expected: SealToken::label(snapshot.previous.as_ref()),
                actual: SealToken::label(head_token),
            });
        }

        let snapshot = Arc::new(snapshot);
        info!(
            gates = snapshot.gates.len(),
            total_tests = snapshot.total_tests,
            seal_token = %snapshot.seal_token,
            "floor sealed"
        );
        ledger.push(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<FloorSnapshot>>> {
        self.ledger
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// How to read the declared gates when checking them against a prior floor.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Declared {
    /// A delta: inherited gates it omits are carried over unchanged.
    Delta,
    /// A complete gate set: inherited gates it omits were removed.
    Complete,
}

/// Every way `declared` (plus `retired`) weakens `prior`, in floor order.
fn append_only_violations(
    prior: &FloorSnapshot,
    declared: &[GateDefinition],
    retired: &[GateId],
    mode: Declared,
) -> Vec<FloorViolation> {
    let by_id: BTreeMap<&GateId, &GateDefinition> = declared.iter().map(|d| (&d.id, d)).collect();
    let mut violations = Vec::new();
    for inherited in &prior.gates {
        if retired.contains(&inherited.id) {
            violations.push(FloorViolation::Removed {
                gate: inherited.id.clone(),
            });
            continue;
        }
        match by_id.get(&inherited.id) {
            Some(d) => {
                if d.expected_tests < inherited.expected_tests {
                    violations.push(FloorViolation::Shrunk {
                        gate: inherited.id.clone(),
                        inherited: inherited.expected_tests,
                        declared: d.expected_tests,
                    });
                }
                if inherited.blocking && !d.blocking {
                    violations.push(FloorViolation::Downgraded {
                        gate: inherited.id.clone(),
                    });
                }
            }
            None if mode == Declared::Complete => violations.push(FloorViolation::Removed {
                gate: inherited.id.clone(),
            }),
            None => {}
        }
    }
    violations
}
