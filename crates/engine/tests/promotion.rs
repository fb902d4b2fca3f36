//! End-to-end promotion evaluations against in-memory sinks and collaborators.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use engine::{
    CancellationHandle, CancellationSignal, CollaboratorError, EngineError, EngineSettings,
    GateCollaborator, GateContext, PromotionEngine, PromotionInputs,
};
use gates::{
    BranchName, CandidateId, CheckOutcome, Criterion, CriterionName, CorrelationId, ErrorKind,
    ExplicitCriteria, FloorDelta, FloorError, FloorSnapshot, FloorStore, FloorStoreError,
    FloorTracker, FloorViolation, GateDefinition, GateId, GateStatus, Points, RejectionReason,
    ReleaseVersion, ReportArtifact, ReportExporter, ReportSink, SealToken, Timestamp, Verdict,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemorySink {
    written: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    fn last(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap()
            .last()
            .map(|(_, bytes)| bytes.clone())
            .unwrap()
    }
}

impl ReportSink for MemorySink {
    fn persist(&self, name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        self.written
            .lock()
            .unwrap()
            .push((name.to_string(), contents.to_vec()));
        Ok(PathBuf::from(name))
    }
}

#[derive(Default)]
struct MemoryStore {
    snapshots: Mutex<Vec<FloorSnapshot>>,
}

impl FloorStore for MemoryStore {
    fn load(&self) -> std::io::Result<Vec<FloorSnapshot>> {
        Ok(self.snapshots.lock().unwrap().clone())
    }

    fn append(&self, snapshot: &FloorSnapshot) -> Result<PathBuf, FloorStoreError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let head = snapshots.last().map(|h| &h.seal_token);
        if head != snapshot.previous.as_ref() {
            return Err(FloorStoreError::HeadMoved {
                expected: SealToken::label(snapshot.previous.as_ref()),
                actual: SealToken::label(head),
            });
        }
        snapshots.push(snapshot.clone());
        Ok(PathBuf::from(format!("{}.json", snapshot.version)))
    }
}

/// A store whose disk is full.
struct FullDisk;

impl FloorStore for FullDisk {
    fn load(&self) -> std::io::Result<Vec<FloorSnapshot>> {
        Ok(Vec::new())
    }

    fn append(&self, _snapshot: &FloorSnapshot) -> Result<PathBuf, FloorStoreError> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Fail,
    Hang,
}

/// Passes every gate with its expected count unless told otherwise.
#[derive(Default)]
struct Fleet {
    overrides: BTreeMap<GateId, Behaviour>,
    calls: AtomicUsize,
}

impl Fleet {
    fn with(mut self, gate: &str, behaviour: Behaviour) -> Self {
        self.overrides.insert(id(gate), behaviour);
        self
    }
}

#[async_trait]
impl GateCollaborator for Fleet {
    async fn evaluate(&self, ctx: &GateContext) -> Result<CheckOutcome, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let expected = ctx.definition.expected_tests;
        match self.overrides.get(&ctx.definition.id) {
            None => Ok(CheckOutcome {
                passed: true,
                tests_run: expected,
                tests_passed: expected,
                duration_ms: 12,
                detail: "green".into(),
            }),
            Some(Behaviour::Fail) => Ok(CheckOutcome {
                passed: false,
                tests_run: expected,
                tests_passed: expected.saturating_sub(1),
                duration_ms: 12,
                detail: "one assertion failed".into(),
            }),
            Some(Behaviour::Hang) => {
                ctx.cancel.cancelled().await;
                Err(CollaboratorError::Fault {
                    message: "stopped".into(),
                })
            }
        }
    }
}

fn id(raw: &str) -> GateId {
    GateId::new(raw).unwrap()
}

fn gate(raw: &str, tests: u32, blocking: bool, origin: &str) -> GateDefinition {
    GateDefinition {
        id: id(raw),
        suite: format!("suites/{raw}"),
        expected_tests: tests,
        blocking,
        origin_version: ReleaseVersion::parse(origin).unwrap(),
    }
}

/// Six inherited gates carrying 77 tests, the last one non-blocking.
fn base_floor() -> Vec<GateDefinition> {
    vec![
        gate("regression-suite", 41, true, "1.0.0"),
        gate("health-supervisor", 9, true, "1.0.0"),
        gate("circuit-breakers", 8, true, "1.0.0"),
        gate("lock-verify", 6, true, "1.0.0"),
        gate("backup-restore", 7, true, "1.0.0"),
        gate("dead-letter-queue", 6, false, "1.0.0"),
    ]
}

/// Six gates new in 1.1.0.
fn next_delta() -> Vec<GateDefinition> {
    vec![
        gate("chaos-suite", 5, true, "1.1.0"),
        gate("fuzz-corpus", 4, true, "1.1.0"),
        gate("sbom-present", 1, true, "1.1.0"),
        gate("migration-dry-run", 3, true, "1.1.0"),
        gate("perf-budget", 2, true, "1.1.0"),
        gate("docs-links", 1, false, "1.1.0"),
    ]
}

fn settings(deadline: Duration) -> EngineSettings {
    EngineSettings {
        worker_slots: 4,
        gate_timeout: Duration::from_secs(5),
        evaluation_deadline: deadline,
        max_variance: Points::whole(5),
    }
}

fn inputs(candidate: &str, delta: Vec<GateDefinition>) -> PromotionInputs {
    PromotionInputs {
        candidate: CandidateId::new(candidate).unwrap(),
        target_branch: BranchName::new("release").unwrap(),
        evidence: "ci/run-1841".into(),
        delta: FloorDelta {
            definitions: delta,
            retired: Vec::new(),
        },
        criteria: ExplicitCriteria::default(),
        release_version: None,
        correlation_id: CorrelationId::new_random(),
        decided_at: None,
    }
}

fn engine(
    floor: Arc<FloorTracker>,
    sink: Arc<MemorySink>,
    fleet: Arc<Fleet>,
    deadline: Duration,
) -> PromotionEngine<Arc<MemorySink>> {
    PromotionEngine::new(
        settings(deadline),
        floor,
        Points::whole(500),
        ReportExporter::new(sink),
    )
    .with_default_collaborator(fleet)
}

/// A tracker whose head is the sealed 1.0.0 floor.
async fn sealed_base() -> Arc<FloorTracker> {
    let floor = Arc::new(FloorTracker::new());
    let outcome = engine(
        Arc::clone(&floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .evaluate(inputs("v1.0.0", base_floor()), &CancellationSignal::never())
    .await
    .unwrap();
    assert!(outcome.sealed.is_some());
    let head = floor.head().unwrap();
    assert_eq!(head.gates.len(), 6);
    assert_eq!(head.total_tests, 77);
    floor
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inherited_floor_and_green_delta_are_approved_and_sealed() {
    let floor = sealed_base().await;
    let store = Arc::new(MemoryStore::default());
    let outcome = engine(
        Arc::clone(&floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .with_floor_store(store.clone())
    .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
    .await
    .unwrap();

    assert_eq!(outcome.decision.verdict, Verdict::Approved);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.decision.variance, Points::ZERO);
    assert_eq!(outcome.results.len(), 12);

    let sealed = outcome.sealed.expect("approved evaluation seals");
    assert_eq!(sealed.version, ReleaseVersion::new(1, 1, 0));
    assert_eq!(sealed.gates.len(), 12);
    assert_eq!(sealed.total_tests, 77 + 16);
    assert_eq!(floor.head().unwrap().seal_token, sealed.seal_token);
    assert_eq!(store.load().unwrap().len(), 1);
}

#[tokio::test]
async fn failing_blocking_delta_gate_rejects_and_leaves_floor_unsealed() {
    let floor = sealed_base().await;
    let before = floor.head().unwrap();
    let fleet = Arc::new(Fleet::default().with("fuzz-corpus", Behaviour::Fail));
    let outcome = engine(
        Arc::clone(&floor),
        Arc::default(),
        fleet,
        Duration::from_secs(10),
    )
    .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
    .await
    .unwrap();

    assert_eq!(outcome.decision.verdict, Verdict::Rejected);
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.decision.failed_blocking_gates, vec![id("fuzz-corpus")]);
    assert_eq!(
        outcome.decision.reasons,
        vec![RejectionReason::BlockingGateFailed {
            gate: id("fuzz-corpus"),
            status: GateStatus::Failed,
            error_kind: Some(ErrorKind::GateFailure),
        }]
    );
    assert!(outcome.sealed.is_none());
    assert_eq!(floor.head().unwrap().seal_token, before.seal_token);
}

#[tokio::test]
async fn shrinking_an_inherited_gate_aborts_before_any_gate_runs() {
    let floor = sealed_base().await;
    let fleet = Arc::new(Fleet::default());
    let mut delta = next_delta();
    delta.push(gate("regression-suite", 40, true, "1.0.0"));

    let err = engine(floor, Arc::default(), fleet.clone(), Duration::from_secs(10))
        .evaluate(inputs("v1.1.0", delta), &CancellationSignal::never())
        .await
        .unwrap_err();

    match &err {
        EngineError::Floor(FloorError::Regression { violations }) => assert_eq!(
            violations,
            &vec![FloorViolation::Shrunk {
                gate: id("regression-suite"),
                inherited: 41,
                declared: 40,
            }]
        ),
        other => panic!("expected a floor regression, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 2);
    assert_eq!(fleet.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lone_non_blocking_failure_is_a_warning() {
    let floor = sealed_base().await;
    let fleet = Arc::new(Fleet::default().with("docs-links", Behaviour::Fail));
    let outcome = engine(floor, Arc::default(), fleet, Duration::from_secs(10))
        .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome.decision.verdict, Verdict::Approved);
    assert_eq!(outcome.decision.warnings.len(), 1);
    assert_eq!(outcome.decision.warnings[0].gate, id("docs-links"));
    assert!(outcome.sealed.is_some());
}

#[tokio::test]
async fn inherited_non_blocking_failure_approves_but_does_not_seal() {
    let floor = sealed_base().await;
    let fleet = Arc::new(Fleet::default().with("dead-letter-queue", Behaviour::Fail));
    let outcome = engine(
        Arc::clone(&floor),
        Arc::default(),
        fleet,
        Duration::from_secs(10),
    )
    .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
    .await
    .unwrap();

    assert_eq!(outcome.decision.verdict, Verdict::Approved);
    assert!(outcome.sealed.is_none());
    assert!(matches!(
        outcome.seal_error,
        Some(FloorError::InheritedGateNotPassed { .. })
    ));
    assert_eq!(floor.head().unwrap().version, ReleaseVersion::new(1, 0, 0));
}

#[tokio::test]
async fn unsatisfied_criterion_rejects_with_its_name() {
    let floor = Arc::new(FloorTracker::new());
    let mut request = inputs("v1.0.0", base_floor());
    request.criteria = ExplicitCriteria::new(vec![
        Criterion {
            name: CriterionName::new("clean-room-reproducibility").unwrap(),
            satisfied: true,
        },
        Criterion {
            name: CriterionName::new("release-bundle-hash").unwrap(),
            satisfied: false,
        },
    ])
    .unwrap();
    let outcome = engine(floor, Arc::default(), Arc::default(), Duration::from_secs(10))
        .evaluate(request, &CancellationSignal::never())
        .await
        .unwrap();

    assert_eq!(
        outcome.decision.reasons,
        vec![RejectionReason::CriterionUnsatisfied {
            criterion: CriterionName::new("release-bundle-hash").unwrap(),
        }]
    );
}

#[tokio::test]
async fn identical_inputs_give_identical_report_hashes() {
    let correlation_id = CorrelationId::from_uuid(uuid::Uuid::from_u128(0x5eed));
    let decided_at = Timestamp::from_utc(chrono::Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap());

    let mut hashes = Vec::new();
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let sink = Arc::new(MemorySink::default());
        let mut request = inputs("v1.0.0", base_floor());
        request.correlation_id = correlation_id;
        request.decided_at = Some(decided_at);
        let outcome = engine(
            Arc::new(FloorTracker::new()),
            sink.clone(),
            Arc::default(),
            Duration::from_secs(10),
        )
        .evaluate(request, &CancellationSignal::never())
        .await
        .unwrap();
        hashes.push(outcome.decision.report_hash.clone().unwrap());

        let artifact: ReportArtifact = serde_json::from_slice(&sink.last()).unwrap();
        assert!(artifact.verify().unwrap());
        bodies.push(artifact.body.canonical().unwrap().0);
    }
    assert_eq!(hashes[0], hashes[1]);
    assert_eq!(bodies[0], bodies[1]);
}

#[tokio::test]
async fn cancellation_rejects_with_a_distinct_reason() {
    let floor = sealed_base().await;
    let fleet = Arc::new(Fleet::default().with("chaos-suite", Behaviour::Hang));
    let (handle, signal) = CancellationHandle::new();
    let evaluation = {
        let floor = Arc::clone(&floor);
        tokio::spawn(async move {
            engine(floor, Arc::default(), fleet, Duration::from_secs(30))
                .evaluate(inputs("v1.1.0", next_delta()), &signal)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), evaluation)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.decision.verdict, Verdict::Rejected);
    assert_eq!(
        outcome.decision.reasons.first(),
        Some(&RejectionReason::EvaluationCancelled)
    );
    assert_eq!(
        outcome.decision.reasons[0].to_string(),
        "evaluation cancelled"
    );
    assert_eq!(
        outcome.results[&id("chaos-suite")].error_kind,
        Some(ErrorKind::Cancelled)
    );
    assert!(outcome.sealed.is_none());
    assert_eq!(floor.head().unwrap().version, ReleaseVersion::new(1, 0, 0));
}

#[tokio::test]
async fn outer_deadline_records_unresolved_gates_as_timed_out() {
    let floor = sealed_base().await;
    let fleet = Arc::new(Fleet::default().with("perf-budget", Behaviour::Hang));
    let outcome = engine(floor, Arc::default(), fleet, Duration::from_millis(200))
        .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
        .await
        .unwrap();

    let hung = &outcome.results[&id("perf-budget")];
    assert_eq!(hung.status, GateStatus::TimedOut);
    assert_eq!(hung.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(outcome.results.len(), 12);
    assert_eq!(
        outcome
            .results
            .values()
            .filter(|r| r.status == GateStatus::Passed)
            .count(),
        11
    );
    assert_eq!(outcome.decision.verdict, Verdict::Rejected);
    assert_eq!(outcome.decision.failed_blocking_gates, vec![id("perf-budget")]);
}

#[tokio::test]
async fn restored_ledger_continues_the_chain() {
    let store = Arc::new(MemoryStore::default());
    let first = engine(
        Arc::new(FloorTracker::new()),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .with_floor_store(store.clone())
    .evaluate(inputs("v1.0.0", base_floor()), &CancellationSignal::never())
    .await
    .unwrap();
    assert!(first.sealed.is_some());

    let restored = Arc::new(FloorTracker::from_snapshots(store.load().unwrap()).unwrap());
    let second = engine(restored, Arc::default(), Arc::default(), Duration::from_secs(10))
        .with_floor_store(store.clone())
        .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
        .await
        .unwrap();

    let sealed = second.sealed.unwrap();
    assert_eq!(sealed.previous.as_ref(), first.sealed.as_ref().map(|s| &s.seal_token));
    assert_eq!(store.load().unwrap().len(), 2);
}

#[tokio::test]
async fn evaluations_restored_from_the_same_head_seal_once() {
    let store = Arc::new(MemoryStore::default());
    engine(
        Arc::new(FloorTracker::new()),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .with_floor_store(store.clone())
    .evaluate(inputs("v1.0.0", base_floor()), &CancellationSignal::never())
    .await
    .unwrap();

    // Two independent runs restore the ledger before either seals.
    let first_floor = Arc::new(FloorTracker::from_snapshots(store.load().unwrap()).unwrap());
    let second_floor = Arc::new(FloorTracker::from_snapshots(store.load().unwrap()).unwrap());

    let first = engine(first_floor, Arc::default(), Arc::default(), Duration::from_secs(10))
        .with_floor_store(store.clone())
        .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
        .await
        .unwrap();
    assert_eq!(first.sealed.unwrap().version, ReleaseVersion::new(1, 1, 0));

    let mut late = inputs("v1.2.0", next_delta());
    late.release_version = Some(ReleaseVersion::new(1, 2, 0));
    let second = engine(
        Arc::clone(&second_floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .with_floor_store(store.clone())
    .evaluate(late, &CancellationSignal::never())
    .await
    .unwrap();

    assert_eq!(second.decision.verdict, Verdict::Approved);
    assert!(second.sealed.is_none());
    assert!(matches!(second.seal_error, Some(FloorError::SealConflict { .. })));
    assert_eq!(second_floor.head().unwrap().version, ReleaseVersion::new(1, 0, 0));

    let reloaded = FloorTracker::from_snapshots(store.load().unwrap()).unwrap();
    assert_eq!(reloaded.history().len(), 2);
    assert_eq!(reloaded.head().unwrap().version, ReleaseVersion::new(1, 1, 0));
}

#[tokio::test]
async fn concurrent_evaluations_on_one_engine_seal_once() {
    let floor = sealed_base().await;
    let engine = engine(
        Arc::clone(&floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    );
    let mut patch = inputs("v1.1.0", next_delta());
    patch.release_version = Some(ReleaseVersion::new(1, 1, 0));
    let mut minor = inputs("v1.2.0", next_delta());
    minor.release_version = Some(ReleaseVersion::new(1, 2, 0));

    let never = CancellationSignal::never();
    let (a, b) = tokio::join!(engine.evaluate(patch, &never), engine.evaluate(minor, &never));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert!(outcomes.iter().all(|o| o.decision.verdict == Verdict::Approved));
    assert_eq!(outcomes.iter().filter(|o| o.sealed.is_some()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o.seal_error, Some(FloorError::SealConflict { .. })))
            .count(),
        1
    );
    assert_eq!(floor.history().len(), 2);
}

#[tokio::test]
async fn store_failure_leaves_the_in_memory_floor_untouched() {
    let floor = sealed_base().await;
    let err = engine(
        Arc::clone(&floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .with_floor_store(Arc::new(FullDisk))
    .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
    .await
    .unwrap_err();

    assert!(matches!(
        &err,
        EngineError::FloorStore { version, .. } if *version == ReleaseVersion::new(1, 1, 0)
    ));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(floor.head().unwrap().version, ReleaseVersion::new(1, 0, 0));
    assert_eq!(floor.history().len(), 1);

    // The same floor can still be sealed once storage recovers.
    let retried = engine(
        Arc::clone(&floor),
        Arc::default(),
        Arc::default(),
        Duration::from_secs(10),
    )
    .evaluate(inputs("v1.1.0", next_delta()), &CancellationSignal::never())
    .await
    .unwrap();
    assert!(retried.sealed.is_some());
    assert_eq!(floor.head().unwrap().version, ReleaseVersion::new(1, 1, 0));
}
