//! One-file-per-version floor ledger.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gates::{FloorSnapshot, FloorStore, FloorStoreError, SealToken};
use tracing::{debug, info, warn};

use crate::write_new;

/// Stores each sealed snapshot as `<dir>/<version>.json`.
///
/// Files are created with create-new semantics, so a sealed version can be
/// written once only. [`FsFloorStore::load`] returns snapshots sorted by
/// version; the last one is the ledger head.
///
/// Appends from separate processes are serialised by a claim file,
/// `<dir>/claims/<predecessor token>` (`genesis` for the first seal), created
/// with create-new semantics before the snapshot is written. Only one writer
/// can claim the successor of a given head. A claim whose snapshot write
/// fails is released; a claim left behind by a crashed writer blocks further
/// seals on that head until it is removed by hand.
#[derive(Debug, Clone)]
pub struct FsFloorStore {
    dir: PathBuf,
}

impl FsFloorStore {
    /// Creates a store over `dir`. A missing directory is an empty ledger.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The ledger directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn claims_dir(&self) -> PathBuf {
        self.dir.join("claims")
    }
}

impl FloorStore for FsFloorStore {
    fn load(&self) -> std::io::Result<Vec<FloorSnapshot>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let snapshot: FloorSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
                std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{} is not a floor snapshot: {e}", path.display()),
                )
            })?;
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if stem != snapshot.version.to_string() {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "{} holds the snapshot for {}",
                        path.display(),
                        snapshot.version
                    ),
                ));
            }
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.version.cmp(&b.version));
        debug!(dir = %self.dir.display(), count = snapshots.len(), "floor ledger loaded");
        Ok(snapshots)
    }

    fn append(&self, snapshot: &FloorSnapshot) -> Result<PathBuf, FloorStoreError> {
        std::fs::create_dir_all(self.claims_dir())?;
        let expected = SealToken::label(snapshot.previous.as_ref());

        let head = self.load()?.pop();
        let head_token = head.as_ref().map(|h| &h.seal_token);
        if head_token != snapshot.previous.as_ref() {
            warn!(version = %snapshot.version, "stored floor head moved");
            return Err(FloorStoreError::HeadMoved {
                expected,
                actual: SealToken::label(head_token),
            });
        }

        let contents = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::from)?;
        let claim = self
            .claims_dir()
            .join(snapshot.previous.as_ref().map_or("genesis", SealToken::as_str));
        match write_new(&claim, snapshot.version.to_string().as_bytes()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let claimed_by = std::fs::read_to_string(&claim).unwrap_or_default();
                warn!(version = %snapshot.version, claimed_by = %claimed_by.trim(), "successor already claimed");
                return Err(FloorStoreError::HeadMoved {
                    expected,
                    actual: format!("successor {} claimed", claimed_by.trim()),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let path = self.dir.join(format!("{}.json", snapshot.version));
        if let Err(e) = write_new(&path, &contents) {
            if let Err(release) = std::fs::remove_file(&claim) {
                warn!(claim = %claim.display(), error = %release, "failed to release claim");
            }
            return Err(e.into());
        }
        info!(path = %path.display(), version = %snapshot.version, "floor snapshot stored");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use gates::{
        CheckOutcome, CorrelationId, FloorDelta, FloorTracker, GateDefinition, GateId, GateResult,
        ReleaseVersion,
    };

    use super::*;

    fn gate(id: &str, origin: ReleaseVersion) -> GateDefinition {
        GateDefinition {
            id: GateId::new(id).unwrap(),
            suite: format!("suites/{id}"),
            expected_tests: 4,
            blocking: true,
            origin_version: origin,
        }
    }

    /// Seals `versions` in order, each adding one gate, and returns the snapshots.
    fn sealed_chain(versions: &[ReleaseVersion]) -> Vec<Arc<FloorSnapshot>> {
        let tracker = FloorTracker::new();
        for (i, version) in versions.iter().enumerate() {
            let head = tracker.head();
            let delta = FloorDelta {
                definitions: vec![gate(&format!("gate-{i}"), version.clone())],
                retired: Vec::new(),
            };
            let combined = FloorTracker::combined_gate_set(head.as_deref(), &delta).unwrap();
            let results = head.as_deref().map(passing).unwrap_or_default();
            tracker
                .seal(
                    head.as_ref().map(|h| &h.seal_token),
                    version.clone(),
                    &combined,
                    &results,
                )
                .unwrap();
        }
        tracker.history()
    }

    /// A passing result for every gate of `head`.
    fn passing(head: &FloorSnapshot) -> BTreeMap<GateId, GateResult> {
        let correlation_id = CorrelationId::new_random();
        head.gates
            .iter()
            .map(|g| {
                let outcome = CheckOutcome {
                    passed: true,
                    tests_run: g.expected_tests,
                    tests_passed: g.expected_tests,
                    duration_ms: 1,
                    detail: String::new(),
                };
                (g.id.clone(), GateResult::from_outcome(g, outcome, correlation_id))
            })
            .collect()
    }

    #[test]
    fn missing_directory_is_an_empty_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path().join("floor"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn loads_snapshots_in_version_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path());
        let chain = sealed_chain(&[
            ReleaseVersion::new(1, 2, 0),
            ReleaseVersion::new(1, 10, 0),
        ]);
        // "1.10.0" sorts before "1.2.0" lexically.
        store.append(&chain[0]).unwrap();
        store.append(&chain[1]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].version, ReleaseVersion::new(1, 2, 0));
        assert_eq!(loaded[1].version, ReleaseVersion::new(1, 10, 0));
        assert!(FloorTracker::from_snapshots(loaded).is_ok());
    }

    #[test]
    fn a_sealed_version_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path());
        let chain = sealed_chain(&[ReleaseVersion::new(1, 0, 0)]);
        store.append(&chain[0]).unwrap();
        let err = store.append(&chain[0]).unwrap_err();
        assert!(matches!(err, FloorStoreError::HeadMoved { .. }));
        assert_eq!(store.load().unwrap().len(), 1);
    }

    /// Restores a tracker from `store` and seals one more version on its head.
    fn seal_next(store: &FsFloorStore, version: ReleaseVersion) -> FloorSnapshot {
        let tracker = FloorTracker::from_snapshots(store.load().unwrap()).unwrap();
        let head = tracker.head().unwrap();
        let delta = FloorDelta {
            definitions: vec![gate(&format!("gate-{version}"), version.clone())],
            retired: Vec::new(),
        };
        let combined = FloorTracker::combined_gate_set(Some(&*head), &delta).unwrap();
        tracker
            .prepare_seal(Some(&head.seal_token), version, &combined, &passing(&head))
            .unwrap()
    }

    #[test]
    fn writers_sealing_the_same_head_do_not_fork_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path());
        let base = sealed_chain(&[ReleaseVersion::new(1, 0, 0)]);
        store.append(&base[0]).unwrap();

        // Both writers restored the ledger before either sealed.
        let first = seal_next(&store, ReleaseVersion::new(1, 1, 0));
        let second = seal_next(&store, ReleaseVersion::new(1, 2, 0));
        assert_eq!(first.previous, second.previous);

        store.append(&first).unwrap();
        let err = store.append(&second).unwrap_err();
        match err {
            FloorStoreError::HeadMoved { expected, actual } => {
                assert_eq!(expected, base[0].seal_token.to_string());
                assert_eq!(actual, first.seal_token.to_string());
            }
            other => panic!("expected HeadMoved, got {other:?}"),
        }

        let reloaded = FloorTracker::from_snapshots(store.load().unwrap()).unwrap();
        assert_eq!(reloaded.head().unwrap().version, ReleaseVersion::new(1, 1, 0));
        assert!(!dir.path().join("1.2.0.json").exists());
    }

    #[test]
    fn a_claimed_successor_blocks_a_racing_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path());
        let base = sealed_chain(&[ReleaseVersion::new(1, 0, 0)]);
        store.append(&base[0]).unwrap();
        let late = seal_next(&store, ReleaseVersion::new(1, 2, 0));

        // Another writer has claimed the slot but not yet written its snapshot.
        std::fs::write(dir.path().join("claims").join(base[0].seal_token.as_str()), "1.1.0").unwrap();

        let err = store.append(&late).unwrap_err();
        assert!(
            matches!(&err, FloorStoreError::HeadMoved { actual, .. } if actual == "successor 1.1.0 claimed"),
            "{err:?}"
        );
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn a_failed_write_releases_its_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFloorStore::new(dir.path());
        let base = sealed_chain(&[ReleaseVersion::new(1, 0, 0)]);
        store.append(&base[0]).unwrap();
        let next = seal_next(&store, ReleaseVersion::new(1, 1, 0));

        // A directory squatting on the snapshot's file name makes the write fail.
        std::fs::create_dir(dir.path().join("1.1.0.json")).unwrap();
        let err = store.append(&next).unwrap_err();
        assert!(matches!(err, FloorStoreError::Io(_)));
        assert!(!dir.path().join("claims").join(base[0].seal_token.as_str()).exists());

        std::fs::remove_dir(dir.path().join("1.1.0.json")).unwrap();
        store.append(&next).unwrap();
    }

    #[test]
    fn foreign_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.0.0.json"), b"[]").unwrap();
        let err = FsFloorStore::new(dir.path()).load().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
