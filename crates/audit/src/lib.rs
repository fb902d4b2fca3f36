//! Filesystem adapters for the promotion gate's durable records.
//!
//! Implements the persistence ports defined in the [`gates`] crate:
//!
//! - [`FsReportSink`] ([`gates::ReportSink`]) writes one report artefact per
//!   evaluation into a report directory.
//! - [`FsFloorStore`] ([`gates::FloorStore`]) keeps one JSON file per sealed
//!   floor snapshot, named `<version>.json`, and refuses snapshots that do not
//!   chain to the stored head.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules. Both
//! adapters only ever create new files; nothing here overwrites or deletes a
//! record once written. The only file ever removed is a floor claim marker
//! whose snapshot failed to write.

mod floor_store;
mod report_sink;

pub use floor_store::FsFloorStore;
pub use report_sink::FsReportSink;

use std::io::Write;
use std::path::Path;

/// Writes `contents` to a file that must not already exist, then syncs it.
fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
