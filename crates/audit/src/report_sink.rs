//! Report directory sink.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use gates::ReportSink;
use tracing::debug;

use crate::write_new;

/// Writes report artefacts into a directory, never replacing an existing file.
///
/// If the requested name is taken (two evaluations of one candidate in the
/// same millisecond), a numeric suffix is appended: `name-1.json`, `name-2.json`.
#[derive(Debug, Clone)]
pub struct FsReportSink {
    root: PathBuf,
}

impl FsReportSink {
    /// Creates a sink writing under `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The report directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ReportSink for FsReportSink {
    fn persist(&self, name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let (stem, extension) = match name.rsplit_once('.') {
            Some((stem, extension)) => (stem, Some(extension)),
            None => (name, None),
        };
        for attempt in 0u32.. {
            let candidate = match (attempt, extension) {
                (0, _) => name.to_string(),
                (n, Some(extension)) => format!("{stem}-{n}.{extension}"),
                (n, None) => format!("{stem}-{n}"),
            };
            let path = self.root.join(candidate);
            match write_new(&path, contents) {
                Ok(()) => {
                    debug!(path = %path.display(), bytes = contents.len(), "report written");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free report name for '{name}'"),
        ))
    }
}
