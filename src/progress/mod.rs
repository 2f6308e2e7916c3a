//! Progress writer/reader (C1): mtime-based liveness probe primitive used by
//! every long-running loop (delayed-job monitor, backend listener watch
//! loops, operator message worker) to signal forward progress to an external
//! liveness check.
//!
//! Grounded on the teacher's health-check touch-file pattern; generalized
//! here into a reusable writer/reader pair plus the multi-file variant spec
//! §4.1 requires.

pub mod tracker;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::errors::{ErrorKind, OsmoError, OsmoResult};

/// Touches a file's mtime on every call to `touch`, signaling forward
/// progress to whatever process reads it as a liveness probe.
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProgressWriter { path: path.into() }
    }

    /// Creates the file if absent and updates its mtime to now.
    pub fn touch(&self) -> OsmoResult<()> {
        if !self.path.exists() {
            File::create(&self.path)
                .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to create progress file", err))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to open progress file", err))?;
        file.set_modified(SystemTime::now())
            .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to touch progress file", err))?;
        Ok(())
    }
}

fn mtime(path: &Path) -> OsmoResult<SystemTime> {
    let metadata = fs::metadata(path)
        .map_err(|err| OsmoError::with_source(ErrorKind::Server, "failed to stat progress file", err))?;
    metadata
        .modified()
        .map_err(|err| OsmoError::with_source(ErrorKind::Server, "progress file has no mtime", err))
}

/// Reports a single progress file healthy iff `now - mtime < interval`.
pub struct ProgressReader {
    path: PathBuf,
    interval: Duration,
}

impl ProgressReader {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        ProgressReader { path: path.into(), interval }
    }

    pub fn is_healthy(&self) -> bool {
        let Ok(modified) = mtime(&self.path) else { return false };
        match SystemTime::now().duration_since(modified) {
            Ok(elapsed) => elapsed < self.interval,
            Err(_) => true,
        }
    }
}

/// Multi-file variant: parses a colon-separated `file:interval_ms[,file:interval_ms...]`
/// list and reports unhealthy if any referenced file is stale.
pub struct MultiProgressReader {
    readers: Vec<ProgressReader>,
}

impl MultiProgressReader {
    pub fn parse(spec: &str) -> OsmoResult<Self> {
        let mut readers = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (path, interval_ms) = entry
                .rsplit_once(':')
                .ok_or_else(|| OsmoError::new(ErrorKind::User, format!("malformed progress spec entry: `{entry}`")))?;
            let interval_ms: u64 = interval_ms
                .parse()
                .map_err(|_| OsmoError::new(ErrorKind::User, format!("non-numeric interval in: `{entry}`")))?;
            readers.push(ProgressReader::new(path, Duration::from_millis(interval_ms)));
        }
        Ok(MultiProgressReader { readers })
    }

    pub fn is_healthy(&self) -> bool {
        self.readers.iter().all(|reader| reader.is_healthy())
    }
}
