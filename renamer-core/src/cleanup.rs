use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Every path a session has created, shared between the pipeline task and the
/// session store so a superseding intake can clean up a stale session.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLedger {
    inner: Arc<Mutex<LedgerEntries>>,
}

#[derive(Debug, Clone, Default)]
struct LedgerEntries {
    files: BTreeSet<PathBuf>,
    exclusive_dirs: BTreeSet<PathBuf>,
    shared_dirs: BTreeSet<PathBuf>,
}

impl ArtifactLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file(&self, path: impl Into<PathBuf>) {
        self.entries().files.insert(path.into());
    }

    /// A directory owned by exactly one session; everything below it is removed.
    pub fn record_exclusive_dir(&self, path: impl Into<PathBuf>) {
        self.entries().exclusive_dirs.insert(path.into());
    }

    /// A directory that may be shared with other sessions of the same owner;
    /// removed only when empty.
    pub fn record_shared_dir(&self, path: impl Into<PathBuf>) {
        self.entries().shared_dirs.insert(path.into());
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.entries().files.iter().cloned().collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        let entries = self.entries();
        entries.files.contains(path)
            || entries.exclusive_dirs.contains(path)
            || entries.shared_dirs.contains(path)
    }

    fn snapshot(&self) -> LedgerEntries {
        self.entries().clone()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LedgerEntries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed_files: Vec<PathBuf>,
    pub removed_dirs: Vec<PathBuf>,
    pub kept_dirs: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupCoordinator;

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Removes every recorded artifact. Never fails: problems end up in the
    /// report and in the log.
    pub async fn run(&self, ledger: &ArtifactLedger) -> CleanupReport {
        let entries = ledger.snapshot();
        match tokio::task::spawn_blocking(move || sweep(&entries)).await {
            Ok(report) => {
                for (path, error) in &report.failures {
                    warn!(path = %path.display(), error = %error, "cleanup could not remove artifact");
                }
                report
            }
            Err(err) => {
                warn!(error = %err, "cleanup task aborted");
                CleanupReport {
                    failures: vec![(PathBuf::new(), err.to_string())],
                    ..CleanupReport::default()
                }
            }
        }
    }
}

fn sweep(entries: &LedgerEntries) -> CleanupReport {
    let mut report = CleanupReport::default();

    for file in &entries.files {
        match std::fs::remove_file(file) {
            Ok(()) => report.removed_files.push(file.clone()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => report.failures.push((file.clone(), err.to_string())),
        }
    }

    for root in &entries.exclusive_dirs {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    report.failures.push((path, err.to_string()));
                    continue;
                }
            };
            let path = entry.path();
            let outcome = if entry.file_type().is_dir() {
                std::fs::remove_dir(path)
            } else {
                std::fs::remove_file(path)
            };
            match outcome {
                Ok(()) if entry.file_type().is_dir() => report.removed_dirs.push(path.to_path_buf()),
                Ok(()) => report.removed_files.push(path.to_path_buf()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => report.failures.push((path.to_path_buf(), err.to_string())),
            }
        }
    }

    let mut shared: Vec<&PathBuf> = entries.shared_dirs.iter().collect();
    shared.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
    for dir in shared {
        match is_empty_dir(dir) {
            Ok(true) => match std::fs::remove_dir(dir) {
                Ok(()) => report.removed_dirs.push(dir.clone()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => report.failures.push((dir.clone(), err.to_string())),
            },
            Ok(false) => {
                debug!(path = %dir.display(), "shared directory still in use");
                report.kept_dirs.push(dir.clone());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => report.failures.push((dir.clone(), err.to_string())),
        }
    }

    report
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}
