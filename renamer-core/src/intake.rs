use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info};

use crate::cleanup::ArtifactLedger;
use crate::engine::{output_is_usable, MediaEngine, ProbeReport};
use crate::pipeline::{PipelineError, PipelineResult, ValidationError};
use crate::session::{AssetDescriptor, RemoteFile, RemoteRef};
use crate::transport::Transport;

/// Rejects an asset before any session exists for it.
pub fn validate_asset(asset: &AssetDescriptor, max_bytes: u64) -> Result<(), ValidationError> {
    if asset.size_bytes > max_bytes {
        return Err(ValidationError::AssetTooLarge {
            size: asset.size_bytes,
            limit: max_bytes,
        });
    }
    Ok(())
}

/// Strips anything that would let a declared name escape its directory.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `"{prefix} {stem} {suffix}{.ext}"` with empty parts left out.
pub fn decorate_file_name(name: &str, prefix: Option<&str>, suffix: Option<&str>) -> String {
    let name = sanitize_file_name(name);
    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| name.clone());
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let parts: Vec<&str> = [prefix, Some(stem.as_str()), suffix]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    sanitize_file_name(&format!("{}{extension}", parts.join(" ")))
}

pub const ASSET_DIR: &str = "asset";

pub struct IntakeStage {
    engine: Arc<dyn MediaEngine>,
    transport: Arc<dyn Transport>,
}

impl IntakeStage {
    pub fn new(engine: Arc<dyn MediaEngine>, transport: Arc<dyn Transport>) -> Self {
        Self { engine, transport }
    }

    /// Creates the owner directory (shared across the owner's sessions) and
    /// the session directory below it.
    pub async fn prepare_dirs(&self, work_dir: &Path, ledger: &ArtifactLedger) -> PipelineResult<()> {
        if let Some(owner_dir) = work_dir.parent() {
            ledger.record_shared_dir(owner_dir);
        }
        ledger.record_exclusive_dir(work_dir);
        // The cleanup of a superseded session may remove the owner directory
        // while it is still empty.
        let mut attempts = 0;
        loop {
            attempts += 1;
            match fs::create_dir_all(work_dir).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && attempts < 3 => {
                    debug!(path = %work_dir.display(), attempts, "owner directory vanished, retrying");
                }
                Err(err) => return Err(PipelineError::io(work_dir, err)),
            }
        }
    }

    /// Fetches the asset into `work_dir/asset/`, apart from every name the
    /// later stages generate in the session directory.
    pub async fn fetch_asset(
        &self,
        remote: &RemoteRef,
        work_dir: &Path,
        file_name: &str,
        ledger: &ArtifactLedger,
    ) -> PipelineResult<PathBuf> {
        let dir = work_dir.join(ASSET_DIR);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::io(&dir, err))?;
        self.download(remote, &dir, file_name, ledger).await
    }

    pub async fn download(
        &self,
        remote: &RemoteRef,
        work_dir: &Path,
        file_name: &str,
        ledger: &ArtifactLedger,
    ) -> PipelineResult<PathBuf> {
        let dest = work_dir.join(file_name);
        ledger.record_file(&dest);
        let bytes = self
            .transport
            .download(remote, &dest)
            .await
            .map_err(|err| PipelineError::Download(err.to_string()))?;
        if !output_is_usable(&dest).await {
            return Err(PipelineError::Download(format!(
                "{} is missing or empty after download",
                dest.display()
            )));
        }
        info!(path = %dest.display(), bytes, "asset downloaded");
        Ok(dest)
    }

    pub async fn probe(&self, path: &Path) -> PipelineResult<ProbeReport> {
        let report = self
            .engine
            .probe(path)
            .await
            .map_err(|err| PipelineError::Probe(err.to_string()))?;
        debug!(
            path = %path.display(),
            streams = report.streams.len(),
            duration = ?report.duration_seconds,
            "asset probed"
        );
        Ok(report)
    }

    /// Fetches a user-supplied subtitle file into `work_dir/subs/`.
    pub async fn fetch_subtitle(
        &self,
        file: &RemoteFile,
        work_dir: &Path,
        sequence: usize,
        ledger: &ArtifactLedger,
    ) -> PipelineResult<PathBuf> {
        let dir = work_dir.join("subs");
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| PipelineError::io(&dir, err))?;
        let name = format!("{sequence:02}-{}", sanitize_file_name(&file.file_name));
        self.download(&file.remote, &dir, &name, ledger).await
    }
}
