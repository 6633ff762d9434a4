//! The messaging collaborator: status messages, decision prompts, asset
//! download and shaped upload.

mod local;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::StreamInfo;
use crate::session::{OwnerId, RemoteRef, SessionToken};

pub use local::{DeliveryRecord, LocalTransport, PromptNotice};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Backpressure from the remote side; the call may be repeated after `wait`.
    #[error("rate limited, retry after {wait:?}")]
    RateLimited { wait: Duration },
    #[error("{0}")]
    Failed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadShape {
    Video,
    Audio,
    Document,
}

impl UploadShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadShape::Video => "video",
            UploadShape::Audio => "audio",
            UploadShape::Document => "document",
        }
    }
}

impl fmt::Display for UploadShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with `(sent_bytes, total_bytes)` while an upload is in flight.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Clone)]
pub struct UploadRequest {
    pub owner: OwnerId,
    pub shape: UploadShape,
    pub path: PathBuf,
    pub file_name: String,
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub duration_seconds: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("owner", &self.owner)
            .field("shape", &self.shape)
            .field("path", &self.path)
            .field("caption", &self.caption)
            .field("thumbnail", &self.thumbnail)
            .field("duration_seconds", &self.duration_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStep {
    Thumbnail,
    SubtitlePlan,
}

/// Everything a client needs to render the choices for a waiting step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub step: PromptStep,
    pub file_name: String,
    pub duration_seconds: Option<f64>,
    /// Subtitle streams in position order; the position is the index users pick.
    pub subtitle_streams: Vec<StreamInfo>,
    pub timeout: Duration,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_status(&self, owner: OwnerId, text: &str) -> TransportResult<RemoteRef>;

    async fn edit_status(
        &self,
        owner: OwnerId,
        status: &RemoteRef,
        text: &str,
    ) -> TransportResult<()>;

    async fn delete_status(&self, owner: OwnerId, status: &RemoteRef) -> TransportResult<()>;

    async fn prompt(
        &self,
        owner: OwnerId,
        token: SessionToken,
        prompt: &Prompt,
    ) -> TransportResult<()>;

    /// Fetches `remote` to `dest`, returning the number of bytes written.
    async fn download(&self, remote: &RemoteRef, dest: &std::path::Path) -> TransportResult<u64>;

    async fn upload(&self, request: &UploadRequest) -> TransportResult<RemoteRef>;
}
