use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::DeliverySection;
use crate::pipeline::{PipelineError, PipelineResult};
use crate::session::{MediaKind, OwnerId, RemoteRef};
use crate::transport::{ProgressFn, Transport, TransportError, UploadRequest, UploadShape};

/// Container extensions that get a video preview when sent as documents.
pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "mkv", "webm", "flv"];

pub fn upload_shape(kind: MediaKind, file_name: &str, promote_documents: bool) -> UploadShape {
    match kind {
        MediaKind::Video => UploadShape::Video,
        MediaKind::Audio => UploadShape::Audio,
        MediaKind::Document if promote_documents && has_video_extension(file_name) => {
            UploadShape::Video
        }
        MediaKind::Document => UploadShape::Document,
    }
}

fn has_video_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn humanbytes(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if size < 1024 {
        return format!("{size} B");
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Fills `{filename}`, `{filesize}` and `{duration}` in the owner's template.
/// Any other placeholder, or no template at all, yields the bold file name.
pub fn render_caption(
    template: Option<&str>,
    file_name: &str,
    size_bytes: u64,
    duration_seconds: Option<u64>,
) -> String {
    let fallback = format!("**{file_name}**");
    let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
        return fallback;
    };
    let Ok(placeholder) = Regex::new(r"\{(\w*)\}") else {
        return fallback;
    };
    let mut unknown = false;
    let rendered = placeholder.replace_all(template, |caps: &regex::Captures<'_>| {
        match &caps[1] {
            "filename" => file_name.to_string(),
            "filesize" => humanbytes(size_bytes),
            "duration" => format_duration(duration_seconds.unwrap_or(0)),
            _ => {
                unknown = true;
                String::new()
            }
        }
    });
    if unknown {
        fallback
    } else {
        rendered.into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        (self.sent.min(self.total) * 100) / self.total
    }
}

/// A progress callback that forwards at most one update per `interval`
/// (plus the final one) to the returned receiver.
pub fn throttled_progress(interval: Duration) -> (ProgressFn, mpsc::UnboundedReceiver<UploadProgress>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let last: Mutex<Option<Instant>> = Mutex::new(None);
    let callback: ProgressFn = Arc::new(move |sent, total| {
        let now = Instant::now();
        let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match *last {
            None => true,
            Some(previous) => sent >= total || now.duration_since(previous) >= interval,
        };
        if due {
            *last = Some(now);
            let _ = tx.send(UploadProgress { sent, total });
        }
    });
    (callback, rx)
}

/// What to deliver, before shape and caption are decided.
#[derive(Debug, Clone)]
pub struct DeliveryInput {
    pub owner: OwnerId,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub file_name: String,
    pub caption_template: Option<String>,
    pub thumbnail: Option<PathBuf>,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReceipt {
    pub remote: RemoteRef,
    pub shape: UploadShape,
    pub caption: String,
    pub attempts: u32,
}

pub struct DeliveryStage {
    transport: Arc<dyn Transport>,
    section: DeliverySection,
}

impl DeliveryStage {
    pub fn new(transport: Arc<dyn Transport>, section: DeliverySection) -> Self {
        Self { transport, section }
    }

    pub async fn prepare(&self, input: DeliveryInput) -> PipelineResult<UploadRequest> {
        let size = tokio::fs::metadata(&input.path)
            .await
            .map_err(|err| PipelineError::io(&input.path, err))?
            .len();
        let duration = input.duration_seconds.map(|d| d.round() as u64);
        Ok(UploadRequest {
            owner: input.owner,
            shape: upload_shape(
                input.kind,
                &input.file_name,
                self.section.promote_video_documents,
            ),
            caption: render_caption(
                input.caption_template.as_deref(),
                &input.file_name,
                size,
                duration,
            ),
            path: input.path,
            file_name: input.file_name,
            thumbnail: input.thumbnail,
            duration_seconds: duration,
            progress: None,
        })
    }

    /// Uploads `request`, sleeping out rate-limit waits and repeating the same
    /// call up to the configured attempt cap. Other transport errors end the
    /// delivery immediately with the transport's own message.
    pub async fn deliver(
        &self,
        mut request: UploadRequest,
        status: Option<&RemoteRef>,
    ) -> PipelineResult<DeliveryReceipt> {
        let owner = request.owner;
        let forwarder = status.map(|status| {
            let (callback, mut updates) = throttled_progress(self.section.progress_interval());
            request.progress = Some(callback);
            let transport = self.transport.clone();
            let status = status.clone();
            tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    let text = format!("Uploading… {}%", update.percent());
                    if let Err(err) = transport.edit_status(owner, &status, &text).await {
                        debug!(owner, error = %err, "progress update dropped");
                    }
                }
            })
        });

        let result = self.upload_with_retry(&request, status).await;
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        result
    }

    async fn upload_with_retry(
        &self,
        request: &UploadRequest,
        status: Option<&RemoteRef>,
    ) -> PipelineResult<DeliveryReceipt> {
        let owner = request.owner;
        let max_attempts = self.section.attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.transport.upload(request).await {
                Ok(remote) => {
                    info!(owner, shape = %request.shape, attempts = attempt, "delivered");
                    return Ok(DeliveryReceipt {
                        remote,
                        shape: request.shape,
                        caption: request.caption.clone(),
                        attempts: attempt,
                    });
                }
                Err(TransportError::RateLimited { wait }) if attempt < max_attempts => {
                    warn!(
                        owner,
                        attempt,
                        wait_seconds = wait.as_secs_f64(),
                        "delivery rate limited"
                    );
                    if let Some(status) = status {
                        let text = format!("Rate limited, retrying in {}s…", wait.as_secs());
                        if let Err(err) = self.transport.edit_status(owner, status, &text).await {
                            debug!(owner, error = %err, "rate-limit notice dropped");
                        }
                    }
                    sleep(wait).await;
                }
                Err(TransportError::RateLimited { wait }) => {
                    return Err(PipelineError::DeliveryFailed(format!(
                        "still rate limited after {attempt} attempts (last wait {}s)",
                        wait.as_secs()
                    )));
                }
                Err(TransportError::Failed(message)) => {
                    return Err(PipelineError::DeliveryFailed(message));
                }
            }
        }
    }
}
