use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::info;

use super::{Prompt, Transport, TransportError, TransportResult, UploadRequest, UploadShape};
use crate::session::{OwnerId, RemoteRef, SessionToken};

/// A delivered file as it landed in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub owner: OwnerId,
    pub shape: UploadShape,
    pub path: PathBuf,
    pub caption: String,
    pub thumbnail: Option<PathBuf>,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PromptNotice {
    pub owner: OwnerId,
    pub token: SessionToken,
    pub prompt: Prompt,
}

/// Filesystem-backed transport: remote references are local paths and
/// uploads are copied under `outbox/<owner>/`.
#[derive(Debug)]
pub struct LocalTransport {
    outbox: PathBuf,
    next_status: AtomicU64,
    statuses: Mutex<BTreeMap<String, String>>,
    deliveries: Mutex<Vec<DeliveryRecord>>,
    prompts: Option<mpsc::UnboundedSender<PromptNotice>>,
}

impl LocalTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            next_status: AtomicU64::new(1),
            statuses: Mutex::new(BTreeMap::new()),
            deliveries: Mutex::new(Vec::new()),
            prompts: None,
        }
    }

    /// Forwards every decision prompt to the returned receiver.
    pub fn with_prompt_channel(mut self) -> (Self, mpsc::UnboundedReceiver<PromptNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.prompts = Some(tx);
        (self, rx)
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status messages that are still present, keyed by message id.
    pub fn statuses(&self) -> BTreeMap<String, String> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status_map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn failed(action: &str, path: &Path, err: std::io::Error) -> TransportError {
    TransportError::Failed(format!("{action} {}: {err}", path.display()))
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_status(&self, owner: OwnerId, text: &str) -> TransportResult<RemoteRef> {
        let id = format!("status-{}", self.next_status.fetch_add(1, Ordering::Relaxed));
        info!(owner, status = %id, "{text}");
        self.status_map().insert(id.clone(), text.to_string());
        Ok(RemoteRef::new(id))
    }

    async fn edit_status(
        &self,
        owner: OwnerId,
        status: &RemoteRef,
        text: &str,
    ) -> TransportResult<()> {
        let mut statuses = self.status_map();
        match statuses.get_mut(status.as_str()) {
            Some(current) => {
                info!(owner, status = %status, "{text}");
                *current = text.to_string();
                Ok(())
            }
            None => Err(TransportError::Failed(format!(
                "status message {status} does not exist"
            ))),
        }
    }

    async fn delete_status(&self, _owner: OwnerId, status: &RemoteRef) -> TransportResult<()> {
        self.status_map().remove(status.as_str());
        Ok(())
    }

    async fn prompt(
        &self,
        owner: OwnerId,
        token: SessionToken,
        prompt: &Prompt,
    ) -> TransportResult<()> {
        info!(owner, token = %token, step = ?prompt.step, "awaiting decision");
        if let Some(prompts) = &self.prompts {
            let _ = prompts.send(PromptNotice {
                owner,
                token,
                prompt: prompt.clone(),
            });
        }
        Ok(())
    }

    async fn download(&self, remote: &RemoteRef, dest: &Path) -> TransportResult<u64> {
        let source = PathBuf::from(remote.as_str());
        fs::copy(&source, dest)
            .await
            .map_err(|err| failed("cannot read", &source, err))
    }

    async fn upload(&self, request: &UploadRequest) -> TransportResult<RemoteRef> {
        let dir = self.outbox.join(request.owner.to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| failed("cannot create", &dir, err))?;
        let total = fs::metadata(&request.path)
            .await
            .map_err(|err| failed("cannot read", &request.path, err))?
            .len();
        if let Some(progress) = &request.progress {
            progress(0, total);
        }
        let target = dir.join(&request.file_name);
        fs::copy(&request.path, &target)
            .await
            .map_err(|err| failed("cannot write", &target, err))?;
        let thumbnail = match &request.thumbnail {
            Some(thumb) => {
                let copy = dir.join(format!("{}.thumb.jpg", request.file_name));
                fs::copy(thumb, &copy)
                    .await
                    .map_err(|err| failed("cannot write", &copy, err))?;
                Some(copy)
            }
            None => None,
        };
        if let Some(progress) = &request.progress {
            progress(total, total);
        }
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeliveryRecord {
                owner: request.owner,
                shape: request.shape,
                path: target.clone(),
                caption: request.caption.clone(),
                thumbnail,
                duration_seconds: request.duration_seconds,
            });
        Ok(RemoteRef::new(target.to_string_lossy()))
    }
}
