use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Instant;

use renamer_core::config::DeliverySection;
use renamer_core::delivery::{DeliveryInput, DeliveryStage};
use renamer_core::pipeline::PipelineError;
use renamer_core::session::{MediaKind, OwnerId, RemoteRef, SessionToken};
use renamer_core::transport::{
    LocalTransport, Prompt, Transport, TransportError, TransportResult, UploadRequest,
};

/// Fails uploads with the queued errors, then defers to a local transport.
struct FlakyTransport {
    inner: LocalTransport,
    failures: Mutex<VecDeque<TransportError>>,
    uploads: AtomicUsize,
    upload_times: Mutex<Vec<Instant>>,
}

impl FlakyTransport {
    fn new(outbox: &Path, failures: Vec<TransportError>) -> Self {
        Self {
            inner: LocalTransport::new(outbox),
            failures: Mutex::new(failures.into()),
            uploads: AtomicUsize::new(0),
            upload_times: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send_status(&self, owner: OwnerId, text: &str) -> TransportResult<RemoteRef> {
        self.inner.send_status(owner, text).await
    }

    async fn edit_status(
        &self,
        owner: OwnerId,
        status: &RemoteRef,
        text: &str,
    ) -> TransportResult<()> {
        self.inner.edit_status(owner, status, text).await
    }

    async fn delete_status(&self, owner: OwnerId, status: &RemoteRef) -> TransportResult<()> {
        self.inner.delete_status(owner, status).await
    }

    async fn prompt(
        &self,
        owner: OwnerId,
        token: SessionToken,
        prompt: &Prompt,
    ) -> TransportResult<()> {
        self.inner.prompt(owner, token, prompt).await
    }

    async fn download(&self, remote: &RemoteRef, dest: &Path) -> TransportResult<u64> {
        self.inner.download(remote, dest).await
    }

    async fn upload(&self, request: &UploadRequest) -> TransportResult<RemoteRef> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.upload_times.lock().unwrap().push(Instant::now());
        let next = self.failures.lock().unwrap().pop_front();
        match next {
            Some(error) => Err(error),
            None => self.inner.upload(request).await,
        }
    }
}

fn section(max_attempts: u32) -> DeliverySection {
    DeliverySection {
        max_attempts,
        promote_video_documents: true,
        progress_interval_ms: 1000,
    }
}

async fn request(stage: &DeliveryStage, base: &TempDir) -> UploadRequest {
    let path = base.path().join("final.mkv");
    std::fs::write(&path, vec![7u8; 4096]).unwrap();
    stage
        .prepare(DeliveryInput {
            owner: 9,
            kind: MediaKind::Document,
            path,
            file_name: "final.mkv".into(),
            caption_template: None,
            thumbnail: None,
            duration_seconds: Some(61.0),
        })
        .await
        .unwrap()
}

fn rate_limited(seconds: u64) -> TransportError {
    TransportError::RateLimited {
        wait: Duration::from_secs(seconds),
    }
}

#[tokio::test(start_paused = true)]
async fn rate_limit_waits_the_requested_time_then_retries_once() {
    let base = TempDir::new().unwrap();
    let transport = Arc::new(FlakyTransport::new(
        &base.path().join("outbox"),
        vec![rate_limited(5)],
    ));
    let stage = DeliveryStage::new(transport.clone(), section(5));
    let request = request(&stage, &base).await;
    let status = transport.send_status(9, "Uploading…").await.unwrap();

    let receipt = stage.deliver(request, Some(&status)).await.unwrap();

    assert_eq!(receipt.attempts, 2);
    assert_eq!(transport.uploads.load(Ordering::SeqCst), 2);
    let times = transport.upload_times.lock().unwrap().clone();
    assert!(times[1] - times[0] >= Duration::from_secs(5));
    assert_eq!(receipt.shape.as_str(), "video");
    assert_eq!(receipt.caption, "**final.mkv**");
    assert_eq!(transport.inner.deliveries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_rate_limits_retry_until_the_cap() {
    let base = TempDir::new().unwrap();
    let transport = Arc::new(FlakyTransport::new(
        &base.path().join("outbox"),
        vec![rate_limited(5), rate_limited(7), rate_limited(11), rate_limited(13)],
    ));
    let stage = DeliveryStage::new(transport.clone(), section(3));
    let request = request(&stage, &base).await;
    let started = Instant::now();

    let err = stage.deliver(request, None).await.unwrap_err();

    assert!(matches!(err, PipelineError::DeliveryFailed(_)));
    assert_eq!(transport.uploads.load(Ordering::SeqCst), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(23), "{elapsed:?}");
    assert!(transport.inner.deliveries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn other_errors_are_terminal_and_verbatim() {
    let base = TempDir::new().unwrap();
    let transport = Arc::new(FlakyTransport::new(
        &base.path().join("outbox"),
        vec![TransportError::Failed("FILE_PARTS_INVALID".into())],
    ));
    let stage = DeliveryStage::new(transport.clone(), section(5));
    let request = request(&stage, &base).await;

    let err = stage.deliver(request, None).await.unwrap_err();

    match err {
        PipelineError::DeliveryFailed(message) => assert_eq!(message, "FILE_PARTS_INVALID"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.uploads.load(Ordering::SeqCst), 1);
}
