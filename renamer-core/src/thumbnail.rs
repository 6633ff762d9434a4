//! Thumbnail resolution: a custom image, else a captured frame, else nothing.
//! A custom image that cannot be fetched falls through to a frame capture.
//!
//! Every failure in here degrades to "no thumbnail"; nothing escapes the
//! resolver.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, GenericImageView};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cleanup::ArtifactLedger;
use crate::config::ThumbnailSection;
use crate::engine::MediaEngine;
use crate::session::{RemoteRef, ThumbnailChoice};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Error)]
enum ThumbnailError {
    #[error("download failed: {0}")]
    Download(#[from] TransportError),
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("asset has no video stream")]
    NoVideo,
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("normalization task aborted: {0}")]
    Join(String),
}

/// What the resolver needs to know about the working asset.
#[derive(Debug, Clone)]
pub struct ThumbnailRequest<'a> {
    pub choice: &'a ThumbnailChoice,
    pub working_path: &'a Path,
    pub duration_seconds: Option<f64>,
    pub has_video: bool,
    pub work_dir: &'a Path,
    pub ledger: &'a ArtifactLedger,
}

pub struct ThumbnailResolver {
    engine: Arc<dyn MediaEngine>,
    transport: Arc<dyn Transport>,
    section: ThumbnailSection,
}

impl ThumbnailResolver {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        transport: Arc<dyn Transport>,
        section: ThumbnailSection,
    ) -> Self {
        Self {
            engine,
            transport,
            section,
        }
    }

    /// Path of a normalized JPEG, or `None` when there is no usable source.
    pub async fn resolve(&self, request: ThumbnailRequest<'_>) -> Option<PathBuf> {
        let source = match request.choice {
            ThumbnailChoice::None => return None,
            ThumbnailChoice::Custom(remote) => match self.fetch_custom(remote, &request).await {
                Ok(source) => Ok(source),
                Err(err) => {
                    warn!(error = %err, "custom thumbnail unavailable, capturing a frame");
                    self.capture_frame(None, &request).await
                }
            },
            ThumbnailChoice::GenerateFromFrame { at_seconds } => {
                self.capture_frame(*at_seconds, &request).await
            }
        };
        let source = match source {
            Ok(source) => source,
            Err(err) => {
                warn!(error = %err, "thumbnail degraded");
                return None;
            }
        };

        let target = request.work_dir.join("thumb.jpg");
        request.ledger.record_file(&target);
        let max_dimension = self.section.max_dimension;
        let quality = self.section.jpeg_quality;
        let job_target = target.clone();
        let normalized = tokio::task::spawn_blocking(move || {
            normalize(&source, &job_target, max_dimension, quality)
        })
        .await
        .map_err(|err| ThumbnailError::Join(err.to_string()))
        .and_then(|result| result);
        match normalized {
            Ok((width, height)) => {
                debug!(width, height, path = %target.display(), "thumbnail ready");
                Some(target)
            }
            Err(err) => {
                warn!(error = %err, "thumbnail degraded");
                None
            }
        }
    }

    async fn fetch_custom(
        &self,
        remote: &RemoteRef,
        request: &ThumbnailRequest<'_>,
    ) -> Result<PathBuf, ThumbnailError> {
        let dest = request.work_dir.join("thumb-source");
        request.ledger.record_file(&dest);
        self.transport.download(remote, &dest).await?;
        Ok(dest)
    }

    async fn capture_frame(
        &self,
        requested: Option<f64>,
        request: &ThumbnailRequest<'_>,
    ) -> Result<PathBuf, ThumbnailError> {
        if !request.has_video {
            return Err(ThumbnailError::NoVideo);
        }
        let at = frame_timestamp(requested, request.duration_seconds, &mut rand::thread_rng());
        let dest = request.work_dir.join("frame.jpg");
        request.ledger.record_file(&dest);
        let outcome = self
            .engine
            .extract_frame(request.working_path, at, &dest)
            .await;
        if outcome.succeeded {
            return Ok(dest);
        }
        if at > 0.0 {
            debug!(at, "frame capture failed, retrying at the first frame");
            let retry = self
                .engine
                .extract_frame(request.working_path, 0.0, &dest)
                .await;
            if retry.succeeded {
                return Ok(dest);
            }
            return Err(ThumbnailError::Capture(retry.describe()));
        }
        Err(ThumbnailError::Capture(outcome.describe()))
    }
}

/// Picks an in-range capture timestamp. A requested time past the end is
/// clamped to the last whole second; no request picks a random second. An
/// unknown duration always falls back to the first frame.
pub fn frame_timestamp<R: Rng>(
    requested: Option<f64>,
    duration_seconds: Option<f64>,
    rng: &mut R,
) -> f64 {
    let Some(duration) = duration_seconds.filter(|d| d.is_finite() && *d > 0.0) else {
        return 0.0;
    };
    let upper = (duration - 1.0).max(0.0);
    match requested.filter(|t| t.is_finite()) {
        Some(at) => at.clamp(0.0, upper),
        None if upper > 0.0 => rng.gen_range(0.0..=upper).floor(),
        None => 0.0,
    }
}

/// Decodes `source`, drops alpha, shrinks it to fit `max_dimension` (never
/// enlarging) and writes a JPEG to `target`. Returns the written dimensions.
fn normalize(
    source: &Path,
    target: &Path,
    max_dimension: u32,
    quality: u8,
) -> Result<(u32, u32), ThumbnailError> {
    let image = image::io::Reader::open(source)
        .map_err(|err| ThumbnailError::Io {
            source: err,
            path: source.to_path_buf(),
        })?
        .with_guessed_format()
        .map_err(|err| ThumbnailError::Io {
            source: err,
            path: source.to_path_buf(),
        })?
        .decode()?;

    let (width, height) = image.dimensions();
    let image = if width > max_dimension || height > max_dimension {
        let (w, h) = fit_within(width, height, max_dimension);
        image.resize_exact(w, h, FilterType::Triangle)
    } else {
        image
    };
    let rgb = image.to_rgb8();

    let file = File::create(target).map_err(|err| ThumbnailError::Io {
        source: err,
        path: target.to_path_buf(),
    })?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100)).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok((rgb.width(), rgb.height()))
}

/// Largest size within `bound` on both axes keeping the aspect ratio.
fn fit_within(width: u32, height: u32, bound: u32) -> (u32, u32) {
    let scale = bound as f64 / width.max(height) as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, bound);
    let h = ((height as f64 * scale).round() as u32).clamp(1, bound);
    (w, h)
}
