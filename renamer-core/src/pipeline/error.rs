use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::session::{OwnerId, SessionState, SessionToken};
use crate::transform::TransformKind;
use crate::transport::TransportError;

/// Input rejected before it could change any session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("file is {size} bytes, the limit is {limit} bytes")]
    AssetTooLarge { size: u64, limit: u64 },
    #[error("unsupported subtitle file: {file_name}")]
    UnsupportedSubtitle { file_name: String },
    #[error("no subtitle stream at index {0}")]
    UnknownSubtitleIndex(u32),
    #[error("{decision} is not accepted while the session is {state}")]
    UnexpectedDecision {
        state: SessionState,
        decision: &'static str,
    },
}

/// A chain stage whose engine run left no usable output.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("stage {stage} ({kind}) failed: {diagnostics}")]
pub struct TransformFailure {
    /// 1-based position in the chain.
    pub stage: usize,
    pub kind: TransformKind,
    pub diagnostics: String,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("session {token} is no longer active for owner {owner}")]
    SessionExpired { owner: OwnerId, token: SessionToken },
    #[error(transparent)]
    Transform(#[from] TransformFailure),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("session was cancelled")]
    Cancelled,
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            source,
            path: path.into(),
        }
    }
}

impl From<EngineError> for PipelineError {
    fn from(error: EngineError) -> Self {
        PipelineError::Probe(error.to_string())
    }
}

impl From<TransportError> for PipelineError {
    fn from(error: TransportError) -> Self {
        PipelineError::DeliveryFailed(error.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
