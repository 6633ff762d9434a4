mod fsm;
mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cleanup::ArtifactLedger;
use crate::engine::ProbeReport;

pub use fsm::{Decision, RemoteFile, UserChoice};
pub use store::{SessionHandle, SessionStore};

pub type OwnerId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short token fragment used to namespace working directories.
    pub fn fragment(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "document" => Ok(Self::Document),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Opaque handle the transport understands (message id, file id, local path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef(pub String);

impl RemoteRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub remote: RemoteRef,
    pub file_name: String,
    pub size_bytes: u64,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Intake,
    AwaitingThumbnailChoice,
    AwaitingSubtitlePlan,
    Ready,
    Processing,
    Delivered,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Intake => "intake",
            SessionState::AwaitingThumbnailChoice => "awaiting_thumbnail_choice",
            SessionState::AwaitingSubtitlePlan => "awaiting_subtitle_plan",
            SessionState::Ready => "ready",
            SessionState::Processing => "processing",
            SessionState::Delivered => "delivered",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Delivered | SessionState::Failed)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            SessionState::AwaitingThumbnailChoice | SessionState::AwaitingSubtitlePlan
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailChoice {
    None,
    Custom(RemoteRef),
    /// Capture a frame; a missing timestamp picks one within the duration.
    GenerateFromFrame { at_seconds: Option<f64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalAnchor {
    Top,
    Middle,
    Bottom,
}

impl VerticalAnchor {
    /// ASS numpad alignment: bottom-centre, middle-centre, top-centre.
    pub fn alignment(&self) -> u8 {
        match self {
            VerticalAnchor::Top => 8,
            VerticalAnchor::Middle => 5,
            VerticalAnchor::Bottom => 2,
        }
    }

    /// Vertical margin in script pixels; the middle anchor ignores it.
    pub fn margin(&self, base: u32) -> u32 {
        match self {
            VerticalAnchor::Middle => 0,
            VerticalAnchor::Top | VerticalAnchor::Bottom => base,
        }
    }
}

impl FromStr for VerticalAnchor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(Self::Top),
            "middle" | "center" => Ok(Self::Middle),
            "bottom" => Ok(Self::Bottom),
            other => Err(format!("unknown position: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnStyle {
    pub font_size: u32,
    pub font_color: String,
    /// Colour with optional `@opacity`, e.g. `black@0.5`.
    pub background_color: String,
    pub position: VerticalAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftSubtitle {
    pub path: PathBuf,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnSpec {
    pub path: PathBuf,
    pub style: BurnStyle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitlePlan {
    /// Positions among the probed subtitle streams.
    pub remove: BTreeSet<u32>,
    pub soft: Vec<SoftSubtitle>,
    pub burn: Vec<BurnSpec>,
}

impl SubtitlePlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.soft.is_empty() && self.burn.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub owner: OwnerId,
    pub asset: AssetDescriptor,
    pub state: SessionState,
    pub thumbnail: ThumbnailChoice,
    pub subtitles: SubtitlePlan,
    pub probe: Option<ProbeReport>,
    pub work_dir: PathBuf,
    pub working_path: Option<PathBuf>,
    pub ledger: ArtifactLedger,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(owner: OwnerId, asset: AssetDescriptor, work_root: &Path) -> Self {
        let token = SessionToken::new();
        let work_dir = work_root
            .join(owner.to_string())
            .join(token.fragment());
        Self {
            token,
            owner,
            asset,
            state: SessionState::Intake,
            thumbnail: ThumbnailChoice::None,
            subtitles: SubtitlePlan::default(),
            probe: None,
            work_dir,
            working_path: None,
            ledger: ArtifactLedger::new(),
            created_at: Utc::now(),
        }
    }

    pub fn owner_dir(&self) -> Option<&Path> {
        self.work_dir.parent()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.probe.as_ref().and_then(|probe| probe.duration_seconds)
    }

    /// Whether subtitle editing makes sense for this asset at all.
    pub fn wants_subtitle_plan(&self) -> bool {
        match self.asset.kind {
            MediaKind::Audio => false,
            MediaKind::Video | MediaKind::Document => self
                .probe
                .as_ref()
                .map(ProbeReport::has_video)
                .unwrap_or(false),
        }
    }

    pub fn subtitle_positions(&self) -> BTreeSet<u32> {
        self.probe
            .as_ref()
            .map(ProbeReport::subtitle_positions)
            .unwrap_or_default()
    }
}
