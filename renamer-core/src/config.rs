use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::session::{BurnStyle, VerticalAnchor};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RenamerConfig {
    pub paths: PathsSection,
    pub limits: LimitsSection,
    pub decisions: DecisionsSection,
    pub engine: EngineSection,
    pub burn: BurnSection,
    pub subtitles: SubtitlesSection,
    pub thumbnail: ThumbnailSection,
    pub delivery: DeliverySection,
}

impl RenamerConfig {
    pub fn work_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.work_dir)
    }

    /// Rejects values that would make the pipeline unable to terminate or to
    /// create a single session.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_asset_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_asset_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.thumbnail.max_dimension == 0 {
            return Err(ConfigError::Invalid {
                field: "thumbnail.max_dimension",
                reason: "must be greater than zero".into(),
            });
        }
        if self.subtitles.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid {
                field: "subtitles.allowed_extensions",
                reason: "at least one extension is required".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub work_dir: String,
    pub settings_db: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    pub max_asset_bytes: u64,
    pub session_shards: usize,
    pub session_max_age_seconds: u64,
}

impl LimitsSection {
    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultThumbnail {
    Generate,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionsSection {
    pub thumbnail_timeout_seconds: u64,
    pub subtitle_timeout_seconds: u64,
    pub default_thumbnail: DefaultThumbnail,
}

impl DecisionsSection {
    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_secs(self.thumbnail_timeout_seconds)
    }

    pub fn subtitle_timeout(&self) -> Duration {
        Duration::from_secs(self.subtitle_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub probe_timeout_seconds: u64,
    pub frame_timeout_seconds: u64,
    pub transform_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BurnSection {
    pub font_size: u32,
    pub font_color: String,
    pub background_color: String,
    pub position: VerticalAnchor,
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    pub margin_v: u32,
}

impl BurnSection {
    pub fn default_style(&self) -> BurnStyle {
        BurnStyle {
            font_size: self.font_size,
            font_color: self.font_color.clone(),
            background_color: self.background_color.clone(),
            position: self.position,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubtitlesSection {
    pub allowed_extensions: Vec<String>,
    pub default_language: String,
}

impl SubtitlesSection {
    pub fn is_supported(&self, file_name: &str) -> bool {
        let Some(extension) = Path::new(file_name).extension() else {
            return false;
        };
        let extension = extension.to_string_lossy();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailSection {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    pub max_attempts: u32,
    pub promote_video_documents: bool,
    pub progress_interval_ms: u64,
}

impl DeliverySection {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

pub fn load_renamer_config<P: AsRef<Path>>(path: P) -> Result<RenamerConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    let config: RenamerConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    config.validate()?;
    Ok(config)
}
