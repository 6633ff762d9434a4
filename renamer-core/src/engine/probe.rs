use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    Other,
}

impl StreamKind {
    fn from_codec_type(value: Option<&str>) -> Self {
        match value {
            Some("video") => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            Some("subtitle") => StreamKind::Subtitle,
            Some("data") => StreamKind::Data,
            Some("attachment") => StreamKind::Attachment,
            _ => StreamKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Absolute stream index inside the container.
    pub index: u32,
    pub kind: StreamKind,
    pub codec_name: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
    /// Cover art carried as a video stream.
    pub attached_pic: bool,
}

/// A subtitle stream addressed by its position among subtitle streams only,
/// which is the index users pick from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtitleTrack<'a> {
    pub position: u32,
    pub stream: &'a StreamInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub streams: Vec<StreamInfo>,
    pub duration_seconds: Option<f64>,
    pub format_name: Option<String>,
}

impl ProbeReport {
    pub fn parse(payload: &[u8]) -> EngineResult<Self> {
        let raw: FfprobeOutput =
            serde_json::from_slice(payload).map_err(|err| EngineError::Parse(err.to_string()))?;
        Ok(Self::from(raw))
    }

    pub fn subtitle_tracks(&self) -> Vec<SubtitleTrack<'_>> {
        self.streams
            .iter()
            .filter(|stream| stream.kind == StreamKind::Subtitle)
            .enumerate()
            .map(|(position, stream)| SubtitleTrack {
                position: position as u32,
                stream,
            })
            .collect()
    }

    pub fn subtitle_positions(&self) -> BTreeSet<u32> {
        self.subtitle_tracks()
            .into_iter()
            .map(|track| track.position)
            .collect()
    }

    pub fn count(&self, kind: StreamKind) -> usize {
        self.streams.iter().filter(|stream| stream.kind == kind).count()
    }

    pub fn has_video(&self) -> bool {
        self.streams
            .iter()
            .any(|stream| stream.kind == StreamKind::Video && !stream.attached_pic)
    }

    pub fn has_audio(&self) -> bool {
        self.count(StreamKind::Audio) > 0
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    format_name: Option<String>,
}

impl From<FfprobeOutput> for ProbeReport {
    fn from(raw: FfprobeOutput) -> Self {
        let mut streams: Vec<StreamInfo> = raw
            .streams
            .into_iter()
            .map(|stream| StreamInfo {
                index: stream.index,
                kind: StreamKind::from_codec_type(stream.codec_type.as_deref()),
                codec_name: stream.codec_name,
                language: tag(&stream.tags, "language"),
                title: tag(&stream.tags, "title"),
                attached_pic: stream.disposition.get("attached_pic").copied() == Some(1),
            })
            .collect();
        streams.sort_by_key(|stream| stream.index);
        let duration_seconds = raw
            .format
            .duration
            .as_deref()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value > 0.0);
        Self {
            streams,
            duration_seconds,
            format_name: raw.format.format_name,
        }
    }
}

fn tag(tags: &HashMap<String, String>, key: &str) -> Option<String> {
    tags.iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.clone())
}
