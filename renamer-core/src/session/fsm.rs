use std::path::PathBuf;

use crate::config::SubtitlesSection;
use crate::engine::ProbeReport;
use crate::pipeline::ValidationError;

use super::{
    BurnSpec, BurnStyle, RemoteRef, Session, SessionState, SoftSubtitle, ThumbnailChoice,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub remote: RemoteRef,
    pub file_name: String,
}

/// What a user picked, as delivered by the transport. Subtitle files are still
/// remote at this point.
#[derive(Debug, Clone, PartialEq)]
pub enum UserChoice {
    Thumbnail(ThumbnailChoice),
    RemoveSubtitle(u32),
    AddSoftSubtitle {
        file: RemoteFile,
        language: Option<String>,
    },
    AddBurnSubtitle {
        file: RemoteFile,
        style: Option<BurnStyle>,
    },
    Continue,
}

impl UserChoice {
    pub fn label(&self) -> &'static str {
        match self {
            UserChoice::Thumbnail(_) => "thumbnail",
            UserChoice::RemoveSubtitle(_) => "remove_subtitle",
            UserChoice::AddSoftSubtitle { .. } => "add_soft_subtitle",
            UserChoice::AddBurnSubtitle { .. } => "add_burn_subtitle",
            UserChoice::Continue => "continue",
        }
    }

    fn accepted_in(&self, state: SessionState) -> bool {
        match self {
            UserChoice::Thumbnail(_) => state == SessionState::AwaitingThumbnailChoice,
            UserChoice::RemoveSubtitle(_)
            | UserChoice::AddSoftSubtitle { .. }
            | UserChoice::AddBurnSubtitle { .. }
            | UserChoice::Continue => state == SessionState::AwaitingSubtitlePlan,
        }
    }

    pub fn subtitle_file(&self) -> Option<&RemoteFile> {
        match self {
            UserChoice::AddSoftSubtitle { file, .. } | UserChoice::AddBurnSubtitle { file, .. } => {
                Some(file)
            }
            _ => None,
        }
    }
}

/// A choice whose subtitle files have been fetched to the session directory.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Thumbnail(ThumbnailChoice),
    RemoveSubtitle(u32),
    AddSoftSubtitle(SoftSubtitle),
    AddBurnSubtitle(BurnSpec),
    Continue,
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Thumbnail(_) => "thumbnail",
            Decision::RemoveSubtitle(_) => "remove_subtitle",
            Decision::AddSoftSubtitle(_) => "add_soft_subtitle",
            Decision::AddBurnSubtitle(_) => "add_burn_subtitle",
            Decision::Continue => "continue",
        }
    }
}

impl Session {
    /// Intake finished: the asset is on disk and probed.
    pub fn start_decisions(
        &mut self,
        probe: ProbeReport,
        working_path: PathBuf,
    ) -> Result<SessionState, ValidationError> {
        if self.state != SessionState::Intake {
            return Err(ValidationError::UnexpectedDecision {
                state: self.state,
                decision: "start_decisions",
            });
        }
        self.probe = Some(probe);
        self.working_path = Some(working_path);
        self.state = SessionState::AwaitingThumbnailChoice;
        Ok(self.state)
    }

    /// Validates a choice against the current state without mutating anything.
    pub fn precheck(
        &self,
        choice: &UserChoice,
        subtitles: &SubtitlesSection,
    ) -> Result<(), ValidationError> {
        if !choice.accepted_in(self.state) {
            return Err(ValidationError::UnexpectedDecision {
                state: self.state,
                decision: choice.label(),
            });
        }
        match choice {
            UserChoice::RemoveSubtitle(position) => {
                if !self.subtitle_positions().contains(position) {
                    return Err(ValidationError::UnknownSubtitleIndex(*position));
                }
            }
            UserChoice::AddSoftSubtitle { file, .. } | UserChoice::AddBurnSubtitle { file, .. } => {
                if !subtitles.is_supported(&file.file_name) {
                    return Err(ValidationError::UnsupportedSubtitle {
                        file_name: file.file_name.clone(),
                    });
                }
            }
            UserChoice::Thumbnail(_) | UserChoice::Continue => {}
        }
        Ok(())
    }

    pub fn apply(&mut self, decision: Decision) -> Result<SessionState, ValidationError> {
        match (self.state, decision) {
            (SessionState::AwaitingThumbnailChoice, Decision::Thumbnail(choice)) => {
                self.thumbnail = choice;
                self.state = self.after_thumbnail();
            }
            (SessionState::AwaitingSubtitlePlan, Decision::RemoveSubtitle(position)) => {
                if !self.subtitle_positions().contains(&position) {
                    return Err(ValidationError::UnknownSubtitleIndex(position));
                }
                self.subtitles.remove.insert(position);
            }
            (SessionState::AwaitingSubtitlePlan, Decision::AddSoftSubtitle(soft)) => {
                self.subtitles.soft.push(soft);
            }
            (SessionState::AwaitingSubtitlePlan, Decision::AddBurnSubtitle(burn)) => {
                self.subtitles.burn.push(burn);
            }
            (SessionState::AwaitingSubtitlePlan, Decision::Continue) => {
                self.state = SessionState::Ready;
            }
            (state, decision) => {
                return Err(ValidationError::UnexpectedDecision {
                    state,
                    decision: decision.label(),
                });
            }
        }
        Ok(self.state)
    }

    /// The wait for the current step elapsed; take the default branch.
    ///
    /// Subtitle edits collected before the deadline are kept.
    pub fn expire_wait(
        &mut self,
        default_thumbnail: ThumbnailChoice,
    ) -> Result<SessionState, ValidationError> {
        match self.state {
            SessionState::AwaitingThumbnailChoice => {
                self.thumbnail = default_thumbnail;
                self.state = self.after_thumbnail();
            }
            SessionState::AwaitingSubtitlePlan => {
                self.state = SessionState::Ready;
            }
            state => {
                return Err(ValidationError::UnexpectedDecision {
                    state,
                    decision: "timeout",
                });
            }
        }
        Ok(self.state)
    }

    pub fn begin_processing(&mut self) -> Result<(), ValidationError> {
        if self.state != SessionState::Ready {
            return Err(ValidationError::UnexpectedDecision {
                state: self.state,
                decision: "process",
            });
        }
        self.state = SessionState::Processing;
        Ok(())
    }

    /// Any non-terminal state may fail; only processing may deliver.
    pub fn finish(&mut self, delivered: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if delivered && self.state == SessionState::Processing {
            SessionState::Delivered
        } else {
            SessionState::Failed
        };
    }

    fn after_thumbnail(&self) -> SessionState {
        if self.wants_subtitle_plan() {
            SessionState::AwaitingSubtitlePlan
        } else {
            SessionState::Ready
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AssetDescriptor, MediaKind, VerticalAnchor};
    use std::path::Path;

    fn probe_with_subtitles(count: u32) -> ProbeReport {
        let mut streams = format!(
            r#"{{"index": 0, "codec_type": "video", "codec_name": "h264"}},
               {{"index": 1, "codec_type": "audio", "codec_name": "aac"}}"#
        );
        for i in 0..count {
            streams.push_str(&format!(
                r#", {{"index": {}, "codec_type": "subtitle", "codec_name": "subrip"}}"#,
                i + 2
            ));
        }
        let payload = format!(r#"{{"streams": [{streams}], "format": {{"duration": "60.0"}}}}"#);
        ProbeReport::parse(payload.as_bytes()).unwrap()
    }

    fn session(kind: MediaKind) -> Session {
        let asset = AssetDescriptor {
            remote: RemoteRef::new("file-1"),
            file_name: "movie.mkv".into(),
            size_bytes: 1024,
            kind,
        };
        Session::new(1, asset, Path::new("/tmp/work"))
    }

    fn subtitles_section() -> SubtitlesSection {
        SubtitlesSection {
            allowed_extensions: vec!["srt".into(), "ass".into()],
            default_language: "eng".into(),
        }
    }

    fn style() -> BurnStyle {
        BurnStyle {
            font_size: 24,
            font_color: "white".into(),
            background_color: "black@0.5".into(),
            position: VerticalAnchor::Bottom,
        }
    }

    #[test]
    fn full_decision_sequence_reaches_ready() {
        let mut session = session(MediaKind::Video);
        session
            .start_decisions(probe_with_subtitles(3), PathBuf::from("/tmp/work/movie.mkv"))
            .unwrap();
        assert_eq!(session.state, SessionState::AwaitingThumbnailChoice);

        let state = session
            .apply(Decision::Thumbnail(ThumbnailChoice::GenerateFromFrame {
                at_seconds: Some(5.0),
            }))
            .unwrap();
        assert_eq!(state, SessionState::AwaitingSubtitlePlan);

        session.apply(Decision::RemoveSubtitle(1)).unwrap();
        session
            .apply(Decision::AddBurnSubtitle(BurnSpec {
                path: PathBuf::from("/tmp/work/subs/a.srt"),
                style: style(),
            }))
            .unwrap();
        assert_eq!(session.apply(Decision::Continue).unwrap(), SessionState::Ready);
        assert_eq!(session.subtitles.remove.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(session.subtitles.burn.len(), 1);

        session.begin_processing().unwrap();
        session.finish(true);
        assert_eq!(session.state, SessionState::Delivered);
    }

    #[test]
    fn removing_unknown_index_is_rejected_without_mutation() {
        let mut session = session(MediaKind::Video);
        session
            .start_decisions(probe_with_subtitles(2), PathBuf::from("/tmp/x.mkv"))
            .unwrap();
        session
            .apply(Decision::Thumbnail(ThumbnailChoice::None))
            .unwrap();
        let err = session.apply(Decision::RemoveSubtitle(5)).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownSubtitleIndex(5)));
        assert!(session.subtitles.remove.is_empty());
        assert_eq!(session.state, SessionState::AwaitingSubtitlePlan);
    }

    #[test]
    fn audio_skips_subtitle_plan() {
        let mut session = session(MediaKind::Audio);
        session
            .start_decisions(probe_with_subtitles(0), PathBuf::from("/tmp/x.mp3"))
            .unwrap();
        let state = session
            .apply(Decision::Thumbnail(ThumbnailChoice::None))
            .unwrap();
        assert_eq!(state, SessionState::Ready);
    }

    #[test]
    fn timeouts_take_default_branches() {
        let mut session = session(MediaKind::Video);
        session
            .start_decisions(probe_with_subtitles(1), PathBuf::from("/tmp/x.mkv"))
            .unwrap();
        let state = session
            .expire_wait(ThumbnailChoice::GenerateFromFrame { at_seconds: None })
            .unwrap();
        assert_eq!(state, SessionState::AwaitingSubtitlePlan);
        assert_eq!(
            session.thumbnail,
            ThumbnailChoice::GenerateFromFrame { at_seconds: None }
        );
        assert_eq!(
            session.expire_wait(ThumbnailChoice::None).unwrap(),
            SessionState::Ready
        );
        assert!(session.subtitles.is_empty());
        assert!(session.expire_wait(ThumbnailChoice::None).is_err());
    }

    #[test]
    fn precheck_rejects_out_of_state_and_bad_files() {
        let mut session = session(MediaKind::Video);
        session
            .start_decisions(probe_with_subtitles(1), PathBuf::from("/tmp/x.mkv"))
            .unwrap();
        let section = subtitles_section();

        let early = UserChoice::Continue;
        assert!(matches!(
            session.precheck(&early, &section),
            Err(ValidationError::UnexpectedDecision { .. })
        ));

        session
            .apply(Decision::Thumbnail(ThumbnailChoice::None))
            .unwrap();
        let bad_file = UserChoice::AddSoftSubtitle {
            file: RemoteFile {
                remote: RemoteRef::new("doc-7"),
                file_name: "subs.docx".into(),
            },
            language: None,
        };
        assert!(matches!(
            session.precheck(&bad_file, &section),
            Err(ValidationError::UnsupportedSubtitle { .. })
        ));
        assert!(session
            .precheck(&UserChoice::RemoveSubtitle(0), &section)
            .is_ok());
    }

    #[test]
    fn finish_from_waiting_state_fails() {
        let mut session = session(MediaKind::Video);
        session.finish(true);
        assert_eq!(session.state, SessionState::Failed);
        session.finish(true);
        assert_eq!(session.state, SessionState::Failed);
    }
}
