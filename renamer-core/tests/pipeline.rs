use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use renamer_core::config::{load_renamer_config, RenamerConfig};
use renamer_core::engine::{EngineInvocation, EngineOutcome, EngineResult, MediaEngine, ProbeReport};
use renamer_core::pipeline::{Pipeline, PipelineError, ValidationError};
use renamer_core::session::{
    AssetDescriptor, MediaKind, OwnerId, RemoteFile, RemoteRef, ThumbnailChoice, UserChoice,
};
use renamer_core::settings::{OwnerSettings, StaticSettings};
use renamer_core::transform::TransformKind;
use renamer_core::transport::{LocalTransport, PromptNotice, PromptStep, UploadShape};

const VIDEO_WITH_THREE_SUBS: &str = r#"{
    "streams": [
        {"index": 0, "codec_type": "video", "codec_name": "h264"},
        {"index": 1, "codec_type": "audio", "codec_name": "aac"},
        {"index": 2, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "eng"}},
        {"index": 3, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "spa"}},
        {"index": 4, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "por"}}
    ],
    "format": {"duration": "95.500000", "format_name": "matroska,webm"}
}"#;

/// Writes every declared output unless its stage label is listed in `fail_on`.
/// With `hold_first_run` set, the first transform signals `entered` and then
/// waits on `release`.
struct FakeEngine {
    probe: ProbeReport,
    fail_on: Vec<&'static str>,
    runs: Mutex<Vec<String>>,
    hold_first_run: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl FakeEngine {
    fn new(fail_on: Vec<&'static str>) -> Self {
        Self {
            probe: ProbeReport::parse(VIDEO_WITH_THREE_SUBS.as_bytes()).unwrap(),
            fail_on,
            runs: Mutex::new(Vec::new()),
            hold_first_run: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn holding_first_run() -> Self {
        let engine = Self::new(vec![]);
        engine.hold_first_run.store(true, Ordering::SeqCst);
        engine
    }

    fn labels(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn probe(&self, input: &Path) -> EngineResult<ProbeReport> {
        assert!(input.exists());
        Ok(self.probe.clone())
    }

    async fn run(&self, invocation: &EngineInvocation) -> EngineOutcome {
        self.runs.lock().unwrap().push(invocation.label.clone());
        if self.hold_first_run.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail_on.contains(&invocation.label.as_str()) {
            return EngineOutcome::inspect(
                &invocation.output,
                format!("simulated {} failure", invocation.label),
                Some(0),
            )
            .await;
        }
        let mut bytes = std::fs::read(&invocation.inputs[0]).unwrap();
        bytes.extend_from_slice(invocation.label.as_bytes());
        std::fs::write(&invocation.output, bytes).unwrap();
        EngineOutcome::inspect(&invocation.output, "", Some(0)).await
    }

    async fn extract_frame(&self, input: &Path, _at: f64, output: &Path) -> EngineOutcome {
        assert!(input.exists());
        image::RgbImage::from_pixel(640, 360, image::Rgb([20, 40, 60]))
            .save(output)
            .unwrap();
        EngineOutcome::inspect(output, "", Some(0)).await
    }
}

fn fixture_config(base: &TempDir) -> RenamerConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/renamer.toml");
    let mut config = load_renamer_config(path).unwrap();
    config.paths.work_dir = base.path().join("work").to_string_lossy().to_string();
    config
}

fn write_source(base: &TempDir, name: &str, bytes: &[u8]) -> AssetDescriptor {
    let dir = base.path().join("source");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    AssetDescriptor {
        remote: RemoteRef::new(path.to_string_lossy()),
        file_name: name.to_string(),
        size_bytes: bytes.len() as u64,
        kind: MediaKind::Video,
    }
}

fn remaining_entries(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .map(|entry| entry.path().to_path_buf())
        .collect()
}

struct Harness {
    base: TempDir,
    pipeline: Arc<Pipeline>,
    transport: Arc<LocalTransport>,
    engine: Arc<FakeEngine>,
    prompts: Option<UnboundedReceiver<PromptNotice>>,
}

impl Harness {
    fn new(fail_on: Vec<&'static str>, settings: StaticSettings) -> Self {
        Self::build(FakeEngine::new(fail_on), settings, |_| {})
    }

    fn build<F>(engine: FakeEngine, settings: StaticSettings, adjust: F) -> Self
    where
        F: FnOnce(&mut RenamerConfig),
    {
        let base = TempDir::new().unwrap();
        let mut config = fixture_config(&base);
        adjust(&mut config);
        let (transport, prompts) =
            LocalTransport::new(base.path().join("outbox")).with_prompt_channel();
        let transport = Arc::new(transport);
        let engine = Arc::new(engine);
        let pipeline = Arc::new(Pipeline::new(
            config,
            engine.clone(),
            transport.clone(),
            Arc::new(settings),
        ));
        Self {
            base,
            pipeline,
            transport,
            engine,
            prompts: Some(prompts),
        }
    }

    fn work_dir(&self) -> PathBuf {
        self.base.path().join("work")
    }

    /// Answers every prompt with the choices `script` returns for it.
    fn drive<F>(&mut self, script: F) -> JoinHandle<()>
    where
        F: Fn(&PromptNotice) -> Vec<UserChoice> + Send + 'static,
    {
        let mut prompts = self.prompts.take().unwrap();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            while let Some(notice) = prompts.recv().await {
                for choice in script(&notice) {
                    pipeline
                        .dispatch(notice.owner, notice.token, choice)
                        .unwrap();
                }
            }
        })
    }
}

#[tokio::test]
async fn delivered_session_leaves_nothing_behind() {
    let settings = StaticSettings::new().with_owner(
        1,
        OwnerSettings {
            prefix: Some("[HD]".into()),
            caption_template: Some("{filename} • {filesize}".into()),
            metadata_enabled: true,
            metadata_value: Some("@renamer".into()),
            ..OwnerSettings::default()
        },
    );
    let mut harness = Harness::new(vec![], settings);
    let driver = harness.drive(|notice| match notice.prompt.step {
        PromptStep::Thumbnail => vec![UserChoice::Thumbnail(ThumbnailChoice::GenerateFromFrame {
            at_seconds: Some(12.0),
        })],
        PromptStep::SubtitlePlan => {
            assert_eq!(notice.prompt.subtitle_streams.len(), 3);
            vec![UserChoice::RemoveSubtitle(1), UserChoice::Continue]
        }
    });
    let asset = write_source(&harness.base, "movie.mkv", b"matroska bytes");

    let receipt = harness.pipeline.process(1, asset).await.unwrap();
    driver.abort();

    assert_eq!(receipt.shape, UploadShape::Video);
    assert_eq!(receipt.attempts, 1);
    assert!(receipt.caption.starts_with("[HD] movie.mkv • "));
    assert_eq!(harness.engine.labels(), vec!["remove-subs", "inject-metadata"]);

    let delivered = harness.transport.deliveries();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].path.ends_with("1/[HD] movie.mkv"));
    assert_eq!(
        std::fs::read(&delivered[0].path).unwrap(),
        b"matroska bytesremove-subsinject-metadata"
    );
    assert_eq!(delivered[0].duration_seconds, Some(96));
    let thumb = image::open(delivered[0].thumbnail.as_ref().unwrap()).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (320, 180));

    assert!(remaining_entries(&harness.work_dir()).is_empty());
    assert!(harness.transport.statuses().is_empty());
    assert!(harness.pipeline.store().is_empty());
}

#[tokio::test]
async fn transform_failure_is_reported_and_cleaned_up() {
    let mut harness = Harness::new(vec!["burn-sub"], StaticSettings::new());
    let subs = harness.base.path().join("source").join("burn.srt");
    std::fs::create_dir_all(subs.parent().unwrap()).unwrap();
    std::fs::write(&subs, b"1\n00:00:00,000 --> 00:00:01,000\nhi\n").unwrap();
    let subs_ref = RemoteRef::new(subs.to_string_lossy());
    let driver = harness.drive(move |notice| match notice.prompt.step {
        PromptStep::Thumbnail => vec![UserChoice::Thumbnail(ThumbnailChoice::None)],
        PromptStep::SubtitlePlan => vec![
            UserChoice::RemoveSubtitle(0),
            UserChoice::AddBurnSubtitle {
                file: RemoteFile {
                    remote: subs_ref.clone(),
                    file_name: "burn.srt".into(),
                },
                style: None,
            },
            UserChoice::Continue,
        ],
    });
    let asset = write_source(&harness.base, "clip.mp4", b"mp4 bytes");

    let err = harness.pipeline.process(2, asset).await.unwrap_err();
    driver.abort();

    match err {
        PipelineError::Transform(failure) => {
            assert_eq!(failure.stage, 2);
            assert_eq!(failure.kind, TransformKind::BurnSub);
            assert_eq!(failure.diagnostics, "simulated burn-sub failure");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.engine.labels(), vec!["remove-subs", "burn-sub"]);
    assert!(harness.transport.deliveries().is_empty());
    assert!(remaining_entries(&harness.work_dir()).is_empty());

    let statuses = harness.transport.statuses();
    let last = statuses.values().next().unwrap();
    assert!(last.starts_with("Error: stage 2 (burn-sub) failed"), "{last}");
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompts_fall_back_to_defaults() {
    let harness = Harness::new(vec![], StaticSettings::new());
    let asset = write_source(&harness.base, "talk.mkv", b"bytes");
    let started = tokio::time::Instant::now();

    let receipt = harness.pipeline.process(3, asset).await.unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(60 + 120), "{waited:?}");
    assert!(waited < Duration::from_secs(60 + 120 + 5), "{waited:?}");
    assert_eq!(receipt.caption, "**talk.mkv**");
    assert!(harness.engine.labels().is_empty());
    let delivered = harness.transport.deliveries();
    assert!(delivered[0].thumbnail.is_some(), "default generates a frame");
    assert!(remaining_entries(&harness.work_dir()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stored_default_thumbnail_wins_on_timeout() {
    let base_image = TempDir::new().unwrap();
    let custom = base_image.path().join("cover.png");
    image::RgbImage::from_pixel(100, 400, image::Rgb([250, 0, 0]))
        .save(&custom)
        .unwrap();
    let settings = StaticSettings::new().with_owner(
        4,
        OwnerSettings {
            default_thumbnail: Some(RemoteRef::new(custom.to_string_lossy())),
            ..OwnerSettings::default()
        },
    );
    let harness = Harness::new(vec![], settings);
    let asset = write_source(&harness.base, "ep01.mkv", b"bytes");

    harness.pipeline.process(4, asset).await.unwrap();

    let delivered = harness.transport.deliveries();
    let thumb = image::open(delivered[0].thumbnail.as_ref().unwrap()).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (80, 320));
}

#[tokio::test(start_paused = true)]
async fn unreachable_default_thumbnail_falls_back_to_a_frame() {
    let settings = StaticSettings::new().with_owner(
        8,
        OwnerSettings {
            default_thumbnail: Some(RemoteRef::new("/nonexistent/cover.png")),
            ..OwnerSettings::default()
        },
    );
    let harness = Harness::new(vec![], settings);
    let asset = write_source(&harness.base, "ep02.mkv", b"bytes");

    harness.pipeline.process(8, asset).await.unwrap();

    let delivered = harness.transport.deliveries();
    let thumb = image::open(delivered[0].thumbnail.as_ref().unwrap()).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (320, 180));
    assert!(remaining_entries(&harness.work_dir()).is_empty());
}

#[tokio::test]
async fn oversized_asset_never_creates_a_session() {
    let harness = Harness::new(vec![], StaticSettings::new());
    let mut asset = write_source(&harness.base, "huge.mkv", b"x");
    asset.size_bytes = 2 * 1024 * 1024 * 1024 + 1;

    let err = harness.pipeline.submit(5, asset).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::AssetTooLarge { .. })
    ));
    assert!(harness.pipeline.store().is_empty());
    assert!(!harness.work_dir().exists());
    assert!(harness.transport.statuses().is_empty());
}

#[tokio::test]
async fn new_intake_supersedes_and_cleans_previous_session() {
    let harness = Harness::new(vec![], StaticSettings::new());
    let first = harness
        .pipeline
        .submit(6, write_source(&harness.base, "first.mkv", b"one"))
        .await
        .unwrap();
    let first_dir = first.handle.work_dir.clone();
    assert!(first_dir.join("asset").join("first.mkv").exists());

    let second = harness
        .pipeline
        .submit(6, write_source(&harness.base, "second.mkv", b"two"))
        .await
        .unwrap();
    assert!(!first_dir.exists());
    assert!(second.handle.work_dir.join("asset").join("second.mkv").exists());

    let stale = harness
        .pipeline
        .dispatch(6, first.token(), UserChoice::Thumbnail(ThumbnailChoice::None))
        .unwrap_err();
    assert!(matches!(stale, PipelineError::SessionExpired { owner: 6, .. }));

    let second_token = second.token();
    assert!(harness.pipeline.run(first).await.is_err());
    assert_eq!(
        harness.pipeline.store().get(6).map(|session| session.token),
        Some(second_token)
    );

    harness
        .pipeline
        .dispatch(6, second_token, UserChoice::Thumbnail(ThumbnailChoice::None))
        .unwrap();
    harness
        .pipeline
        .dispatch(6, second_token, UserChoice::Continue)
        .unwrap_err();
}

#[tokio::test]
async fn asset_named_like_generated_artifacts_is_delivered_intact() {
    let mut harness = Harness::new(vec![], StaticSettings::new());
    let driver = harness.drive(|notice| match notice.prompt.step {
        PromptStep::Thumbnail => vec![UserChoice::Thumbnail(ThumbnailChoice::GenerateFromFrame {
            at_seconds: None,
        })],
        PromptStep::SubtitlePlan => vec![UserChoice::RemoveSubtitle(0), UserChoice::Continue],
    });
    let names = [
        "thumb.jpg",
        "frame.jpg",
        "thumb-source",
        "subs",
        "asset",
        "stage-01-remove-subs",
    ];

    for (owner, name) in (40..).zip(names) {
        let asset = write_source(&harness.base, name, b"ORIGINAL USER BYTES");
        let receipt = harness.pipeline.process(owner, asset).await.unwrap();
        assert_eq!(receipt.attempts, 1, "{name}");
    }
    driver.abort();

    let delivered = harness.transport.deliveries();
    assert_eq!(delivered.len(), names.len());
    for (record, name) in delivered.iter().zip(names) {
        assert!(record.path.ends_with(name), "{:?}", record.path);
        assert_eq!(
            std::fs::read(&record.path).unwrap(),
            b"ORIGINAL USER BYTESremove-subs",
            "{name}"
        );
        let thumb = image::open(record.thumbnail.as_ref().unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (320, 180), "{name}");
    }
    assert!(remaining_entries(&harness.work_dir()).is_empty());
}

#[tokio::test]
async fn superseding_during_a_transform_leaves_only_the_new_session() {
    let mut harness = Harness::build(FakeEngine::holding_first_run(), StaticSettings::new(), |_| {});
    let driver = harness.drive(|notice| match notice.prompt.step {
        PromptStep::Thumbnail => vec![UserChoice::Thumbnail(ThumbnailChoice::None)],
        PromptStep::SubtitlePlan => vec![UserChoice::RemoveSubtitle(0), UserChoice::Continue],
    });
    let first = {
        let pipeline = harness.pipeline.clone();
        let asset = write_source(&harness.base, "first.mkv", b"one");
        tokio::spawn(async move { pipeline.process(20, asset).await })
    };
    harness.engine.entered.notified().await;
    let first_dir = harness.pipeline.store().get(20).unwrap().work_dir;
    assert!(first_dir.join("stage-01-remove-subs").exists());

    let second = harness
        .pipeline
        .submit(20, write_source(&harness.base, "second.mkv", b"two"))
        .await
        .unwrap();
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled), "{err}");

    let second_dir = second.handle.work_dir.clone();
    let owner_dir = second_dir.parent().unwrap().to_path_buf();
    assert!(!first_dir.exists());
    let leftovers = remaining_entries(&harness.work_dir());
    assert!(leftovers.contains(&second_dir.join("asset").join("second.mkv")));
    for entry in &leftovers {
        assert!(
            *entry == owner_dir || entry.starts_with(&second_dir),
            "left behind: {entry:?}"
        );
    }

    harness.pipeline.run(second).await.unwrap();
    driver.abort();

    assert_eq!(harness.engine.labels(), vec!["remove-subs", "remove-subs"]);
    let delivered = harness.transport.deliveries();
    assert_eq!(delivered.len(), 1);
    assert_eq!(std::fs::read(&delivered[0].path).unwrap(), b"tworemove-subs");
    assert!(remaining_entries(&harness.work_dir()).is_empty());
    assert!(harness.pipeline.store().is_empty());
}

#[tokio::test]
async fn expired_sessions_are_swept_with_their_files() {
    let harness = Harness::build(FakeEngine::new(vec![]), StaticSettings::new(), |config| {
        config.limits.session_max_age_seconds = 0;
    });
    let active = harness
        .pipeline
        .submit(30, write_source(&harness.base, "late.mkv", b"late"))
        .await
        .unwrap();
    let token = active.token();
    assert!(active.handle.work_dir.join("asset").join("late.mkv").exists());

    assert_eq!(harness.pipeline.sweep_expired().await, 1);

    assert!(harness.pipeline.store().is_empty());
    assert!(remaining_entries(&harness.work_dir()).is_empty());
    let stale = harness
        .pipeline
        .dispatch(30, token, UserChoice::Thumbnail(ThumbnailChoice::None))
        .unwrap_err();
    assert!(matches!(stale, PipelineError::SessionExpired { owner: 30, .. }));
    assert!(harness.pipeline.run(active).await.is_err());
    assert!(remaining_entries(&harness.work_dir()).is_empty());
    assert_eq!(harness.pipeline.sweep_expired().await, 0);
}

#[tokio::test]
async fn invalid_choices_are_rejected_at_dispatch() {
    let harness = Harness::new(vec![], StaticSettings::new());
    let active = harness
        .pipeline
        .submit(7, write_source(&harness.base, "a.mkv", b"a"))
        .await
        .unwrap();
    let token = active.token();

    let early = harness
        .pipeline
        .dispatch(7, token, UserChoice::RemoveSubtitle(0))
        .unwrap_err();
    assert!(matches!(
        early,
        PipelineError::Validation(ValidationError::UnexpectedDecision { .. })
    ));

    harness
        .pipeline
        .dispatch(7, token, UserChoice::Thumbnail(ThumbnailChoice::None))
        .unwrap();
    let run = {
        let pipeline = harness.pipeline.clone();
        tokio::spawn(async move { pipeline.run(active).await })
    };
    while harness.pipeline.store().get(7).map(|s| s.state.as_str())
        != Some("awaiting_subtitle_plan")
    {
        tokio::task::yield_now().await;
    }

    let unknown = harness
        .pipeline
        .dispatch(7, token, UserChoice::RemoveSubtitle(9))
        .unwrap_err();
    assert!(matches!(
        unknown,
        PipelineError::Validation(ValidationError::UnknownSubtitleIndex(9))
    ));
    let unsupported = harness
        .pipeline
        .dispatch(
            7,
            token,
            UserChoice::AddSoftSubtitle {
                file: RemoteFile {
                    remote: RemoteRef::new("/nowhere/notes.docx"),
                    file_name: "notes.docx".into(),
                },
                language: None,
            },
        )
        .unwrap_err();
    assert!(matches!(
        unsupported,
        PipelineError::Validation(ValidationError::UnsupportedSubtitle { .. })
    ));

    harness
        .pipeline
        .dispatch(7, token, UserChoice::Continue)
        .unwrap();
    run.await.unwrap().unwrap();
    assert!(harness.engine.labels().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_owners_complete_independently() {
    let mut harness = Harness::new(vec![], StaticSettings::new());
    let driver = harness.drive(|notice| match notice.prompt.step {
        PromptStep::Thumbnail => vec![UserChoice::Thumbnail(ThumbnailChoice::None)],
        PromptStep::SubtitlePlan => vec![
            UserChoice::RemoveSubtitle((notice.owner % 3) as u32),
            UserChoice::Continue,
        ],
    });

    let mut runs = Vec::new();
    for owner in 10..16 as OwnerId {
        let asset = write_source(&harness.base, &format!("owner-{owner}.mkv"), b"payload");
        let pipeline = harness.pipeline.clone();
        runs.push(tokio::spawn(async move { pipeline.process(owner, asset).await }));
    }
    for run in runs {
        run.await.unwrap().unwrap();
    }
    driver.abort();

    let mut delivered: Vec<(OwnerId, String)> = harness
        .transport
        .deliveries()
        .into_iter()
        .map(|record| {
            let name = record.path.file_name().unwrap().to_string_lossy().to_string();
            (record.owner, name)
        })
        .collect();
    delivered.sort();
    let expected: Vec<(OwnerId, String)> = (10..16)
        .map(|owner| (owner, format!("owner-{owner}.mkv")))
        .collect();
    assert_eq!(delivered, expected);
    assert!(remaining_entries(&harness.work_dir()).is_empty());
    assert!(harness.pipeline.store().is_empty());
}
