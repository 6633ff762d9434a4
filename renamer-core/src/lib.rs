pub mod cleanup;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod sqlite;
pub mod thumbnail;
pub mod transform;
pub mod transport;

pub use cleanup::{ArtifactLedger, CleanupCoordinator, CleanupReport};
pub use config::{
    load_renamer_config, BurnSection, DecisionsSection, DefaultThumbnail, DeliverySection,
    EngineSection, LimitsSection, PathsSection, RenamerConfig, SubtitlesSection,
    ThumbnailSection,
};
pub use delivery::{
    format_duration, humanbytes, render_caption, upload_shape, DeliveryInput, DeliveryReceipt,
    DeliveryStage, UploadProgress,
};
pub use engine::{
    CommandOutput, CommandRunner, EngineError, EngineInvocation, EngineOutcome, EngineResult,
    FfmpegEngine, MediaEngine, ProbeReport, StreamInfo, StreamKind, SystemCommandRunner,
};
pub use error::{ConfigError, Result};
pub use intake::{decorate_file_name, sanitize_file_name, validate_asset, IntakeStage};
pub use pipeline::{
    ActiveSession, Pipeline, PipelineError, PipelineResult, TransformFailure, ValidationError,
};
pub use session::{
    AssetDescriptor, BurnSpec, BurnStyle, Decision, MediaKind, OwnerId, RemoteFile, RemoteRef,
    Session, SessionHandle, SessionState, SessionStore, SessionToken, SoftSubtitle,
    SubtitlePlan, ThumbnailChoice, UserChoice, VerticalAnchor,
};
pub use settings::{
    OwnerSettings, SettingsError, SettingsResult, SettingsSource, SqliteSettingsStore,
    SqliteSettingsStoreBuilder, StaticSettings,
};
pub use thumbnail::{frame_timestamp, ThumbnailRequest, ThumbnailResolver};
pub use transform::{build_chain, ChainObserver, PlannedStage, TransformChain, TransformKind, TransformOp};
pub use transport::{
    DeliveryRecord, LocalTransport, Prompt, PromptNotice, PromptStep, ProgressFn, Transport,
    TransportError, TransportResult, UploadRequest, UploadShape,
};
