use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use renamer_core::{
    load_renamer_config, AssetDescriptor, BurnStyle, DefaultThumbnail, FfmpegEngine,
    LocalTransport, MediaEngine, MediaKind, OwnerId, OwnerSettings, Pipeline, ProbeReport,
    PromptStep, RemoteFile, RemoteRef, RenamerConfig, SettingsSource, SqliteSettingsStore,
    StaticSettings, StreamKind, ThumbnailChoice, UserChoice, VerticalAnchor,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] renamer_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings error: {0}")]
    Settings(#[from] renamer_core::SettingsError),
    #[error("{0}")]
    Pipeline(#[from] renamer_core::PipelineError),
    #[error("engine error: {0}")]
    Engine(#[from] renamer_core::EngineError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Media renamer pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to the main renamer.toml
    #[arg(long, default_value = "configs/renamer.toml")]
    pub config: PathBuf,
    /// Override for paths.settings_db
    #[arg(long)]
    pub settings_db: Option<PathBuf>,
    /// Override for paths.work_dir
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one local file through the whole pipeline
    Process(ProcessArgs),
    /// Lists the streams of a media file
    Probe(ProbeArgs),
    /// Per-owner preferences
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Checks binaries, directories and the settings database
    Health,
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// File to process
    pub input: PathBuf,
    /// Name to deliver under; defaults to the input's name
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long, default_value = "document")]
    pub kind: MediaKind,
    #[arg(long, default_value_t = 1)]
    pub owner: OwnerId,
    /// Where delivered files land
    #[arg(long, default_value = "outbox")]
    pub outbox: PathBuf,
    /// `generate`, `none`, or a path to an image
    #[arg(long)]
    pub thumbnail: Option<String>,
    /// Frame timestamp in seconds when generating a thumbnail
    #[arg(long)]
    pub at: Option<f64>,
    /// Subtitle stream position to drop (repeatable)
    #[arg(long = "remove-sub")]
    pub remove_sub: Vec<u32>,
    /// Subtitle file to mux as a soft track, `path[:lang]` (repeatable)
    #[arg(long = "soft-sub")]
    pub soft_sub: Vec<String>,
    /// Subtitle file to burn into the picture (repeatable)
    #[arg(long = "burn-sub")]
    pub burn_sub: Vec<PathBuf>,
    #[arg(long)]
    pub font_size: Option<u32>,
    #[arg(long)]
    pub font_color: Option<String>,
    /// Box colour, optionally with `@opacity`
    #[arg(long)]
    pub background: Option<String>,
    #[arg(long)]
    pub position: Option<VerticalAnchor>,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    pub input: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Shows the stored settings of an owner
    Show(SettingsOwnerArgs),
    /// Updates the given fields, keeping the others
    Set(SettingsSetArgs),
    /// Removes everything stored for an owner
    Clear(SettingsOwnerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SettingsOwnerArgs {
    #[arg(long)]
    pub owner: OwnerId,
}

#[derive(Args, Debug, Clone)]
pub struct SettingsSetArgs {
    #[arg(long)]
    pub owner: OwnerId,
    #[arg(long)]
    pub prefix: Option<String>,
    #[arg(long)]
    pub suffix: Option<String>,
    /// Caption with `{filename}`, `{filesize}` and `{duration}` placeholders
    #[arg(long)]
    pub caption: Option<String>,
    /// Image used when a thumbnail prompt goes unanswered
    #[arg(long)]
    pub default_thumbnail: Option<String>,
    /// Enables metadata injection with this value
    #[arg(long, conflicts_with = "no_metadata")]
    pub metadata: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_metadata: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "renamerctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Process(args) => {
            let summary = runtime.block_on(context.process(args))?;
            render(&summary, cli.format)?;
        }
        Commands::Probe(args) => {
            let report = runtime.block_on(context.probe(&args.input))?;
            render(&report, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Show(args)) => {
            let view = context.settings_show(args.owner)?;
            render(&view, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Set(args)) => {
            let view = context.settings_set(args)?;
            render(&view, cli.format)?;
        }
        Commands::Settings(SettingsCommands::Clear(args)) => {
            let removed = context.settings_clear(args.owner)?;
            render(&removed, cli.format)?;
        }
        Commands::Health => {
            let report = runtime.block_on(context.health_check());
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: RenamerConfig,
    config_path: PathBuf,
    settings_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_renamer_config(&cli.config)?;
        if let Some(work_dir) = &cli.work_dir {
            config.paths.work_dir = work_dir.to_string_lossy().into_owned();
        }
        let settings_db = cli
            .settings_db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.paths.settings_db));
        Ok(Self {
            config,
            config_path: cli.config.clone(),
            settings_db,
        })
    }

    fn engine(&self) -> FfmpegEngine {
        FfmpegEngine::from_config(&self.config.engine)
    }

    fn settings_source(&self) -> Result<Arc<dyn SettingsSource>> {
        if self.settings_db.exists() {
            let store = SqliteSettingsStore::builder()
                .path(&self.settings_db)
                .read_only(true)
                .build()?;
            Ok(Arc::new(store))
        } else {
            Ok(Arc::new(StaticSettings::new()))
        }
    }

    fn writable_settings(&self) -> Result<SqliteSettingsStore> {
        if let Some(parent) = self.settings_db.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = SqliteSettingsStore::builder()
            .path(&self.settings_db)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    async fn process(&self, args: &ProcessArgs) -> Result<ProcessSummary> {
        let metadata = fs::metadata(&args.input).map_err(|err| {
            AppError::MissingResource(format!("{}: {err}", args.input.display()))
        })?;
        let file_name = match &args.name {
            Some(name) => name.clone(),
            None => file_name_of(&args.input)?,
        };
        let script = DecisionScript::from_args(args, &self.config)?;

        let (transport, mut prompts) = LocalTransport::new(&args.outbox).with_prompt_channel();
        let transport = Arc::new(transport);
        let pipeline = Arc::new(Pipeline::new(
            self.config.clone(),
            Arc::new(self.engine()),
            transport.clone(),
            self.settings_source()?,
        ));

        let dispatcher = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                while let Some(notice) = prompts.recv().await {
                    for choice in script.choices_for(notice.prompt.step) {
                        let label = choice.label();
                        if let Err(err) = pipeline.dispatch(notice.owner, notice.token, choice) {
                            warn!(owner = notice.owner, choice = label, error = %err, "choice rejected");
                        }
                    }
                }
            })
        };

        let asset = AssetDescriptor {
            remote: RemoteRef::new(args.input.to_string_lossy()),
            file_name,
            size_bytes: metadata.len(),
            kind: args.kind,
        };
        info!(owner = args.owner, file = %asset.file_name, "processing local file");
        let outcome = pipeline.process(args.owner, asset).await;
        dispatcher.abort();
        let receipt = outcome?;

        let record = transport
            .deliveries()
            .pop()
            .ok_or_else(|| AppError::MissingResource("delivery record".to_string()))?;
        Ok(ProcessSummary {
            owner: args.owner,
            shape: receipt.shape.to_string(),
            caption: receipt.caption,
            attempts: receipt.attempts,
            delivered: record.path,
            thumbnail: record.thumbnail,
        })
    }

    async fn probe(&self, input: &Path) -> Result<ProbeReport> {
        Ok(self.engine().probe(input).await?)
    }

    fn settings_show(&self, owner: OwnerId) -> Result<SettingsView> {
        let settings = if self.settings_db.exists() {
            SqliteSettingsStore::builder()
                .path(&self.settings_db)
                .read_only(true)
                .build()?
                .get(owner)?
        } else {
            None
        };
        Ok(SettingsView {
            owner,
            stored: settings.is_some(),
            settings: settings.unwrap_or_default(),
        })
    }

    fn settings_set(&self, args: &SettingsSetArgs) -> Result<SettingsView> {
        let store = self.writable_settings()?;
        let mut settings = store.get(args.owner)?.unwrap_or_default();
        apply_settings_update(&mut settings, args);
        store.upsert(args.owner, &settings)?;
        info!(owner = args.owner, "settings updated");
        Ok(SettingsView {
            owner: args.owner,
            stored: true,
            settings,
        })
    }

    fn settings_clear(&self, owner: OwnerId) -> Result<SettingsRemoval> {
        let removed = if self.settings_db.exists() {
            self.writable_settings()?.delete(owner)?
        } else {
            false
        };
        Ok(SettingsRemoval { owner, removed })
    }

    async fn health_check(&self) -> Vec<HealthEntry> {
        let mut entries = Vec::new();
        entries.push(HealthEntry::ok(
            "config",
            format!("{} loaded", self.config_path.display()),
        ));

        let engine = self.engine();
        for binary in engine.binaries() {
            let name = binary.display().to_string();
            match engine.version_of(binary).await {
                Ok(version) if !version.is_empty() => entries.push(HealthEntry::ok(name, version)),
                Ok(_) => entries.push(HealthEntry::warn(name, "no version reported")),
                Err(err) => entries.push(HealthEntry::error(name, err.to_string())),
            }
        }

        let work_dir = self.config.work_dir();
        match fs::create_dir_all(&work_dir) {
            Ok(()) => entries.push(HealthEntry::ok(
                "work_dir",
                format!("{} writable", work_dir.display()),
            )),
            Err(err) => entries.push(HealthEntry::error(
                "work_dir",
                format!("{}: {err}", work_dir.display()),
            )),
        }

        if self.settings_db.exists() {
            let probe = SqliteSettingsStore::builder()
                .path(&self.settings_db)
                .read_only(true)
                .build()
                .and_then(|store| store.get(0));
            match probe {
                Ok(_) => entries.push(HealthEntry::ok(
                    "settings_db",
                    self.settings_db.display().to_string(),
                )),
                Err(err) => entries.push(HealthEntry::error("settings_db", err.to_string())),
            }
        } else {
            entries.push(HealthEntry::warn(
                "settings_db",
                format!("{} missing, defaults apply", self.settings_db.display()),
            ));
        }

        entries
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidArgument(format!("{} has no file name", path.display())))
}

fn apply_settings_update(settings: &mut OwnerSettings, args: &SettingsSetArgs) {
    if let Some(prefix) = &args.prefix {
        settings.prefix = non_blank(prefix);
    }
    if let Some(suffix) = &args.suffix {
        settings.suffix = non_blank(suffix);
    }
    if let Some(caption) = &args.caption {
        settings.caption_template = non_blank(caption);
    }
    if let Some(thumbnail) = &args.default_thumbnail {
        settings.default_thumbnail = non_blank(thumbnail).map(RemoteRef);
    }
    if let Some(value) = &args.metadata {
        settings.metadata_enabled = true;
        settings.metadata_value = non_blank(value);
    }
    if args.no_metadata {
        settings.metadata_enabled = false;
    }
}

/// An empty argument clears the field.
fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Answers the pipeline's prompts from command-line flags.
#[derive(Debug, Clone)]
struct DecisionScript {
    thumbnail: ThumbnailChoice,
    subtitles: Vec<UserChoice>,
}

impl DecisionScript {
    fn from_args(args: &ProcessArgs, config: &RenamerConfig) -> Result<Self> {
        let thumbnail = match args.thumbnail.as_deref() {
            None => match config.decisions.default_thumbnail {
                DefaultThumbnail::Generate => {
                    ThumbnailChoice::GenerateFromFrame { at_seconds: args.at }
                }
                DefaultThumbnail::None => ThumbnailChoice::None,
            },
            Some("generate") => ThumbnailChoice::GenerateFromFrame { at_seconds: args.at },
            Some("none") => ThumbnailChoice::None,
            Some(path) => {
                if !Path::new(path).is_file() {
                    return Err(AppError::MissingResource(format!("thumbnail {path}")));
                }
                ThumbnailChoice::Custom(RemoteRef::new(path))
            }
        };

        let mut subtitles: Vec<UserChoice> = args
            .remove_sub
            .iter()
            .map(|position| UserChoice::RemoveSubtitle(*position))
            .collect();
        for entry in &args.soft_sub {
            let (path, language) = split_language(entry);
            subtitles.push(UserChoice::AddSoftSubtitle {
                file: remote_file(Path::new(path))?,
                language,
            });
        }
        let style = burn_style(args, config);
        for path in &args.burn_sub {
            subtitles.push(UserChoice::AddBurnSubtitle {
                file: remote_file(path)?,
                style: style.clone(),
            });
        }
        subtitles.push(UserChoice::Continue);

        Ok(Self {
            thumbnail,
            subtitles,
        })
    }

    fn choices_for(&self, step: PromptStep) -> Vec<UserChoice> {
        match step {
            PromptStep::Thumbnail => vec![UserChoice::Thumbnail(self.thumbnail.clone())],
            PromptStep::SubtitlePlan => self.subtitles.clone(),
        }
    }
}

/// Splits `path[:lang]`; a suffix only counts as a language when it is a
/// short alphabetic code, so Windows drive letters stay in the path.
fn split_language(entry: &str) -> (&str, Option<String>) {
    match entry.rsplit_once(':') {
        Some((path, lang))
            if !path.is_empty()
                && (2..=3).contains(&lang.len())
                && lang.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            (path, Some(lang.to_ascii_lowercase()))
        }
        _ => (entry, None),
    }
}

fn remote_file(path: &Path) -> Result<RemoteFile> {
    if !path.is_file() {
        return Err(AppError::MissingResource(format!(
            "subtitle {}",
            path.display()
        )));
    }
    Ok(RemoteFile {
        remote: RemoteRef::new(path.to_string_lossy()),
        file_name: file_name_of(path)?,
    })
}

/// `None` when no style flag was given, letting the configured style apply.
fn burn_style(args: &ProcessArgs, config: &RenamerConfig) -> Option<BurnStyle> {
    if args.font_size.is_none()
        && args.font_color.is_none()
        && args.background.is_none()
        && args.position.is_none()
    {
        return None;
    }
    let mut style = config.burn.default_style();
    if let Some(size) = args.font_size {
        style.font_size = size;
    }
    if let Some(color) = &args.font_color {
        style.font_color = color.clone();
    }
    if let Some(background) = &args.background {
        style.background_color = background.clone();
    }
    if let Some(position) = args.position {
        style.position = position;
    }
    Some(style)
}

#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub owner: OwnerId,
    pub shape: String,
    pub caption: String,
    pub attempts: u32,
    pub delivered: PathBuf,
    pub thumbnail: Option<PathBuf>,
}

impl DisplayFallback for ProcessSummary {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Delivered as {}: {}", self.shape, self.delivered.display()),
            format!("Caption: {}", self.caption),
            format!("Attempts: {}", self.attempts),
        ];
        match &self.thumbnail {
            Some(path) => lines.push(format!("Thumbnail: {}", path.display())),
            None => lines.push("Thumbnail: none".to_string()),
        }
        lines.join("\n")
    }
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        let duration = self
            .duration_seconds
            .map(|seconds| format!("{seconds:.1}s"))
            .unwrap_or_else(|| "unknown".to_string());
        lines.push(format!(
            "Format: {} ({duration})",
            self.format_name.as_deref().unwrap_or("unknown")
        ));
        let mut subtitle_position = 0;
        for stream in &self.streams {
            let codec = stream.codec_name.as_deref().unwrap_or("?");
            let language = stream.language.as_deref().unwrap_or("und");
            let title = stream.title.as_deref().unwrap_or("");
            if stream.kind == StreamKind::Subtitle {
                lines.push(format!(
                    "#{} subtitle [{subtitle_position}] {codec} {language} {title}",
                    stream.index
                ));
                subtitle_position += 1;
            } else {
                lines.push(format!(
                    "#{} {:?} {codec} {language} {title}",
                    stream.index, stream.kind
                ));
            }
        }
        lines
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsView {
    pub owner: OwnerId,
    pub stored: bool,
    pub settings: OwnerSettings,
}

impl DisplayFallback for SettingsView {
    fn display(&self) -> String {
        let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        let mut lines = vec![format!(
            "Owner {}{}",
            self.owner,
            if self.stored { "" } else { " (defaults)" }
        )];
        lines.push(format!("  prefix: {}", field(&self.settings.prefix)));
        lines.push(format!("  suffix: {}", field(&self.settings.suffix)));
        lines.push(format!(
            "  caption: {}",
            field(&self.settings.caption_template)
        ));
        lines.push(format!(
            "  default thumbnail: {}",
            self.settings
                .default_thumbnail
                .as_ref()
                .map(RemoteRef::to_string)
                .unwrap_or_else(|| "-".to_string())
        ));
        lines.push(format!(
            "  metadata: {}",
            match self.settings.metadata() {
                Some(value) => value.to_string(),
                None => "off".to_string(),
            }
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsRemoval {
    pub owner: OwnerId,
    pub removed: bool,
}

impl DisplayFallback for SettingsRemoval {
    fn display(&self) -> String {
        if self.removed {
            format!("Owner {} settings removed", self.owner)
        } else {
            format!("Owner {} had no stored settings", self.owner)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}
