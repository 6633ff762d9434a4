//! Per-asset orchestration: intake, decisions, transform chain, thumbnail,
//! delivery, and a cleanup that runs exactly once however the session ends.

mod error;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::cleanup::{ArtifactLedger, CleanupCoordinator};
use crate::config::{DefaultThumbnail, RenamerConfig};
use crate::delivery::{DeliveryInput, DeliveryReceipt, DeliveryStage};
use crate::engine::MediaEngine;
use crate::intake::{decorate_file_name, validate_asset, IntakeStage};
use crate::session::{
    AssetDescriptor, BurnSpec, Decision, OwnerId, RemoteRef, Session, SessionHandle, SessionState,
    SessionStore, SessionToken, SoftSubtitle, ThumbnailChoice, UserChoice,
};
use crate::settings::{OwnerSettings, SettingsSource};
use crate::thumbnail::{ThumbnailRequest, ThumbnailResolver};
use crate::transform::{build_chain, ChainObserver, PlannedStage, TransformChain};
use crate::transport::{Prompt, PromptStep, Transport};

pub use error::{PipelineError, PipelineResult, TransformFailure, ValidationError};

/// A session that finished intake and is waiting to be driven by [`Pipeline::run`].
#[derive(Debug)]
pub struct ActiveSession {
    pub handle: SessionHandle,
    status: Option<RemoteRef>,
    settings: OwnerSettings,
}

impl ActiveSession {
    pub fn owner(&self) -> OwnerId {
        self.handle.owner
    }

    pub fn token(&self) -> SessionToken {
        self.handle.token
    }
}

struct RunContext {
    owner: OwnerId,
    token: SessionToken,
    ledger: ArtifactLedger,
    work_dir: PathBuf,
    status: Option<RemoteRef>,
    settings: OwnerSettings,
}

pub struct Pipeline {
    config: RenamerConfig,
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    settings: Arc<dyn SettingsSource>,
    intake: IntakeStage,
    chain: TransformChain,
    thumbnails: ThumbnailResolver,
    delivery: DeliveryStage,
    cleanup: CleanupCoordinator,
}

impl Pipeline {
    pub fn new(
        config: RenamerConfig,
        engine: Arc<dyn MediaEngine>,
        transport: Arc<dyn Transport>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new(config.limits.session_shards)),
            intake: IntakeStage::new(engine.clone(), transport.clone()),
            chain: TransformChain::new(engine.clone(), config.burn.clone()),
            thumbnails: ThumbnailResolver::new(
                engine,
                transport.clone(),
                config.thumbnail.clone(),
            ),
            delivery: DeliveryStage::new(transport.clone(), config.delivery.clone()),
            cleanup: CleanupCoordinator::new(),
            transport,
            settings,
            config,
        }
    }

    pub fn config(&self) -> &RenamerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Submits and drives one asset to completion.
    pub async fn process(
        &self,
        owner: OwnerId,
        asset: AssetDescriptor,
    ) -> PipelineResult<DeliveryReceipt> {
        let active = self.submit(owner, asset).await?;
        self.run(active).await
    }

    /// Validates the asset, replaces any session the owner still has, then
    /// downloads and probes the asset. An oversized asset never gets a session.
    pub async fn submit(
        &self,
        owner: OwnerId,
        asset: AssetDescriptor,
    ) -> PipelineResult<ActiveSession> {
        validate_asset(&asset, self.config.limits.max_asset_bytes)?;
        let settings = match self.settings.owner_settings(owner).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(owner, error = %err, "settings unavailable, using defaults");
                OwnerSettings::default()
            }
        };

        let session = Session::new(owner, asset.clone(), &self.config.work_dir());
        let (handle, superseded) = self.store.create(session);
        if let Some(stale) = superseded {
            let report = self.cleanup.run(&stale.ledger).await;
            debug!(owner, token = %stale.token, clean = report.is_clean(), "stale session cleaned");
        }
        info!(owner, token = %handle.token, file = %asset.file_name, "session created");

        let status = match self.transport.send_status(owner, "Downloading…").await {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(owner, error = %err, "status message unavailable");
                None
            }
        };
        let ctx = RunContext {
            owner,
            token: handle.token,
            ledger: handle.ledger.clone(),
            work_dir: handle.work_dir.clone(),
            status,
            settings,
        };

        let mut cancel = handle.cancel.clone();
        let outcome = guarded(self.run_intake(&ctx, &asset), &mut cancel).await;
        match outcome {
            Ok(()) => Ok(ActiveSession {
                handle,
                status: ctx.status,
                settings: ctx.settings,
            }),
            Err(err) => {
                self.finish(&ctx, Err(&err)).await;
                Err(err)
            }
        }
    }

    /// Validates a decision event against the owner's active session and
    /// queues it. Stale tokens and invalid choices are rejected here without
    /// touching the session.
    pub fn dispatch(
        &self,
        owner: OwnerId,
        token: SessionToken,
        choice: UserChoice,
    ) -> PipelineResult<()> {
        let subtitles = &self.config.subtitles;
        self.store
            .inspect(owner, token, |session| session.precheck(&choice, subtitles))??;
        self.store.send(owner, token, choice)
    }

    /// Drives the decisions and the processing stages, then cleans up.
    pub async fn run(&self, active: ActiveSession) -> PipelineResult<DeliveryReceipt> {
        let ActiveSession {
            handle,
            status,
            settings,
        } = active;
        let SessionHandle {
            owner,
            token,
            mut events,
            mut cancel,
            ledger,
            work_dir,
        } = handle;
        let ctx = RunContext {
            owner,
            token,
            ledger,
            work_dir,
            status,
            settings,
        };

        let body = async {
            self.collect_decisions(&ctx, &mut events).await?;
            self.process_ready(&ctx).await
        };
        let outcome = guarded(body, &mut cancel).await;
        self.finish(&ctx, outcome.as_ref().map(|_| ())).await;
        outcome
    }

    /// Cancels and cleans up every session older than the configured age.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.store.sweep_expired(self.config.limits.session_max_age());
        for session in &expired {
            self.cleanup.run(&session.ledger).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    async fn run_intake(&self, ctx: &RunContext, asset: &AssetDescriptor) -> PipelineResult<()> {
        self.intake.prepare_dirs(&ctx.work_dir, &ctx.ledger).await?;
        let file_name = decorate_file_name(
            &asset.file_name,
            ctx.settings.prefix.as_deref(),
            ctx.settings.suffix.as_deref(),
        );
        let path = self
            .intake
            .fetch_asset(&asset.remote, &ctx.work_dir, &file_name, &ctx.ledger)
            .await?;
        self.update_status(ctx, "Probing…").await;
        let probe = self.intake.probe(&path).await?;
        let state = self
            .store
            .update(ctx.owner, ctx.token, |session| {
                session.start_decisions(probe, path)
            })??;
        info!(owner = ctx.owner, token = %ctx.token, %state, "intake complete");
        Ok(())
    }

    async fn collect_decisions(
        &self,
        ctx: &RunContext,
        events: &mut mpsc::UnboundedReceiver<UserChoice>,
    ) -> PipelineResult<()> {
        let mut subtitle_sequence = 0usize;
        loop {
            let state = self
                .store
                .inspect(ctx.owner, ctx.token, |session| session.state)?;
            let (step, wait) = match state {
                SessionState::AwaitingThumbnailChoice => (
                    PromptStep::Thumbnail,
                    self.config.decisions.thumbnail_timeout(),
                ),
                SessionState::AwaitingSubtitlePlan => (
                    PromptStep::SubtitlePlan,
                    self.config.decisions.subtitle_timeout(),
                ),
                SessionState::Ready => return Ok(()),
                other => {
                    return Err(ValidationError::UnexpectedDecision {
                        state: other,
                        decision: "collect",
                    }
                    .into())
                }
            };
            self.send_prompt(ctx, step, wait).await?;

            let mut deadline = Instant::now() + wait;
            loop {
                match timeout_at(deadline, events.recv()).await {
                    Ok(Some(choice)) => {
                        let label = choice.label();
                        let applied = match self
                            .resolve_choice(ctx, choice, &mut subtitle_sequence)
                            .await
                        {
                            Ok(decision) => self
                                .store
                                .update(ctx.owner, ctx.token, |session| session.apply(decision))?
                                .map_err(PipelineError::from),
                            Err(err) => Err(err),
                        };
                        match applied {
                            Ok(next) => {
                                debug!(owner = ctx.owner, decision = label, state = %next, "decision applied");
                                if next != state {
                                    break;
                                }
                                deadline = Instant::now() + wait;
                            }
                            Err(err) => {
                                warn!(owner = ctx.owner, decision = label, error = %err, "decision rejected");
                                self.update_status(ctx, &err.to_string()).await;
                            }
                        }
                    }
                    Ok(None) => return Err(PipelineError::Cancelled),
                    Err(_) => {
                        let fallback = self.default_thumbnail(&ctx.settings);
                        let next = self
                            .store
                            .update(ctx.owner, ctx.token, |session| session.expire_wait(fallback))??;
                        info!(owner = ctx.owner, from = %state, to = %next, "decision wait elapsed, using default");
                        break;
                    }
                }
            }
        }
    }

    async fn resolve_choice(
        &self,
        ctx: &RunContext,
        choice: UserChoice,
        sequence: &mut usize,
    ) -> PipelineResult<Decision> {
        let decision = match choice {
            UserChoice::Thumbnail(choice) => Decision::Thumbnail(choice),
            UserChoice::RemoveSubtitle(position) => Decision::RemoveSubtitle(position),
            UserChoice::Continue => Decision::Continue,
            UserChoice::AddSoftSubtitle { file, language } => {
                *sequence += 1;
                let path = self
                    .intake
                    .fetch_subtitle(&file, &ctx.work_dir, *sequence, &ctx.ledger)
                    .await?;
                Decision::AddSoftSubtitle(SoftSubtitle {
                    path,
                    language: language
                        .filter(|lang| !lang.trim().is_empty())
                        .unwrap_or_else(|| self.config.subtitles.default_language.clone()),
                })
            }
            UserChoice::AddBurnSubtitle { file, style } => {
                *sequence += 1;
                let path = self
                    .intake
                    .fetch_subtitle(&file, &ctx.work_dir, *sequence, &ctx.ledger)
                    .await?;
                Decision::AddBurnSubtitle(BurnSpec {
                    path,
                    style: style.unwrap_or_else(|| self.config.burn.default_style()),
                })
            }
        };
        Ok(decision)
    }

    fn default_thumbnail(&self, settings: &OwnerSettings) -> ThumbnailChoice {
        if let Some(remote) = &settings.default_thumbnail {
            return ThumbnailChoice::Custom(remote.clone());
        }
        match self.config.decisions.default_thumbnail {
            DefaultThumbnail::Generate => ThumbnailChoice::GenerateFromFrame { at_seconds: None },
            DefaultThumbnail::None => ThumbnailChoice::None,
        }
    }

    async fn send_prompt(
        &self,
        ctx: &RunContext,
        step: PromptStep,
        wait: std::time::Duration,
    ) -> PipelineResult<()> {
        let prompt = self.store.inspect(ctx.owner, ctx.token, |session| Prompt {
            step,
            file_name: session.asset.file_name.clone(),
            duration_seconds: session.duration_seconds(),
            subtitle_streams: session
                .probe
                .as_ref()
                .map(|probe| {
                    probe
                        .subtitle_tracks()
                        .into_iter()
                        .map(|track| track.stream.clone())
                        .collect()
                })
                .unwrap_or_default(),
            timeout: wait,
        })?;
        if let Err(err) = self.transport.prompt(ctx.owner, ctx.token, &prompt).await {
            warn!(owner = ctx.owner, error = %err, "prompt not delivered, waiting for timeout");
        }
        Ok(())
    }

    async fn process_ready(&self, ctx: &RunContext) -> PipelineResult<DeliveryReceipt> {
        let session = self.store.update(ctx.owner, ctx.token, |session| {
            session.begin_processing().map(|_| session.clone())
        })??;
        let (Some(working), Some(probe)) = (session.working_path.clone(), session.probe.clone())
        else {
            return Err(PipelineError::Probe("session has no probed working file".into()));
        };
        info!(owner = ctx.owner, token = %ctx.token, "processing");
        self.update_status(ctx, "Processing…").await;

        let ops = build_chain(&session.subtitles, ctx.settings.metadata());
        let reporter = StageReporter {
            pipeline: self,
            ctx,
        };
        let final_path = self
            .chain
            .execute(&ops, &working, &probe, &ctx.work_dir, &ctx.ledger, &reporter)
            .await?;

        self.update_status(ctx, "Preparing thumbnail…").await;
        let thumbnail = self
            .thumbnails
            .resolve(ThumbnailRequest {
                choice: &session.thumbnail,
                working_path: &final_path,
                duration_seconds: probe.duration_seconds,
                has_video: probe.has_video(),
                work_dir: &ctx.work_dir,
                ledger: &ctx.ledger,
            })
            .await;

        self.update_status(ctx, "Uploading…").await;
        let request = self
            .delivery
            .prepare(DeliveryInput {
                owner: ctx.owner,
                kind: session.asset.kind,
                file_name: file_name_of(&final_path),
                path: final_path,
                caption_template: ctx.settings.caption_template.clone(),
                thumbnail,
                duration_seconds: probe.duration_seconds,
            })
            .await?;
        self.delivery.deliver(request, ctx.status.as_ref()).await
    }

    /// Terminal bookkeeping shared by every exit path.
    async fn finish(&self, ctx: &RunContext, outcome: Result<(), &PipelineError>) {
        let delivered = outcome.is_ok();
        let _ = self
            .store
            .update(ctx.owner, ctx.token, |session| session.finish(delivered));
        let report = self.cleanup.run(&ctx.ledger).await;
        if !report.is_clean() {
            warn!(owner = ctx.owner, failures = report.failures.len(), "cleanup left artifacts behind");
        }
        self.store.remove(ctx.owner, ctx.token);

        let Some(status) = &ctx.status else {
            return;
        };
        let result = match outcome {
            Ok(()) => self.transport.delete_status(ctx.owner, status).await,
            Err(err) => {
                info!(owner = ctx.owner, token = %ctx.token, error = %err, "session failed");
                self.transport
                    .edit_status(ctx.owner, status, &format!("Error: {err}"))
                    .await
            }
        };
        if let Err(err) = result {
            debug!(owner = ctx.owner, error = %err, "final status update dropped");
        }
    }

    async fn update_status(&self, ctx: &RunContext, text: &str) {
        if let Some(status) = &ctx.status {
            if let Err(err) = self.transport.edit_status(ctx.owner, status, text).await {
                debug!(owner = ctx.owner, error = %err, "status update dropped");
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store)
            .field("chain", &self.chain)
            .finish()
    }
}

struct StageReporter<'a> {
    pipeline: &'a Pipeline,
    ctx: &'a RunContext,
}

#[async_trait]
impl<'a> ChainObserver for StageReporter<'a> {
    async fn stage_started(&self, stage: &PlannedStage, total: usize) {
        let text = format!("Step {}/{}: {}…", stage.stage, total, stage.kind);
        self.pipeline.update_status(self.ctx, &text).await;
    }

    async fn stage_completed(&self, stage: &PlannedStage) {
        let output = stage.invocation.output.clone();
        let _ = self
            .pipeline
            .store
            .update(self.ctx.owner, self.ctx.token, |session| {
                session.working_path = Some(output);
            });
    }
}

/// Runs `body` until it finishes, panics, or the session is cancelled.
async fn guarded<T, F>(body: F, cancel: &mut watch::Receiver<bool>) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    let body = AssertUnwindSafe(body).catch_unwind();
    tokio::select! {
        result = body => result.unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(panic)))),
        _ = cancelled(cancel) => Err(PipelineError::Cancelled),
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string())
}
