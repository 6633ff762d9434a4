//! Ordered, destructive transform chain over the media engine.
//!
//! Every stage reads the previous stage's output and writes into its own
//! `stage-NN-<kind>` directory under the session directory, keeping the file
//! name. A stage's input is deleted only after its output is confirmed
//! present and non-empty, so at any moment exactly one working file exists.

pub mod args;

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::cleanup::ArtifactLedger;
use crate::config::BurnSection;
use crate::engine::{EngineInvocation, MediaEngine, ProbeReport, StreamKind};
use crate::pipeline::TransformFailure;
use crate::session::{BurnSpec, SoftSubtitle, SubtitlePlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    RemoveSubs,
    AddSoftSub,
    BurnSub,
    InjectMetadata,
}

impl TransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformKind::RemoveSubs => "remove-subs",
            TransformKind::AddSoftSub => "add-soft-sub",
            TransformKind::BurnSub => "burn-sub",
            TransformKind::InjectMetadata => "inject-metadata",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformOp {
    RemoveSubs { remove: BTreeSet<u32> },
    AddSoftSub(SoftSubtitle),
    BurnSub(BurnSpec),
    InjectMetadata { value: String },
}

impl TransformOp {
    pub fn kind(&self) -> TransformKind {
        match self {
            TransformOp::RemoveSubs { .. } => TransformKind::RemoveSubs,
            TransformOp::AddSoftSub(_) => TransformKind::AddSoftSub,
            TransformOp::BurnSub(_) => TransformKind::BurnSub,
            TransformOp::InjectMetadata { .. } => TransformKind::InjectMetadata,
        }
    }
}

/// Chain order: removal, soft muxes, burn-ins, then metadata.
pub fn build_chain(plan: &SubtitlePlan, metadata: Option<&str>) -> Vec<TransformOp> {
    let mut ops = Vec::new();
    if !plan.remove.is_empty() {
        ops.push(TransformOp::RemoveSubs {
            remove: plan.remove.clone(),
        });
    }
    ops.extend(plan.soft.iter().cloned().map(TransformOp::AddSoftSub));
    ops.extend(plan.burn.iter().cloned().map(TransformOp::BurnSub));
    if let Some(value) = metadata.filter(|value| !value.trim().is_empty()) {
        ops.push(TransformOp::InjectMetadata {
            value: value.to_string(),
        });
    }
    ops
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    /// 1-based position in the chain.
    pub stage: usize,
    pub kind: TransformKind,
    pub invocation: EngineInvocation,
}

/// Hooks for reporting chain progress.
#[async_trait]
pub trait ChainObserver: Send + Sync {
    async fn stage_started(&self, _stage: &PlannedStage, _total: usize) {}

    /// `stage.invocation.output` is now the working artifact.
    async fn stage_completed(&self, _stage: &PlannedStage) {}
}

impl ChainObserver for () {}

#[derive(Clone)]
pub struct TransformChain {
    engine: Arc<dyn MediaEngine>,
    burn: BurnSection,
}

impl TransformChain {
    pub fn new(engine: Arc<dyn MediaEngine>, burn: BurnSection) -> Self {
        Self { engine, burn }
    }

    /// Resolves every stage's input, output and engine arguments up front.
    pub fn plan(
        &self,
        ops: &[TransformOp],
        input: &Path,
        probe: &ProbeReport,
        work_dir: &Path,
    ) -> Vec<PlannedStage> {
        let file_name = input
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "asset".into());
        let positions = probe.subtitle_positions();
        let mut subtitle_count = probe.count(StreamKind::Subtitle);
        let mut current = input.to_path_buf();
        let mut stages = Vec::with_capacity(ops.len());

        for (offset, op) in ops.iter().enumerate() {
            let stage = offset + 1;
            let kind = op.kind();
            let output = work_dir
                .join(format!("stage-{stage:02}-{kind}"))
                .join(&file_name);
            let (inputs, args) = match op {
                TransformOp::RemoveSubs { remove } => {
                    subtitle_count -= remove.intersection(&positions).count();
                    (vec![current.clone()], args::remove_subtitles(probe, remove))
                }
                TransformOp::AddSoftSub(soft) => {
                    let args = args::add_soft_subtitle(subtitle_count, &soft.language, &output);
                    subtitle_count += 1;
                    (vec![current.clone(), soft.path.clone()], args)
                }
                TransformOp::BurnSub(burn) => (
                    vec![current.clone()],
                    args::burn_subtitle(&burn.path, &burn.style, &self.burn),
                ),
                TransformOp::InjectMetadata { value } => {
                    (vec![current.clone()], args::inject_metadata(value))
                }
            };
            stages.push(PlannedStage {
                stage,
                kind,
                invocation: EngineInvocation {
                    label: kind.as_str().to_string(),
                    inputs,
                    args,
                    output: output.clone(),
                },
            });
            current = output;
        }
        stages
    }

    /// Runs the chain and returns the final artifact. On failure the last
    /// good artifact stays on disk and remaining stages are skipped.
    pub async fn execute(
        &self,
        ops: &[TransformOp],
        input: &Path,
        probe: &ProbeReport,
        work_dir: &Path,
        ledger: &ArtifactLedger,
        observer: &dyn ChainObserver,
    ) -> Result<PathBuf, TransformFailure> {
        let stages = self.plan(ops, input, probe, work_dir);
        let total = stages.len();
        let mut current = input.to_path_buf();

        for planned in &stages {
            observer.stage_started(planned, total).await;
            let output = &planned.invocation.output;
            ledger.record_file(output);
            if let Some(dir) = output.parent() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|err| TransformFailure {
                        stage: planned.stage,
                        kind: planned.kind,
                        diagnostics: format!("cannot create {}: {err}", dir.display()),
                    })?;
            }

            let outcome = self.engine.run(&planned.invocation).await;
            if !outcome.succeeded {
                warn!(
                    stage = planned.stage,
                    kind = %planned.kind,
                    exit_code = ?outcome.exit_code,
                    "transform stage produced no usable output"
                );
                let _ = fs::remove_file(output).await;
                return Err(TransformFailure {
                    stage: planned.stage,
                    kind: planned.kind,
                    diagnostics: outcome.describe(),
                });
            }

            if let Err(err) = fs::remove_file(&current).await {
                warn!(path = %current.display(), error = %err, "could not drop previous stage input");
            }
            info!(stage = planned.stage, kind = %planned.kind, "transform stage complete");
            observer.stage_completed(planned).await;
            current = output.clone();
        }
        Ok(current)
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("burn", &self.burn)
            .finish()
    }
}
