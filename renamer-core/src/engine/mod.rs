//! Seam to the external media engine (ffmpeg/ffprobe).
//!
//! The engine is trusted for nothing but the file it leaves behind: an
//! invocation succeeds only when its declared output exists and is non-empty,
//! whatever the exit status says.

mod probe;
mod runner;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::EngineSection;

pub use probe::{ProbeReport, StreamInfo, StreamKind, SubtitleTrack};
pub use runner::{CommandOutput, CommandRunner, SystemCommandRunner};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {limit:?}")]
    Timeout { program: PathBuf, limit: Duration },
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("invalid probe payload: {0}")]
    Parse(String),
}

/// One engine run producing one output file from one or more inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInvocation {
    pub label: String,
    pub inputs: Vec<PathBuf>,
    /// Output-side arguments placed between the inputs and the output path.
    pub args: Vec<String>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome {
    pub output_path: PathBuf,
    pub diagnostics: String,
    pub exit_code: Option<i32>,
    pub succeeded: bool,
}

impl EngineOutcome {
    /// Judges an invocation by its declared output alone.
    pub async fn inspect(
        output_path: impl Into<PathBuf>,
        diagnostics: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        let output_path = output_path.into();
        let succeeded = output_is_usable(&output_path).await;
        Self {
            output_path,
            diagnostics: diagnostics.into(),
            exit_code,
            succeeded,
        }
    }

    pub fn failed(output_path: impl Into<PathBuf>, diagnostics: impl Into<String>) -> Self {
        Self {
            output_path: output_path.into(),
            diagnostics: diagnostics.into(),
            exit_code: None,
            succeeded: false,
        }
    }

    /// Diagnostic text suitable for a user-facing failure message.
    pub fn describe(&self) -> String {
        if !self.diagnostics.is_empty() {
            return self.diagnostics.clone();
        }
        match self.exit_code {
            Some(code) => format!("engine exited with status {code} and produced no output"),
            None => "engine produced no output".to_string(),
        }
    }
}

pub async fn output_is_usable(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn probe(&self, input: &Path) -> EngineResult<ProbeReport>;

    async fn run(&self, invocation: &EngineInvocation) -> EngineOutcome;

    async fn extract_frame(&self, input: &Path, at_seconds: f64, output: &Path) -> EngineOutcome;
}

#[derive(Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    probe_timeout: Duration,
    frame_timeout: Duration,
    transform_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl FfmpegEngine {
    pub fn from_config(section: &EngineSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&section.ffmpeg),
            ffprobe: PathBuf::from(&section.ffprobe),
            probe_timeout: Duration::from_secs(section.probe_timeout_seconds),
            frame_timeout: Duration::from_secs(section.frame_timeout_seconds),
            transform_timeout: Duration::from_secs(section.transform_timeout_seconds),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn binaries(&self) -> [&Path; 2] {
        [&self.ffmpeg, &self.ffprobe]
    }

    /// First line of `<binary> -version`, used by health checks.
    pub async fn version_of(&self, binary: &Path) -> EngineResult<String> {
        let output = self
            .runner
            .run(binary, &["-version".to_string()], self.probe_timeout)
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    fn base_args() -> Vec<String> {
        ["-y", "-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn execute(&self, args: Vec<String>, output: &Path, limit: Duration) -> EngineOutcome {
        debug!(program = %self.ffmpeg.display(), ?args, "running engine");
        match self.runner.run(&self.ffmpeg, &args, limit).await {
            Ok(result) => EngineOutcome::inspect(output, result.stderr_text(), result.status).await,
            Err(err) => EngineOutcome::failed(output, err.to_string()),
        }
    }
}

impl std::fmt::Debug for FfmpegEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegEngine")
            .field("ffmpeg", &self.ffmpeg)
            .field("ffprobe", &self.ffprobe)
            .field("transform_timeout", &self.transform_timeout)
            .finish()
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn probe(&self, input: &Path) -> EngineResult<ProbeReport> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            input.to_string_lossy().to_string(),
        ];
        let output = self
            .runner
            .run(&self.ffprobe, &args, self.probe_timeout)
            .await?;
        if output.status != Some(0) || output.stdout.is_empty() {
            return Err(EngineError::Probe(format!(
                "{} returned status {:?}: {}",
                self.ffprobe.display(),
                output.status,
                output.stderr_text()
            )));
        }
        ProbeReport::parse(&output.stdout)
    }

    async fn run(&self, invocation: &EngineInvocation) -> EngineOutcome {
        let mut args = Self::base_args();
        for input in &invocation.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }
        args.extend(invocation.args.iter().cloned());
        args.push(invocation.output.to_string_lossy().to_string());
        self.execute(args, &invocation.output, self.transform_timeout)
            .await
    }

    async fn extract_frame(&self, input: &Path, at_seconds: f64, output: &Path) -> EngineOutcome {
        let mut args = Self::base_args();
        args.extend([
            "-ss".to_string(),
            format!("{:.3}", at_seconds.max(0.0)),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            output.to_string_lossy().to_string(),
        ]);
        self.execute(args, output, self.frame_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Exits cleanly and optionally writes the last argument as a file.
    #[derive(Default)]
    struct ScriptedRunner {
        write_bytes: Option<Vec<u8>>,
        status: Option<i32>,
        stderr: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _program: &Path,
            args: &[String],
            _limit: Duration,
        ) -> EngineResult<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            if let (Some(bytes), Some(output)) = (&self.write_bytes, args.last()) {
                std::fs::write(output, bytes).unwrap();
            }
            Ok(CommandOutput {
                status: self.status,
                stdout: Vec::new(),
                stderr: self.stderr.clone().into_bytes(),
            })
        }
    }

    fn engine(runner: ScriptedRunner) -> (FfmpegEngine, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let section = EngineSection {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            probe_timeout_seconds: 5,
            frame_timeout_seconds: 5,
            transform_timeout_seconds: 5,
        };
        let engine = FfmpegEngine::from_config(&section).with_runner(runner.clone());
        (engine, runner)
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_failure() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(ScriptedRunner {
            status: Some(0),
            ..ScriptedRunner::default()
        });
        let invocation = EngineInvocation {
            label: "remove-subs".into(),
            inputs: vec![dir.path().join("in.mkv")],
            args: vec!["-c".into(), "copy".into()],
            output: dir.path().join("out.mkv"),
        };
        let outcome = engine.run(&invocation).await;
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.describe().contains("no output"));
    }

    #[tokio::test]
    async fn empty_output_is_failure_even_with_success_status() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(ScriptedRunner {
            status: Some(0),
            write_bytes: Some(Vec::new()),
            ..ScriptedRunner::default()
        });
        let output = dir.path().join("frame.jpg");
        let outcome = engine.extract_frame(&dir.path().join("in.mp4"), 3.0, &output).await;
        assert!(output.exists());
        assert!(!outcome.succeeded);
    }

    #[tokio::test]
    async fn non_empty_output_succeeds_and_keeps_stderr() {
        let dir = tempdir().unwrap();
        let (engine, runner) = engine(ScriptedRunner {
            status: Some(1),
            write_bytes: Some(b"data".to_vec()),
            stderr: "warning: odd timestamps".into(),
            ..ScriptedRunner::default()
        });
        let invocation = EngineInvocation {
            label: "inject-metadata".into(),
            inputs: vec![dir.path().join("a.mp4"), dir.path().join("b.srt")],
            args: vec!["-map".into(), "0".into()],
            output: dir.path().join("out.mp4"),
        };
        let outcome = engine.run(&invocation).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.diagnostics, "warning: odd timestamps");

        let calls = runner.calls.lock().unwrap();
        let args = &calls[0];
        assert_eq!(&args[..4], &["-y", "-hide_banner", "-loglevel", "error"]);
        let inputs: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.as_str() == "-i")
            .map(|(i, _)| args[i + 1].clone())
            .collect();
        assert_eq!(inputs.len(), 2);
        assert!(args.last().unwrap().ends_with("out.mp4"));
    }

    #[tokio::test]
    async fn probe_failure_carries_stderr() {
        let (engine, _) = engine(ScriptedRunner {
            status: Some(1),
            stderr: "moov atom not found".into(),
            ..ScriptedRunner::default()
        });
        let err = engine.probe(Path::new("/tmp/broken.mp4")).await.unwrap_err();
        assert!(err.to_string().contains("moov atom not found"));
    }
}
