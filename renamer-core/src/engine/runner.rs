use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String], limit: Duration)
        -> EngineResult<CommandOutput>;
}

/// Spawns real child processes. The child is killed if the awaiting future is
/// dropped or the time limit elapses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        limit: Duration,
    ) -> EngineResult<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match timeout(limit, command.output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Ok(Err(source)) => Err(EngineError::Spawn {
                program: program.to_path_buf(),
                source,
            }),
            Err(_) => Err(EngineError::Timeout {
                program: program.to_path_buf(),
                limit,
            }),
        }
    }
}
