//! Runtime adapters: turn a code snippet into a confined subprocess.
//!
//! Every adapter builds an unconfined [`CommandSpec`], hands it to
//! [`Sandbox::enforce`] and spawns only the confined result. Output capture,
//! the watchdog and the per-line filter live in `execward-process`.

mod node;
mod python;
mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use execward_process::{
    CaptureOptions, CapturedOutput, LineRedactor, OutputChunk, run_captured,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::sandboxing::{CommandSpec, Sandbox, SandboxType};

pub use node::NodeAdapter;
pub use python::PythonAdapter;
pub use shell::ShellAdapter;

/// Language a snippet is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Shell,
    Python,
    Node,
}

impl Runtime {
    pub const ALL: [Runtime; 3] = [Runtime::Shell, Runtime::Python, Runtime::Node];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Python => "python",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            "python" | "python3" | "py" => Ok(Self::Python),
            "node" | "js" | "javascript" => Ok(Self::Node),
            other => Err(format!("unknown runtime `{other}`")),
        }
    }
}

/// Everything an adapter needs for one run.
#[derive(Clone)]
pub struct RunContext {
    pub sandbox: Arc<Sandbox>,
    /// Session scratch directory; cwd and writable root.
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    /// Scrubbed environment.
    pub env: BTreeMap<String, String>,
    pub redactor: Arc<dyn LineRedactor>,
    pub chunk_tx: Option<mpsc::Sender<OutputChunk>>,
    pub cancel: CancellationToken,
}

impl RunContext {
    fn capture_options(&self) -> CaptureOptions {
        let mut options = CaptureOptions::new(self.timeout, self.max_output_bytes)
            .with_redactor(Arc::clone(&self.redactor))
            .with_cancel(self.cancel.clone())
            .with_kill_grace(self.kill_grace);
        if let Some(tx) = &self.chunk_tx {
            options = options.with_chunks(tx.clone());
        }
        options
    }

    /// Base spec shared by all adapters: cwd, env, timeout and writable root.
    pub fn command(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program)
            .with_cwd(&self.work_dir)
            .with_env(self.env.clone())
            .with_timeout(self.timeout)
            .with_writable_root(&self.work_dir)
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("sandbox", &self.sandbox.sandbox_type())
            .field("work_dir", &self.work_dir)
            .field("timeout", &self.timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("streaming", &self.chunk_tx.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: CapturedOutput,
    pub sandbox_type: SandboxType,
}

#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    fn runtime(&self) -> Runtime;

    /// Unconfined invocation for `code`.
    fn command_spec(&self, code: &str, ctx: &RunContext) -> Result<CommandSpec, ExecError>;

    async fn run(&self, code: &str, ctx: RunContext) -> Result<RunOutput, ExecError> {
        let runtime = self.runtime();
        let spec = self.command_spec(code, &ctx)?;
        let confined = ctx.sandbox.enforce(spec);
        let sandbox_type = confined.sandbox_type;
        tracing::debug!(
            %runtime,
            sandbox = %sandbox_type,
            program = %confined.program,
            "starting execution"
        );

        let output = run_captured(&confined.into_spawn_spec(), ctx.capture_options())
            .await
            .map_err(|source| ExecError::SpawnFailure { runtime, source })?;

        tracing::debug!(
            %runtime,
            termination = ?output.termination,
            duration_ms = output.duration.as_millis() as u64,
            truncated = output.truncated,
            "execution finished"
        );
        Ok(RunOutput {
            output,
            sandbox_type,
        })
    }
}

/// One adapter per [`Runtime`].
pub fn default_adapters() -> BTreeMap<Runtime, Arc<dyn RuntimeAdapter>> {
    let adapters: [Arc<dyn RuntimeAdapter>; 3] = [
        Arc::new(ShellAdapter::default()),
        Arc::new(PythonAdapter::default()),
        Arc::new(NodeAdapter::default()),
    ];
    adapters
        .into_iter()
        .map(|adapter| (adapter.runtime(), adapter))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parses_aliases() {
        assert_eq!("bash".parse::<Runtime>().unwrap(), Runtime::Shell);
        assert_eq!("Python3".parse::<Runtime>().unwrap(), Runtime::Python);
        assert_eq!("js".parse::<Runtime>().unwrap(), Runtime::Node);
        assert!("ruby".parse::<Runtime>().is_err());
    }

    #[test]
    fn default_adapters_cover_every_runtime() {
        let adapters = default_adapters();
        for runtime in Runtime::ALL {
            assert_eq!(adapters[&runtime].runtime(), runtime);
        }
    }
}
