use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use execward_process::{Confinement, SpawnSpec};

use super::SandboxType;

/// Unconfined invocation built by a runtime adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Already scrubbed; passed to the child verbatim.
    pub env: BTreeMap<String, String>,
    /// Wall-clock budget, used to derive the CPU limit.
    pub timeout: Duration,
    /// Writable in addition to the policy's write paths (the session directory).
    pub writable_roots: Vec<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_writable_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.writable_roots.push(root.into());
        self
    }
}

/// Output of [`Sandbox::enforce`](super::Sandbox::enforce): what will actually be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub confinement: Confinement,
    pub sandbox_type: SandboxType,
}

impl ConfinedCommand {
    pub fn into_spawn_spec(self) -> SpawnSpec {
        SpawnSpec {
            program: self.program,
            args: self.args,
            cwd: self.cwd,
            env: self.env,
            confinement: self.confinement,
        }
    }
}
