//! Spawning a confined child with a scrubbed environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::confine::Confinement;
use crate::error::ProcessError;
#[cfg(unix)]
use crate::process_group;

/// Fully resolved invocation. The child sees exactly `env`, nothing inherited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub confinement: Confinement,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn confinement(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }
}

/// Spawn `spec` as the leader of a new session with piped stdout/stderr.
///
/// Stdin is `/dev/null`; the child is killed if the handle is dropped.
pub fn spawn_confined(spec: &SpawnSpec) -> Result<Child, ProcessError> {
    if spec.program.is_empty() {
        return Err(ProcessError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing program"),
        });
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        let mut prepared = spec.confinement.prepare()?;
        #[cfg(target_os = "linux")]
        let parent_pid = nix::unistd::getpid().as_raw();

        // SAFETY: the hook only issues syscalls on data prepared before the fork.
        unsafe {
            command.pre_exec(move || {
                process_group::detach_from_tty()?;
                #[cfg(target_os = "linux")]
                process_group::set_parent_death_signal(parent_pid)?;
                prepared.apply_in_child()
            });
        }
    }

    #[cfg(not(unix))]
    if !spec.confinement.is_unrestricted() {
        return Err(ProcessError::Unsupported {
            feature: "process confinement",
            platform: std::env::consts::OS,
        });
    }

    command.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })
}
