//! Execution and approval configuration (`[execution]`).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When an execution request must be authorized before it may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Run immediately, never create approval records.
    None,
    /// Ask once per (session, runtime) pair.
    #[default]
    #[serde(alias = "first-time")]
    FirstTime,
    /// Ask for every request.
    Always,
}

impl ApprovalPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::FirstTime => "first_time",
            Self::Always => "always",
        }
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "never" => Ok(Self::None),
            "first_time" | "first-time" => Ok(Self::FirstTime),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown approval policy `{other}`")),
        }
    }
}

/// Execution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub approval_policy: ApprovalPolicy,

    /// Timeout applied when a request does not carry one.
    pub default_timeout_secs: u64,

    /// Upper bound for request-supplied timeouts.
    pub max_timeout_secs: u64,

    /// Capture ceiling shared by stdout and stderr.
    pub max_output_bytes: usize,

    /// Idle window after which a session is considered expired.
    pub session_idle_timeout_secs: u64,

    /// Parent directory for per-session scratch directories.
    /// Defaults to `<tmp>/execward-sessions`.
    pub work_root: Option<PathBuf>,

    /// Session and approval state shared between invocations. Defaults to
    /// `<data dir>/execward/state.json`; must lie outside `work_root` and
    /// every writable sandbox path.
    pub state_file: Option<PathBuf>,

    /// Capacity of the streaming chunk channel.
    pub chunk_channel_capacity: usize,

    /// Time between SIGTERM and SIGKILL when a process is stopped.
    pub kill_grace_ms: u64,

    /// Extra environment variable names passed through to child processes.
    pub env_allowlist: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            approval_policy: ApprovalPolicy::FirstTime,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_output_bytes: 1024 * 1024,
            session_idle_timeout_secs: 30 * 60,
            work_root: None,
            state_file: None,
            chunk_channel_capacity: 256,
            kill_grace_ms: 500,
            env_allowlist: Vec::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Resolve the session work root, falling back to the system temp dir.
    pub fn resolved_work_root(&self) -> PathBuf {
        self.work_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("execward-sessions"))
    }

    /// Resolve the state file, falling back to a temp location outside the
    /// default work root when no data directory is known.
    pub fn resolved_state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("execward"))
                .unwrap_or_else(|| std::env::temp_dir().join("execward-state"))
                .join("state.json")
        })
    }

    /// Clamp a requested timeout into `(0, max_timeout]`.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let timeout = requested
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| self.default_timeout());
        timeout.min(self.max_timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_policy_accepts_both_spellings() {
        assert_eq!("first-time".parse::<ApprovalPolicy>(), Ok(ApprovalPolicy::FirstTime));
        assert_eq!("first_time".parse::<ApprovalPolicy>(), Ok(ApprovalPolicy::FirstTime));
        assert_eq!("ALWAYS".parse::<ApprovalPolicy>(), Ok(ApprovalPolicy::Always));
        assert!("sometimes".parse::<ApprovalPolicy>().is_err());
    }

    #[test]
    fn effective_timeout_is_clamped() {
        let config = ExecutionConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(30));
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::from_secs(10_000))),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.effective_timeout(Some(Duration::ZERO)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn default_state_file_is_outside_the_work_root() {
        let config = ExecutionConfig::default();
        assert!(!crate::is_within(
            &config.resolved_state_file(),
            &config.resolved_work_root()
        ));
    }

    #[test]
    fn work_root_defaults_under_temp_dir() {
        let config = ExecutionConfig::default();
        assert!(config.resolved_work_root().starts_with(std::env::temp_dir()));
    }
}
