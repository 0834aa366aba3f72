//! Sandbox configuration.
//!
//! Describes which confinement technology to request and the limits the
//! selected sandbox enforces on every spawned process. The configuration is
//! immutable once handed to the sandbox manager.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// System locations a confined process may read by default.
///
/// Interpreters and shared libraries live here; without them nothing can run
/// under a filesystem ruleset.
pub const DEFAULT_READ_PATHS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc",
    "/opt",
    "/dev",
    "/proc",
    "/nix/store",
    "/System",
    "/Library",
    "/private/etc",
    "/private/var/db",
];

/// Credential locations that are never readable or writable from a sandbox.
pub const DEFAULT_SENSITIVE_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.aws",
    "~/.config/gcloud",
    "~/.azure",
    "~/.kube",
    "~/.docker",
    "~/.npmrc",
    "~/.pypirc",
    "~/.config/gh",
    "~/.secrets",
    "~/.gnupg",
    "~/.config/op",
    "~/.vault-token",
    "~/.terraform.d/credentials.tfrc.json",
    "~/.cargo/credentials.toml",
    "~/.git-credentials",
    "~/.netrc",
];

/// Confinement technology requested by the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxTechnology {
    /// Never confine.
    None,
    /// Pick the best primitive available on this platform.
    #[default]
    Auto,
    /// Linux Landlock filesystem rulesets.
    Landlock,
    /// Linux seccomp-bpf syscall filtering.
    Seccomp,
    /// macOS `sandbox-exec` profiles.
    Seatbelt,
}

impl SandboxTechnology {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::Landlock => "landlock",
            Self::Seccomp => "seccomp",
            Self::Seatbelt => "seatbelt",
        }
    }

    /// Whether this names a concrete platform primitive.
    pub fn is_concrete(self) -> bool {
        matches!(self, Self::Landlock | Self::Seccomp | Self::Seatbelt)
    }
}

impl fmt::Display for SandboxTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxTechnology {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "auto" => Ok(Self::Auto),
            "landlock" => Ok(Self::Landlock),
            "seccomp" => Ok(Self::Seccomp),
            "seatbelt" | "macos" | "sandbox-exec" => Ok(Self::Seatbelt),
            other => Err(format!("unknown sandbox technology `{other}`")),
        }
    }
}

/// Sandbox configuration (`[sandbox]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Master switch. When false every execution runs unconfined.
    pub enabled: bool,

    /// Requested technology.
    pub technology: SandboxTechnology,

    /// Paths readable by confined processes, in addition to the session directory.
    pub allowed_read_paths: Vec<PathBuf>,

    /// Paths writable by confined processes, in addition to the session directory.
    pub allowed_write_paths: Vec<PathBuf>,

    /// Paths denied even when they sit under an allowed root. Supports `~/`.
    pub blocked_paths: Vec<String>,

    /// Memory ceiling per process in megabytes (0 = unlimited).
    pub max_memory_mb: u64,

    /// Share of the wall-clock budget the process may spend on CPU (1-100).
    pub max_cpu_percent: u8,

    /// Largest file a process may create, in megabytes (0 = unlimited).
    pub max_file_size_mb: u64,

    /// Process fan-out ceiling (0 = unlimited). Counted per user by the kernel.
    pub max_processes: u64,

    /// Allow outbound network access.
    pub network_allowed: bool,

    /// Degrade to no confinement instead of failing when an explicitly
    /// requested technology is unavailable.
    pub fallback_to_noop: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            technology: SandboxTechnology::Auto,
            allowed_read_paths: DEFAULT_READ_PATHS.iter().map(PathBuf::from).collect(),
            allowed_write_paths: Vec::new(),
            blocked_paths: DEFAULT_SENSITIVE_PATHS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            max_memory_mb: 512,
            max_cpu_percent: 100,
            max_file_size_mb: 64,
            max_processes: 0,
            network_allowed: false,
            fallback_to_noop: true,
        }
    }
}

impl SandboxConfig {
    /// A configuration that never confines anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            technology: SandboxTechnology::None,
            ..Self::default()
        }
    }

    /// Builder: request a specific technology.
    pub fn with_technology(mut self, technology: SandboxTechnology) -> Self {
        self.technology = technology;
        self
    }

    /// Builder: allow or deny network access.
    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    /// `enabled && technology != none`.
    pub fn is_active(&self) -> bool {
        self.enabled && self.technology != SandboxTechnology::None
    }

    /// Blocked paths with `~` expanded to the home directory.
    pub fn expanded_blocked_paths(&self) -> Vec<PathBuf> {
        self.blocked_paths.iter().map(|p| expand_home(p)).collect()
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
