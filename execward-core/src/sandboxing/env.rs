//! Environment scrubbing for confined children.
//!
//! The child environment is rebuilt from an allow-list; nothing is inherited
//! wholesale. Credential-looking names never pass, even when allow-listed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::SandboxType;

/// Never forwarded to a child, whatever the allow-list says.
pub const FILTERED_ENV_VARS: &[&str] = &[
    "SSH_AUTH_SOCK",
    "GPG_AGENT_INFO",
    "DATABASE_URL",
    "PGPASSWORD",
    "MYSQL_PWD",
    "KUBECONFIG",
    "DOCKER_AUTH_CONFIG",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "HF_TOKEN",
];

/// Forwarded from the host when present.
pub const PRESERVED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
    "PYTHONPATH",
    "NODE_PATH",
    "VIRTUAL_ENV",
    "NO_COLOR",
];

pub const EXECWARD_SANDBOX_ACTIVE: &str = "EXECWARD_SANDBOX_ACTIVE";
pub const EXECWARD_SANDBOX_TYPE: &str = "EXECWARD_SANDBOX_TYPE";
pub const EXECWARD_SANDBOX_NETWORK_DISABLED: &str = "EXECWARD_SANDBOX_NETWORK_DISABLED";
pub const EXECWARD_SANDBOX_WRITABLE_ROOTS: &str = "EXECWARD_SANDBOX_WRITABLE_ROOTS";

pub(crate) const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub fn should_filter_env_var(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    FILTERED_ENV_VARS.contains(&upper.as_str())
        || upper.starts_with("AWS_")
        || upper.starts_with("AZURE_")
        || upper.starts_with("GCP_")
        || upper.starts_with("LD_")
        || upper.starts_with("DYLD_")
        || upper.ends_with("_TOKEN")
        || upper.ends_with("_KEY")
        || upper.ends_with("_SECRET")
        || upper.ends_with("_PASSWORD")
        || upper.ends_with("_CREDENTIALS")
}

/// Build the child environment from `host`.
///
/// Temp variables point at `work_dir`, the one place a confined child can write.
pub fn build_sanitized_env(
    host: &BTreeMap<String, String>,
    extra_allowed: &[String],
    work_dir: &Path,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = PRESERVED_ENV_VARS
        .iter()
        .copied()
        .chain(extra_allowed.iter().map(String::as_str))
        .filter(|key| !should_filter_env_var(key))
        .filter_map(|key| host.get(key).map(|value| (key.to_string(), value.clone())))
        .collect();

    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    let work_dir = work_dir.display().to_string();
    for key in ["TMPDIR", "TMP", "TEMP"] {
        env.insert(key.to_string(), work_dir.clone());
    }
    env
}

/// Tell the child which sandbox it runs under.
pub fn apply_sandbox_markers(
    env: &mut BTreeMap<String, String>,
    sandbox_type: SandboxType,
    network_disabled: bool,
    writable_roots: &[PathBuf],
) {
    if sandbox_type == SandboxType::Noop {
        return;
    }
    env.insert(EXECWARD_SANDBOX_ACTIVE.to_string(), "1".to_string());
    env.insert(EXECWARD_SANDBOX_TYPE.to_string(), sandbox_type.to_string());
    if network_disabled {
        env.insert(EXECWARD_SANDBOX_NETWORK_DISABLED.to_string(), "1".to_string());
    }
    if !writable_roots.is_empty() {
        let roots: Vec<String> = writable_roots
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        env.insert(EXECWARD_SANDBOX_WRITABLE_ROOTS.to_string(), roots.join(":"));
    }
}
