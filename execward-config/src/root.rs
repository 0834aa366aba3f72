use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::debug::DebugConfig;
use crate::execution::ExecutionConfig;
use crate::monitor::MonitorConfig;
use crate::paths::is_within;
use crate::sandbox::SandboxConfig;
use crate::secrets::SecretsConfig;

/// Top-level `execward.toml` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecwardConfig {
    pub sandbox: SandboxConfig,
    pub execution: ExecutionConfig,
    pub secrets: SecretsConfig,
    pub monitor: MonitorConfig,
    pub debug: DebugConfig,
}

impl ExecwardConfig {
    /// Reject values that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        let sandbox = &self.sandbox;
        ensure!(
            (1..=100).contains(&sandbox.max_cpu_percent),
            "sandbox.max_cpu_percent must be between 1 and 100, got {}",
            sandbox.max_cpu_percent
        );

        let execution = &self.execution;
        ensure!(
            execution.default_timeout_secs > 0,
            "execution.default_timeout_secs must be greater than zero"
        );
        ensure!(
            execution.max_timeout_secs >= execution.default_timeout_secs,
            "execution.max_timeout_secs ({}) must not be below default_timeout_secs ({})",
            execution.max_timeout_secs,
            execution.default_timeout_secs
        );
        ensure!(
            execution.max_output_bytes > 0,
            "execution.max_output_bytes must be greater than zero"
        );
        ensure!(
            execution.chunk_channel_capacity > 0,
            "execution.chunk_channel_capacity must be greater than zero"
        );
        ensure!(
            execution.session_idle_timeout_secs > 0,
            "execution.session_idle_timeout_secs must be greater than zero"
        );

        let state_file = execution.resolved_state_file();
        let work_root = execution.resolved_work_root();
        ensure!(
            !is_within(&state_file, &work_root),
            "execution.state_file ({}) must not lie inside work_root ({})",
            state_file.display(),
            work_root.display()
        );
        if let Some(writable) = sandbox
            .allowed_write_paths
            .iter()
            .find(|path| is_within(&state_file, path))
        {
            anyhow::bail!(
                "execution.state_file ({}) must not lie inside writable path {}",
                state_file.display(),
                writable.display()
            );
        }

        ensure!(
            !self.secrets.replacement.is_empty(),
            "secrets.replacement must not be empty"
        );
        ensure!(
            !self.monitor.enabled || self.monitor.interval_secs > 0,
            "monitor.interval_secs must be greater than zero when monitoring is enabled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        ExecwardConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_cpu_percent_out_of_range() {
        let mut config = ExecwardConfig::default();
        config.sandbox.max_cpu_percent = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_cpu_percent"));
    }

    #[test]
    fn rejects_max_timeout_below_default() {
        let mut config = ExecwardConfig::default();
        config.execution.default_timeout_secs = 60;
        config.execution.max_timeout_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_state_file_inside_work_root() {
        let mut config = ExecwardConfig::default();
        config.execution.work_root = Some(PathBuf::from("/srv/execward"));
        config.execution.state_file = Some(PathBuf::from("/srv/execward/.state/state.json"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("work_root"), "{err}");

        config.execution.state_file =
            Some(PathBuf::from("/srv/execward/session/../../state.json"));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_state_file_inside_writable_path() {
        let mut config = ExecwardConfig::default();
        config.execution.work_root = Some(PathBuf::from("/srv/sessions"));
        config.execution.state_file = Some(PathBuf::from("/srv/shared/state.json"));
        config.sandbox.allowed_write_paths = vec![PathBuf::from("/srv/shared")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("writable path"), "{err}");
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: ExecwardConfig = toml::from_str(
            r#"
            [sandbox]
            technology = "seccomp"

            [execution]
            approval_policy = "none"
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.technology, crate::SandboxTechnology::Seccomp);
        assert!(config.sandbox.enabled);
        assert_eq!(config.execution.approval_policy, crate::ApprovalPolicy::None);
        assert_eq!(config.execution.default_timeout_secs, 30);
    }
}
