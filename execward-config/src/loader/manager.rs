use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::layers::{ConfigLayerEntry, ConfigLayerSource, ConfigLayerStack};
use crate::root::ExecwardConfig;
use crate::{CONFIG_FILE_NAME, CONFIG_PATH_ENV};

/// Loads, merges and validates `execward.toml` layers.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ExecwardConfig,
    config_path: Option<PathBuf>,
    layer_stack: ConfigLayerStack,
}

impl ConfigManager {
    /// Load configuration from the default locations.
    ///
    /// `EXECWARD_CONFIG_PATH` wins when set; otherwise the current directory
    /// is treated as the workspace.
    pub fn load() -> Result<Self> {
        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            let trimmed = config_path.trim();
            if !trimmed.is_empty() {
                return Self::load_from_file(trimmed).with_context(|| {
                    format!(
                        "Failed to load configuration from {}={}",
                        CONFIG_PATH_ENV, trimmed
                    )
                });
            }
        }

        Self::load_from_workspace(std::env::current_dir()?)
    }

    /// Load system, user and workspace layers for `workspace`.
    pub fn load_from_workspace(workspace: impl AsRef<Path>) -> Result<Self> {
        let mut layer_stack = Self::base_layers();

        let workspace_config_path = workspace.as_ref().join(CONFIG_FILE_NAME);
        if workspace_config_path.exists() {
            let toml = Self::load_toml_from_file(&workspace_config_path)?;
            layer_stack.push(ConfigLayerEntry::new(
                ConfigLayerSource::Workspace {
                    file: workspace_config_path,
                },
                toml,
            ));
        }

        Self::from_layers(layer_stack)
    }

    /// Load system and user layers, then `path` on top.
    ///
    /// Unlike the implicit layers, a missing explicit file is an error.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut layer_stack = Self::base_layers();
        let toml = Self::load_toml_from_file(path)?;
        layer_stack.push(ConfigLayerEntry::new(
            ConfigLayerSource::Explicit {
                file: path.to_path_buf(),
            },
            toml,
        ));
        Self::from_layers(layer_stack)
    }

    pub fn config(&self) -> &ExecwardConfig {
        &self.config
    }

    pub fn into_config(self) -> ExecwardConfig {
        self.config
    }

    /// Highest-precedence file that contributed to the configuration.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn layer_stack(&self) -> &ConfigLayerStack {
        &self.layer_stack
    }

    /// Path of the per-user configuration file.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("execward").join(CONFIG_FILE_NAME))
    }

    fn base_layers() -> ConfigLayerStack {
        let mut layer_stack = ConfigLayerStack::default();

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/execward").join(CONFIG_FILE_NAME);
            Self::push_optional(&mut layer_stack, system_config, |file| {
                ConfigLayerSource::System { file }
            });
        }

        if let Some(user_config) = Self::user_config_path() {
            Self::push_optional(&mut layer_stack, user_config, |file| {
                ConfigLayerSource::User { file }
            });
        }

        layer_stack
    }

    // Implicit layers are best effort: a broken user file should not stop a
    // workspace from loading.
    fn push_optional(
        stack: &mut ConfigLayerStack,
        path: PathBuf,
        source: impl FnOnce(PathBuf) -> ConfigLayerSource,
    ) {
        if !path.exists() {
            return;
        }
        match Self::load_toml_from_file(&path) {
            Ok(toml) => stack.push(ConfigLayerEntry::new(source(path), toml)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable config layer");
            }
        }
    }

    fn from_layers(layer_stack: ConfigLayerStack) -> Result<Self> {
        let config = if layer_stack.layers().is_empty() {
            ExecwardConfig::default()
        } else {
            layer_stack
                .effective_config()
                .try_into()
                .context("Failed to deserialize effective configuration")?
        };

        config
            .validate()
            .context("Configuration failed validation")?;

        let config_path = layer_stack
            .layers()
            .last()
            .map(|layer| layer.source.file().clone());

        tracing::debug!(
            layers = layer_stack.layers().len(),
            path = ?config_path,
            "configuration loaded"
        );

        Ok(Self {
            config,
            config_path,
            layer_stack,
        })
    }

    fn load_toml_from_file(path: &Path) -> Result<toml::Value> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let value: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(value)
    }
}
