use std::path::PathBuf;

use toml::Value as TomlValue;

use super::merge_toml_values;

/// Where a configuration layer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// `/etc/execward/execward.toml`
    System { file: PathBuf },
    /// `~/.config/execward/execward.toml`
    User { file: PathBuf },
    /// `execward.toml` in the workspace root.
    Workspace { file: PathBuf },
    /// File named by `EXECWARD_CONFIG_PATH` or passed explicitly.
    Explicit { file: PathBuf },
}

impl ConfigLayerSource {
    pub fn file(&self) -> &PathBuf {
        match self {
            Self::System { file }
            | Self::User { file }
            | Self::Workspace { file }
            | Self::Explicit { file } => file,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayerEntry {
    pub source: ConfigLayerSource,
    pub config: TomlValue,
}

impl ConfigLayerEntry {
    pub fn new(source: ConfigLayerSource, config: TomlValue) -> Self {
        Self { source, config }
    }
}

/// Configuration layers, ordered from lowest to highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayerStack {
    layers: Vec<ConfigLayerEntry>,
}

impl ConfigLayerStack {
    pub fn push(&mut self, layer: ConfigLayerEntry) {
        self.layers.push(layer);
    }

    /// Merge all layers into one effective document.
    pub fn effective_config(&self) -> TomlValue {
        let mut merged = TomlValue::Table(toml::Table::new());
        for layer in &self.layers {
            merge_toml_values(&mut merged, &layer.config);
        }
        merged
    }

    pub fn layers(&self) -> &[ConfigLayerEntry] {
        &self.layers
    }
}
