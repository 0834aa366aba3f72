//! Debug and tracing configuration (`[debug]`).

use serde::{Deserialize, Serialize};

/// Trace level for structured logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

impl std::fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Unknown levels fall back to the default instead of rejecting the whole file.
impl<'de> Deserialize<'de> for TraceLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Install a tracing subscriber even when `RUST_LOG` is unset.
    pub enable_tracing: bool,

    pub trace_level: TraceLevel,

    /// Targets to enable, e.g. `execward_core::monitor`. Empty means all execward crates.
    pub trace_targets: Vec<String>,
}

impl DebugConfig {
    /// Build an `EnvFilter`-compatible directive string.
    pub fn filter_directive(&self) -> String {
        let targets = if self.trace_targets.is_empty() {
            vec![
                "execward".to_string(),
                "execward_core".to_string(),
                "execward_process".to_string(),
                "execward_config".to_string(),
            ]
        } else {
            self.trace_targets.clone()
        };
        targets
            .iter()
            .map(|target| format!("{}={}", target, self.trace_level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_default() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: TraceLevel,
        }
        let parsed: Wrapper = toml::from_str("level = \"chatty\"").unwrap();
        assert_eq!(parsed.level, TraceLevel::Warn);
    }

    #[test]
    fn filter_directive_uses_configured_targets() {
        let config = DebugConfig {
            enable_tracing: true,
            trace_level: TraceLevel::Debug,
            trace_targets: vec!["execward_core::monitor".to_string()],
        };
        assert_eq!(config.filter_directive(), "execward_core::monitor=debug");
    }
}
