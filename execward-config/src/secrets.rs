//! Secrets redaction configuration (`[secrets]`).

use serde::{Deserialize, Serialize};

/// Case-insensitive patterns matched against environment variable names.
/// Values of matching variables are redacted from all captured output.
pub const DEFAULT_SECRET_NAME_PATTERNS: &[&str] = &[
    "KEY",
    "SECRET",
    "TOKEN",
    "PASSW(OR)?D",
    "CREDENTIAL",
    "PRIVATE",
    "AUTH",
    "COOKIE",
    "_PAT$",
    "DATABASE_URL",
    "_DSN$",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Name patterns (regular expressions, matched case-insensitively).
    pub name_patterns: Vec<String>,

    /// Additional name patterns appended to `name_patterns`.
    pub extra_patterns: Vec<String>,

    /// Values shorter than this are never treated as secrets.
    pub min_length: usize,

    /// Text substituted for each redacted value.
    pub replacement: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            name_patterns: DEFAULT_SECRET_NAME_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
            extra_patterns: Vec::new(),
            min_length: 8,
            replacement: "[REDACTED]".to_string(),
        }
    }
}

impl SecretsConfig {
    /// All name patterns, configured ones first.
    pub fn all_patterns(&self) -> impl Iterator<Item = &str> {
        self.name_patterns
            .iter()
            .chain(self.extra_patterns.iter())
            .map(String::as_str)
    }
}
