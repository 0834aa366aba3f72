//! Redaction of environment-derived secret values from captured output.
//!
//! The filter is total: it never fails on input. If the combined pattern
//! cannot be compiled the filter withholds every line instead of passing
//! anything through unredacted.

use std::fmt;

use execward_config::SecretsConfig;
use execward_process::LineRedactor;
use regex::{Regex, RegexBuilder};
use tracing::{error, warn};

#[derive(Clone)]
enum Mode {
    Identity,
    Redact(Regex),
    /// Fail closed: every line is replaced wholesale.
    Withhold,
}

/// Replaces every occurrence of every collected secret value.
#[derive(Clone)]
pub struct SecretsFilter {
    mode: Mode,
    replacement: String,
    secret_count: usize,
    longest: usize,
}

impl SecretsFilter {
    /// Identity filter; nothing is redacted.
    pub fn identity() -> Self {
        Self {
            mode: Mode::Identity,
            replacement: String::new(),
            secret_count: 0,
            longest: 0,
        }
    }

    /// Collect secrets from the current process environment.
    pub fn from_env(config: &SecretsConfig) -> Self {
        Self::from_vars(std::env::vars(), config)
    }

    /// Collect secrets from an explicit `(name, value)` snapshot.
    pub fn from_vars<I, K, V>(vars: I, config: &SecretsConfig) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let name_patterns: Vec<Regex> = config
            .all_patterns()
            .filter_map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| {
                        warn!(pattern, error = %err, "ignoring invalid secret name pattern");
                    })
                    .ok()
            })
            .collect();

        let min_length = config.min_length.max(1);
        let mut values: Vec<String> = vars
            .into_iter()
            .filter(|(name, _)| {
                let name = name.as_ref();
                name_patterns.iter().any(|pattern| pattern.is_match(name))
            })
            .map(|(_, value)| value.into())
            .filter(|value| value.len() >= min_length)
            .collect();

        // Output is redacted one line at a time, so a multi-line value is
        // also registered line by line.
        let fragments: Vec<String> = values
            .iter()
            .filter(|value| value.contains('\n'))
            .flat_map(|value| value.lines())
            .map(str::trim)
            .filter(|line| line.len() >= min_length)
            .map(str::to_owned)
            .collect();
        values.extend(fragments);

        Self::from_values(&mut values, &config.replacement)
    }

    fn from_values(values: &mut Vec<String>, replacement: &str) -> Self {
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();

        if values.is_empty() {
            return Self::identity();
        }

        let secret_count = values.len();
        let longest = values[0].len();
        // Longest first: alternation is leftmost-first, so a longer secret
        // that contains a shorter one is matched whole.
        let pattern = values
            .iter()
            .map(|value| regex::escape(value))
            .collect::<Vec<_>>()
            .join("|");

        let mode = match RegexBuilder::new(&pattern)
            .size_limit(64 * 1024 * 1024)
            .build()
        {
            Ok(regex) => Mode::Redact(regex),
            Err(err) => {
                error!(
                    secret_count,
                    error = %err,
                    "failed to compile secrets pattern; withholding all output"
                );
                Mode::Withhold
            }
        };

        Self {
            mode,
            replacement: replacement.to_string(),
            secret_count,
            longest,
        }
    }

    pub fn redact(&self, input: &str) -> String {
        match &self.mode {
            Mode::Identity => input.to_string(),
            Mode::Redact(regex) => regex
                .replace_all(input, regex::NoExpand(&self.replacement))
                .into_owned(),
            Mode::Withhold => withhold(input, &self.replacement),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.mode, Mode::Identity)
    }

    pub fn is_withholding(&self) -> bool {
        matches!(self.mode, Mode::Withhold)
    }

    pub fn secret_count(&self) -> usize {
        self.secret_count
    }
}

impl Default for SecretsFilter {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for SecretsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Identity => "identity",
            Mode::Redact(_) => "redact",
            Mode::Withhold => "withhold",
        };
        f.debug_struct("SecretsFilter")
            .field("mode", &mode)
            .field("secret_count", &self.secret_count)
            .finish()
    }
}

impl LineRedactor for SecretsFilter {
    fn redact(&self, line: &str) -> String {
        SecretsFilter::redact(self, line)
    }

    fn lookahead(&self) -> usize {
        self.longest
    }
}

/// Replace each line with `replacement`, keeping line breaks.
fn withhold(input: &str, replacement: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for line in input.split_inclusive('\n') {
        out.push_str(replacement);
        if line.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn filter(vars: &[(&str, &str)]) -> SecretsFilter {
        SecretsFilter::from_vars(
            vars.iter().map(|(k, v)| (*k, *v)),
            &SecretsConfig::default(),
        )
    }

    #[test]
    fn identity_without_qualifying_values() {
        let filter = filter(&[("HOME", "/home/dev"), ("API_KEY", "short")]);
        assert!(filter.is_identity());
        assert_eq!(filter.redact("API_KEY=short\n"), "API_KEY=short\n");
    }

    #[test]
    fn redacts_every_occurrence() {
        let filter = filter(&[("GITHUB_TOKEN", "ghp_abcdef123456")]);
        assert_eq!(
            filter.redact("a ghp_abcdef123456 b ghp_abcdef123456\n"),
            "a [REDACTED] b [REDACTED]\n"
        );
    }

    #[test]
    fn overlapping_secrets_are_both_fully_redacted() {
        let filter = filter(&[
            ("DB_PASSWORD", "hunter2hunter2"),
            ("SERVICE_SECRET", "prefix-hunter2hunter2-suffix"),
        ]);
        assert_eq!(filter.secret_count(), 2);
        assert_eq!(
            filter.redact("x=prefix-hunter2hunter2-suffix y=hunter2hunter2"),
            "x=[REDACTED] y=[REDACTED]"
        );
    }

    #[test]
    fn name_patterns_are_case_insensitive_and_extendable() {
        let config = SecretsConfig {
            extra_patterns: vec!["^MY_APP_".into()],
            ..SecretsConfig::default()
        };
        let filter = SecretsFilter::from_vars(
            [("my_app_seed", "seed-value-42"), ("stripe_api_key", "sk_live_999999")],
            &config,
        );
        assert_eq!(filter.secret_count(), 2);
        assert_eq!(
            filter.redact("seed-value-42 sk_live_999999"),
            "[REDACTED] [REDACTED]"
        );
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let filter = filter(&[("AUTH_HEADER", "Bearer a.b*c+d?")]);
        assert_eq!(filter.redact("Bearer a.b*c+d?"), "[REDACTED]");
        assert_eq!(filter.redact("Bearer aXbbbcd"), "Bearer aXbbbcd");
    }

    #[test]
    fn replacement_is_not_expanded() {
        let config = SecretsConfig {
            replacement: "$0".into(),
            ..SecretsConfig::default()
        };
        let filter = SecretsFilter::from_vars([("API_TOKEN", "tok-123456789")], &config);
        assert_eq!(filter.redact("tok-123456789"), "$0");
    }

    #[test]
    fn invalid_name_pattern_is_skipped() {
        let config = SecretsConfig {
            name_patterns: vec!["(".into(), "TOKEN".into()],
            ..SecretsConfig::default()
        };
        let filter = SecretsFilter::from_vars([("API_TOKEN", "tok-123456789")], &config);
        assert_eq!(filter.secret_count(), 1);
    }

    #[test]
    fn multi_line_values_are_redacted_line_by_line() {
        let filter = filter(&[(
            "SIGNING_KEY",
            "-----BEGIN KEY-----\nAAAABBBBCCCCDDDD\nEE\n-----END KEY-----",
        )]);
        // Whole value plus the three lines long enough to qualify.
        assert_eq!(filter.secret_count(), 4);
        assert_eq!(filter.redact("AAAABBBBCCCCDDDD\n"), "[REDACTED]\n");
        assert_eq!(filter.redact("-----END KEY-----\n"), "[REDACTED]\n");
        assert_eq!(filter.redact("EE\n"), "EE\n");
        assert_eq!(
            filter.redact("-----BEGIN KEY-----\nAAAABBBBCCCCDDDD\nEE\n-----END KEY-----"),
            "[REDACTED]"
        );
    }

    #[test]
    fn withhold_keeps_line_structure() {
        assert_eq!(withhold("a\nb\n", "[X]"), "[X]\n[X]\n");
        assert_eq!(withhold("tail", "[X]"), "[X]");
        assert_eq!(withhold("", "[X]"), "");
    }

    #[test]
    fn lookahead_is_longest_secret() {
        let filter = filter(&[("A_TOKEN", "12345678"), ("B_TOKEN", "1234567890ab")]);
        assert_eq!(LineRedactor::lookahead(&filter), 12);
    }
}
