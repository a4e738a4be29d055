//! PII redaction applied in-line before an entry reaches the writer.
//!
//! Grounded on the teacher's `format::template` regex-substitution pattern
//! (placeholder replacement via a compiled `Regex` over a template string)
//! and `backend::search`'s use of `regex::Regex` as the matching engine —
//! generalized here into a fixed, immutable table of (name, pattern,
//! replacement) built once at construction, per Design Notes §9 ("a
//! compiled, immutable table... adding a pattern is a rebuild, not a
//! mutation").

use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{LogtapError, Result};

struct Pattern {
    name: String,
    regex: Regex,
    replacement: String,
}

/// A custom pattern loaded from YAML: `{name, regex, replacement}`.
#[derive(Debug, Deserialize)]
struct CustomPatternSpec {
    name: String,
    regex: String,
    replacement: String,
}

fn builtin_patterns() -> Vec<(&'static str, &'static str, &'static str)> {
    vec![
        (
            "email",
            r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
            "<email>",
        ),
        // Luhn-anchored shape: 13-19 digits, optionally grouped by spaces/dashes.
        (
            "credit_card",
            r"\b(?:\d[ -]?){13,19}\b",
            "<credit_card>",
        ),
        (
            "ipv4",
            r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b",
            "<ipv4>",
        ),
        (
            "ipv6",
            r"\b(?:[A-Fa-f0-9]{1,4}:){2,7}[A-Fa-f0-9]{1,4}\b",
            "<ipv6>",
        ),
        (
            "jwt",
            r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\b",
            "<jwt>",
        ),
        (
            "uuid",
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            "<uuid>",
        ),
        ("phone", r"\+[1-9]\d{7,14}\b", "<phone>"),
        (
            "bearer_token",
            r"(?i)\bBearer\s+[A-Za-z0-9\-._~+/]+=*",
            "Bearer <token>",
        ),
        (
            "api_key",
            r"\b[A-Za-z0-9]{32,}\b",
            "<api_key>",
        ),
    ]
}

/// Known built-in pattern names, used to validate `--redact` flags before a
/// `Redactor` is constructed.
pub fn builtin_names() -> Vec<&'static str> {
    builtin_patterns().into_iter().map(|(n, _, _)| n).collect()
}

/// Streaming PII redactor. Immutable after construction; the only mutable
/// piece is the `on_redact` hook, which is itself set once at construction
/// time (never swapped afterward) — see Design Notes §9.
pub struct Redactor {
    patterns: Vec<Pattern>,
    on_redact: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pattern_names: Vec<String>,
}

impl Redactor {
    /// `names` may contain `"all"` (expands to every built-in), specific
    /// built-in names, or be empty (redaction disabled — `message()`/`
    /// apply()` become no-ops, matching the spec's "optional" framing).
    pub fn new(names: &[String], custom_file: Option<&Path>) -> Result<Self> {
        let mut patterns = Vec::new();
        let mut pattern_names = Vec::new();

        let all = builtin_patterns();
        let wants_all = names.iter().any(|n| n == "all");
        for (name, pat, repl) in &all {
            if wants_all || names.iter().any(|n| n == name) {
                patterns.push(Pattern {
                    name: name.to_string(),
                    regex: Regex::new(pat)?,
                    replacement: repl.to_string(),
                });
                pattern_names.push(name.to_string());
            }
        }

        if !wants_all {
            let known: Vec<&str> = all.iter().map(|(n, _, _)| *n).collect();
            for name in names {
                if !known.contains(&name.as_str()) && custom_file.is_none() {
                    return Err(LogtapError::config(format!(
                        "unknown redact pattern: {name}"
                    )));
                }
            }
        }

        if let Some(path) = custom_file {
            let raw = std::fs::read_to_string(path).map_err(LogtapError::from)?;
            let specs: Vec<CustomPatternSpec> = serde_yaml::from_str(&raw)?;
            for spec in specs {
                let regex = Regex::new(&spec.regex).map_err(|e| {
                    LogtapError::config(format!(
                        "custom pattern '{}' failed to compile: {e}",
                        spec.name
                    ))
                })?;
                pattern_names.push(spec.name.clone());
                patterns.push(Pattern {
                    name: spec.name,
                    regex,
                    replacement: spec.replacement,
                });
            }
        }

        Ok(Redactor {
            patterns,
            on_redact: None,
            pattern_names,
        })
    }

    pub fn disabled() -> Self {
        Redactor {
            patterns: Vec::new(),
            on_redact: None,
            pattern_names: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_redact = Some(Box::new(hook));
        self
    }

    pub fn pattern_names(&self) -> &[String] {
        &self.pattern_names
    }

    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Apply every enabled pattern, left to right, to `text`. Overlapping
    /// matches are resolved by pattern order (spec.md §4.1): once a pattern
    /// has rewritten a span, a later pattern only ever sees the rewritten
    /// text, never the original.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.patterns {
            if pattern.regex.is_match(&out) {
                out = pattern
                    .regex
                    .replace_all(&out, pattern.replacement.as_str())
                    .into_owned();
                if let Some(hook) = &self.on_redact {
                    hook(&pattern.name);
                }
            }
        }
        out
    }

    /// Redacts a log entry's message in place, and optionally its label
    /// values (message only, per spec.md §4.1's default scope — label
    /// redaction is an explicit opt-in by the caller via `redact_labels`).
    pub fn apply(&self, message: &str, labels: &[(String, String)], redact_labels: bool) -> (String, Vec<(String, String)>) {
        let message = self.redact(message);
        let labels = if redact_labels {
            labels
                .iter()
                .map(|(k, v)| (k.clone(), self.redact(v)))
                .collect()
        } else {
            labels.to_vec()
        };
        (message, labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_email() {
        let r = Redactor::new(&["email".to_string()], None).unwrap();
        let out = r.redact("contact user@example.com: hello 1");
        assert_eq!(out, "contact <email>: hello 1");
    }

    #[test]
    fn unknown_builtin_is_config_error() {
        let err = Redactor::new(&["not-a-pattern".to_string()], None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn all_expands_to_every_builtin() {
        let r = Redactor::new(&["all".to_string()], None).unwrap();
        assert_eq!(r.pattern_names().len(), builtin_names().len());
    }

    #[test]
    fn idempotent_on_already_redacted_text() {
        let r = Redactor::new(&["email".to_string()], None).unwrap();
        let once = r.redact("user@example.com");
        let twice = r.redact(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn disabled_redactor_is_passthrough() {
        let r = Redactor::disabled();
        assert!(!r.is_enabled());
        assert_eq!(r.redact("user@example.com"), "user@example.com");
    }

    #[test]
    fn hook_fires_once_per_matching_pattern() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let r = Redactor::new(&["email".to_string()], None)
            .unwrap()
            .with_hook(move |_name| {
                count2.fetch_add(1, Ordering::SeqCst);
            });
        r.redact("a@b.com and c@d.com");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_pattern_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.yaml");
        std::fs::write(
            &path,
            "- name: ticket\n  regex: 'TICKET-\\d+'\n  replacement: '<ticket>'\n",
        )
        .unwrap();
        let r = Redactor::new(&[], Some(&path)).unwrap();
        assert_eq!(r.redact("see TICKET-123 for details"), "see <ticket> for details");
    }

    #[test]
    fn malformed_custom_pattern_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "- name: bad\n  regex: '[unterminated'\n  replacement: 'x'\n").unwrap();
        let err = Redactor::new(&[], Some(&path)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
