//! Configuration validation engine.
//!
//! Parses a config file, detects unknown/misspelled fields, and reports
//! semantic problems that deserialization alone does not catch.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use crate::{
    env_subst::substitute_env,
    loader::{find_config_file, parse_config, parse_config_value},
    schema::TuringPiConfig,
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "range", "cluster"
    pub category: &'static str,
    /// Dotted path, e.g. "images.compression_level"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    Array(Box<KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Struct};

    let fields = |names: &[&'static str]| Struct(names.iter().map(|n| (*n, Leaf)).collect());

    Struct(HashMap::from([
        (
            "container",
            fields(&[
                "worker_image",
                "name_prefix",
                "docker_context",
                "docker_host",
                "stop_grace_secs",
                "cleanup_timeout_secs",
                "sweep_timeout_secs",
                "exec_timeout_secs",
            ]),
        ),
        (
            "images",
            fields(&[
                "output_dir",
                "temp_dir",
                "compression_level",
                "expansion_ratio",
                "temp_max_age_secs",
                "sweep_interval_secs",
                "keep_intermediate",
                "verify_checksums",
            ]),
        ),
        ("network", fields(&["prefix_len", "gateway", "dns"])),
        ("bmc", fields(&["host", "port", "user"])),
        (
            "nodes",
            Array(Box::new(fields(&["index", "hostname", "ip", "user"]))),
        ),
        (
            "retry",
            fields(&["attempts", "initial_delay_ms", "increment_ms"]),
        ),
    ]))
}

fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (schema, value) {
        (KnownKeys::Struct(known), serde_json::Value::Object(map)) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match known.get(key.as_str()) {
                    Some(child_schema) => {
                        check_unknown_fields(child, child_schema, &path, diagnostics);
                    },
                    None => {
                        let hint = suggest(key, known.keys().copied());
                        let message = match hint {
                            Some(h) => format!("unknown field \"{key}\" (did you mean \"{h}\"?)"),
                            None => format!("unknown field \"{key}\""),
                        };
                        diagnostics.push(Diagnostic::new(
                            Severity::Warning,
                            "unknown-field",
                            path,
                            message,
                        ));
                    },
                }
            }
        },
        (KnownKeys::Array(item), serde_json::Value::Array(items)) => {
            for (i, child) in items.iter().enumerate() {
                check_unknown_fields(child, item, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        _ => {},
    }
}

/// Closest known key within edit distance 2.
fn suggest<'a>(key: &str, known: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    known
        .map(|k| (levenshtein(key, k), k))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, k)| k)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}

/// Validate the config file at `path`, or the discovered one when `None`.
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path.map(Path::to_path_buf).or_else(find_config_file);

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => validate_str(&substitute_env(&content), &actual_path),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate config text; the format is taken from `path`'s extension.
pub fn validate_str(raw: &str, path: &Path) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let value = match parse_config_value(raw, path) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(Severity::Error, "syntax", "", e.to_string()));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    match parse_config(raw, path) {
        Ok(config) => diagnostics.extend(check_config(&config)),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            e.to_string(),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Semantic checks on an already-parsed config.
#[must_use]
pub fn check_config(config: &TuringPiConfig) -> Vec<Diagnostic> {
    let mut out = Vec::new();

    if config.images.compression_level > 9 {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "images.compression_level",
            format!(
                "compression level {} is outside 0..=9",
                config.images.compression_level
            ),
        ));
    }
    if config.images.expansion_ratio < 1.0 {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "images.expansion_ratio",
            "expansion ratio below 1.0 underestimates the decompressed size",
        ));
    }
    if config.images.sweep_interval_secs == 0 {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "images.sweep_interval_secs",
            "sweep interval must be positive",
        ));
    }
    if !matches!(config.network.prefix_len, 8 | 16 | 24) {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "network.prefix_len",
            format!(
                "prefix /{} is not one of 8, 16, 24; legacy images will reject it",
                config.network.prefix_len
            ),
        ));
    }
    if config.network.dns.is_empty() {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "network.dns",
            "no DNS servers configured; prepare will require --dns",
        ));
    }
    if config.retry.attempts == 0 {
        out.push(Diagnostic::new(
            Severity::Error,
            "range",
            "retry.attempts",
            "at least one attempt is required",
        ));
    }
    if config.container.sweep_timeout_secs < config.container.cleanup_timeout_secs {
        out.push(Diagnostic::new(
            Severity::Warning,
            "range",
            "container.sweep_timeout_secs",
            "sweep ceiling is shorter than a single container cleanup",
        ));
    }

    let mut seen = BTreeSet::new();
    for (i, node) in config.nodes.iter().enumerate() {
        let path = format!("nodes[{i}].index");
        if !(1..=4).contains(&node.index) {
            out.push(Diagnostic::new(
                Severity::Error,
                "cluster",
                path,
                format!("node index {} is outside 1..=4", node.index),
            ));
        } else if !seen.insert(node.index) {
            out.push(Diagnostic::new(
                Severity::Error,
                "cluster",
                path,
                format!("node index {} is configured twice", node.index),
            ));
        }
        if let Some(hostname) = node.hostname.as_deref().map(str::trim) {
            let label_ok = (1..=63).contains(&hostname.len())
                && hostname.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
                && !hostname.starts_with('-')
                && !hostname.ends_with('-');
            if hostname.is_empty() {
                out.push(Diagnostic::new(
                    Severity::Error,
                    "cluster",
                    format!("nodes[{i}].hostname"),
                    "hostname is empty",
                ));
            } else if !label_ok {
                out.push(Diagnostic::new(
                    Severity::Error,
                    "cluster",
                    format!("nodes[{i}].hostname"),
                    format!("{hostname:?} is not a single hostname label"),
                ));
            }
        }
    }

    out
}
