//! Unknown-key detection with Levenshtein suggestions.
//!
//! The raw TOML is walked before serde deserialization; every dotted key not
//! present in the config schema produces a warning with a "did you mean?"
//! suggestion. Warnings never reject a config.

use super::PhasecastConfig;
use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown config key '{}'", self.field)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

/// Optional keys absent from the serialized defaults.
const OPTIONAL_KEYS: &[&str] = &["publisher.dataset", "storage.url"];

/// Every valid dotted key path, derived from the serialized default config.
pub fn known_config_keys() -> HashSet<String> {
    let mut keys: HashSet<String> = toml::Value::try_from(PhasecastConfig::default())
        .map(|v| walk_toml_keys(&v, "").into_iter().collect())
        .unwrap_or_default();
    keys.extend(OPTIONAL_KEYS.iter().map(|k| (*k).to_string()));
    keys
}

/// Recursively collect dotted key paths.
///
/// `{ a = { b = 1, c = 2 } }` yields `["a", "a.b", "a.c"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Closest known key within edit distance 3, ties broken alphabetically.
pub fn suggest_correction(unknown: &str, known: &HashSet<String>) -> Option<String> {
    known
        .iter()
        .map(|k| (levenshtein(unknown, k), k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.clone())
}

/// Warnings for every unknown key in a raw TOML document.
///
/// Parse errors yield no warnings; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("rate_hz", "rate_hz"), 0);
        assert_eq!(levenshtein("rate_hz", "rate_hx"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
[publisher]
grace_perod_secs = 10
"#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "publisher.grace_perod_secs");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("publisher.grace_period_secs")
        );
    }

    #[test]
    fn test_all_valid_keys_produce_zero_warnings() {
        let warnings = validate_unknown_keys(
            r#"
[publisher]
dataset = "replay.csv"
rate_hz = 60.0

[storage]
kind = "timescale"
url = "postgres://localhost/metrology"

[timeseries]
layout = "aggregate"
"#,
        );
        assert!(warnings.is_empty(), "Expected 0 warnings, got: {warnings:?}");
    }

    #[test]
    fn test_unknown_section_without_close_match() {
        let warnings = validate_unknown_keys("[dashboards]\ngrafana_folder = \"x\"\n");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.suggestion.is_none()));
    }

    #[test]
    fn test_known_keys_cover_every_section() {
        let known = known_config_keys();
        for section in [
            "publisher",
            "subscriber",
            "timeseries",
            "summary",
            "storage",
            "server",
            "logging",
        ] {
            assert!(known.contains(section), "missing section {section}");
        }
        assert!(known.contains("summary.window_ms"));
        assert!(known.contains("storage.url"));
    }
}
