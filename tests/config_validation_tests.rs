//! Config Validation Tests
//!
//! Loading from disk, unknown-key suggestions and cross-field validation.

use phasecast::config::validation::validate_unknown_keys;
use phasecast::config::{ConfigError, SinkKind};
use phasecast::{PhasecastConfig, RowLayout};
use std::io::Write;
use tokio_test::{assert_err, assert_ok};

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn validation_errors(config: &PhasecastConfig) -> Vec<String> {
    match config.validate() {
        Err(ConfigError::Validation(errors)) => errors,
        other => panic!("expected validation errors, got {other:?}"),
    }
}

#[test]
fn file_overrides_keep_other_defaults() {
    let file = write_config(
        r#"
[publisher]
endpoint = "tcp://127.0.0.1:6000"
rate_hz = 50.0

[timeseries]
layout = "aggregate"

[storage]
kind = "memory"
"#,
    );
    let config = PhasecastConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.publisher.endpoint, "tcp://127.0.0.1:6000");
    assert_eq!(config.publisher.rate_hz, 50.0);
    assert_eq!(config.publisher.grace_period_secs, 75);
    assert_eq!(config.timeseries.layout, RowLayout::Aggregate);
    assert_eq!(config.storage.kind, SinkKind::Memory);
    assert_ok!(config.validate());
}

#[test]
fn broken_file_is_a_parse_error() {
    let file = write_config("[publisher\nrate_hz = ");
    assert!(matches!(
        PhasecastConfig::load_from_file(file.path()),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = PhasecastConfig::load_from_file(std::path::Path::new("/nonexistent/phasecast.toml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn unknown_keys_warn_without_failing() {
    let raw = r#"
[subscriber]
read_timout_ms = 4000

[sumary]
window_ms = 500
"#;
    let warnings = validate_unknown_keys(raw);
    let fields: Vec<&str> = warnings.iter().map(|w| w.field.as_str()).collect();
    assert!(fields.contains(&"subscriber.read_timout_ms"));
    assert!(fields.contains(&"sumary"));

    let timeout = warnings
        .iter()
        .find(|w| w.field == "subscriber.read_timout_ms")
        .unwrap();
    assert_eq!(timeout.suggestion.as_deref(), Some("subscriber.read_timeout_ms"));
    assert!(timeout.to_string().contains("did you mean"));

    let file = write_config(raw);
    assert_ok!(PhasecastConfig::load_from_file(file.path()));
}

#[test]
fn every_problem_is_reported_at_once() {
    let mut config = PhasecastConfig::default();
    config.publisher.rate_hz = 0.0;
    config.publisher.endpoint = "udp://nowhere".to_string();
    config.summary.window_ms = 0;
    config.storage.table = "readings; drop table x".to_string();

    let errors = validation_errors(&config);
    assert_eq!(errors.len(), 4, "{errors:#?}");
    assert!(errors.iter().any(|e| e.starts_with("publisher.rate_hz")));
    assert!(errors.iter().any(|e| e.starts_with("publisher.endpoint")));
    assert!(errors.iter().any(|e| e.starts_with("summary.window_ms")));
    assert!(errors.iter().any(|e| e.starts_with("storage.table")));
}

#[test]
fn read_timeout_must_outlast_heartbeats() {
    let mut config = PhasecastConfig::default();
    config.subscriber.read_timeout_ms = config.publisher.heartbeat_interval_ms;
    let errors = validation_errors(&config);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("heartbeat_interval_ms"));
}

#[test]
fn timescale_sink_needs_a_url() {
    let mut config = PhasecastConfig::default();
    config.storage.kind = SinkKind::Timescale;
    config.storage.url = None;
    assert!(validation_errors(&config)[0].starts_with("storage.url"));

    config.storage.url = Some("postgres://localhost/phasecast".to_string());
    assert_ok!(config.validate());
}

#[test]
fn pending_cap_cannot_undercut_flush_threshold() {
    let mut config = PhasecastConfig::default();
    config.timeseries.max_pending_rows = config.timeseries.flush_threshold_rows - 1;
    assert_err!(config.validate());
    assert!(validation_errors(&config)[0].starts_with("timeseries.max_pending_rows"));
}

#[test]
fn serialized_defaults_round_trip() {
    let config = PhasecastConfig::default();
    let rendered = config.to_toml().unwrap();
    assert!(validate_unknown_keys(&rendered).is_empty());
    let parsed: PhasecastConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, config);
}
