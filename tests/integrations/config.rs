use alertwatch::cli::Cli;
use alertwatch::config::Config;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

/// Runs `test_fn` with the path of a temporary file holding `toml_content`.
fn with_config_file<F>(toml_content: &str, test_fn: F)
where
    F: FnOnce(PathBuf),
{
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", toml_content).unwrap();
    test_fn(file.path().to_path_buf());
}

#[test]
fn test_load_full_valid_config() {
    let toml_content = r#"
        log_level = "debug"
        rule_files = ["/etc/alertwatch/auth.yml", "/etc/alertwatch/web.yml"]
        state_path = "/var/lib/alertwatch/state.json"

        [dispatch]
        send_timeout_ms = 2500
        auto_silence_after = 5
        silence_cooldown_seconds = 900
        shutdown_grace_seconds = 3

        [dispatch.retry]
        max_retries = 1
        initial_backoff_ms = 100
        max_backoff_ms = 1000
        jitter_factor = 0.0

        [metrics]
        enabled = true
        listen_address = "0.0.0.0:9102"
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from(["alertwatch", "--config", path.to_str().unwrap()]).unwrap();
        let config = Config::load(&cli).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.rule_files.len(), 2);
        assert_eq!(
            config.state_path,
            Some(PathBuf::from("/var/lib/alertwatch/state.json"))
        );
        assert_eq!(config.dispatch.send_timeout_ms, 2500);
        assert_eq!(config.dispatch.auto_silence_after, 5);
        assert_eq!(config.dispatch.retry.max_retries, 1);
        assert_eq!(config.dispatch.retry.max_backoff_ms, 1000);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen_address.port(), 9102);
    });
}

#[test]
fn test_partial_config_keeps_defaults() {
    let toml_content = r#"
        [dispatch]
        auto_silence_after = 10
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from(["alertwatch", "-c", path.to_str().unwrap()]).unwrap();
        let config = Config::load(&cli).unwrap();

        let defaults = Config::default();
        assert_eq!(config.dispatch.auto_silence_after, 10);
        assert_eq!(config.dispatch.retry, defaults.dispatch.retry);
        assert_eq!(config.dispatch.send_timeout_ms, defaults.dispatch.send_timeout_ms);
        assert_eq!(config.log_level, "info");
    });
}

#[test]
fn test_cli_overrides_file() {
    let toml_content = r#"
        log_level = "warn"
        rule_files = ["/etc/alertwatch/from-file.yml"]
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from([
            "alertwatch",
            "--config",
            path.to_str().unwrap(),
            "--rules",
            "a.yml",
            "--rules",
            "b.yml",
            "--log-level",
            "trace",
            "--state-path",
            "/tmp/state.json",
            "--metrics",
        ])
        .unwrap();
        let config = Config::load(&cli).unwrap();

        assert_eq!(config.log_level, "trace");
        assert_eq!(
            config.rule_files,
            vec![PathBuf::from("a.yml"), PathBuf::from("b.yml")]
        );
        assert_eq!(config.state_path, Some(PathBuf::from("/tmp/state.json")));
        assert!(config.metrics.enabled);
    });
}

#[test]
fn test_missing_explicit_config_file_is_an_error() {
    let cli = Cli::try_parse_from(["alertwatch", "--config", "/nonexistent/alertwatch.toml"]).unwrap();
    assert!(Config::load(&cli).is_err());
}

#[test]
fn test_invalid_values_are_rejected() {
    let toml_content = r#"
        [dispatch.retry]
        jitter_factor = 2.5
    "#;

    with_config_file(toml_content, |path| {
        let cli = Cli::try_parse_from(["alertwatch", "--config", path.to_str().unwrap()]).unwrap();
        let err = Config::load(&cli).unwrap_err();
        assert!(err.to_string().contains("jitter_factor"));
    });
}
