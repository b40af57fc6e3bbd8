//! The full application, built with fakes for the source and notifiers.

use alertwatch::aggregation::AggregationConfig;
use alertwatch::app::App;
use alertwatch::config::Config;
use alertwatch::core::NotifierAdapter;
use alertwatch::error::ConfigError;
use alertwatch::internal_metrics::Metrics;
use alertwatch::notification::NotifierRegistry;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, watch};

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{mock_notifier::MockNotifier, mock_source::MockSource, record, rule};

#[tokio::test]
async fn test_app_delivers_and_flushes_on_shutdown() {
    // Arrange
    let source = Arc::new(MockSource::new());
    source.push("instant", Ok(vec![record(1, json!({"user": "alice"}))]));
    source.push("windowed", Ok(vec![record(1, json!({"user": "bob"}))]));
    let notifier = MockNotifier::new("mock");
    let windowed = AggregationConfig {
        count: None,
        window_seconds: Some(3600),
        key: None,
    };
    let rules = vec![
        rule("instant", AggregationConfig::default(), vec![notifier.clone() as Arc<dyn NotifierAdapter>]),
        rule("windowed", windowed, vec![notifier.clone() as Arc<dyn NotifierAdapter>]),
    ];
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = App::builder(Config::default())
        .rules_override(rules)
        .query_source_override(source.clone())
        .metrics_override(Metrics::new_for_test())
        .build(shutdown_rx)
        .await
        .unwrap();
    assert_eq!(app.rule_names(), vec!["instant".to_string(), "windowed".to_string()]);
    let app_handle = tokio::spawn(app.run());

    // Act
    notifier.wait_for_deliveries(1, Duration::from_secs(5)).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.calls_for("windowed").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), app_handle)
        .await
        .expect("app did not shut down in time");

    // Assert
    assert!(result.unwrap().is_ok());
    let mut rules: Vec<_> = notifier
        .delivered()
        .into_iter()
        .map(|sent| sent.batch.rule)
        .collect();
    rules.sort();
    assert_eq!(rules, vec!["instant".to_string(), "windowed".to_string()]);
}

#[tokio::test]
async fn test_build_fails_on_invalid_rule_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
- name: bad
  query: {{ path: /tmp/events.ndjson }}
  notifiers:
    - type: carrier-pigeon
"#
    )
    .unwrap();
    let config = Config {
        rule_files: vec![file.path().to_path_buf()],
        ..Config::default()
    };

    let result = App::builder(config)
        .metrics_override(Metrics::new_for_test())
        .build(watch::channel(false).1)
        .await;

    let err = result.err().expect("build should fail");
    let config_err = err.downcast_ref::<ConfigError>().expect("a ConfigError");
    assert_eq!(
        config_err,
        &ConfigError::UnknownNotifier {
            kind: "carrier-pigeon".to_string()
        }
    );
}

#[tokio::test]
async fn test_reload_swaps_rules_and_keeps_them_on_error() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.yml");
    std::fs::write(
        &rules_path,
        "- name: first\n  query: { path: /tmp/none.ndjson }\n  notifiers: [ { type: log } ]\n",
    )
    .unwrap();
    let config = Config {
        rule_files: vec![rules_path.clone()],
        ..Config::default()
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut app = App::builder(config)
        .registry_override(NotifierRegistry::with_builtin())
        .query_source_override(Arc::new(MockSource::new()))
        .metrics_override(Metrics::new_for_test())
        .build(shutdown_rx)
        .await
        .unwrap();
    assert_eq!(app.rule_names(), vec!["first".to_string()]);

    // Act: a valid edit
    std::fs::write(
        &rules_path,
        "- name: second\n  query: { path: /tmp/none.ndjson }\n  notifiers: [ { type: log } ]\n\
         - name: third\n  query: { path: /tmp/none.ndjson }\n  notifiers: [ { type: log } ]\n",
    )
    .unwrap();
    app.reload().await.unwrap();

    // Assert
    assert_eq!(app.rule_names(), vec!["second".to_string(), "third".to_string()]);

    // Act: a broken edit
    std::fs::write(
        &rules_path,
        "- name: broken\n  query: { path: /tmp/none.ndjson }\n",
    )
    .unwrap();
    let err = app.reload().await.unwrap_err();

    // Assert
    assert!(format!("{:#}", err).contains("keeping the current rules"));
    assert_eq!(app.rule_names(), vec!["second".to_string(), "third".to_string()]);
}

#[tokio::test]
async fn test_reload_signal_triggers_reload_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.yml");
    std::fs::write(
        &rules_path,
        "- name: before\n  query: { path: /tmp/none.ndjson }\n  notifiers: [ { type: log } ]\n",
    )
    .unwrap();
    let source = Arc::new(MockSource::new());
    let config = Config {
        rule_files: vec![rules_path.clone()],
        ..Config::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let app = App::builder(config)
        .query_source_override(source.clone())
        .metrics_override(Metrics::new_for_test())
        .reload_signal(reload_rx)
        .build(shutdown_rx)
        .await
        .unwrap();
    let app_handle = tokio::spawn(app.run());

    std::fs::write(
        &rules_path,
        "- name: after\n  query: { path: /tmp/none.ndjson }\n  notifiers: [ { type: log } ]\n",
    )
    .unwrap();
    reload_tx.send(()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while source.calls_for("after").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reloaded rule never ran");

    shutdown_tx.send(true).unwrap();
    app_handle.await.unwrap().unwrap();
}
