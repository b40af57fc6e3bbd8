//! Aggregation, formatting and dispatch working together.

use alertwatch::aggregation::AggregationConfig;
use alertwatch::core::NotifierAdapter;
use alertwatch::dispatch::{AlertDispatcher, DeliveryReport, DispatchConfig, RetryConfig};
use alertwatch::error::NotifyError;
use alertwatch::internal_metrics::Metrics;
use alertwatch::state::RuleState;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{mock_notifier::MockNotifier, record, rule};

fn fast_config() -> DispatchConfig {
    DispatchConfig {
        send_timeout_ms: 1_000,
        retry: RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter_factor: 0.0,
        },
        ..DispatchConfig::default()
    }
}

fn dispatcher(operator: Arc<MockNotifier>, shutdown_rx: watch::Receiver<bool>) -> AlertDispatcher {
    AlertDispatcher::new(
        fast_config(),
        operator,
        Arc::new(Metrics::new_for_test()),
        shutdown_rx,
    )
}

#[tokio::test]
async fn test_counted_batch_reaches_healthy_notifier_when_another_fails() {
    // Arrange
    let healthy = MockNotifier::new("A");
    let broken = MockNotifier::failing("B", NotifyError::Permanent("invalid_token".into()));
    let aggregation = AggregationConfig {
        count: Some(2),
        window_seconds: None,
        key: None,
    };
    let rule = rule(
        "failed-logins",
        aggregation.clone(),
        vec![healthy.clone() as Arc<dyn NotifierAdapter>, broken.clone()],
    );
    let mut state = RuleState::new("failed-logins", &aggregation);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = dispatcher(MockNotifier::new("operator"), shutdown_rx);

    // Act
    assert!(state
        .pending
        .add(record(1, json!({"user": "alice", "host": "web-1"})))
        .is_none());
    let batch = state
        .pending
        .add(record(2, json!({"user": "bob", "host": "web-2"})))
        .expect("second record completes the batch");
    let report = dispatcher.dispatch(&rule, &mut state, batch).await.unwrap();

    // Assert
    match &report {
        DeliveryReport::PartialFailure { delivered, failed } => {
            assert_eq!(delivered, &vec!["A".to_string()]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].adapter, "B");
            assert_eq!(failed[0].attempts, 1);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }
    assert_eq!(state.consecutive_errors, 1);

    let sent = healthy.delivered();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "failed-logins");
    assert_eq!(sent[0].batch.len(), 2);
    assert!(sent[0].body.starts_with("2 matches for rule 'failed-logins'"));
    assert!(sent[0].body.contains("user: alice"));
    assert!(sent[0].body.contains("user: bob"));
}

#[tokio::test]
async fn test_keyed_batches_are_dispatched_per_key() {
    let notifier = MockNotifier::new("A");
    let aggregation = AggregationConfig {
        count: Some(2),
        window_seconds: None,
        key: Some("user".to_string()),
    };
    let rule = rule("by-user", aggregation.clone(), vec![notifier.clone() as Arc<dyn NotifierAdapter>]);
    let mut state = RuleState::new("by-user", &aggregation);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = dispatcher(MockNotifier::new("operator"), shutdown_rx);

    let mut ready = Vec::new();
    for (minute, user) in [(1, "alice"), (2, "bob"), (3, "alice")] {
        ready.extend(state.pending.add(record(minute, json!({ "user": user }))));
    }
    for batch in ready {
        dispatcher.dispatch(&rule, &mut state, batch).await.unwrap();
    }

    let sent = notifier.delivered();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].batch.key.as_deref(), Some("alice"));
    assert!(sent[0].body.contains("(aggregated by alice)"));
    assert_eq!(state.pending.pending_records(), 1);
}

#[tokio::test]
async fn test_recovered_notifier_clears_error_streak() {
    let flaky = MockNotifier::new("flaky");
    flaky.push_outcome(Err(NotifyError::Transient("503".into())));
    flaky.push_outcome(Err(NotifyError::Transient("503".into())));
    let rule = rule(
        "r",
        AggregationConfig::default(),
        vec![flaky.clone() as Arc<dyn NotifierAdapter>],
    );
    let mut state = RuleState::new("r", &AggregationConfig::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = dispatcher(MockNotifier::new("operator"), shutdown_rx);

    // One retry is allowed, so two transient failures exhaust the first dispatch.
    let batch = state.pending.add(record(1, json!({}))).unwrap();
    let first = dispatcher.dispatch(&rule, &mut state, batch).await.unwrap();
    assert_eq!(first.failed_adapters(), vec!["flaky"]);
    assert_eq!(state.consecutive_errors, 1);

    let batch = state.pending.add(record(2, json!({}))).unwrap();
    let second = dispatcher.dispatch(&rule, &mut state, batch).await.unwrap();
    assert!(second.is_delivered());
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(flaky.attempts(), 3);
}

#[tokio::test]
async fn test_auto_silence_notifies_operator_and_drops_later_batches() {
    let broken = MockNotifier::failing("pager", NotifyError::Permanent("gone".into()));
    let operator = MockNotifier::new("operator");
    let rule = rule(
        "noisy",
        AggregationConfig::default(),
        vec![broken.clone() as Arc<dyn NotifierAdapter>],
    );
    let mut state = RuleState::new("noisy", &AggregationConfig::default());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = dispatcher(operator.clone(), shutdown_rx);

    let mut reports = Vec::new();
    for minute in 1..=5 {
        let batch = state.pending.add(record(minute, json!({}))).unwrap();
        reports.push(dispatcher.dispatch(&rule, &mut state, batch).await.unwrap());
    }

    assert_eq!(broken.attempts(), 3);
    assert!(matches!(reports[3], DeliveryReport::Silenced { .. }));
    assert!(matches!(reports[4], DeliveryReport::Silenced { .. }));
    assert_eq!(state.silenced_batches, 2);
    assert_eq!(state.consecutive_errors, 0);

    let notices = operator.delivered();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].title.contains("noisy"));
    assert!(notices[0].body.contains("pager"));
}
