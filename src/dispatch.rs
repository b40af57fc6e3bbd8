//! Delivery of alert batches to a rule's notifiers.
//!
//! The dispatcher applies the rule's silence policy, renders the batch once,
//! and fans the rendered alert out to every notifier concurrently. Each
//! notifier is retried on its own; one failing or hanging notifier never
//! holds back the others.

use crate::core::{saturating_add_seconds, AlertBatch, NotifierAdapter};
use crate::error::{DispatchError, NotifyError};
use crate::formatting::{PlainTextFormatter, TextFormatter};
use crate::internal_metrics::Metrics;
use crate::rules::Rule;
use crate::state::RuleState;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Retry and backoff settings for transient notifier failures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds; doubles on each retry.
    pub initial_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Random spread applied to each delay, as a fraction of the delay.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (zero-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp = 2u64.saturating_pow(retry);
        let delay_ms = self.initial_backoff_ms.saturating_mul(exp).min(self.max_backoff_ms);
        apply_jitter(Duration::from_millis(delay_ms), self.jitter_factor)
    }
}

fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let ms = delay.as_millis() as f64;
    let spread = ms * factor;
    let jittered = rand::rng().random_range((ms - spread)..=(ms + spread));
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Dispatch settings shared by all rules.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DispatchConfig {
    /// Upper bound for a single notifier call in milliseconds.
    pub send_timeout_ms: u64,
    /// Retry settings for transient failures.
    pub retry: RetryConfig,
    /// Consecutive failed dispatches after which a rule is silenced.
    /// Zero disables auto-silencing.
    pub auto_silence_after: u32,
    /// Default silence duration for rules without `silence_seconds`.
    pub silence_cooldown_seconds: u64,
    /// How long in-flight dispatches may continue after shutdown starts.
    pub shutdown_grace_seconds: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            retry: RetryConfig::default(),
            auto_silence_after: 3,
            silence_cooldown_seconds: 3600,
            shutdown_grace_seconds: 10,
        }
    }
}

/// A notifier that did not deliver the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterFailure {
    pub adapter: String,
    pub error: NotifyError,
    pub attempts: u32,
}

/// Outcome of dispatching one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    /// Every notifier accepted the alert.
    Delivered { adapters: Vec<String> },
    /// At least one notifier failed after retries. `delivered` is empty when
    /// every notifier failed.
    PartialFailure {
        delivered: Vec<String>,
        failed: Vec<AdapterFailure>,
    },
    /// The rule is silenced; no notifier was called.
    Silenced { until: DateTime<Utc> },
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryReport::Delivered { .. })
    }

    /// Names of the notifiers that failed, in configured order.
    pub fn failed_adapters(&self) -> Vec<&str> {
        match self {
            DeliveryReport::PartialFailure { failed, .. } => {
                failed.iter().map(|f| f.adapter.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Sends alert batches to notifiers.
pub struct AlertDispatcher {
    config: DispatchConfig,
    formatter: Arc<dyn TextFormatter>,
    operator: Arc<dyn NotifierAdapter>,
    metrics: Arc<Metrics>,
    shutdown_rx: watch::Receiver<bool>,
    // Set the first time a dispatch observes shutdown. Every later dispatch
    // shares the same deadline.
    shutdown_seen_at: OnceLock<Instant>,
}

impl AlertDispatcher {
    /// Creates a dispatcher.
    ///
    /// # Arguments
    /// * `operator` - Sink for notices about the dispatcher itself, such as a
    ///   rule being auto-silenced. It is never retried.
    /// * `shutdown_rx` - Once this turns `true`, in-flight dispatches get
    ///   `shutdown_grace_seconds` to finish before they are abandoned.
    pub fn new(
        config: DispatchConfig,
        operator: Arc<dyn NotifierAdapter>,
        metrics: Arc<Metrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            formatter: Arc::new(PlainTextFormatter),
            operator,
            metrics,
            shutdown_rx,
            shutdown_seen_at: OnceLock::new(),
        }
    }

    /// Dispatches a batch for `rule` and records the outcome in `state`.
    #[instrument(skip_all, fields(rule = %rule.name(), matches = batch.len()))]
    pub async fn dispatch(
        &self,
        rule: &Rule,
        state: &mut RuleState,
        batch: AlertBatch,
    ) -> Result<DeliveryReport, DispatchError> {
        let now = Utc::now();
        if state.is_silenced(now) {
            let until = state.silenced_until.unwrap_or(now);
            state.silenced_batches += 1;
            self.metrics.increment_alerts_silenced(rule.name());
            info!(%until, "Rule is silenced, dropping batch");
            return Ok(DeliveryReport::Silenced { until });
        }

        if rule.notifiers.is_empty() {
            return Err(DispatchError::NoNotifiers {
                rule: rule.name().to_string(),
            });
        }

        let title = self.formatter.format_title(&rule.config, &batch);
        let body = self.formatter.format_body(&rule.config, &batch);

        let start = Instant::now();
        let deliveries = rule
            .notifiers
            .iter()
            .map(|notifier| self.deliver(notifier.as_ref(), &title, &body, &batch));

        let outcomes = tokio::select! {
            biased;
            outcomes = join_all(deliveries) => outcomes,
            _ = self.grace_expired() => {
                error!("Shutdown grace period expired, abandoning in-flight dispatch");
                return Err(DispatchError::Abandoned { rule: rule.name().to_string() });
            }
        };
        self.metrics.record_dispatch_duration(start.elapsed());
        self.metrics.increment_batches_dispatched(rule.name());

        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(name) => delivered.push(name),
                Err(failure) => failed.push(failure),
            }
        }

        if failed.is_empty() {
            state.consecutive_errors = 0;
            debug!(adapters = ?delivered, "Batch delivered to all notifiers");
            return Ok(DeliveryReport::Delivered { adapters: delivered });
        }

        state.consecutive_errors += 1;
        warn!(
            failed = ?failed.iter().map(|f| f.adapter.as_str()).collect::<Vec<_>>(),
            consecutive_errors = state.consecutive_errors,
            "Batch delivery failed for some notifiers"
        );

        if self.config.auto_silence_after > 0
            && state.consecutive_errors >= self.config.auto_silence_after
        {
            self.auto_silence(rule, state, &batch, &failed, now).await;
        }

        Ok(DeliveryReport::PartialFailure { delivered, failed })
    }

    /// Sends to one notifier, retrying transient failures with backoff.
    async fn deliver(
        &self,
        notifier: &dyn NotifierAdapter,
        title: &str,
        body: &str,
        batch: &AlertBatch,
    ) -> Result<String, AdapterFailure> {
        let name = notifier.name().to_string();
        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = match timeout(send_timeout, notifier.send(title, body, batch)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Transient(format!(
                    "send timed out after {}ms",
                    self.config.send_timeout_ms
                ))),
            };

            match result {
                Ok(()) => {
                    self.metrics.increment_alerts_delivered(&name);
                    return Ok(name);
                }
                Err(error) if error.is_transient() && attempts <= self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for_retry(attempts - 1);
                    warn!(
                        notifier = %name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Transient notifier failure, retrying"
                    );
                    sleep(delay).await;
                }
                Err(error) => {
                    self.metrics.increment_notify_failures(&name, error.is_transient());
                    error!(notifier = %name, attempts, %error, "Notifier failed to deliver alert");
                    return Err(AdapterFailure {
                        adapter: name,
                        error,
                        attempts,
                    });
                }
            }
        }
    }

    async fn auto_silence(
        &self,
        rule: &Rule,
        state: &mut RuleState,
        batch: &AlertBatch,
        failed: &[AdapterFailure],
        now: DateTime<Utc>,
    ) {
        let cooldown_secs = rule
            .config
            .silence_seconds
            .unwrap_or(self.config.silence_cooldown_seconds);
        let until = saturating_add_seconds(now, cooldown_secs);

        error!(
            rule = %rule.name(),
            failures = state.consecutive_errors,
            %until,
            "Rule failed to deliver repeatedly, silencing it"
        );
        state.silenced_until = Some(until);
        state.consecutive_errors = 0;
        self.metrics.increment_auto_silenced(rule.name());

        let title = format!("Rule '{}' silenced until {}", rule.name(), until.to_rfc3339());
        let body = failed
            .iter()
            .map(|f| format!("{}: {} (after {} attempts)", f.adapter, f.error, f.attempts))
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = self.operator.send(&title, &body, batch).await {
            error!(error = %e, "Failed to notify operator about silenced rule");
        }
    }

    /// Resolves once the grace period that started with shutdown has passed.
    /// Never resolves if the shutdown sender is gone.
    ///
    /// The grace period is measured once for the dispatcher, so dispatches
    /// that start during shutdown, such as the final flush of several keyed
    /// groups, share it instead of each getting a fresh one.
    async fn grace_expired(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let closed = shutdown_rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
        let seen_at = *self.shutdown_seen_at.get_or_init(Instant::now);
        sleep_until(seen_at + Duration::from_secs(self.config.shutdown_grace_seconds)).await;
    }
}
