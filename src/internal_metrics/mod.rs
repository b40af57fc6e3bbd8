//! # Internal Metrics Module
//!
//! Collection and exposition of the service's own metrics.
//!
//! - **`MetricsBuilder`** installs the Prometheus recorder and prepares the
//!   metrics server.
//! - **`Metrics`** is the handle the rest of the application records through.
//! - **`MetricsServer`** (in `server.rs`) serves `/metrics` for scraping.

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use metrics::{Histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

pub mod server;

/// The public API for the metrics system.
#[derive(Clone)]
pub struct Metrics {
    query_duration_seconds: Histogram,
    dispatch_duration_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Registers descriptions for all metrics with the global recorder and
    /// returns a handle.
    pub fn new() -> Self {
        metrics::describe_gauge!("rules_loaded_count", Unit::Count, "The number of rules currently scheduled.");
        metrics::describe_counter!("rule_matches_total", Unit::Count, "Matches returned by rule queries, labeled by rule.");
        metrics::describe_counter!("query_errors_total", Unit::Count, "Failed rule queries, labeled by rule.");
        metrics::describe_counter!("batches_dispatched_total", Unit::Count, "Alert batches handed to notifiers, labeled by rule.");
        metrics::describe_counter!("alerts_sent_total", Unit::Count, "Alerts accepted by a notifier, labeled by notifier.");
        metrics::describe_counter!("notifier_failures_total", Unit::Count, "Alerts a notifier failed to deliver after retries, labeled by notifier and kind.");
        metrics::describe_counter!("alerts_silenced_total", Unit::Count, "Batches dropped because their rule was silenced.");
        metrics::describe_counter!("rules_auto_silenced_total", Unit::Count, "Times a rule was silenced after repeated delivery failures.");
        metrics::describe_histogram!("query_duration_seconds", Unit::Seconds, "Time taken by a rule query.");
        metrics::describe_histogram!("dispatch_duration_seconds", Unit::Seconds, "Time taken to deliver one batch to all of a rule's notifiers.");

        Self {
            query_duration_seconds: metrics::histogram!("query_duration_seconds"),
            dispatch_duration_seconds: metrics::histogram!("dispatch_duration_seconds"),
        }
    }

    /// A handle for when metrics are disabled. With no recorder installed
    /// every call is a no-op.
    pub fn disabled() -> Self {
        Self {
            query_duration_seconds: metrics::histogram!("disabled"),
            dispatch_duration_seconds: metrics::histogram!("disabled"),
        }
    }

    /// Creates a `Metrics` instance suitable for testing.
    pub fn new_for_test() -> Self {
        // The default recorder is a no-op.
        Self::new()
    }

    pub fn set_rules_loaded_count(&self, count: u64) {
        metrics::gauge!("rules_loaded_count").set(count as f64);
    }

    pub fn increment_rule_matches(&self, rule: &str, count: usize) {
        metrics::counter!("rule_matches_total", "rule" => rule.to_string()).increment(count as u64);
    }

    pub fn increment_query_errors(&self, rule: &str) {
        metrics::counter!("query_errors_total", "rule" => rule.to_string()).increment(1);
    }

    pub fn increment_batches_dispatched(&self, rule: &str) {
        metrics::counter!("batches_dispatched_total", "rule" => rule.to_string()).increment(1);
    }

    pub fn increment_alerts_delivered(&self, notifier: &str) {
        metrics::counter!("alerts_sent_total", "notifier" => notifier.to_string()).increment(1);
    }

    pub fn increment_notify_failures(&self, notifier: &str, transient: bool) {
        let kind = if transient { "transient" } else { "permanent" };
        metrics::counter!("notifier_failures_total", "notifier" => notifier.to_string(), "kind" => kind)
            .increment(1);
    }

    pub fn increment_alerts_silenced(&self, rule: &str) {
        metrics::counter!("alerts_silenced_total", "rule" => rule.to_string()).increment(1);
    }

    pub fn increment_auto_silenced(&self, rule: &str) {
        metrics::counter!("rules_auto_silenced_total", "rule" => rule.to_string()).increment(1);
    }

    pub fn record_query_duration(&self, elapsed: Duration) {
        self.query_duration_seconds.record(elapsed.as_secs_f64());
    }

    pub fn record_dispatch_duration(&self, elapsed: Duration) {
        self.dispatch_duration_seconds.record(elapsed.as_secs_f64());
    }
}

/// Builder for the metrics system.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus recorder and prepares the metrics server.
    ///
    /// If metrics are disabled, or any step of the setup fails, a disabled
    /// `Metrics` handle and no server are returned. Metrics never stop the
    /// service from starting.
    pub fn build(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Metrics, Option<(MetricsServer, SocketAddr)>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        let builder = match PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        ) {
            Ok(builder) => builder,
            Err(e) => {
                error!(error = %e, "Invalid histogram buckets for metrics");
                return (Metrics::disabled(), None);
            }
        };
        let recorder = builder.build_recorder();
        let handle = recorder.handle();

        // Bind first so that the address can be reported.
        let listener = match std::net::TcpListener::bind(self.config.listen_address) {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %self.config.listen_address, error = %e, "Failed to bind metrics server");
                return (Metrics::disabled(), None);
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Failed to get local address for metrics server");
                return (Metrics::disabled(), None);
            }
        };
        let listener = match listener
            .set_nonblocking(true)
            .and_then(|()| TcpListener::from_std(listener))
        {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to hand metrics listener to the runtime");
                return (Metrics::disabled(), None);
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!(error = %e, "Failed to install Prometheus recorder");
            return (Metrics::disabled(), None);
        }

        let metrics = Metrics::new();
        let server = MetricsServer::new(listener, handle, shutdown_rx);
        (metrics, Some((server, addr)))
    }
}
