//! Periodic evaluation of rules.
//!
//! Every rule runs in its own task with its own [`RuleState`]. A tick queries
//! the rule's source for the window since the last successful run, buffers
//! the matches, dispatches the batches that are ready and records progress.
//! Rules never share mutable state, so a slow rule cannot delay another.

use crate::core::{saturating_sub_seconds, NotifierAdapter, QuerySource};
use crate::dispatch::{AlertDispatcher, DeliveryReport, DispatchConfig};
use crate::error::{DispatchError, QueryError};
use crate::internal_metrics::Metrics;
use crate::rules::Rule;
use crate::state::{RuleState, StateStore};
use crate::task_manager::TaskManager;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// What one evaluation of a rule did.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Matches returned by the query.
    pub matches: usize,
    /// One report per dispatched batch, in dispatch order.
    pub reports: Vec<DeliveryReport>,
    /// Set when the query failed; the window will be queried again.
    pub query_error: Option<QueryError>,
    pub dispatch_errors: Vec<DispatchError>,
}

/// Evaluates a single rule. Owns that rule's state.
pub struct RuleWorker {
    rule: Rule,
    state: RuleState,
    source: Arc<dyn QuerySource>,
    dispatcher: Arc<AlertDispatcher>,
    store: Arc<StateStore>,
    metrics: Arc<Metrics>,
}

impl RuleWorker {
    /// Creates a worker, restoring the rule's persisted state if the store
    /// has any.
    pub fn new(
        rule: Rule,
        source: Arc<dyn QuerySource>,
        dispatcher: Arc<AlertDispatcher>,
        store: Arc<StateStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let state = match store.get(rule.name()) {
            Some(saved) => {
                debug!(rule = %rule.name(), ?saved, "Restored rule state");
                RuleState::restore(rule.name(), &rule.config.aggregation, &saved)
            }
            None => RuleState::new(rule.name(), &rule.config.aggregation),
        };
        Self {
            rule,
            state,
            source,
            dispatcher,
            store,
            metrics,
        }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn state(&self) -> &RuleState {
        &self.state
    }

    /// Runs one evaluation of the rule with `now` as the end of the query
    /// window.
    ///
    /// `last_run` only advances when the query succeeded, so a failed window
    /// is covered again by the next run. Groups whose aggregation window has
    /// closed are dispatched either way.
    #[instrument(skip_all, fields(rule = %self.rule.name()))]
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::default();
        let since = self.state.last_run.unwrap_or_else(|| {
            saturating_sub_seconds(now, self.rule.config.initial_lookback_seconds())
        });

        let start = Instant::now();
        let queried = self.source.query(&self.rule.config, since, now).await;
        self.metrics.record_query_duration(start.elapsed());

        let mut ready = Vec::new();
        match queried {
            Ok(records) => {
                summary.matches = records.len();
                if !records.is_empty() {
                    self.metrics.increment_rule_matches(self.rule.name(), records.len());
                    info!(matches = records.len(), %since, until = %now, "Rule matched");
                }
                for record in records {
                    if let Some(batch) = self.state.pending.add_at(record, now) {
                        ready.push(batch);
                    }
                }
            }
            Err(e) => {
                self.metrics.increment_query_errors(self.rule.name());
                warn!(error = %e, %since, "Query failed, window will be retried");
                summary.query_error = Some(e);
            }
        }
        ready.extend(self.state.pending.poll_expired(now));

        for batch in ready {
            self.dispatch_into(batch, &mut summary).await;
        }

        if summary.query_error.is_none() {
            self.state.last_run = Some(now);
        }
        self.persist();
        summary
    }

    /// Dispatches whatever is still buffered and saves the state. Called
    /// when the worker stops.
    pub async fn flush(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some(batch) = self.state.pending.flush() {
            self.dispatch_into(batch, &mut summary).await;
        }
        self.persist();
        summary
    }

    async fn dispatch_into(&mut self, batch: crate::core::AlertBatch, summary: &mut RunSummary) {
        match self.dispatcher.dispatch(&self.rule, &mut self.state, batch).await {
            Ok(report) => summary.reports.push(report),
            Err(e) => {
                error!(error = %e, "Dispatch failed");
                summary.dispatch_errors.push(e);
            }
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(self.rule.name(), self.state.snapshot()) {
            error!(rule = %self.rule.name(), error = %e, "Failed to persist rule state");
        }
    }

    /// Evaluates the rule every `run_every_seconds` until shutdown, then
    /// flushes pending matches.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.rule.config.run_every_seconds);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(rule = %self.rule.name(), period_secs = period.as_secs(), "Rule worker started");

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.run_once(Utc::now()).await;
                }
            }
        }

        let pending = self.state.pending.pending_records();
        if pending > 0 {
            info!(rule = %self.rule.name(), pending, "Flushing pending matches before stopping");
        }
        self.flush().await;
        info!(rule = %self.rule.name(), "Rule worker stopped");
    }
}

/// Starts rule workers sharing one source, store and dispatch policy.
pub struct Scheduler {
    source: Arc<dyn QuerySource>,
    store: Arc<StateStore>,
    metrics: Arc<Metrics>,
    dispatch_config: DispatchConfig,
    operator: Arc<dyn NotifierAdapter>,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn QuerySource>,
        store: Arc<StateStore>,
        metrics: Arc<Metrics>,
        dispatch_config: DispatchConfig,
        operator: Arc<dyn NotifierAdapter>,
    ) -> Self {
        Self {
            source,
            store,
            metrics,
            dispatch_config,
            operator,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Creates the worker for `rule` without starting it.
    pub fn worker(&self, rule: Rule, shutdown_rx: watch::Receiver<bool>) -> RuleWorker {
        RuleWorker::new(
            rule,
            self.source.clone(),
            Arc::new(self.dispatcher(shutdown_rx)),
            self.store.clone(),
            self.metrics.clone(),
        )
    }

    fn dispatcher(&self, shutdown_rx: watch::Receiver<bool>) -> AlertDispatcher {
        AlertDispatcher::new(
            self.dispatch_config.clone(),
            self.operator.clone(),
            self.metrics.clone(),
            shutdown_rx,
        )
    }

    /// Spawns one worker per rule. The returned handle stops them.
    pub fn start(&self, rules: Vec<Rule>) -> RunningRules {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_manager = TaskManager::new(shutdown_rx.clone());
        let dispatcher = Arc::new(self.dispatcher(shutdown_rx));

        let rule_names: Vec<String> = rules.iter().map(|r| r.name().to_string()).collect();
        if let Err(e) = self.store.retain_rules(rule_names.iter().map(String::as_str)) {
            warn!(error = %e, "Failed to drop state of removed rules");
        }
        self.metrics.set_rules_loaded_count(rules.len() as u64);

        for rule in rules {
            let name = format!("rule:{}", rule.name());
            let worker = RuleWorker::new(
                rule,
                self.source.clone(),
                dispatcher.clone(),
                self.store.clone(),
                self.metrics.clone(),
            );
            task_manager.spawn(name, worker.run(task_manager.get_shutdown_rx()));
        }
        info!(rules = rule_names.len(), "Scheduler started");

        RunningRules {
            shutdown_tx,
            task_manager,
            rule_names,
        }
    }
}

/// A started set of rule workers.
pub struct RunningRules {
    shutdown_tx: watch::Sender<bool>,
    task_manager: TaskManager,
    rule_names: Vec<String>,
}

impl RunningRules {
    pub fn rule_names(&self) -> &[String] {
        &self.rule_names
    }

    /// Signals every worker to stop and waits until they have flushed.
    pub async fn stop(self) {
        // Receivers live in the workers; a send error only means they are gone.
        let _ = self.shutdown_tx.send(true);
        self.task_manager.shutdown().await;
    }
}
