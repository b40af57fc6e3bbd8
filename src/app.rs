//! The main application logic, decoupled from the entry point.

use crate::{
    config::Config,
    core::{NotifierAdapter, QuerySource},
    internal_metrics::{Metrics, MetricsBuilder},
    notification::{LogNotifier, NotifierRegistry},
    rules::{Rule, RuleLoader},
    scheduler::{RunningRules, Scheduler},
    source::FileQuerySource,
    state::StateStore,
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

/// A handle to the running application.
pub struct App {
    config: Config,
    registry: NotifierRegistry,
    scheduler: Scheduler,
    running: Option<RunningRules>,
    task_manager: TaskManager,
    reload_rx: Option<mpsc::Receiver<()>>,
    metrics_addr: Option<SocketAddr>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Names of the rules currently scheduled.
    pub fn rule_names(&self) -> Vec<String> {
        self.running
            .as_ref()
            .map(|running| running.rule_names().to_vec())
            .unwrap_or_default()
    }

    /// Reloads the rule files and swaps the running rule set.
    ///
    /// The new files are fully validated first. If they are rejected the
    /// current rules keep running untouched. Otherwise the current workers
    /// are stopped, which flushes their pending matches, and workers for
    /// the new rules start from the persisted state.
    #[instrument(skip_all)]
    pub async fn reload(&mut self) -> Result<()> {
        let rules = RuleLoader::load_from_files(&self.config.rule_files, &self.registry)
            .context("Rule reload rejected, keeping the current rules")?;

        if let Some(running) = self.running.take() {
            running.stop().await;
        }
        info!(rules = rules.len(), "Rules reloaded");
        self.running = Some(self.scheduler.start(rules));
        Ok(())
    }

    /// Runs until the shutdown signal, reloading rules whenever the reload
    /// channel fires, then stops every task.
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                reload = next_reload(&mut self.reload_rx) => match reload {
                    Some(()) => {
                        if let Err(e) = self.reload().await {
                            error!(error = ?e, "Failed to reload rules");
                        }
                    }
                    None => self.reload_rx = None,
                },
            }
        }

        info!("Shutdown signal received, stopping rule workers...");
        if let Some(running) = self.running.take() {
            running.stop().await;
        }
        self.task_manager.shutdown().await;
        info!("All tasks shut down.");
        Ok(())
    }
}

async fn next_reload(reload_rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match reload_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Builder for the main application.
///
/// Every collaborator can be overridden, which is how the integration tests
/// run the full application against fakes.
pub struct AppBuilder {
    config: Config,
    rules_override: Option<Vec<Rule>>,
    registry_override: Option<NotifierRegistry>,
    query_source_override: Option<Arc<dyn QuerySource>>,
    operator_override: Option<Arc<dyn NotifierAdapter>>,
    state_store_override: Option<Arc<StateStore>>,
    metrics_override: Option<Metrics>,
    reload_rx: Option<mpsc::Receiver<()>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            rules_override: None,
            registry_override: None,
            query_source_override: None,
            operator_override: None,
            state_store_override: None,
            metrics_override: None,
            reload_rx: None,
        }
    }

    /// Uses these rules instead of loading `rule_files`.
    pub fn rules_override(mut self, rules: Vec<Rule>) -> Self {
        self.rules_override = Some(rules);
        self
    }

    /// Replaces the built-in notifier registry.
    pub fn registry_override(mut self, registry: NotifierRegistry) -> Self {
        self.registry_override = Some(registry);
        self
    }

    pub fn query_source_override(mut self, source: Arc<dyn QuerySource>) -> Self {
        self.query_source_override = Some(source);
        self
    }

    /// Replaces the log sink that receives auto-silence notices.
    pub fn operator_override(mut self, operator: Arc<dyn NotifierAdapter>) -> Self {
        self.operator_override = Some(operator);
        self
    }

    pub fn state_store_override(mut self, store: Arc<StateStore>) -> Self {
        self.state_store_override = Some(store);
        self
    }

    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Each message on this channel triggers a rule reload.
    pub fn reload_signal(mut self, reload_rx: mpsc::Receiver<()>) -> Self {
        self.reload_rx = Some(reload_rx);
        self
    }

    /// Builds all components and starts the rule workers.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        // =========================================================================
        // 1. Metrics
        // =========================================================================
        let (metrics, metrics_server_info) = match self.metrics_override {
            Some(m) => (m, None),
            None => MetricsBuilder::new(config.metrics.clone()).build(task_manager.get_shutdown_rx()),
        };
        let metrics = Arc::new(metrics);
        let metrics_addr = if let Some((server, addr)) = metrics_server_info {
            task_manager.spawn("MetricsServer", server.run());
            info!(%addr, "Metrics server listening");
            Some(addr)
        } else {
            None
        };

        // =========================================================================
        // 2. Rules
        // =========================================================================
        let registry = self
            .registry_override
            .unwrap_or_else(NotifierRegistry::with_builtin);
        let rules = match self.rules_override {
            Some(rules) => rules,
            None => RuleLoader::load_from_files(&config.rule_files, &registry)?,
        };
        if rules.is_empty() {
            warn!("No rules loaded, nothing will be evaluated");
        }

        // =========================================================================
        // 3. State, source and scheduler
        // =========================================================================
        let store = match self.state_store_override {
            Some(store) => store,
            None => match &config.state_path {
                Some(path) => Arc::new(StateStore::open(path)?),
                None => Arc::new(StateStore::in_memory()),
            },
        };
        let source = self
            .query_source_override
            .unwrap_or_else(|| Arc::new(FileQuerySource::new()));
        let operator = self
            .operator_override
            .unwrap_or_else(|| Arc::new(LogNotifier::operator()));

        let scheduler = Scheduler::new(
            source,
            store,
            metrics,
            config.dispatch.clone(),
            operator,
        );
        let running = scheduler.start(rules);

        info!("AlertWatch initialized successfully.");

        Ok(App {
            config,
            registry,
            scheduler,
            running: Some(running),
            task_manager,
            reload_rx: self.reload_rx,
            metrics_addr,
        })
    }
}
