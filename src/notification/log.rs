//! A notifier that writes alerts to the application log.
//!
//! This is the one sink that is always available. The dispatcher uses it as
//! the operator channel for auto-silence notices, and rules can list it like
//! any other notifier.

use crate::core::{AlertBatch, NotifierAdapter};
use crate::error::{ConfigError, NotifyError};
use crate::notification::AdapterKind;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

/// Log level used for alerts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogOptions {
    #[serde(default)]
    pub level: LogLevel,
}

pub struct LogNotifier {
    name: String,
    level: LogLevel,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>, level: LogLevel) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }

    /// The operator sink used for internal notices.
    pub fn operator() -> Self {
        Self::new("operator-log", LogLevel::Error)
    }
}

#[async_trait]
impl NotifierAdapter for LogNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str, batch: &AlertBatch) -> Result<(), NotifyError> {
        let rule = batch.rule.as_str();
        let matches = batch.len();
        match self.level {
            LogLevel::Info => {
                info!(target: "alertwatch::alerts", notifier = %self.name, rule, matches, "{}\n{}", title, body)
            }
            LogLevel::Warn => {
                warn!(target: "alertwatch::alerts", notifier = %self.name, rule, matches, "{}\n{}", title, body)
            }
            LogLevel::Error => {
                error!(target: "alertwatch::alerts", notifier = %self.name, rule, matches, "{}\n{}", title, body)
            }
        }
        Ok(())
    }
}

impl AdapterKind for LogNotifier {
    const KIND: &'static str = "log";
    type Options = LogOptions;

    fn validate(_options: &Self::Options) -> Result<(), ConfigError> {
        Ok(())
    }

    fn build(name: String, options: Self::Options) -> Result<Self, ConfigError> {
        Ok(Self::new(name, options.level))
    }
}
