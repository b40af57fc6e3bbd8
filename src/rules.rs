//! Rule definitions and their load-time validation.
//!
//! Rules are read from YAML files, each holding a list of rule definitions.
//! Loading is all-or-nothing: any invalid rule or notifier rejects the whole
//! set, so a reload never leaves a half-applied configuration behind.

use crate::aggregation::AggregationConfig;
use crate::core::{NotifierAdapter, INDEX_FIELD, MAX_DURATION_SECONDS, TIMESTAMP_FIELD};
use crate::error::ConfigError;
use crate::notification::{NotifierRegistry, NotifierSpec};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fmt, fs};

/// The static configuration of a single rule, as written in a rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Unique name of the rule.
    pub name: String,
    /// How often the rule's query runs.
    #[serde(default = "default_run_every_seconds")]
    pub run_every_seconds: u64,
    /// How far back the first query looks when no previous run is known.
    #[serde(default)]
    pub initial_lookback_seconds: Option<u64>,
    /// What to query for.
    pub query: QueryDefinition,
    /// How matches are grouped before alerting.
    #[serde(default)]
    pub aggregation: AggregationConfig,
    /// How long the rule stays silent after repeated delivery failures.
    /// Falls back to the global dispatch setting.
    #[serde(default)]
    pub silence_seconds: Option<u64>,
    /// Title used for alerts instead of the rule name.
    #[serde(default)]
    pub alert_subject: Option<String>,
    /// Where alerts are sent, in order.
    #[serde(default)]
    pub notifiers: Vec<NotifierSpec>,
}

fn default_run_every_seconds() -> u64 {
    60
}

impl RuleConfig {
    /// Lookback for the very first query of the rule.
    pub fn initial_lookback_seconds(&self) -> u64 {
        self.initial_lookback_seconds.unwrap_or(self.run_every_seconds)
    }
}

/// The query a rule runs against its source.
///
/// The built-in file source reads newline-delimited JSON documents from
/// `path` and keeps those whose fields equal every entry in `filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDefinition {
    pub path: PathBuf,
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default = "default_index_field")]
    pub index_field: String,
}

fn default_timestamp_field() -> String {
    TIMESTAMP_FIELD.to_string()
}

fn default_index_field() -> String {
    INDEX_FIELD.to_string()
}

/// A validated rule together with the notifiers built for it.
#[derive(Clone)]
pub struct Rule {
    pub config: RuleConfig,
    pub notifiers: Vec<Arc<dyn NotifierAdapter>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.config.name)
            .field(
                "notifiers",
                &self.notifiers.iter().map(|n| n.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Rule {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Loads and validates rule files.
pub struct RuleLoader;

impl RuleLoader {
    /// Reads every rule file, then validates the combined set.
    pub fn load_from_files(paths: &[PathBuf], registry: &NotifierRegistry) -> Result<Vec<Rule>> {
        let mut configs = Vec::new();
        for file_path in paths {
            let file_content = fs::read_to_string(file_path)
                .with_context(|| format!("Failed to read rule file: {}", file_path.display()))?;
            let rules: Vec<RuleConfig> = serde_yml::from_str(&file_content).with_context(|| {
                format!("Failed to parse YAML from rule file: {}", file_path.display())
            })?;
            configs.extend(rules);
        }
        Ok(Self::compile(configs, registry)?)
    }

    /// Validates rule definitions and builds their notifiers.
    pub fn compile(
        configs: Vec<RuleConfig>,
        registry: &NotifierRegistry,
    ) -> Result<Vec<Rule>, ConfigError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(configs.len());

        for config in configs {
            if !seen.insert(config.name.clone()) {
                return Err(ConfigError::DuplicateRule { rule: config.name });
            }
            validate_rule(&config)?;

            let notifiers = config
                .notifiers
                .iter()
                .map(|spec| registry.build(spec))
                .collect::<Result<Vec<_>, _>>()?;

            rules.push(Rule { config, notifiers });
        }
        Ok(rules)
    }
}

fn validate_rule(config: &RuleConfig) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidRule {
        rule: config.name.clone(),
        reason: reason.to_string(),
    };

    if config.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if config.run_every_seconds == 0 {
        return Err(invalid("run_every_seconds must be greater than zero"));
    }
    if config.aggregation.count == Some(0) {
        return Err(invalid("aggregation.count must be at least 1"));
    }
    if config.aggregation.window_seconds == Some(0) {
        return Err(invalid("aggregation.window_seconds must be greater than zero"));
    }
    if config.silence_seconds == Some(0) {
        return Err(invalid("silence_seconds must be greater than zero"));
    }
    for (field, secs) in [
        ("run_every_seconds", Some(config.run_every_seconds)),
        ("initial_lookback_seconds", config.initial_lookback_seconds),
        ("aggregation.window_seconds", config.aggregation.window_seconds),
        ("silence_seconds", config.silence_seconds),
    ] {
        if secs.is_some_and(|secs| secs > MAX_DURATION_SECONDS) {
            return Err(invalid(&format!(
                "{} must be at most {} seconds",
                field, MAX_DURATION_SECONDS
            )));
        }
    }
    if config.notifiers.is_empty() {
        return Err(ConfigError::NoNotifiers {
            rule: config.name.clone(),
        });
    }

    // Delivery reports name notifiers, so each name must be unique.
    let mut names = HashSet::new();
    for spec in &config.notifiers {
        if !names.insert(spec.display_name()) {
            return Err(invalid(&format!(
                "notifier name '{}' is used more than once; set a distinct `name`",
                spec.display_name()
            )));
        }
    }
    Ok(())
}
