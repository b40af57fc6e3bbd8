//! Configuration management for AlertWatch
//!
//! The service configuration is layered with `figment`: built-in defaults,
//! then an optional `alertwatch.toml` file, then `ALERTWATCH_*` environment
//! variables, then command-line arguments. Rule definitions live in their
//! own YAML files, listed by `rule_files`.

use crate::cli::Cli;
use crate::core::MAX_DURATION_SECONDS;
use crate::dispatch::DispatchConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "alertwatch.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Default filter for log output when `RUST_LOG` is not set.
    pub log_level: String,
    /// YAML files holding rule definitions.
    pub rule_files: Vec<PathBuf>,
    /// Where rule state is persisted between restarts. In-memory when unset.
    pub state_path: Option<PathBuf>,
    /// Alert delivery settings.
    pub dispatch: DispatchConfig,
    /// Prometheus metrics endpoint.
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            rule_files: Vec::new(),
            state_path: None,
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration, layering defaults, the TOML file, the
    /// environment and the command line.
    ///
    /// A missing config file is only an error if it was named explicitly.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        match &cli.config {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        let config: Config = figment
            // e.g. ALERTWATCH_DISPATCH__AUTO_SILENCE_AFTER=5
            .merge(Env::prefixed("ALERTWATCH_").split("__"))
            .merge(cli)
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatch.send_timeout_ms == 0 {
            anyhow::bail!("dispatch.send_timeout_ms must be greater than zero");
        }
        if self.dispatch.retry.max_backoff_ms < self.dispatch.retry.initial_backoff_ms {
            anyhow::bail!("dispatch.retry.max_backoff_ms must not be smaller than initial_backoff_ms");
        }
        if !(0.0..=1.0).contains(&self.dispatch.retry.jitter_factor) {
            anyhow::bail!("dispatch.retry.jitter_factor must be between 0.0 and 1.0");
        }
        if self.dispatch.silence_cooldown_seconds == 0 {
            anyhow::bail!("dispatch.silence_cooldown_seconds must be greater than zero");
        }
        for (field, secs) in [
            ("dispatch.silence_cooldown_seconds", self.dispatch.silence_cooldown_seconds),
            ("dispatch.shutdown_grace_seconds", self.dispatch.shutdown_grace_seconds),
        ] {
            if secs > MAX_DURATION_SECONDS {
                anyhow::bail!("{} must be at most {} seconds", field, MAX_DURATION_SECONDS);
            }
        }
        Ok(())
    }
}
