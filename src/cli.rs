//! Command-Line Interface (CLI) argument parsing.
//!
//! Arguments are parsed at startup and merged over the configuration file
//! and environment variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Runs alerting rules against event sources and delivers their alerts.
#[derive(Parser, Debug, Default, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Rule file to load. Repeat to load several; replaces `rule_files`.
    #[arg(short, long = "rules", value_name = "FILE")]
    pub rules: Vec<PathBuf>,

    /// File to persist rule state in.
    #[arg(long, value_name = "FILE")]
    pub state_path: Option<PathBuf>,

    /// Default log filter, e.g. `debug` or `alertwatch=trace`.
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Serve Prometheus metrics.
    #[arg(long)]
    pub metrics: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if !self.rules.is_empty() {
            let files = self
                .rules
                .iter()
                .map(|p| Value::from(p.to_string_lossy().into_owned()))
                .collect::<Vec<_>>();
            dict.insert("rule_files".into(), Value::from(files));
        }

        if let Some(path) = &self.state_path {
            dict.insert(
                "state_path".into(),
                Value::from(path.to_string_lossy().into_owned()),
            );
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        // Only an explicit flag overrides the file.
        if self.metrics {
            let mut metrics = Dict::new();
            metrics.insert("enabled".into(), Value::from(true));
            dict.insert("metrics".into(), Value::from(metrics));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
