//! A query source backed by newline-delimited JSON files.
//!
//! Each line of a rule's `query.path` is one event document. An event
//! matches when its timestamp lies in `(since, until]` and every entry of
//! the rule's `filter` equals the event's field of the same name.

use crate::core::{MatchRecord, QuerySource};
use crate::error::QueryError;
use crate::rules::RuleConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct FileQuerySource;

impl FileQuerySource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QuerySource for FileQuerySource {
    #[instrument(skip_all, fields(rule = %rule.name, path = %rule.query.path.display()))]
    async fn query(
        &self,
        rule: &RuleConfig,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>, QueryError> {
        let query = &rule.query;
        let content = tokio::fs::read_to_string(&query.path).await.map_err(|e| {
            QueryError::Unavailable(format!("{}: {}", query.path.display(), e))
        })?;
        let default_index = index_from_path(&query.path);

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Map<String, Value> = serde_json::from_str(line).map_err(|e| {
                QueryError::Parse(format!(
                    "{} line {}: {}",
                    query.path.display(),
                    line_no + 1,
                    e
                ))
            })?;

            let Some(timestamp) = fields
                .get(&query.timestamp_field)
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc))
            else {
                warn!(line = line_no + 1, field = %query.timestamp_field, "Skipping event without a valid timestamp");
                continue;
            };

            if timestamp <= since || timestamp > until {
                continue;
            }
            if !matches_filter(&fields, &query.filter) {
                continue;
            }

            let index = fields
                .get(&query.index_field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| default_index.clone());
            records.push(MatchRecord::new(timestamp, index, fields));
        }

        debug!(matches = records.len(), %since, %until, "File query finished");
        Ok(records)
    }
}

fn matches_filter(fields: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(name, expected)| fields.get(name) == Some(expected))
}

fn index_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
