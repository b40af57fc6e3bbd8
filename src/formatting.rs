//! Rendering of alert batches into a destination-independent title and body.

use crate::core::{AlertBatch, MatchRecord};
use crate::rules::{QueryDefinition, RuleConfig};
use serde_json::Value;

const RECORD_SEPARATOR: &str = "\n----------------------------------------\n";
const TOP_EVENTS_PREFIX: &str = "top_events_";

/// A trait for rendering a batch of matches into a title and a body.
///
/// The output does not depend on the destination; notifiers wrap it in
/// whatever envelope their channel needs.
pub trait TextFormatter: Send + Sync {
    fn format_title(&self, rule: &RuleConfig, batch: &AlertBatch) -> String;
    fn format_body(&self, rule: &RuleConfig, batch: &AlertBatch) -> String;
}

/// Renders one `key: value` line per field.
///
/// The rule's timestamp and index fields are left out, as are
/// `top_events_*` summaries.
pub struct PlainTextFormatter;

impl PlainTextFormatter {
    fn format_record(&self, query: &QueryDefinition, record: &MatchRecord) -> String {
        let mut text = String::new();
        for (key, value) in &record.fields {
            if *key == query.timestamp_field
                || *key == query.index_field
                || key.starts_with(TOP_EVENTS_PREFIX)
            {
                continue;
            }
            text.push_str(&format!("{}: {}\n", key, format_value(value)));
        }
        text
    }

    fn summary(&self, batch: &AlertBatch) -> String {
        match &batch.key {
            Some(key) => format!(
                "{} matches for rule '{}' (aggregated by {})\n\n",
                batch.len(),
                batch.rule,
                key
            ),
            None => format!("{} matches for rule '{}'\n\n", batch.len(), batch.rule),
        }
    }
}

impl TextFormatter for PlainTextFormatter {
    fn format_title(&self, rule: &RuleConfig, batch: &AlertBatch) -> String {
        match rule.alert_subject.as_deref() {
            Some(subject) if !subject.trim().is_empty() => subject.to_string(),
            _ => batch.rule.clone(),
        }
    }

    fn format_body(&self, rule: &RuleConfig, batch: &AlertBatch) -> String {
        if batch.is_empty() {
            return String::new();
        }
        if batch.len() == 1 {
            return self.format_record(&rule.query, &batch.records[0]);
        }

        let mut body = self.summary(batch);
        for record in &batch.records {
            body.push_str(&self.format_record(&rule.query, record));
            body.push_str(RECORD_SEPARATOR);
        }
        body
    }
}

/// Strings are rendered raw, nested structures as pretty-printed JSON.
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        other => other.to_string(),
    }
}
