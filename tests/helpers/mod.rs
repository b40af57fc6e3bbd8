#![allow(dead_code)]
pub mod mock_notifier;
pub mod mock_source;

use alertwatch::aggregation::AggregationConfig;
use alertwatch::core::{MatchRecord, NotifierAdapter};
use alertwatch::rules::{QueryDefinition, Rule, RuleConfig};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Builds a rule around already constructed notifiers.
pub fn rule(
    name: &str,
    aggregation: AggregationConfig,
    notifiers: Vec<Arc<dyn NotifierAdapter>>,
) -> Rule {
    Rule {
        config: RuleConfig {
            name: name.to_string(),
            run_every_seconds: 60,
            initial_lookback_seconds: None,
            query: QueryDefinition {
                path: "/dev/null".into(),
                filter: Map::new(),
                timestamp_field: "@timestamp".to_string(),
                index_field: "_index".to_string(),
            },
            aggregation,
            silence_seconds: None,
            alert_subject: None,
            notifiers: Vec::new(),
        },
        notifiers,
    }
}

/// A fixed instant on 2024-05-01, `minute` minutes past noon.
pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

/// A record with the given fields, timestamped `minute` past noon.
pub fn record(minute: u32, fields: Value) -> MatchRecord {
    let fields = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    MatchRecord::new(at(minute), "events", fields)
}
