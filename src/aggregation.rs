//! Per-rule buffering of matches into alert batches.
//!
//! A buffer holds one pending group per aggregation key. A group is emitted
//! as an [`AlertBatch`] once it holds `count` records or once its oldest
//! record has been buffered for `window`, whichever happens first.

use crate::core::{seconds_delta, AlertBatch, MatchRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How a rule groups its matches before alerting.
///
/// With neither `count` nor `window_seconds` set the rule is realtime and
/// every match is alerted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationConfig {
    /// Emit a batch once this many matches are buffered.
    #[serde(default)]
    pub count: Option<usize>,
    /// Emit a batch once the oldest buffered match is this many seconds old.
    #[serde(default)]
    pub window_seconds: Option<u64>,
    /// Group matches by the value of this field.
    #[serde(default)]
    pub key: Option<String>,
}

impl AggregationConfig {
    pub fn is_realtime(&self) -> bool {
        self.count.is_none() && self.window_seconds.is_none()
    }
}

#[derive(Debug, Clone)]
struct PendingGroup {
    key: Option<String>,
    opened_at: DateTime<Utc>,
    records: Vec<MatchRecord>,
}

/// Buffers matches for a single rule.
#[derive(Debug, Clone)]
pub struct AggregationBuffer {
    rule: String,
    count: Option<usize>,
    window: Option<Duration>,
    key_field: Option<String>,
    // Ordered by `opened_at`, oldest first.
    groups: Vec<PendingGroup>,
}

impl AggregationBuffer {
    /// Creates an empty buffer for `rule`.
    pub fn new(rule: impl Into<String>, config: &AggregationConfig) -> Self {
        Self {
            rule: rule.into(),
            count: config.count,
            window: config.window_seconds.map(seconds_delta),
            key_field: config.key.clone(),
            groups: Vec::new(),
        }
    }

    /// Buffers a record using the current wall-clock time.
    pub fn add(&mut self, record: MatchRecord) -> Option<AlertBatch> {
        self.add_at(record, Utc::now())
    }

    /// Buffers a record that arrived at `now`.
    ///
    /// Returns the record's group as a completed batch if the group reached
    /// its count threshold or its window has elapsed; the group is then
    /// removed from the buffer.
    pub fn add_at(&mut self, record: MatchRecord, now: DateTime<Utc>) -> Option<AlertBatch> {
        let key = self
            .key_field
            .as_deref()
            .and_then(|field| record.field_as_key(field));

        if self.count.is_none() && self.window.is_none() {
            return Some(AlertBatch {
                rule: self.rule.clone(),
                key,
                records: vec![record],
            });
        }

        let idx = match self.groups.iter().position(|g| g.key == key) {
            Some(idx) => idx,
            None => {
                self.groups.push(PendingGroup {
                    key,
                    opened_at: now,
                    records: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        self.groups[idx].records.push(record);

        if self.is_complete(&self.groups[idx], now) {
            let group = self.groups.remove(idx);
            return Some(self.into_batch(group));
        }
        None
    }

    /// Emits every group whose window has elapsed at `now`, oldest first.
    pub fn poll_expired(&mut self, now: DateTime<Utc>) -> Vec<AlertBatch> {
        let Some(window) = self.window else {
            return Vec::new();
        };

        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.groups)
            .into_iter()
            .partition(|g| now - g.opened_at >= window);
        self.groups = pending;

        expired.into_iter().map(|g| self.into_batch(g)).collect()
    }

    /// Forces emission of the oldest pending group.
    ///
    /// Returns `None` and leaves the buffer untouched when nothing is
    /// pending. Call repeatedly to drain every aggregation key.
    pub fn flush(&mut self) -> Option<AlertBatch> {
        if self.groups.is_empty() {
            return None;
        }
        let group = self.groups.remove(0);
        Some(self.into_batch(group))
    }

    /// Timestamp of the oldest record still buffered, if any.
    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        self.groups
            .iter()
            .flat_map(|g| &g.records)
            .map(|r| r.timestamp)
            .min()
    }

    /// Total number of buffered records across all groups.
    pub fn pending_records(&self) -> usize {
        self.groups.iter().map(|g| g.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn is_complete(&self, group: &PendingGroup, now: DateTime<Utc>) -> bool {
        let count_reached = self.count.is_some_and(|count| group.records.len() >= count);
        let window_elapsed = self.window.is_some_and(|window| now - group.opened_at >= window);
        count_reached || window_elapsed
    }

    fn into_batch(&self, group: PendingGroup) -> AlertBatch {
        AlertBatch {
            rule: self.rule.clone(),
            key: group.key,
            records: group.records,
        }
    }
}
