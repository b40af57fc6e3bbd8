//! Core domain types and service traits for AlertWatch
//!
//! This module defines the fundamental data structures and trait contracts
//! that govern component interactions throughout the application.

use crate::error::{NotifyError, QueryError};
use crate::rules::RuleConfig;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name carrying the event timestamp in source documents.
pub const TIMESTAMP_FIELD: &str = "@timestamp";
/// Field name carrying the source index or stream identifier.
pub const INDEX_FIELD: &str = "_index";

/// Upper bound for every configured duration, in seconds (100 years).
pub const MAX_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Converts configured seconds into a `TimeDelta`, saturating at
/// `TimeDelta::MAX` where chrono would panic.
pub fn seconds_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// `at + secs`, clamped to the latest representable instant.
pub fn saturating_add_seconds(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    at.checked_add_signed(seconds_delta(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - secs`, clamped to the earliest representable instant.
pub fn saturating_sub_seconds(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    at.checked_sub_signed(seconds_delta(secs))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A single event returned by a rule's query.
///
/// Records are immutable once produced. Fields are kept in a stable
/// (lexicographic) order so that rendering is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    /// When the event happened, according to the source.
    pub timestamp: DateTime<Utc>,
    /// The index or stream the event was read from.
    pub index: String,
    /// The event's fields.
    pub fields: Map<String, Value>,
}

impl MatchRecord {
    pub fn new(timestamp: DateTime<Utc>, index: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            timestamp,
            index: index.into(),
            fields,
        }
    }

    /// Returns the value of a field, if present.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns the value of a field rendered as a plain string, for use as an
    /// aggregation key. Strings are returned without quotes.
    pub fn field_as_key(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// An ordered group of matches for one rule and aggregation key.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertBatch {
    /// Name of the rule that produced the matches.
    pub rule: String,
    /// Value of the rule's aggregation key shared by all records, if any.
    pub key: Option<String>,
    /// The matches, in the order they were buffered.
    pub records: Vec<MatchRecord>,
}

impl AlertBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Supplies matching events for a rule.
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Returns the events matching `rule` with a timestamp in `(since, until]`.
    ///
    /// # Returns
    /// * `Ok(records)` in source order, possibly empty
    /// * `Err(QueryError)` if the source could not be read or parsed
    async fn query(
        &self,
        rule: &RuleConfig,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>, QueryError>;
}

/// Delivers a rendered alert to an external notification channel.
///
/// The dispatcher only ever talks to notifiers through this trait.
#[async_trait]
pub trait NotifierAdapter: Send + Sync {
    /// A short, descriptive name for the notifier (e.g., "slack").
    /// Used in delivery reports, logging and metrics.
    fn name(&self) -> &str;

    /// Sends one rendered alert.
    ///
    /// # Returns
    /// * `Ok(())` if the alert was accepted by the destination
    /// * `Err(NotifyError::Transient)` if the send may succeed when retried
    /// * `Err(NotifyError::Permanent)` if retrying cannot help
    async fn send(&self, title: &str, body: &str, batch: &AlertBatch) -> Result<(), NotifyError>;
}
