#![allow(dead_code)]
//! A query source that replays scripted responses.

use alertwatch::core::{MatchRecord, QuerySource};
use alertwatch::error::QueryError;
use alertwatch::rules::RuleConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryCall {
    pub rule: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// Responses are queued per rule; a rule with nothing queued gets no matches.
#[derive(Debug, Default)]
pub struct MockSource {
    responses: Mutex<HashMap<String, VecDeque<Result<Vec<MatchRecord>, QueryError>>>>,
    pub calls: Mutex<Vec<QueryCall>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, rule: &str, response: Result<Vec<MatchRecord>, QueryError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(rule.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls_for(&self, rule: &str) -> Vec<QueryCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.rule == rule)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QuerySource for MockSource {
    async fn query(
        &self,
        rule: &RuleConfig,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MatchRecord>, QueryError> {
        self.calls.lock().unwrap().push(QueryCall {
            rule: rule.name.clone(),
            since,
            until,
        });
        self.responses
            .lock()
            .unwrap()
            .get_mut(&rule.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(Vec::new()))
    }
}
