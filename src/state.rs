//! Mutable per-rule state and its optional persistence between restarts.

use crate::aggregation::{AggregationBuffer, AggregationConfig};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Runtime state of one rule. Owned by that rule's evaluation task.
#[derive(Debug, Clone)]
pub struct RuleState {
    /// End of the last query window that was fully processed.
    pub last_run: Option<DateTime<Utc>>,
    /// Alerts for the rule are dropped until this instant.
    pub silenced_until: Option<DateTime<Utc>>,
    /// Number of dispatches in a row that had at least one failed notifier.
    pub consecutive_errors: u32,
    /// Number of batches dropped because the rule was silenced.
    pub silenced_batches: u64,
    /// Matches waiting for their aggregation window to close.
    pub pending: AggregationBuffer,
}

impl RuleState {
    pub fn new(rule: &str, aggregation: &AggregationConfig) -> Self {
        Self {
            last_run: None,
            silenced_until: None,
            consecutive_errors: 0,
            silenced_batches: 0,
            pending: AggregationBuffer::new(rule, aggregation),
        }
    }

    /// Restores the persisted parts of a rule's state.
    pub fn restore(rule: &str, aggregation: &AggregationConfig, saved: &PersistedRuleState) -> Self {
        Self {
            last_run: saved.last_run,
            silenced_until: saved.silenced_until,
            ..Self::new(rule, aggregation)
        }
    }

    pub fn is_silenced(&self, now: DateTime<Utc>) -> bool {
        self.silenced_until.is_some_and(|until| until > now)
    }

    pub fn snapshot(&self) -> PersistedRuleState {
        PersistedRuleState {
            last_run: self.resume_point(),
            silenced_until: self.silenced_until,
        }
    }

    /// Where a restarted rule should resume querying.
    ///
    /// Buffered matches only live in memory, so while any are pending this is
    /// moved back to just before the oldest of them. A crash then re-queries
    /// those matches instead of losing them.
    fn resume_point(&self) -> Option<DateTime<Utc>> {
        let oldest = self.pending.oldest_pending().map(|ts| {
            ts.checked_sub_signed(TimeDelta::nanoseconds(1))
                .unwrap_or(ts)
        });
        match (self.last_run, oldest) {
            (Some(last_run), Some(oldest)) => Some(last_run.min(oldest)),
            (last_run, None) => last_run,
            (None, oldest) => oldest,
        }
    }
}

/// The parts of [`RuleState`] that survive a restart.
///
/// `last_run` is the resume point: it never lies past a match that was
/// buffered but not yet dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRuleState {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub silenced_until: Option<DateTime<Utc>>,
}

/// Keeps the last known state of every rule, optionally backed by a JSON
/// file of the form `{"rule name": {"last_run": ..., "silenced_until": ...}}`.
///
/// Rule tasks only touch the store at step boundaries; it is never used to
/// share live state between rules.
#[derive(Debug, Default)]
pub struct StateStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, PersistedRuleState>>,
}

impl StateStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a file-backed store. A missing file is treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse state file: {}", path.display()))?
            }
        } else {
            debug!(path = %path.display(), "State file does not exist yet, starting empty");
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, rule: &str) -> Option<PersistedRuleState> {
        self.lock().get(rule).copied()
    }

    /// Records the state of a rule and writes the store to disk if it is
    /// file-backed.
    pub fn save(&self, rule: &str, state: PersistedRuleState) -> Result<()> {
        let mut entries = self.lock();
        entries.insert(rule.to_string(), state);
        // Written under the lock so concurrent saves never share the temp file.
        self.write(&entries)
    }

    /// Drops entries for rules that are no longer configured.
    pub fn retain_rules<'a>(&self, rules: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let keep: Vec<&str> = rules.into_iter().collect();
        let mut entries = self.lock();
        entries.retain(|name, _| keep.contains(&name.as_str()));
        self.write(&entries)
    }

    fn write(&self, entries: &BTreeMap<String, PersistedRuleState>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PersistedRuleState>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("State store mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
