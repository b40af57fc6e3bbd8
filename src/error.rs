//! Error types shared by the rule loader, query sources, notifiers and the
//! dispatcher.

use thiserror::Error;

/// A rule or notifier definition that cannot be loaded.
///
/// Any `ConfigError` is fatal for the rule set being loaded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("rule '{rule}' is defined more than once")]
    DuplicateRule { rule: String },

    #[error("rule '{rule}' has no notifiers configured")]
    NoNotifiers { rule: String },

    #[error("rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("unknown notifier type '{kind}'")]
    UnknownNotifier { kind: String },

    #[error("notifier '{kind}' is missing required option '{option}'")]
    MissingOption { kind: String, option: String },

    #[error("notifier '{kind}' has an invalid option: {reason}")]
    InvalidOption { kind: String, reason: String },
}

/// Failure of a query source to produce matches for a rule.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("query source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse query result: {0}")]
    Parse(String),
}

/// Failure of a single notifier to deliver a rendered alert.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    /// Network errors, timeouts, rate limiting and server-side errors.
    #[error("transient notifier error: {0}")]
    Transient(String),

    /// Rejected payloads, bad credentials and other client-side errors.
    #[error("permanent notifier error: {0}")]
    Permanent(String),
}

impl NotifyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

/// A batch that could not be dispatched at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("rule '{rule}' has no notifiers to dispatch to")]
    NoNotifiers { rule: String },

    #[error("dispatch for rule '{rule}' abandoned after the shutdown grace period")]
    Abandoned { rule: String },
}
