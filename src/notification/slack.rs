//! A notifier that posts alerts to Slack incoming webhooks.

use crate::core::{AlertBatch, NotifierAdapter};
use crate::error::{ConfigError, NotifyError};
use crate::notification::AdapterKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use serde_with::{serde_as, OneOrMany};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const NAMED_COLORS: [&str; 3] = ["good", "warning", "danger"];

/// Options accepted by the `slack` notifier.
///
/// `webhook_url` may be given as a single URL or a list of URLs; it is
/// always a list once loaded.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackOptions {
    #[serde_as(as = "OneOrMany<_>")]
    pub webhook_url: Vec<String>,
    /// HTTPS proxy to send requests through.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_username")]
    pub username_override: String,
    #[serde(default)]
    pub channel_override: String,
    #[serde(default = "default_emoji")]
    pub emoji_override: String,
    /// When set, used instead of `emoji_override`.
    #[serde(default)]
    pub icon_url_override: Option<String>,
    #[serde(default = "default_color")]
    pub msg_color: String,
    #[serde(default = "default_parse")]
    pub parse_override: String,
    #[serde(default)]
    pub text_string: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_username() -> String {
    "alertwatch".to_string()
}

fn default_emoji() -> String {
    ":ghost:".to_string()
}

fn default_color() -> String {
    "danger".to_string()
}

fn default_parse() -> String {
    "none".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

/// A client for sending messages to one or more Slack webhooks.
pub struct SlackNotifier {
    name: String,
    options: SlackOptions,
    client: reqwest::Client,
    retrying: Mutex<Option<PartialDelivery>>,
}

/// An alert that some webhook URLs accepted while others failed transiently.
/// A retry of the same alert only posts to the URLs that have not accepted
/// it yet.
#[derive(Debug)]
struct PartialDelivery {
    title: String,
    body: String,
    timestamps: Vec<DateTime<Utc>>,
    accepted: Vec<bool>,
}

impl PartialDelivery {
    fn is_for(&self, title: &str, body: &str, batch: &AlertBatch) -> bool {
        self.title == title
            && self.body == body
            && self.timestamps.iter().eq(batch.records.iter().map(|r| &r.timestamp))
    }
}

impl SlackNotifier {
    /// Builds the webhook payload for one alert.
    pub fn payload(&self, title: &str, body: &str) -> Value {
        let mut payload = json!({
            "username": self.options.username_override,
            "channel": self.options.channel_override,
            "parse": self.options.parse_override,
            "text": self.options.text_string,
            "attachments": [
                {
                    "color": self.options.msg_color,
                    "title": title,
                    "text": body,
                    "fields": [],
                }
            ],
        });

        match &self.options.icon_url_override {
            Some(icon_url) if !icon_url.is_empty() => {
                payload["icon_url"] = Value::String(icon_url.clone());
            }
            _ => {
                payload["icon_emoji"] = Value::String(self.options.emoji_override.clone());
            }
        }
        payload
    }

    /// Which URLs already accepted this alert. Forgets any earlier alert
    /// that was still being retried.
    fn accepted_urls(&self, title: &str, body: &str, batch: &AlertBatch) -> Vec<bool> {
        let previous = self
            .retrying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some(partial) if partial.is_for(title, body, batch) => partial.accepted,
            _ => vec![false; self.options.webhook_url.len()],
        }
    }

    async fn post(&self, url: &str, payload: &Value) -> Result<(), NotifyError> {
        let response = self.client.post(url).json(payload).send().await.map_err(|e| {
            error!(error = %e, "HTTP request to Slack failed");
            if e.is_builder() {
                NotifyError::Permanent(format!("invalid Slack request: {}", e))
            } else {
                NotifyError::Transient(format!("error posting to Slack: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        error!(status = %status, body = %text, "Failed to send Slack notification");
        Err(classify_status(status, &text))
    }
}

/// Rate limiting and server errors are worth retrying; anything else the
/// webhook rejected will be rejected again.
fn classify_status(status: StatusCode, body: &str) -> NotifyError {
    let message = format!("Slack returned status {}, body: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        NotifyError::Transient(message)
    } else {
        NotifyError::Permanent(message)
    }
}

#[async_trait]
impl NotifierAdapter for SlackNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    /// Posts the alert to every configured webhook URL.
    ///
    /// All URLs are attempted. If any fail, the most severe error is
    /// returned: permanent over transient. After a transient failure, a
    /// retry of the same alert skips the URLs that already accepted it.
    #[instrument(skip(self, title, body, batch), fields(rule = %batch.rule, count = batch.len()))]
    async fn send(&self, title: &str, body: &str, batch: &AlertBatch) -> Result<(), NotifyError> {
        let payload = self.payload(title, body);
        let mut accepted = self.accepted_urls(title, body, batch);

        let mut failure: Option<NotifyError> = None;
        for (url, done) in self.options.webhook_url.iter().zip(accepted.iter_mut()) {
            if *done {
                debug!(url = %url, "Webhook already accepted this alert, skipping");
                continue;
            }
            match self.post(url, &payload).await {
                Ok(()) => *done = true,
                Err(e) => {
                    failure = match (failure, e) {
                        (Some(NotifyError::Permanent(prev)), _) => Some(NotifyError::Permanent(prev)),
                        (_, e) => Some(e),
                    };
                }
            }
        }

        match failure {
            Some(e) => {
                if e.is_transient() {
                    *self.retrying.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(PartialDelivery {
                            title: title.to_string(),
                            body: body.to_string(),
                            timestamps: batch.records.iter().map(|r| r.timestamp).collect(),
                            accepted,
                        });
                }
                Err(e)
            }
            None => {
                info!("Alert sent to Slack");
                Ok(())
            }
        }
    }
}

impl AdapterKind for SlackNotifier {
    const KIND: &'static str = "slack";
    const REQUIRED_OPTIONS: &'static [&'static str] = &["webhook_url"];
    type Options = SlackOptions;

    fn validate(options: &Self::Options) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidOption {
            kind: Self::KIND.to_string(),
            reason,
        };

        if options.webhook_url.is_empty() {
            return Err(invalid("webhook_url must contain at least one URL".to_string()));
        }
        for url in &options.webhook_url {
            let parsed =
                Url::parse(url).map_err(|e| invalid(format!("webhook_url '{}': {}", url, e)))?;
            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(invalid(format!("webhook_url '{}' is not an http(s) URL", url)));
            }
        }
        if !is_valid_color(&options.msg_color) {
            return Err(invalid(format!(
                "msg_color '{}' must be one of good, warning, danger or a #rrggbb value",
                options.msg_color
            )));
        }
        if options.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds must be greater than zero".to_string()));
        }
        Ok(())
    }

    fn build(name: String, options: Self::Options) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidOption {
            kind: Self::KIND.to_string(),
            reason,
        };

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(options.timeout_seconds));
        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| invalid(format!("proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| invalid(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name,
            options,
            client,
            retrying: Mutex::new(None),
        })
    }
}

fn is_valid_color(color: &str) -> bool {
    if NAMED_COLORS.contains(&color) {
        return true;
    }
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}
