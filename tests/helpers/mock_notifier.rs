#![allow(dead_code)]
//! A notifier that records what it receives and fails on demand.

use alertwatch::core::{AlertBatch, NotifierAdapter};
use alertwatch::error::NotifyError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct SentAlert {
    pub title: String,
    pub body: String,
    pub batch: AlertBatch,
}

#[derive(Debug)]
pub struct MockNotifier {
    name: String,
    pub sent: Arc<Mutex<Vec<SentAlert>>>,
    /// Outcomes for the next calls; once empty, `fallback` applies.
    script: Mutex<VecDeque<Result<(), NotifyError>>>,
    fallback: Mutex<Result<(), NotifyError>>,
    attempts: Mutex<usize>,
    notify: Arc<Notify>,
}

impl MockNotifier {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Arc::new(Mutex::new(Vec::new())),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            attempts: Mutex::new(0),
            notify: Arc::new(Notify::new()),
        })
    }

    /// A notifier whose every call fails with `error`.
    pub fn failing(name: &str, error: NotifyError) -> Arc<Self> {
        let notifier = Self::new(name);
        notifier.fail_with(error);
        notifier
    }

    pub fn fail_with(&self, error: NotifyError) {
        *self.fallback.lock().unwrap() = Err(error);
    }

    pub fn succeed(&self) {
        *self.fallback.lock().unwrap() = Ok(());
    }

    pub fn push_outcome(&self, outcome: Result<(), NotifyError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Calls made, successful or not.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Alerts accepted.
    pub fn delivered(&self) -> Vec<SentAlert> {
        self.sent.lock().unwrap().clone()
    }

    /// Waits until at least `count` alerts were accepted.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.sent.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .expect("Timed out waiting for alerts");
    }
}

#[async_trait]
impl NotifierAdapter for MockNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, title: &str, body: &str, batch: &AlertBatch) -> Result<(), NotifyError> {
        *self.attempts.lock().unwrap() += 1;
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        if outcome.is_ok() {
            self.sent.lock().unwrap().push(SentAlert {
                title: title.to_string(),
                body: body.to_string(),
                batch: batch.clone(),
            });
            self.notify.notify_waiters();
        }
        outcome
    }
}
