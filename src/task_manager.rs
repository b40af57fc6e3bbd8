//! Manages the lifecycle of spawned tasks.
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A centralized owner for a group of spawned tasks.
///
/// Every task receives the same shutdown channel through
/// [`TaskManager::get_shutdown_rx`]; [`TaskManager::shutdown`] waits for all
/// of them after the channel has been flipped by its owner.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    /// Spawns a task and keeps its handle.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task_name = %name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Waits for all managed tasks to complete.
    pub async fn shutdown(self) {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect::<Vec<_>>();
        info!(tasks = handles.len(), "TaskManager shutting down, waiting for tasks");

        let (task_names, handles): (Vec<String>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let results = join_all(handles).await;

        let mut panicked = Vec::new();
        for (task_name, result) in task_names.iter().zip(results) {
            match result {
                Ok(()) => debug!(task_name = %task_name, "Task shut down gracefully"),
                Err(e) => {
                    error!(task_name = %task_name, error = %e, "Task panicked during shutdown");
                    panicked.push(task_name.as_str());
                }
            }
        }

        if panicked.is_empty() {
            info!("All tasks shut down gracefully");
        } else {
            error!(tasks = ?panicked, "{} tasks panicked during shutdown", panicked.len());
        }
    }
}
