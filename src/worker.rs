//! Background work
//!
//! Blocking cache and WebDAV work runs on the tokio blocking pool; results
//! come back as a `Result` or through a completion callback. Failures are
//! routed through a central `ErrorHandler`, which decides whether the daemon
//! can keep going.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::cache::CacheError;
use crate::webdav::WebDavError;

/// How a background task ended
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(anyhow::Error),
}

impl<T> From<Result<T>> for TaskOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Succeeded(value),
            Err(e) => TaskOutcome::Failed(e),
        }
    }
}

/// Run blocking work off the async threads and wait for it
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("Background task failed to complete: {}", e))?
}

/// Run blocking work in the background and hand the outcome to `on_done`
pub fn spawn_with_callback<T, F, C>(work: F, on_done: C) -> JoinHandle<()>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    C: FnOnce(TaskOutcome<T>) + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        let outcome = TaskOutcome::from(run_blocking(work).await);
        on_done(outcome);
    })
}

/// Severity assigned to a failure by the central handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Report to the requester and carry on
    Recoverable,
    /// The remote tier is unusable; shut the daemon down
    Fatal,
}

/// Central sink for background failures
#[derive(Clone)]
pub struct ErrorHandler {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown: Arc::new(shutdown),
        }
    }

    /// Classify an error by looking for a fatal cause anywhere in its chain
    pub fn classify(err: &anyhow::Error) -> Severity {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<WebDavError>() {
                if e.is_fatal() {
                    return Severity::Fatal;
                }
            }
            if let Some(e) = cause.downcast_ref::<CacheError>() {
                if e.is_fatal() {
                    return Severity::Fatal;
                }
            }
            if let Some(e) = cause.downcast_ref::<Arc<CacheError>>() {
                if e.is_fatal() {
                    return Severity::Fatal;
                }
            }
        }
        Severity::Recoverable
    }

    /// Log a failure, requesting shutdown when it is fatal
    pub fn handle(&self, context: &str, err: &anyhow::Error) -> Severity {
        let severity = Self::classify(err);
        match severity {
            Severity::Recoverable => warn!(context = context, error = %err, "Request failed"),
            Severity::Fatal => {
                error!(context = context, error = %err, "Fatal error, shutting down");
                self.shutdown.send_replace(true);
            }
        }
        severity
    }

    /// Receiver that flips to `true` once a fatal error was handled
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}
