//! Background worker lifecycle and graceful shutdown.
//!
//! [`Workers`] owns the shutdown broadcast and the join handles of the queue consumers.
//! The shipping simulator only subscribes to the signal and drains its own tasks; the
//! Redpanda publish flusher belongs to the queue and stops when the queue is dropped.
//!
//! 1. Tasks subscribe to the shutdown signal via [`Workers::subscribe`]
//! 2. Their handles are registered with [`Workers::add`] or [`Workers::spawn`]
//! 3. [`Workers::shutdown`] broadcasts the signal and waits for each task, bounded by a
//!    per-task timeout
//!
//! # Example
//!
//! ```rust,ignore
//! let mut workers = Workers::new(Duration::from_secs(30));
//! workers.add("order-processor", consumer.spawn());
//!
//! shutdown_signal().await;
//! workers.shutdown().await;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Set of background tasks sharing one shutdown signal.
pub struct Workers {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
    timeout: Duration,
}

impl Workers {
    /// Create an empty set; `timeout` bounds how long shutdown waits for each task.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
            timeout,
        }
    }

    /// A receiver that fires once shutdown starts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Register an already spawned task.
    pub fn add(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.handles.push((name.into(), handle));
    }

    /// Spawn a task and register it.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.add(name, tokio::spawn(task));
    }

    /// Number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Broadcast shutdown and wait for every task.
    ///
    /// A task that outlives the timeout is aborted.
    pub async fn shutdown(self) {
        info!(workers = self.handles.len(), "Stopping background workers");
        // No receivers just means every task already stopped.
        let _ = self.shutdown_tx.send(());

        for (name, mut handle) in self.handles {
            match tokio::time::timeout(self.timeout, &mut handle).await {
                Ok(Ok(())) => info!(worker = %name, "Worker stopped gracefully"),
                Ok(Err(e)) => warn!(worker = %name, error = %e, "Worker task failed"),
                Err(_) => {
                    warn!(worker = %name, "Worker shutdown timed out, aborting");
                    handle.abort();
                }
            }
        }

        info!("All background workers stopped");
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
