// Recurring background tasks (heartbeat monitor, room reaper).
//
// Each task sleeps for its interval, runs one tick, and exits when the
// shutdown flag flips. A tick runs in its own task so a panic ends that
// tick only.

use std::{future::Future, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Owns the recurring tasks and their shutdown signal.
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for MaintenanceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceHandle {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx, tasks: Mutex::new(Vec::new()) }
    }

    /// Starts a loop that runs `tick` every `interval` until shutdown.
    pub async fn spawn_recurring<F, Fut>(&self, name: &'static str, interval: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!(task = name, "maintenance task shutting down");
                        break;
                    }
                }
                if let Err(join_error) = tokio::spawn(tick()).await {
                    error!(task = name, error = %join_error, "maintenance tick failed");
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stops every task and waits for them to finish. Safe to call twice.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}
