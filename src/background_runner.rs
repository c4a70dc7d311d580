//! C4 — Background Runner: registers a periodic wake task that survives
//! app termination and fires on device boot. On a real device this wraps
//! platform background-task APIs (BGTaskScheduler / WorkManager); the
//! in-process runner here drives the same contract with a `tokio::spawn`
//! loop, mirroring the teacher's `spawn_background_workers` shutdown
//! pattern in `services/init.rs`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[async_trait]
pub trait BackgroundTask: Send + Sync {
    async fn run(&self);
}

#[async_trait]
pub trait BackgroundRunner: Send + Sync {
    /// Register `task` to run every `interval`, starting after the first
    /// elapsed interval. Returns immediately; the task is driven until
    /// `stop()` is called or the runner is dropped.
    fn register(&self, task: Arc<dyn BackgroundTask>, interval: Duration);

    fn stop(&self);
}

/// `tokio::spawn`-backed background runner. One task is supported at a
/// time per instance (the engine registers exactly one: the periodic
/// `processBackgroundNotifications` sweep), matching spec §5's "min
/// interval ~= 15 min" periodic wake.
pub struct TokioBackgroundRunner {
    shutdown: broadcast::Sender<()>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TokioBackgroundRunner {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            handle: std::sync::Mutex::new(None),
        }
    }
}

impl Default for TokioBackgroundRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundRunner for TokioBackgroundRunner {
    fn register(&self, task: Arc<dyn BackgroundTask>, interval: Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("background runner shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        task.run().await;
                    }
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for TokioBackgroundRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
