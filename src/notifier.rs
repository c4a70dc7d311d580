//! C3 — Platform Notifier: thin capability abstraction over the OS
//! scheduled-notification facility. The core never assumes guaranteed
//! delivery through this contract (spec §4.8); every call is tracked by the
//! Delivery Tracker and backstopped by the Critical Mirror.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppResult;
use crate::model::NotificationContent;

#[async_trait]
pub trait PlatformNotifier: Send + Sync {
    /// Schedule `content` for delivery at `fire_at`. `fire_at <= now` means
    /// immediate. Returns the OS-assigned id.
    async fn schedule(&self, fire_at: DateTime<Utc>, content: &NotificationContent) -> AppResult<String>;

    async fn cancel(&self, os_id: &str) -> AppResult<()>;

    async fn cancel_all(&self) -> AppResult<()>;

    async fn has_permission(&self) -> AppResult<bool>;

    async fn request_permission(&self) -> AppResult<bool>;

    /// Count of notifications currently outstanding with the OS, where
    /// knowable. Used as a secondary health signal alongside the shadow
    /// index (spec's Design Notes: the OS set is write-only queryable).
    async fn outstanding_count(&self) -> AppResult<Option<u64>>;
}

/// Reference notifier for tests and the demo binary. Holds scheduled ids in
/// memory and always grants permission; real OS-backed notifiers (platform
/// channel shims) are the host application's responsibility.
pub struct SimulatedNotifier {
    scheduled: Mutex<std::collections::HashSet<String>>,
    next_id: AtomicU64,
    permission_granted: Arc<std::sync::atomic::AtomicBool>,
}

impl SimulatedNotifier {
    pub fn new() -> Self {
        Self {
            scheduled: Mutex::new(std::collections::HashSet::new()),
            next_id: AtomicU64::new(1),
            permission_granted: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        }
    }

    pub fn with_permission(granted: bool) -> Self {
        let notifier = Self::new();
        notifier
            .permission_granted
            .store(granted, Ordering::SeqCst);
        notifier
    }
}

impl Default for SimulatedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformNotifier for SimulatedNotifier {
    async fn schedule(
        &self,
        _fire_at: DateTime<Utc>,
        _content: &NotificationContent,
    ) -> AppResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let os_id = format!("sim-{}", id);
        self.scheduled.lock().await.insert(os_id.clone());
        Ok(os_id)
    }

    async fn cancel(&self, os_id: &str) -> AppResult<()> {
        self.scheduled.lock().await.remove(os_id);
        Ok(())
    }

    async fn cancel_all(&self) -> AppResult<()> {
        self.scheduled.lock().await.clear();
        Ok(())
    }

    async fn has_permission(&self) -> AppResult<bool> {
        Ok(self.permission_granted.load(Ordering::SeqCst))
    }

    async fn request_permission(&self) -> AppResult<bool> {
        self.permission_granted.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn outstanding_count(&self) -> AppResult<Option<u64>> {
        Ok(Some(self.scheduled.lock().await.len() as u64))
    }
}

/// A `PlatformNotifier` that fails every `schedule` call with a named error
/// a fixed number of times before succeeding, used to exercise the retry
/// queue (spec §8 round-trip check: "a flaky C3 that fails k times then
/// succeeds").
pub struct FlakyNotifier {
    inner: SimulatedNotifier,
    remaining_failures: AtomicU64,
    failure_text: String,
}

impl FlakyNotifier {
    pub fn new(failures: u64, failure_text: impl Into<String>) -> Self {
        Self {
            inner: SimulatedNotifier::new(),
            remaining_failures: AtomicU64::new(failures),
            failure_text: failure_text.into(),
        }
    }
}

#[async_trait]
impl PlatformNotifier for FlakyNotifier {
    async fn schedule(
        &self,
        fire_at: DateTime<Utc>,
        content: &NotificationContent,
    ) -> AppResult<String> {
        loop {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining == 0 {
                return self.inner.schedule(fire_at, content).await;
            }
            if self
                .remaining_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(crate::error::AppError::Notifier(self.failure_text.clone()));
            }
        }
    }

    async fn cancel(&self, os_id: &str) -> AppResult<()> {
        self.inner.cancel(os_id).await
    }

    async fn cancel_all(&self) -> AppResult<()> {
        self.inner.cancel_all().await
    }

    async fn has_permission(&self) -> AppResult<bool> {
        self.inner.has_permission().await
    }

    async fn request_permission(&self) -> AppResult<bool> {
        self.inner.request_permission().await
    }

    async fn outstanding_count(&self) -> AppResult<Option<u64>> {
        self.inner.outstanding_count().await
    }
}
