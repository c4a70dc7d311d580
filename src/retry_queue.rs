//! C10 — Retry Queue: exponential-backoff reattempts of failed scheduling
//! calls (spec §4.5). Scheduling failures only; delivery failures are
//! handled by `rescheduleAll` and the Critical Mirror path per the Design
//! Notes, not by per-entry retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::NotificationRetryConfig;
use crate::db::kv::{get_json, set_json, KvStore};
use crate::error::AppResult;
use crate::model::{NotificationContent, ReminderKind, RetryEntry};
use crate::notifier::PlatformNotifier;
use crate::tracker::DeliveryTracker;

const RETRY_QUEUE_KEY: &str = "notification_retry_queue";
const RETRY_CONFIG_KEY: &str = "notification_retry_config";

#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryQueueStatus {
    pub pending: usize,
    pub config: NotificationRetryConfig,
}

pub struct RetryQueue {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn PlatformNotifier>,
    tracker: Arc<DeliveryTracker>,
    write_lock: Mutex<()>,
}

impl RetryQueue {
    pub async fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn PlatformNotifier>,
        tracker: Arc<DeliveryTracker>,
        default_config: NotificationRetryConfig,
    ) -> AppResult<Self> {
        if kv.get(RETRY_CONFIG_KEY).await?.is_none() {
            set_json(kv.as_ref(), RETRY_CONFIG_KEY, &default_config).await?;
        }
        Ok(Self {
            kv,
            clock,
            notifier,
            tracker,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn config(&self) -> NotificationRetryConfig {
        get_json(self.kv.as_ref(), RETRY_CONFIG_KEY).await
    }

    pub async fn set_config(&self, config: NotificationRetryConfig) -> AppResult<()> {
        set_json(self.kv.as_ref(), RETRY_CONFIG_KEY, &config).await
    }

    pub async fn status(&self) -> RetryQueueStatus {
        let entries: Vec<RetryEntry> = get_json(self.kv.as_ref(), RETRY_QUEUE_KEY).await;
        RetryQueueStatus {
            pending: entries.len(),
            config: self.config().await,
        }
    }

    /// Enqueue a scheduling failure for `original_os_id`. If an entry
    /// already exists for that id, bump its attempt count and backoff
    /// instead of creating a duplicate.
    pub async fn enqueue(
        &self,
        original_os_id: &str,
        kind: ReminderKind,
        content: NotificationContent,
        original_fire_at: DateTime<Utc>,
        failure_reason: impl Into<String>,
    ) -> AppResult<()> {
        let config = self.config().await;
        if !config.enabled {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<RetryEntry> = get_json(self.kv.as_ref(), RETRY_QUEUE_KEY).await;
        let now = self.clock.now();
        let reason = failure_reason.into();

        if let Some(existing) = entries.iter_mut().find(|e| e.original_os_id == original_os_id) {
            existing.attempts += 1;
            existing.failure_reasons.push(reason);
            existing.last_attempt_at = Some(now);
            existing.next_attempt_at = backoff_target(&config, now, existing.attempts);
            if existing.attempts >= config.max_attempts {
                entries.retain(|e| e.original_os_id != original_os_id);
            }
        } else {
            let entry = RetryEntry {
                id: uuid::Uuid::new_v4().to_string(),
                original_os_id: original_os_id.to_string(),
                kind,
                content,
                original_fire_at,
                attempts: 1,
                max_attempts: config.max_attempts,
                next_attempt_at: backoff_target(&config, now, 1),
                created_at: now,
                last_attempt_at: Some(now),
                failure_reasons: vec![reason],
            };
            if entry.attempts < entry.max_attempts || entry.max_attempts == 0 {
                entries.push(entry);
            }
        }

        set_json(self.kv.as_ref(), RETRY_QUEUE_KEY, &entries).await
    }

    /// Drops timed-out entries, then attempts every entry whose
    /// `nextAttemptAt` has arrived.
    pub async fn process(&self) -> AppResult<()> {
        let config = self.config().await;
        let now = self.clock.now();

        let _guard = self.write_lock.lock().await;
        let mut entries: Vec<RetryEntry> = get_json(self.kv.as_ref(), RETRY_QUEUE_KEY).await;

        let timeout = chrono::Duration::hours(config.retry_timeout_hours);
        entries.retain(|e| now - e.created_at < timeout);

        let due: Vec<RetryEntry> = entries
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .cloned()
            .collect();

        let mut remaining: Vec<RetryEntry> = entries
            .into_iter()
            .filter(|e| e.next_attempt_at > now)
            .collect();

        for mut entry in due {
            match self
                .notifier
                .schedule(now + chrono::Duration::seconds(1), &entry.content)
                .await
            {
                Ok(os_id) => {
                    self.tracker
                        .on_scheduled(
                            &os_id,
                            entry.kind,
                            entry.original_fire_at,
                            serde_json::json!({ "retriedFrom": entry.original_os_id }),
                        )
                        .await?;
                }
                Err(e) => {
                    entry.attempts += 1;
                    entry.failure_reasons.push(e.to_string());
                    entry.last_attempt_at = Some(now);
                    entry.next_attempt_at = backoff_target(&config, now, entry.attempts);
                    if entry.attempts < config.max_attempts {
                        remaining.push(entry);
                    }
                }
            }
        }

        set_json(self.kv.as_ref(), RETRY_QUEUE_KEY, &remaining).await
    }
}

fn backoff_target(config: &NotificationRetryConfig, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
    let raw_minutes =
        config.initial_delay_minutes * i64::from(config.backoff_multiplier).pow(attempts.saturating_sub(1));
    let capped_minutes = raw_minutes.min(config.max_delay_hours * 60);
    now + chrono::Duration::minutes(capped_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::db::kv::InMemoryKvStore;
    use crate::model::NotificationContent;
    use crate::notifier::FlakyNotifier;
    use chrono::TimeZone;

    fn content() -> NotificationContent {
        NotificationContent {
            title: "t".into(),
            body: "b".into(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn flaky_notifier_eventually_clears_the_queue() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let test_clock = Arc::new(TestClock::new(now));
        let clock: Arc<dyn Clock> = test_clock.clone();
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let notifier: Arc<dyn PlatformNotifier> = Arc::new(FlakyNotifier::new(1, "timeout"));
        let tracker = Arc::new(DeliveryTracker::new(kv.clone(), clock.clone(), 7));

        let queue = RetryQueue::new(
            kv.clone(),
            clock.clone(),
            notifier.clone(),
            tracker.clone(),
            NotificationRetryConfig {
                enabled: true,
                max_attempts: 3,
                initial_delay_minutes: 5,
                backoff_multiplier: 2,
                max_delay_hours: 24,
                retry_timeout_hours: 72,
            },
        )
        .await
        .unwrap();

        queue
            .enqueue("os-x", ReminderKind::Task, content(), now, "timeout")
            .await
            .unwrap();
        assert_eq!(queue.status().await.pending, 1);

        test_clock.advance(chrono::Duration::minutes(10));

        queue.process().await.unwrap();
        assert_eq!(queue.status().await.pending, 0);
        assert_eq!(tracker.stats().await.total_scheduled, 1);
    }
}
