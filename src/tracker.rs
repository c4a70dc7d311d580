//! C9 — Delivery Tracker: an append-only log of scheduling/delivery events
//! plus a derived stats projection (spec §4.4). Exclusively owns the
//! `DeliveryLogEntry` stream; every other component reads through `stats()`
//! or the tracker's own query helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::db::kv::{get_json, set_json, KvStore};
use crate::error::AppResult;
use crate::model::{DeliveryLogEntry, DeliveryStatus, ReminderKind};

const DELIVERY_LOG_KEY: &str = "notification_delivery_log";
const DELIVERY_STATS_KEY: &str = "notification_delivery_stats";
const DELIVERY_CONFIRMATION_LOG_KEY: &str = "delivery_confirmation_log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total_scheduled: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_interacted: u64,
    pub delivery_rate: f64,
    pub interaction_rate: f64,
    pub last_updated_at: DateTime<Utc>,
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self {
            total_scheduled: 0,
            total_delivered: 0,
            total_failed: 0,
            total_cancelled: 0,
            total_interacted: 0,
            delivery_rate: 0.0,
            interaction_rate: 0.0,
            last_updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Append-only delivery log, single process-wide write lock (spec §5:
/// "a single process-wide write lock on the DeliveryLog ... is acceptable
/// given the expected write volume").
pub struct DeliveryTracker {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    write_count: AtomicU64,
    gc_age_days: i64,
}

impl DeliveryTracker {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, gc_age_days: i64) -> Self {
        Self {
            kv,
            clock,
            write_lock: Mutex::new(()),
            write_count: AtomicU64::new(0),
            gc_age_days,
        }
    }

    pub async fn on_scheduled(
        &self,
        os_id: &str,
        kind: ReminderKind,
        scheduled_for: DateTime<Utc>,
        meta: serde_json::Value,
    ) -> AppResult<()> {
        self.append_unconditional(DeliveryLogEntry {
            os_id: os_id.to_string(),
            kind,
            status: DeliveryStatus::Scheduled,
            timestamp: self.clock.now(),
            scheduled_for,
            delivered_at: None,
            failure_reason: None,
            meta,
        })
        .await
    }

    pub async fn on_delivered(&self, os_id: &str) -> AppResult<()> {
        self.append_transition(os_id, DeliveryStatus::Scheduled, |prev| DeliveryLogEntry {
            os_id: prev.os_id.clone(),
            kind: prev.kind,
            status: DeliveryStatus::Delivered,
            timestamp: self.clock.now(),
            scheduled_for: prev.scheduled_for,
            delivered_at: Some(self.clock.now()),
            failure_reason: None,
            meta: prev.meta.clone(),
        })
        .await
    }

    pub async fn on_failed(&self, os_id: &str, reason: impl Into<String>) -> AppResult<()> {
        let reason = reason.into();
        self.append_transition(os_id, DeliveryStatus::Scheduled, move |prev| DeliveryLogEntry {
            os_id: prev.os_id.clone(),
            kind: prev.kind,
            status: DeliveryStatus::Failed,
            timestamp: self.clock.now(),
            scheduled_for: prev.scheduled_for,
            delivered_at: None,
            failure_reason: Some(reason.clone()),
            meta: prev.meta.clone(),
        })
        .await
    }

    pub async fn on_cancelled(&self, os_id: &str) -> AppResult<()> {
        self.append_transition(os_id, DeliveryStatus::Scheduled, |prev| DeliveryLogEntry {
            os_id: prev.os_id.clone(),
            kind: prev.kind,
            status: DeliveryStatus::Cancelled,
            timestamp: self.clock.now(),
            scheduled_for: prev.scheduled_for,
            delivered_at: None,
            failure_reason: None,
            meta: prev.meta.clone(),
        })
        .await
    }

    pub async fn on_interacted(&self, os_id: &str) -> AppResult<()> {
        self.append_transition(os_id, DeliveryStatus::Delivered, |prev| DeliveryLogEntry {
            os_id: prev.os_id.clone(),
            kind: prev.kind,
            status: DeliveryStatus::Interacted,
            timestamp: self.clock.now(),
            scheduled_for: prev.scheduled_for,
            delivered_at: prev.delivered_at,
            failure_reason: None,
            meta: prev.meta.clone(),
        })
        .await
    }

    /// Logs a scheduling failure for an instance that never got an `osId`
    /// (the notifier call itself failed), so there is no prior `scheduled`
    /// entry to transition from.
    pub async fn on_schedule_failed(
        &self,
        kind: ReminderKind,
        scheduled_for: DateTime<Utc>,
        reason: impl Into<String>,
        meta: serde_json::Value,
    ) -> AppResult<()> {
        self.append_unconditional(DeliveryLogEntry {
            os_id: String::new(),
            kind,
            status: DeliveryStatus::Failed,
            timestamp: self.clock.now(),
            scheduled_for,
            delivered_at: None,
            failure_reason: Some(reason.into()),
            meta,
        })
        .await
    }

    async fn append_transition(
        &self,
        os_id: &str,
        required_prior: DeliveryStatus,
        build: impl FnOnce(&DeliveryLogEntry) -> DeliveryLogEntry,
    ) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut log: Vec<DeliveryLogEntry> = get_json(self.kv.as_ref(), DELIVERY_LOG_KEY).await;

        let prior = log.iter().rev().find(|e| e.os_id == os_id);
        let Some(prior) = prior else {
            tracing::warn!("delivery tracker: no prior entry for os_id {}, dropping transition", os_id);
            return Ok(());
        };
        if prior.status != required_prior {
            tracing::warn!(
                "delivery tracker: rejected transition for os_id {} from {:?}",
                os_id,
                prior.status
            );
            return Ok(());
        }

        let entry = build(prior);
        let confirm = matches!(entry.status, DeliveryStatus::Delivered | DeliveryStatus::Interacted);
        log.push(entry);
        self.commit(log, confirm).await
    }

    async fn append_unconditional(&self, entry: DeliveryLogEntry) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut log: Vec<DeliveryLogEntry> = get_json(self.kv.as_ref(), DELIVERY_LOG_KEY).await;
        log.push(entry);
        self.commit(log, false).await
    }

    async fn commit(&self, log: Vec<DeliveryLogEntry>, confirm: bool) -> AppResult<()> {
        if confirm {
            let mut confirmations: Vec<DeliveryLogEntry> =
                get_json(self.kv.as_ref(), DELIVERY_CONFIRMATION_LOG_KEY).await;
            if let Some(last) = log.last() {
                confirmations.push(last.clone());
            }
            set_json(self.kv.as_ref(), DELIVERY_CONFIRMATION_LOG_KEY, &confirmations).await?;
        }

        let stats = recompute_stats(&log, self.clock.now());
        set_json(self.kv.as_ref(), DELIVERY_STATS_KEY, &stats).await?;
        set_json(self.kv.as_ref(), DELIVERY_LOG_KEY, &log).await?;

        let count = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count % 100 == 0 {
            self.gc().await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> DeliveryStats {
        get_json(self.kv.as_ref(), DELIVERY_STATS_KEY).await
    }

    pub async fn gc(&self) -> AppResult<()> {
        let mut log: Vec<DeliveryLogEntry> = get_json(self.kv.as_ref(), DELIVERY_LOG_KEY).await;
        let cutoff = self.clock.now() - chrono::Duration::days(self.gc_age_days);
        let before = log.len();
        log.retain(|e| e.timestamp >= cutoff);
        if log.len() != before {
            tracing::info!("delivery tracker gc: dropped {} stale entries", before - log.len());
            set_json(self.kv.as_ref(), DELIVERY_LOG_KEY, &log).await?;
        }
        Ok(())
    }
}

fn recompute_stats(log: &[DeliveryLogEntry], now: DateTime<Utc>) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    for entry in log {
        match entry.status {
            DeliveryStatus::Scheduled => stats.total_scheduled += 1,
            DeliveryStatus::Delivered => stats.total_delivered += 1,
            DeliveryStatus::Failed => stats.total_failed += 1,
            DeliveryStatus::Cancelled => stats.total_cancelled += 1,
            DeliveryStatus::Interacted => stats.total_interacted += 1,
        }
    }
    stats.delivery_rate = if stats.total_scheduled > 0 {
        stats.total_delivered as f64 / stats.total_scheduled as f64
    } else {
        0.0
    };
    stats.interaction_rate = if stats.total_delivered > 0 {
        stats.total_interacted as f64 / stats.total_delivered as f64
    } else {
        0.0
    };
    stats.last_updated_at = now;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::db::kv::InMemoryKvStore;
    use chrono::TimeZone;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(TestClock::new(Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap())),
            7,
        )
    }

    #[tokio::test]
    async fn scheduled_then_delivered_then_interacted() {
        let tracker = tracker();
        let fire_at = Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap();
        tracker
            .on_scheduled("os-1", ReminderKind::Task, fire_at, serde_json::json!({}))
            .await
            .unwrap();
        tracker.on_delivered("os-1").await.unwrap();
        tracker.on_interacted("os-1").await.unwrap();

        let stats = tracker.stats().await;
        assert_eq!(stats.total_scheduled, 1);
        assert_eq!(stats.total_delivered, 1);
        assert_eq!(stats.total_interacted, 1);
        assert!((stats.delivery_rate - 1.0).abs() < f64::EPSILON);
        assert!((stats.interaction_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let tracker = tracker();
        let fire_at = Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap();
        tracker
            .on_scheduled("os-2", ReminderKind::Task, fire_at, serde_json::json!({}))
            .await
            .unwrap();
        tracker.on_cancelled("os-2").await.unwrap();
        // A delivered transition after cancellation must be rejected, not applied.
        tracker.on_delivered("os-2").await.unwrap();

        let stats = tracker.stats().await;
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.total_delivered, 0);
    }

    #[tokio::test]
    async fn stats_rates_stay_within_unit_interval() {
        let tracker = tracker();
        let fire_at = Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap();
        for i in 0..5 {
            let os_id = format!("os-{}", i);
            tracker
                .on_scheduled(&os_id, ReminderKind::Meal, fire_at, serde_json::json!({}))
                .await
                .unwrap();
        }
        tracker.on_delivered("os-0").await.unwrap();
        tracker.on_failed("os-1", "timeout").await.unwrap();
        let stats = tracker.stats().await;
        assert!(stats.delivery_rate >= 0.0 && stats.delivery_rate <= 1.0);
        assert!(stats.interaction_rate >= 0.0 && stats.interaction_rate <= 1.0);
    }
}
