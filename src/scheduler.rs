//! C8 — Scheduler Core: drives the Platform Notifier from Materializer
//! output and maintains the persisted shadow index (spec §4.3).

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::kv::{get_json, set_json, KvStore};
use crate::error::AppResult;
use crate::materializer::Materializer;
use crate::model::{ReminderKind, ReminderSpec, ShadowRecord, SpecId};
use crate::notifier::PlatformNotifier;
use crate::retry_queue::RetryQueue;
use crate::tracker::DeliveryTracker;

/// What a single `scheduleX` call accomplished, returned to the Public API
/// per spec §4.1 ("the API returns a summary, not an exception").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleOutcome {
    pub spec_id: SpecId,
    pub scheduled: usize,
    pub failed: usize,
    pub truncated: bool,
}

/// Either a single entity id or every entity of a kind, per the spec's
/// normalized `cancelAll(kind)` operation (Open Questions: the source's
/// `"all"` sentinel is replaced by an explicit variant here).
#[derive(Debug, Clone)]
pub enum CancelTarget {
    Entity(String),
    All,
}

pub struct SchedulerCore {
    kv: Arc<dyn KvStore>,
    notifier: Arc<dyn PlatformNotifier>,
    tracker: Arc<DeliveryTracker>,
    retry_queue: Arc<RetryQueue>,
    materializer: Materializer,
    /// Per-kind locks serializing shadow-index read-modify-write cycles
    /// (spec §5: "a per-kind lock on the shadow index").
    locks: [Mutex<()>; 5],
}

impl SchedulerCore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        notifier: Arc<dyn PlatformNotifier>,
        tracker: Arc<DeliveryTracker>,
        retry_queue: Arc<RetryQueue>,
        materializer: Materializer,
    ) -> Self {
        Self {
            kv,
            notifier,
            tracker,
            retry_queue,
            materializer,
            locks: [
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
                Mutex::new(()),
            ],
        }
    }

    fn lock_for(&self, kind: ReminderKind) -> &Mutex<()> {
        &self.locks[kind.index()]
    }

    async fn load_index(&self, kind: ReminderKind) -> Vec<ShadowRecord> {
        get_json(self.kv.as_ref(), kind.shadow_index_key()).await
    }

    async fn save_index(&self, kind: ReminderKind, records: Vec<ShadowRecord>) -> AppResult<()> {
        set_json(self.kv.as_ref(), kind.shadow_index_key(), &records).await
    }

    /// `scheduleX(spec)` — idempotent per `(kind, entityId)`: cancels
    /// existing shadow records for that key, materializes, and schedules
    /// the result. Strictly ordered cancel -> materialize -> schedule ->
    /// persist -> log, per spec §5.
    pub async fn schedule(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        let kind = spec.kind();
        let spec_id = spec.spec_id();
        let _guard = self.lock_for(kind).lock().await;

        let mut index = self.load_index(kind).await;
        self.cancel_locked(&mut index, &spec_id).await?;

        let material = self.materializer.materialize(spec);
        let mut scheduled = 0usize;
        let mut failed = 0usize;

        for fire in material.instances {
            match self.notifier.schedule(fire.fire_at, &fire.content).await {
                Ok(os_id) => {
                    self.tracker
                        .on_scheduled(
                            &os_id,
                            kind,
                            fire.fire_at,
                            serde_json::json!({ "role": format!("{:?}", fire.role) }),
                        )
                        .await?;
                    index.push(ShadowRecord {
                        os_id,
                        spec_id: spec_id.clone(),
                        fire_at: fire.fire_at,
                        content: fire.content,
                    });
                    scheduled += 1;
                }
                Err(e) => {
                    failed += 1;
                    self.tracker
                        .on_schedule_failed(
                            kind,
                            fire.fire_at,
                            e.to_string(),
                            serde_json::json!({ "role": format!("{:?}", fire.role) }),
                        )
                        .await?;
                    if e.is_retryable() {
                        let synthetic_os_id = format!("pending-{}", uuid::Uuid::new_v4());
                        self.retry_queue
                            .enqueue(&synthetic_os_id, kind, fire.content, fire.fire_at, e.to_string())
                            .await?;
                    }
                }
            }
        }

        if material.horizon_exhausted {
            tracing::warn!(
                "materializer horizon exhausted for {:?}/{}; deferring to next sweep",
                kind,
                spec_id.entity_id
            );
        }

        self.save_index(kind, index).await?;

        Ok(ScheduleOutcome {
            spec_id,
            scheduled,
            failed,
            truncated: material.truncated || material.horizon_exhausted,
        })
    }

    /// `cancel(kind, entityId | "all")`.
    pub async fn cancel(&self, kind: ReminderKind, target: CancelTarget) -> AppResult<usize> {
        let _guard = self.lock_for(kind).lock().await;
        let mut index = self.load_index(kind).await;
        let cancelled = match &target {
            CancelTarget::Entity(entity_id) => {
                let spec_id = SpecId {
                    kind,
                    entity_id: entity_id.clone(),
                };
                self.cancel_locked(&mut index, &spec_id).await?
            }
            CancelTarget::All => {
                let mut count = 0;
                for record in index.drain(..).collect::<Vec<_>>() {
                    self.notifier.cancel(&record.os_id).await.ok();
                    self.tracker.on_cancelled(&record.os_id).await?;
                    count += 1;
                }
                count
            }
        };
        self.save_index(kind, index).await?;
        Ok(cancelled)
    }

    /// Cancels every `ShadowRecord` for `spec_id` within an already-loaded,
    /// already-locked index (used both by `schedule`'s pre-cancel step and
    /// by single-entity `cancel`).
    async fn cancel_locked(&self, index: &mut Vec<ShadowRecord>, spec_id: &SpecId) -> AppResult<usize> {
        let (matching, rest): (Vec<_>, Vec<_>) =
            index.drain(..).partition(|r| &r.spec_id == spec_id);
        *index = rest;
        for record in &matching {
            self.notifier.cancel(&record.os_id).await.ok();
            self.tracker.on_cancelled(&record.os_id).await?;
        }
        Ok(matching.len())
    }

    pub async fn shadow_index_len(&self, kind: ReminderKind) -> usize {
        self.load_index(kind).await.len()
    }

    pub async fn clear_all_indexes(&self) -> AppResult<()> {
        for kind in ReminderKind::ALL {
            let _guard = self.lock_for(kind).lock().await;
            self.kv.delete(kind.shadow_index_key()).await?;
        }
        self.notifier.cancel_all().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{MaterializerConfig, NotificationRetryConfig};
    use crate::db::kv::InMemoryKvStore;
    use crate::model::{ReminderPayload, TaskPriority};
    use crate::notifier::SimulatedNotifier;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap()
    }

    fn task_spec(id: &str, scheduled_at: DateTime<Utc>, leads: Vec<i64>) -> ReminderSpec {
        ReminderSpec {
            entity_id: id.to_string(),
            pet_id: "p1".to_string(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Task {
                scheduled_at,
                lead_times_minutes: leads,
                priority: TaskPriority::Normal,
                completed: false,
            },
        }
    }

    async fn make_scheduler() -> SchedulerCore {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(now()));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let notifier: Arc<dyn PlatformNotifier> = Arc::new(SimulatedNotifier::new());
        let tracker = Arc::new(DeliveryTracker::new(kv.clone(), clock.clone(), 7));
        let retry_queue = Arc::new(
            RetryQueue::new(
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
            .unwrap(),
        );
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            clock,
        );
        SchedulerCore::new(kv, notifier, tracker, retry_queue, materializer)
    }

    /// Invariant #1: the shadow index after `schedule` holds exactly the
    /// instances the Materializer produced for that spec.
    #[tokio::test]
    async fn shadow_index_matches_materializer_output() {
        let scheduler = make_scheduler().await;
        let spec = task_spec("t1", now() + Duration::hours(3), vec![60, 15]);
        let outcome = scheduler.schedule(&spec).await.unwrap();
        assert_eq!(outcome.scheduled, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 2);
    }

    /// Invariant #4: cancelling an entity removes every shadow record for
    /// it and asks the notifier to cancel each one.
    #[tokio::test]
    async fn cancel_entity_clears_shadow_index() {
        let scheduler = make_scheduler().await;
        let spec = task_spec("t2", now() + Duration::hours(3), vec![60, 15]);
        scheduler.schedule(&spec).await.unwrap();
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 2);

        let cancelled = scheduler
            .cancel(ReminderKind::Task, CancelTarget::Entity("t2".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 0);
    }

    /// Invariant #7: re-scheduling the same spec is idempotent — the old
    /// shadow records are replaced, not duplicated.
    #[tokio::test]
    async fn rescheduling_same_spec_is_idempotent() {
        let scheduler = make_scheduler().await;
        let spec = task_spec("t3", now() + Duration::hours(3), vec![60, 15]);
        scheduler.schedule(&spec).await.unwrap();
        scheduler.schedule(&spec).await.unwrap();
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 2);
    }

    #[tokio::test]
    async fn cancel_all_clears_every_kind() {
        let scheduler = make_scheduler().await;
        let spec = task_spec("t4", now() + Duration::hours(3), vec![60]);
        scheduler.schedule(&spec).await.unwrap();
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 1);

        let cancelled = scheduler.cancel(ReminderKind::Task, CancelTarget::All).await.unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(scheduler.shadow_index_len(ReminderKind::Task).await, 0);
    }
}
