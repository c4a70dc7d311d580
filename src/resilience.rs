//! C11 — Resilience Supervisor: restart detection, scheduled-count health
//! monitoring, foreground/background lifecycle hooks, and the periodic
//! background sweep (spec §4.6). This is also where `rescheduleAll` is
//! implemented, since the supervisor is the one component that already
//! holds references to every other piece it needs to touch.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::ResilienceConfig;
use crate::critical_mirror::CriticalMirror;
use crate::db::kv::{get_json, set_json, KvStore};
use crate::domain::DomainReader;
use crate::error::AppResult;
use crate::model::{FrequencyPeriod, MedicationStatus, ReminderKind, ReminderPayload, ReminderSpec};
use crate::notifier::PlatformNotifier;
use crate::retry_queue::RetryQueue;
use crate::scheduler::SchedulerCore;
use crate::tracker::DeliveryTracker;

const RESTART_SENTINEL_KEY: &str = "device_restart_detection";
const LAST_BACKGROUND_CHECK_KEY: &str = "last_background_check";
const PERSISTENT_BACKUP_KEY: &str = "persistent_notifications_v2";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InitializeReport {
    pub permission_granted: bool,
    pub restarted: bool,
    pub rescheduled: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RescheduleAllReport {
    pub specs_considered: usize,
    pub total_scheduled: usize,
    pub total_failed: usize,
}

pub struct ResilienceSupervisor {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    domain: Arc<dyn DomainReader>,
    notifier: Arc<dyn PlatformNotifier>,
    scheduler: Arc<SchedulerCore>,
    retry_queue: Arc<RetryQueue>,
    critical_mirror: Arc<CriticalMirror>,
    tracker: Arc<DeliveryTracker>,
    config: ResilienceConfig,
}

impl ResilienceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        domain: Arc<dyn DomainReader>,
        notifier: Arc<dyn PlatformNotifier>,
        scheduler: Arc<SchedulerCore>,
        retry_queue: Arc<RetryQueue>,
        critical_mirror: Arc<CriticalMirror>,
        tracker: Arc<DeliveryTracker>,
        config: ResilienceConfig,
    ) -> Self {
        Self {
            kv,
            clock,
            domain,
            notifier,
            scheduler,
            retry_queue,
            critical_mirror,
            tracker,
            config,
        }
    }

    async fn all_enabled_specs(&self) -> Vec<ReminderSpec> {
        let mut specs = Vec::new();
        specs.extend(self.domain.list_active_medications().await.unwrap_or_default());
        specs.extend(self.domain.list_pending_tasks(None).await.unwrap_or_default());
        specs.extend(self.domain.list_upcoming_meals(30).await.unwrap_or_default());
        specs.extend(self.domain.list_low_stock_items().await.unwrap_or_default());
        specs.extend(
            self.domain
                .list_pending_health_followups(30)
                .await
                .unwrap_or_default(),
        );
        specs.into_iter().filter(|s| s.enabled).collect()
    }

    /// Full rebuild: cancel every OS notification, clear every shadow
    /// index, re-run the Materializer over all enabled specs, schedule,
    /// refresh the Critical Mirror, process the Retry Queue.
    pub async fn reschedule_all(&self) -> AppResult<RescheduleAllReport> {
        self.scheduler.clear_all_indexes().await?;

        let specs = self.all_enabled_specs().await;
        let mut total_scheduled = 0usize;
        let mut total_failed = 0usize;
        for spec in &specs {
            match self.scheduler.schedule(spec).await {
                Ok(outcome) => {
                    total_scheduled += outcome.scheduled;
                    total_failed += outcome.failed;
                }
                Err(e) => {
                    tracing::warn!("rescheduleAll: failed to schedule {:?}: {}", spec.spec_id(), e);
                }
            }
        }

        self.critical_mirror.refresh().await.ok();
        self.retry_queue.process().await.ok();

        Ok(RescheduleAllReport {
            specs_considered: specs.len(),
            total_scheduled,
            total_failed,
        })
    }

    /// Cold-start entry point. Detects a device restart by comparing now
    /// to the persisted restart sentinel; on a gap beyond the configured
    /// threshold, reconstitutes from the Persistent Backup before doing a
    /// full `rescheduleAll`.
    pub async fn initialize(&self) -> AppResult<InitializeReport> {
        let mut report = InitializeReport::default();

        report.permission_granted = self.notifier.has_permission().await.unwrap_or(false);
        if !report.permission_granted {
            return Ok(report);
        }

        let now = self.clock.now();
        let sentinel: Option<DateTime<Utc>> = get_json(self.kv.as_ref(), RESTART_SENTINEL_KEY).await;
        let gap_hours = sentinel.map(|s| (now - s).num_minutes() as f64 / 60.0);
        let is_restart = match gap_hours {
            Some(hours) => hours > self.config.restart_gap_hours as f64,
            None => true,
        };

        if is_restart {
            report.restarted = true;
            let backup: Vec<ReminderSpec> = get_json(self.kv.as_ref(), PERSISTENT_BACKUP_KEY).await;
            for spec in &backup {
                if spec_is_still_valid(spec, now) {
                    self.scheduler.schedule(spec).await.ok();
                }
            }
            self.reschedule_all().await?;
            report.rescheduled = true;
        }

        set_json(self.kv.as_ref(), RESTART_SENTINEL_KEY, &now).await?;
        Ok(report)
    }

    /// App-foreground entry point.
    pub async fn on_foreground(&self) -> AppResult<()> {
        let now = self.clock.now();
        let sentinel: Option<DateTime<Utc>> = get_json(self.kv.as_ref(), LAST_BACKGROUND_CHECK_KEY).await;
        let gap_minutes = sentinel.map(|s| (now - s).num_minutes());

        if gap_minutes.map(|m| m > self.config.foreground_resync_minutes).unwrap_or(true) {
            self.process_background_notifications().await?;
            self.reschedule_all().await?;
        }

        set_json(self.kv.as_ref(), LAST_BACKGROUND_CHECK_KEY, &now).await
    }

    /// App-background entry point: refreshes the Critical Mirror so a
    /// backstop copy of near-term reminders reaches the server side.
    pub async fn on_background(&self) -> AppResult<()> {
        self.critical_mirror.refresh().await?;
        set_json(self.kv.as_ref(), LAST_BACKGROUND_CHECK_KEY, &self.clock.now()).await
    }

    /// Fired by the Background Runner's periodic OS wake (spec §4.6,
    /// "Background task (C4)").
    pub async fn process_background_notifications(&self) -> AppResult<()> {
        self.domain.reconcile_expired_medications().await.ok();
        self.critical_mirror.process().await?;
        self.tracker.gc().await?;
        self.retry_queue.process().await?;
        self.critical_mirror
            .gc(self.clock.now(), chrono::Duration::days(self.config.gc_age_days))
            .await?;
        Ok(())
    }

    /// Hourly health check (active app only). Compares the expected
    /// scheduled count against the shadow-index size and forces a
    /// `rescheduleAll` on significant drift.
    pub async fn periodic_health_check(&self) -> AppResult<bool> {
        let medications = self.domain.list_active_medications().await.unwrap_or_default();
        let tasks = self
            .domain
            .list_pending_tasks(Some(3))
            .await
            .unwrap_or_default();

        let expected: f64 = medications
            .iter()
            .filter_map(|m| match &m.payload {
                ReminderPayload::Medication {
                    frequency_times,
                    frequency_period,
                    ..
                } => Some(doses_per_day(*frequency_times, *frequency_period) * 3.0),
                _ => None,
            })
            .sum::<f64>()
            + (tasks.len() as f64 * 2.0);

        let actual = self.scheduler.shadow_index_len(ReminderKind::Medication).await
            + self.scheduler.shadow_index_len(ReminderKind::Task).await;

        let rescheduled = if (actual as f64) < self.config.health_check_drift_ratio * expected {
            self.reschedule_all().await?;
            true
        } else {
            false
        };

        self.refresh_persistent_backup().await?;
        Ok(rescheduled)
    }

    async fn refresh_persistent_backup(&self) -> AppResult<()> {
        let medications = self.domain.list_active_medications().await.unwrap_or_default();
        let tasks = self.domain.list_pending_tasks(None).await.unwrap_or_default();
        let meals = self.domain.list_upcoming_meals(30).await.unwrap_or_default();

        let mut backup = Vec::with_capacity(medications.len() + tasks.len() + meals.len());
        backup.extend(medications);
        backup.extend(tasks);
        backup.extend(meals);

        set_json(self.kv.as_ref(), PERSISTENT_BACKUP_KEY, &backup).await
    }
}

fn doses_per_day(frequency_times: f64, period: FrequencyPeriod) -> f64 {
    match period {
        FrequencyPeriod::Day => frequency_times,
        FrequencyPeriod::Week => frequency_times / 7.0,
        FrequencyPeriod::Month => frequency_times / 30.0,
    }
}

fn spec_is_still_valid(spec: &ReminderSpec, now: DateTime<Utc>) -> bool {
    match &spec.payload {
        ReminderPayload::Medication { status, end_date, .. } => {
            *status == MedicationStatus::Active && end_date.map(|e| e > now).unwrap_or(true)
        }
        ReminderPayload::Task { scheduled_at, completed, .. } => !completed && *scheduled_at > now,
        ReminderPayload::Meal { at, .. } => *at > now,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{MaterializerConfig, NotificationRetryConfig};
    use crate::critical_mirror::CriticalMirror;
    use crate::db::kv::{set_json, InMemoryKvStore};
    use crate::materializer::Materializer;
    use crate::model::{ReminderPayload, TaskPriority};
    use crate::notifier::SimulatedNotifier;
    use crate::remote_scheduler::{
        CancelNotificationResponse, GetNotificationStatsResponse, NotificationStats,
        RemoteSchedulerClient, ScheduleNotificationRequest, ScheduleNotificationResponse,
        SendImmediateNotificationRequest, SendImmediateNotificationResponse,
    };
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    struct FakeDomainReader;

    #[async_trait]
    impl DomainReader for FakeDomainReader {
        async fn list_active_medications(&self) -> AppResult<Vec<ReminderSpec>> {
            Ok(Vec::new())
        }
        async fn list_pending_tasks(&self, _within_days: Option<i64>) -> AppResult<Vec<ReminderSpec>> {
            Ok(Vec::new())
        }
        async fn list_upcoming_meals(&self, _within_days: i64) -> AppResult<Vec<ReminderSpec>> {
            Ok(Vec::new())
        }
        async fn list_low_stock_items(&self) -> AppResult<Vec<ReminderSpec>> {
            Ok(Vec::new())
        }
        async fn list_pending_health_followups(&self, _within_days: i64) -> AppResult<Vec<ReminderSpec>> {
            Ok(Vec::new())
        }
        async fn reconcile_expired_medications(&self) -> AppResult<u64> {
            Ok(0)
        }
    }

    struct NullRemoteSchedulerClient;

    #[async_trait]
    impl RemoteSchedulerClient for NullRemoteSchedulerClient {
        async fn schedule_notification(
            &self,
            _req: ScheduleNotificationRequest,
        ) -> AppResult<ScheduleNotificationResponse> {
            Ok(ScheduleNotificationResponse {
                success: true,
                notification_id: None,
            })
        }

        async fn send_immediate_notification(
            &self,
            _req: SendImmediateNotificationRequest,
        ) -> AppResult<SendImmediateNotificationResponse> {
            Ok(SendImmediateNotificationResponse {
                success: true,
                ticket_id: None,
            })
        }

        async fn cancel_notification(&self, _notification_id: &str) -> AppResult<CancelNotificationResponse> {
            Ok(CancelNotificationResponse { success: true })
        }

        async fn get_notification_stats(&self, _user_id: &str) -> AppResult<GetNotificationStatsResponse> {
            Ok(GetNotificationStatsResponse {
                success: true,
                stats: NotificationStats {
                    pending: 0,
                    sent: 0,
                    failed: 0,
                    total: 0,
                },
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap()
    }

    fn task_spec(id: &str, scheduled_at: DateTime<Utc>, completed: bool) -> ReminderSpec {
        ReminderSpec {
            entity_id: id.to_string(),
            pet_id: "p1".to_string(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Task {
                scheduled_at,
                lead_times_minutes: vec![30],
                priority: TaskPriority::Normal,
                completed,
            },
        }
    }

    fn resilience_config() -> ResilienceConfig {
        ResilienceConfig {
            restart_gap_hours: 6,
            foreground_resync_minutes: 5,
            critical_renotify_minutes: 30,
            gc_age_days: 7,
            background_wake_minutes: 15,
            health_check_drift_ratio: 0.8,
        }
    }

    async fn make_supervisor(clock: Arc<dyn Clock>, kv: Arc<dyn KvStore>) -> (ResilienceSupervisor, Arc<DeliveryTracker>) {
        let notifier: Arc<dyn PlatformNotifier> = Arc::new(SimulatedNotifier::new());
        let domain: Arc<dyn DomainReader> = Arc::new(FakeDomainReader);
        let remote: Arc<dyn RemoteSchedulerClient> = Arc::new(NullRemoteSchedulerClient);
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
            clock.clone(),
        );
        let scheduler = Arc::new(SchedulerCore::new(
            kv.clone(),
            notifier.clone(),
            tracker.clone(),
            retry_queue.clone(),
            materializer,
        ));
        let critical_mirror = Arc::new(CriticalMirror::new(
            kv.clone(),
            clock.clone(),
            domain.clone(),
            remote,
            resilience_config(),
        ));
        let supervisor = ResilienceSupervisor::new(
            kv,
            clock,
            domain,
            notifier,
            scheduler,
            retry_queue,
            critical_mirror,
            tracker.clone(),
            resilience_config(),
        );
        (supervisor, tracker)
    }

    /// S5: on first run (no restart sentinel persisted), `initialize()`
    /// detects a restart and reconstitutes valid entries from the
    /// Persistent Backup, filtering out ones `spec_is_still_valid` rejects.
    #[tokio::test]
    async fn initialize_detects_restart_and_reconstitutes_valid_backup_entries() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(now()));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());

        let valid = task_spec("backup-valid", now() + Duration::hours(2), false);
        let invalid = task_spec("backup-invalid", now() + Duration::hours(2), true);
        set_json(kv.as_ref(), PERSISTENT_BACKUP_KEY, &vec![valid, invalid])
            .await
            .unwrap();

        let (supervisor, tracker) = make_supervisor(clock, kv).await;

        let report = supervisor.initialize().await.unwrap();
        assert!(report.permission_granted);
        assert!(report.restarted);
        assert!(report.rescheduled);

        // Only the valid backup entry (one Lead instance) was scheduled;
        // the completed one was filtered out by `spec_is_still_valid`.
        assert_eq!(tracker.stats().await.total_scheduled, 1);
    }

    /// When the gap since the last sentinel is within `restartGapHours`,
    /// `initialize()` must not treat the call as a restart.
    #[tokio::test]
    async fn initialize_does_not_restart_within_gap_threshold() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(now()));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        set_json(kv.as_ref(), RESTART_SENTINEL_KEY, &(now() - Duration::hours(1)))
            .await
            .unwrap();

        let (supervisor, tracker) = make_supervisor(clock, kv).await;
        let report = supervisor.initialize().await.unwrap();
        assert!(report.permission_granted);
        assert!(!report.restarted);
        assert!(!report.rescheduled);
        assert_eq!(tracker.stats().await.total_scheduled, 0);
    }

    #[test]
    fn spec_is_still_valid_rejects_expired_medication() {
        let spec = ReminderSpec {
            entity_id: "m1".to_string(),
            pet_id: "p1".to_string(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date: now() - Duration::days(10),
                end_date: Some(now() - Duration::hours(1)),
                indefinite: false,
                frequency_times: 1.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: None,
                lead_time_minutes: None,
                dosage: "1 tablet".to_string(),
                status: MedicationStatus::Active,
            },
        };
        assert!(!spec_is_still_valid(&spec, now()));
    }

    #[test]
    fn spec_is_still_valid_accepts_future_task() {
        let spec = task_spec("t1", now() + Duration::hours(1), false);
        assert!(spec_is_still_valid(&spec, now()));
    }

    #[test]
    fn spec_is_still_valid_rejects_completed_task() {
        let spec = task_spec("t2", now() + Duration::hours(1), true);
        assert!(!spec_is_still_valid(&spec, now()));
    }
}
