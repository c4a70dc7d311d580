//! C12 — Critical-Reminder Mirror: selects near-term, high-priority
//! reminders and hands them to the Remote Scheduler Client so they can
//! still be delivered when the device itself is unreachable (spec §4.7).

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::ResilienceConfig;
use crate::db::kv::{get_json, set_json, KvStore};
use crate::domain::DomainReader;
use crate::error::AppResult;
use crate::model::{CriticalMirrorRecord, MirrorPriority, PushToken, ReminderKind, ReminderPayload};
use crate::remote_scheduler::{
    RemoteSchedulerClient, RemotePriority, ScheduleNotificationData, ScheduleNotificationRequest,
    SendImmediateNotificationRequest,
};

const CRITICAL_MIRROR_KEY: &str = "critical_reminders_backup";
const PUSH_TOKEN_KEY: &str = "push_notification_token";

const MEDICATION_MAX_NOTIFICATIONS: u32 = 3;
const TASK_MAX_NOTIFICATIONS: u32 = 2;

pub struct CriticalMirror {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    domain: Arc<dyn DomainReader>,
    remote: Arc<dyn RemoteSchedulerClient>,
    config: ResilienceConfig,
    write_lock: Mutex<()>,
}

impl CriticalMirror {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        domain: Arc<dyn DomainReader>,
        remote: Arc<dyn RemoteSchedulerClient>,
        config: ResilienceConfig,
    ) -> Self {
        Self {
            kv,
            clock,
            domain,
            remote,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn push_token(&self) -> Option<PushToken> {
        let token: Option<PushToken> = get_json(self.kv.as_ref(), PUSH_TOKEN_KEY).await;
        token
    }

    pub async fn set_push_token(&self, token: String, platform: String) -> AppResult<()> {
        let now = self.clock.now();
        let existing = self.push_token().await;
        let record = PushToken {
            token,
            platform,
            created_at: existing.map(|t| t.created_at).unwrap_or(now),
            last_updated_at: now,
        };
        set_json(self.kv.as_ref(), PUSH_TOKEN_KEY, &Some(record)).await
    }

    /// Selects near-term critical reminders and persists the mirror set,
    /// preserving `notificationCount`/`lastNotifiedAt` for ids that survive
    /// the refresh (spec §3: refresh is idempotent for unchanged ids).
    pub async fn refresh(&self) -> AppResult<Vec<CriticalMirrorRecord>> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let within_24h = now + chrono::Duration::hours(24);

        let mut selected = Vec::new();

        for spec in self.domain.list_active_medications().await.unwrap_or_default() {
            if let ReminderPayload::Medication { status, .. } = &spec.payload {
                if spec.reminders_enabled
                    && *status == crate::model::MedicationStatus::Active
                    && medication_has_dose_within(&spec, now, within_24h)
                {
                    selected.push(CriticalMirrorRecord {
                        id: format!("{}:{}", ReminderKind::Medication, spec.entity_id),
                        kind: ReminderKind::Medication,
                        entity_id: spec.entity_id.clone(),
                        pet_id: spec.pet_id.clone(),
                        scheduled_for: within_24h,
                        priority: MirrorPriority::Critical,
                        notification_count: 0,
                        max_notifications: MEDICATION_MAX_NOTIFICATIONS,
                        last_notified_at: None,
                    });
                }
            }
        }

        for spec in self.domain.list_pending_tasks(Some(1)).await.unwrap_or_default() {
            if let ReminderPayload::Task {
                scheduled_at,
                priority,
                completed,
                ..
            } = &spec.payload
            {
                if spec.reminders_enabled
                    && !completed
                    && *priority == crate::model::TaskPriority::High
                    && *scheduled_at <= within_24h
                {
                    selected.push(CriticalMirrorRecord {
                        id: format!("{}:{}", ReminderKind::Task, spec.entity_id),
                        kind: ReminderKind::Task,
                        entity_id: spec.entity_id.clone(),
                        pet_id: spec.pet_id.clone(),
                        scheduled_for: *scheduled_at,
                        priority: MirrorPriority::Critical,
                        notification_count: 0,
                        max_notifications: TASK_MAX_NOTIFICATIONS,
                        last_notified_at: None,
                    });
                }
            }
        }

        let previous: Vec<CriticalMirrorRecord> = get_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY).await;
        for record in &mut selected {
            if let Some(prev) = previous.iter().find(|p| p.id == record.id) {
                record.notification_count = prev.notification_count;
                record.last_notified_at = prev.last_notified_at;
            }
        }

        set_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY, &selected).await?;

        if let Some(token) = self.push_token().await {
            for record in &selected {
                let req = ScheduleNotificationRequest {
                    user_id: record.pet_id.clone(),
                    push_token: token.token.clone(),
                    title: "Critical reminder".to_string(),
                    body: format!("{} reminder for {}", record.kind, record.entity_id),
                    data: ScheduleNotificationData {
                        kind: record.kind.as_str().to_string(),
                        pet_id: record.pet_id.clone(),
                        entity_id: record.entity_id.clone(),
                        priority: RemotePriority::Critical,
                    },
                    scheduled_time: record.scheduled_for.timestamp_millis(),
                    max_retries: record.max_notifications,
                };
                if let Err(e) = self.remote.schedule_notification(req).await {
                    tracing::warn!("critical mirror: failed to ship {} to remote scheduler: {}", record.id, e);
                }
            }
        }

        Ok(selected)
    }

    /// Re-notifies any mirror entries due now, gated on the per-record
    /// notification cap and the renotify cooldown (spec §4.6(b)).
    pub async fn process(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut records: Vec<CriticalMirrorRecord> = get_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY).await;
        let gap = chrono::Duration::minutes(self.config.critical_renotify_minutes);
        let Some(token) = self.push_token().await else {
            return Ok(());
        };

        for record in &mut records {
            let due = record.scheduled_for <= now
                && record.notification_count < record.max_notifications
                && record
                    .last_notified_at
                    .map(|t| now - t >= gap)
                    .unwrap_or(true);
            if !due {
                continue;
            }
            let req = SendImmediateNotificationRequest {
                push_token: token.token.clone(),
                title: "Reminder".to_string(),
                body: format!("{} reminder for {}", record.kind, record.entity_id),
                data: serde_json::json!({
                    "type": record.kind.as_str(),
                    "petId": record.pet_id,
                    "entityId": record.entity_id,
                }),
            };
            match self.remote.send_immediate_notification(req).await {
                Ok(_) => {
                    record.notification_count += 1;
                    record.last_notified_at = Some(now);
                }
                Err(e) => {
                    tracing::warn!("critical mirror: re-notify failed for {}: {}", record.id, e);
                }
            }
        }

        set_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY, &records).await
    }

    pub async fn gc(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> AppResult<()> {
        let mut records: Vec<CriticalMirrorRecord> = get_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY).await;
        let before = records.len();
        records.retain(|r| now - r.scheduled_for < max_age);
        if records.len() != before {
            set_json(self.kv.as_ref(), CRITICAL_MIRROR_KEY, &records).await?;
        }
        Ok(())
    }
}

fn medication_has_dose_within(spec: &crate::model::ReminderSpec, now: DateTime<Utc>, within: DateTime<Utc>) -> bool {
    if let ReminderPayload::Medication {
        specific_times: Some(times),
        start_date,
        ..
    } = &spec.payload
    {
        let mut cursor = std::cmp::max(now, *start_date).date_naive();
        let end = within.date_naive();
        while cursor <= end {
            for t in times {
                let candidate = Utc.from_utc_datetime(&cursor.and_time(*t));
                if candidate > now && candidate <= within {
                    return true;
                }
            }
            cursor += chrono::Duration::days(1);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::db::kv::InMemoryKvStore;
    use crate::error::AppResult;
    use crate::model::{FrequencyPeriod, MedicationStatus, ReminderSpec};
    use crate::remote_scheduler::{
        CancelNotificationResponse, GetNotificationStatsResponse, NotificationStats,
        ScheduleNotificationResponse, SendImmediateNotificationResponse,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};

    struct FakeDomainReader {
        medications: Vec<ReminderSpec>,
    }

    #[async_trait]
    impl DomainReader for FakeDomainReader {
        async fn list_active_medications(&self) -> AppResult<Vec<ReminderSpec>> {
            Ok(self.medications.clone())
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

    fn medication_spec(id: &str, dose_time: NaiveTime) -> ReminderSpec {
        ReminderSpec {
            entity_id: id.to_string(),
            pet_id: "p1".to_string(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date: Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
                end_date: None,
                indefinite: true,
                frequency_times: 1.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: Some(vec![dose_time]),
                lead_time_minutes: None,
                dosage: "1 tablet".to_string(),
                status: MedicationStatus::Active,
            },
        }
    }

    /// Idempotent refresh (spec §3): an id present in both the previous and
    /// newly selected set keeps its prior `notificationCount`/`lastNotifiedAt`.
    #[tokio::test]
    async fn refresh_preserves_notification_count_for_surviving_ids() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(now));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let domain: Arc<dyn DomainReader> = Arc::new(FakeDomainReader {
            medications: vec![medication_spec("m1", NaiveTime::from_hms_opt(9, 0, 0).unwrap())],
        });
        let remote: Arc<dyn RemoteSchedulerClient> = Arc::new(NullRemoteSchedulerClient);

        let mirror = CriticalMirror::new(kv.clone(), clock.clone(), domain, remote, resilience_config());

        let id = format!("{}:{}", ReminderKind::Medication, "m1");
        let seeded = vec![CriticalMirrorRecord {
            id: id.clone(),
            kind: ReminderKind::Medication,
            entity_id: "m1".to_string(),
            pet_id: "p1".to_string(),
            scheduled_for: now + ChronoDuration::hours(1),
            priority: MirrorPriority::Critical,
            notification_count: 2,
            max_notifications: MEDICATION_MAX_NOTIFICATIONS,
            last_notified_at: Some(now),
        }];
        set_json(kv.as_ref(), CRITICAL_MIRROR_KEY, &seeded).await.unwrap();

        let selected = mirror.refresh().await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, id);
        assert_eq!(selected[0].notification_count, 2);
        assert_eq!(selected[0].last_notified_at, Some(now));
    }

    /// A discontinued medication is never selected, even with a near-term
    /// dose time, since it is no longer active.
    #[tokio::test]
    async fn refresh_skips_non_active_medication() {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(now));
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let mut spec = medication_spec("m2", NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        if let ReminderPayload::Medication { status, .. } = &mut spec.payload {
            *status = MedicationStatus::Discontinued;
        }
        let domain: Arc<dyn DomainReader> = Arc::new(FakeDomainReader {
            medications: vec![spec],
        });
        let remote: Arc<dyn RemoteSchedulerClient> = Arc::new(NullRemoteSchedulerClient);

        let mirror = CriticalMirror::new(kv, clock, domain, remote, resilience_config());
        let selected = mirror.refresh().await.unwrap();
        assert!(selected.is_empty());
    }
}
