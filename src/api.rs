//! C13 — Public API: the single entry point the host application talks to.
//! Wraps every other component behind `scheduleX` / `cancel` /
//! `rescheduleAll` / `stats` (spec §4.1). Modeled as an explicitly
//! constructed, explicitly torn-down object (spec's Design Notes:
//! "do not rely on lazy module-level construction"), the way the teacher's
//! `AppState` is built once in `main.rs` and threaded through by reference.

use std::sync::Arc;

use crate::background_runner::{BackgroundRunner, BackgroundTask};
use crate::clock::Clock;
use crate::config::Config;
use crate::critical_mirror::CriticalMirror;
use crate::db::kv::KvStore;
use crate::domain::DomainReader;
use crate::error::AppResult;
use crate::materializer::Materializer;
use crate::model::{DeepLinkIntent, ReminderKind, ReminderSpec};
use crate::notifier::PlatformNotifier;
use crate::remote_scheduler::RemoteSchedulerClient;
use crate::resilience::{InitializeReport, RescheduleAllReport, ResilienceSupervisor};
use crate::retry_queue::{RetryQueue, RetryQueueStatus};
use crate::scheduler::{CancelTarget, ScheduleOutcome, SchedulerCore};
use crate::tracker::{DeliveryStats, DeliveryTracker};

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub delivery: DeliveryStats,
    pub retry: RetryQueueStatus,
}

/// Notification-tap payload handed in by the host app's platform channel.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NotificationTapPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub params: serde_json::Value,
}

pub struct Engine {
    notifier: Arc<dyn PlatformNotifier>,
    background_runner: Arc<dyn BackgroundRunner>,
    scheduler: Arc<SchedulerCore>,
    tracker: Arc<DeliveryTracker>,
    retry_queue: Arc<RetryQueue>,
    resilience: Arc<ResilienceSupervisor>,
    critical_mirror: Arc<CriticalMirror>,
}

impl Engine {
    pub async fn new(
        config: &Config,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn PlatformNotifier>,
        domain: Arc<dyn DomainReader>,
        remote: Arc<dyn RemoteSchedulerClient>,
        background_runner: Arc<dyn BackgroundRunner>,
    ) -> AppResult<Self> {
        let tracker = Arc::new(DeliveryTracker::new(
            kv.clone(),
            clock.clone(),
            config.resilience.gc_age_days,
        ));
        let retry_queue = Arc::new(
            RetryQueue::new(
                kv.clone(),
                clock.clone(),
                notifier.clone(),
                tracker.clone(),
                config.notification_retry.clone(),
            )
            .await?,
        );
        let materializer = Materializer::new(config.materializer.clone(), clock.clone());
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
            remote.clone(),
            config.resilience.clone(),
        ));
        let resilience = Arc::new(ResilienceSupervisor::new(
            kv.clone(),
            clock.clone(),
            domain.clone(),
            notifier.clone(),
            scheduler.clone(),
            retry_queue.clone(),
            critical_mirror.clone(),
            tracker.clone(),
            config.resilience.clone(),
        ));

        Ok(Self {
            notifier,
            background_runner,
            scheduler,
            tracker,
            retry_queue,
            resilience,
            critical_mirror,
        })
    }

    /// Lazily runs restart detection and registers the periodic background
    /// sweep. Must be called once before any `scheduleX` call.
    pub async fn initialize(&self) -> AppResult<InitializeReport> {
        let report = self.resilience.initialize().await?;

        let resilience = self.resilience.clone();
        struct Sweep {
            resilience: Arc<ResilienceSupervisor>,
        }
        #[async_trait::async_trait]
        impl BackgroundTask for Sweep {
            async fn run(&self) {
                if let Err(e) = self.resilience.process_background_notifications().await {
                    tracing::warn!("background sweep failed: {}", e);
                }
            }
        }
        self.background_runner.register(
            Arc::new(Sweep { resilience }),
            std::time::Duration::from_secs(15 * 60),
        );

        Ok(report)
    }

    pub fn cleanup(&self) {
        self.background_runner.stop();
    }

    pub async fn schedule_task(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        self.schedule_guarded(spec).await
    }

    pub async fn schedule_medication(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        self.schedule_guarded(spec).await
    }

    pub async fn schedule_meal(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        self.schedule_guarded(spec).await
    }

    pub async fn schedule_inventory_alert(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        self.schedule_guarded(spec).await
    }

    pub async fn schedule_health_followup(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        self.schedule_guarded(spec).await
    }

    /// All five `scheduleX` operations share one implementation
    /// parameterized over the spec's own kind tag (spec's Design Notes:
    /// "tagged variants over inheritance"); per spec §7, `scheduleX`
    /// becomes a no-op once permission has been denied.
    async fn schedule_guarded(&self, spec: &ReminderSpec) -> AppResult<ScheduleOutcome> {
        if !self.notifier.has_permission().await.unwrap_or(false) {
            return Ok(ScheduleOutcome {
                spec_id: spec.spec_id(),
                scheduled: 0,
                failed: 0,
                truncated: false,
            });
        }
        self.scheduler.schedule(spec).await
    }

    pub async fn cancel(&self, kind: ReminderKind, target: CancelTarget) -> AppResult<usize> {
        self.scheduler.cancel(kind, target).await
    }

    pub async fn reschedule_all(&self) -> AppResult<RescheduleAllReport> {
        self.resilience.reschedule_all().await
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            delivery: self.tracker.stats().await,
            retry: self.retry_queue.status().await,
        }
    }

    pub async fn has_permission(&self) -> AppResult<bool> {
        self.notifier.has_permission().await
    }

    pub async fn request_permission(&self) -> AppResult<bool> {
        self.notifier.request_permission().await
    }

    pub async fn on_foreground(&self) -> AppResult<()> {
        self.resilience.on_foreground().await
    }

    pub async fn on_background(&self) -> AppResult<()> {
        self.resilience.on_background().await
    }

    pub async fn periodic_health_check(&self) -> AppResult<bool> {
        self.resilience.periodic_health_check().await
    }

    pub async fn set_push_token(&self, token: String, platform: String) -> AppResult<()> {
        self.critical_mirror.set_push_token(token, platform).await
    }

    /// Records an `interacted` delivery event and maps the tap payload to a
    /// deep-link intent per spec §6.
    pub async fn on_notification_tap(&self, os_id: &str, payload: &NotificationTapPayload) -> AppResult<DeepLinkIntent> {
        self.tracker.on_interacted(os_id).await?;
        Ok(deep_link_for(payload))
    }
}

fn deep_link_for(payload: &NotificationTapPayload) -> DeepLinkIntent {
    let params = payload.params.clone();
    let field = |name: &str| params.get(name).cloned().unwrap_or(serde_json::Value::Null);

    match payload.kind.as_str() {
        "task_reminder" | "task" => DeepLinkIntent {
            screen: "Schedule".to_string(),
            params: serde_json::json!({ "taskId": field("taskId"), "petId": field("petId") }),
        },
        "medication_reminder" | "medication" => DeepLinkIntent {
            screen: "Health".to_string(),
            params: serde_json::json!({
                "tab": "medications",
                "medicationId": field("medicationId"),
                "petId": field("petId"),
            }),
        },
        "meal_reminder" | "meal" => DeepLinkIntent {
            screen: "Feeding".to_string(),
            params: serde_json::json!({ "mealId": field("mealId"), "petId": field("petId") }),
        },
        "inventory_alert" | "inventoryAlert" => DeepLinkIntent {
            screen: "FoodTracker".to_string(),
            params: serde_json::json!({ "foodItemId": field("foodItemId"), "petId": field("petId") }),
        },
        "health_followup_reminder" | "healthFollowup" => DeepLinkIntent {
            screen: "Health".to_string(),
            params: serde_json::json!({
                "tab": "health-records",
                "healthRecordId": field("healthRecordId"),
                "petId": field("petId"),
            }),
        },
        _ => DeepLinkIntent {
            screen: "Home".to_string(),
            params: serde_json::json!({}),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_deep_link_mapping() {
        let payload = NotificationTapPayload {
            kind: "medication_reminder".to_string(),
            params: serde_json::json!({ "medicationId": "m1", "petId": "p1" }),
        };
        let intent = deep_link_for(&payload);
        assert_eq!(intent.screen, "Health");
        assert_eq!(intent.params["tab"], "medications");
        assert_eq!(intent.params["medicationId"], "m1");
        assert_eq!(intent.params["petId"], "p1");
    }

    #[test]
    fn unknown_payload_kind_maps_to_home() {
        let payload = NotificationTapPayload {
            kind: "something_else".to_string(),
            params: serde_json::json!({}),
        };
        assert_eq!(deep_link_for(&payload).screen, "Home");
    }
}
