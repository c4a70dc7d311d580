//! Core data model (spec §3). `ReminderSpec` and `FiringInstance` are tagged
//! unions over the five reminder kinds per the Design Notes
//! ("tagged variants over inheritance"), deliberately avoiding a
//! class-per-handler layout.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five kinds of reminder the engine materializes and schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReminderKind {
    Task,
    Medication,
    Meal,
    InventoryAlert,
    HealthFollowup,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderKind::Task => "task",
            ReminderKind::Medication => "medication",
            ReminderKind::Meal => "meal",
            ReminderKind::InventoryAlert => "inventoryAlert",
            ReminderKind::HealthFollowup => "healthFollowup",
        }
    }

    pub const ALL: [ReminderKind; 5] = [
        ReminderKind::Task,
        ReminderKind::Medication,
        ReminderKind::Meal,
        ReminderKind::InventoryAlert,
        ReminderKind::HealthFollowup,
    ];

    /// Dense index for per-kind lock/array storage.
    pub fn index(&self) -> usize {
        match self {
            ReminderKind::Task => 0,
            ReminderKind::Medication => 1,
            ReminderKind::Meal => 2,
            ReminderKind::InventoryAlert => 3,
            ReminderKind::HealthFollowup => 4,
        }
    }

    /// KV key for this kind's shadow index, per spec §6's "Persisted state
    /// layout". Tasks and health follow-ups share `scheduled_notifications`
    /// as the spec's own key list describes it ("tasks + follow-ups").
    pub fn shadow_index_key(&self) -> &'static str {
        match self {
            ReminderKind::Task | ReminderKind::HealthFollowup => "scheduled_notifications",
            ReminderKind::Medication => "scheduled_medication_notifications",
            ReminderKind::Meal => "scheduled_meal_notifications",
            ReminderKind::InventoryAlert => "inventory_alert_notifications",
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `frequency.period` for a medication schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyPeriod {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicationStatus {
    Active,
    Completed,
    Discontinued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Normal,
    High,
}

/// Kind-specific payload for a `ReminderSpec`, tagged by `ReminderKind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ReminderPayload {
    #[serde(rename = "task")]
    Task {
        scheduled_at: DateTime<Utc>,
        lead_times_minutes: Vec<i64>,
        priority: TaskPriority,
        completed: bool,
    },
    #[serde(rename = "medication")]
    Medication {
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        indefinite: bool,
        frequency_times: f64,
        frequency_period: FrequencyPeriod,
        specific_times: Option<Vec<NaiveTime>>,
        lead_time_minutes: Option<i64>,
        dosage: String,
        status: MedicationStatus,
    },
    #[serde(rename = "meal")]
    Meal {
        at: DateTime<Utc>,
        lead_time_minutes: i64,
    },
    #[serde(rename = "inventoryAlert")]
    InventoryAlert {
        current_amount: f64,
        low_stock_threshold: f64,
        days_remaining: f64,
    },
    #[serde(rename = "healthFollowup")]
    HealthFollowup {
        follow_up_at: DateTime<Utc>,
        followup_type: String,
        title: String,
    },
}

impl ReminderPayload {
    pub fn kind(&self) -> ReminderKind {
        match self {
            ReminderPayload::Task { .. } => ReminderKind::Task,
            ReminderPayload::Medication { .. } => ReminderKind::Medication,
            ReminderPayload::Meal { .. } => ReminderKind::Meal,
            ReminderPayload::InventoryAlert { .. } => ReminderKind::InventoryAlert,
            ReminderPayload::HealthFollowup { .. } => ReminderKind::HealthFollowup,
        }
    }
}

/// ReminderSpec (input; owned by domain). Common fields plus a tagged,
/// kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderSpec {
    pub entity_id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub reminders_enabled: bool,
    pub payload: ReminderPayload,
}

impl ReminderSpec {
    pub fn kind(&self) -> ReminderKind {
        self.payload.kind()
    }

    /// `(kind, entityId)` — the key ShadowRecords, DeliveryLog entries, and
    /// Critical Mirror records are all indexed by per spec §3.
    pub fn spec_id(&self) -> SpecId {
        SpecId {
            kind: self.kind(),
            entity_id: self.entity_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecId {
    pub kind: ReminderKind,
    pub entity_id: String,
}

/// Role of a single firing instant within its spec's expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiringRole {
    Lead,
    Dose,
    Reminder,
    Urgent,
}

/// Notification content handed to the Platform Notifier / Remote Scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// FiringInstance — Materializer output. Invariant: `fire_at > now` at the
/// moment it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiringInstance {
    pub spec_id: SpecId,
    pub role: FiringRole,
    pub fire_at: DateTime<Utc>,
    pub content: NotificationContent,
}

/// ShadowRecord — the engine's persisted mirror of what it asked the OS to
/// schedule. Exclusively owned by the Scheduler Core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowRecord {
    pub os_id: String,
    pub spec_id: SpecId,
    pub fire_at: DateTime<Utc>,
    pub content: NotificationContent,
}

/// DeliveryLogEntry status. Progresses monotonically per `os_id` through
/// `Scheduled -> (Delivered | Cancelled | Failed) -> Interacted?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Scheduled,
    Delivered,
    Failed,
    Cancelled,
    Interacted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub os_id: String,
    pub kind: ReminderKind,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub meta: serde_json::Value,
}

/// RetryEntry — an enqueued scheduling-retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: String,
    pub original_os_id: String,
    pub kind: ReminderKind,
    pub content: NotificationContent,
    pub original_fire_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub failure_reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorPriority {
    High,
    Critical,
}

/// CriticalMirror — a near-term, high-priority reminder duplicated to the
/// server-side Remote Scheduler for delivery when the device is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalMirrorRecord {
    pub id: String,
    pub kind: ReminderKind,
    pub entity_id: String,
    pub pet_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub priority: MirrorPriority,
    pub notification_count: u32,
    pub max_notifications: u32,
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// PushToken — the device's push-notification registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushToken {
    pub token: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Deep-link intent emitted by `on_notification_tap` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepLinkIntent {
    pub screen: String,
    pub params: serde_json::Value,
}
