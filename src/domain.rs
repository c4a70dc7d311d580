//! C6 — Domain Readers: read-only adapters over the application's real pet,
//! medication, task, and meal storage. Production hosts of this crate
//! implement `DomainReader` against their own schema; `SqliteDomainReader`
//! is a reference implementation over the bundled tables in
//! `migrations/0001_init.sql`, kept only so the crate is independently
//! testable and the demo binary has something to read.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::SqlitePool;

use crate::db::domain_schema::{FoodItemRow, HealthFollowupRow, MealRow, MedicationRow, TaskRow};
use crate::error::{AppError, AppResult};
use crate::model::{
    FrequencyPeriod, MedicationStatus, ReminderPayload, ReminderSpec, TaskPriority,
};

/// Read-only, idempotent adapters over the application's primary domain
/// storage (spec §4.9). Every listing method degrades to an empty list on
/// failure rather than aborting a rebuild (spec §7: "Domain reader failure
/// — per-spec skip; do not abort the whole rebuild").
#[async_trait]
pub trait DomainReader: Send + Sync {
    async fn list_active_medications(&self) -> AppResult<Vec<ReminderSpec>>;
    async fn list_pending_tasks(&self, within_days: Option<i64>) -> AppResult<Vec<ReminderSpec>>;
    async fn list_upcoming_meals(&self, within_days: i64) -> AppResult<Vec<ReminderSpec>>;
    async fn list_low_stock_items(&self) -> AppResult<Vec<ReminderSpec>>;
    async fn list_pending_health_followups(&self, within_days: i64)
        -> AppResult<Vec<ReminderSpec>>;

    /// Marks active medications whose `endDate` has passed as `completed`.
    /// Returns the number of rows reconciled.
    async fn reconcile_expired_medications(&self) -> AppResult<u64>;
}

/// Reference `DomainReader` over the bundled reference schema.
pub struct SqliteDomainReader {
    pool: SqlitePool,
}

impl SqliteDomainReader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_specific_times(raw: Option<&str>) -> Option<Vec<NaiveTime>> {
    let raw = raw?;
    let list: Vec<String> = serde_json::from_str(raw).ok()?;
    let parsed: Vec<NaiveTime> = list
        .iter()
        .filter_map(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

fn parse_frequency_period(raw: &str) -> FrequencyPeriod {
    match raw {
        "week" => FrequencyPeriod::Week,
        "month" => FrequencyPeriod::Month,
        _ => FrequencyPeriod::Day,
    }
}

fn parse_medication_status(raw: &str) -> MedicationStatus {
    match raw {
        "completed" => MedicationStatus::Completed,
        "discontinued" => MedicationStatus::Discontinued,
        _ => MedicationStatus::Active,
    }
}

fn parse_task_priority(raw: &str) -> TaskPriority {
    match raw {
        "high" => TaskPriority::High,
        _ => TaskPriority::Normal,
    }
}

impl From<MedicationRow> for ReminderSpec {
    fn from(row: MedicationRow) -> Self {
        ReminderSpec {
            entity_id: row.id,
            pet_id: row.pet_id,
            enabled: row.enabled,
            reminders_enabled: row.reminders_enabled,
            payload: ReminderPayload::Medication {
                start_date: DateTime::from_naive_utc_and_offset(row.start_date, Utc),
                end_date: row
                    .end_date
                    .map(|d| DateTime::from_naive_utc_and_offset(d, Utc)),
                indefinite: row.indefinite,
                frequency_times: row.frequency_times,
                frequency_period: parse_frequency_period(&row.frequency_period),
                specific_times: parse_specific_times(row.specific_times.as_deref()),
                lead_time_minutes: row.lead_time_minutes,
                dosage: row.dosage,
                status: parse_medication_status(&row.status),
            },
        }
    }
}

impl From<TaskRow> for ReminderSpec {
    fn from(row: TaskRow) -> Self {
        let lead_times_minutes: Vec<i64> =
            serde_json::from_str(&row.lead_times_minutes).unwrap_or_default();
        ReminderSpec {
            entity_id: row.id,
            pet_id: row.pet_id,
            enabled: row.enabled,
            reminders_enabled: row.reminders_enabled,
            payload: ReminderPayload::Task {
                scheduled_at: DateTime::from_naive_utc_and_offset(row.scheduled_at, Utc),
                lead_times_minutes,
                priority: parse_task_priority(&row.priority),
                completed: row.completed,
            },
        }
    }
}

impl From<MealRow> for ReminderSpec {
    fn from(row: MealRow) -> Self {
        ReminderSpec {
            entity_id: row.id,
            pet_id: row.pet_id,
            enabled: row.enabled,
            reminders_enabled: true,
            payload: ReminderPayload::Meal {
                at: DateTime::from_naive_utc_and_offset(row.at, Utc),
                lead_time_minutes: row.lead_time_minutes,
            },
        }
    }
}

impl From<FoodItemRow> for ReminderSpec {
    fn from(row: FoodItemRow) -> Self {
        ReminderSpec {
            entity_id: row.id,
            pet_id: row.pet_id,
            enabled: row.enabled,
            reminders_enabled: true,
            payload: ReminderPayload::InventoryAlert {
                current_amount: row.current_amount,
                low_stock_threshold: row.low_stock_threshold,
                days_remaining: row.days_remaining,
            },
        }
    }
}

impl From<HealthFollowupRow> for ReminderSpec {
    fn from(row: HealthFollowupRow) -> Self {
        ReminderSpec {
            entity_id: row.id,
            pet_id: row.pet_id,
            enabled: row.enabled,
            reminders_enabled: true,
            payload: ReminderPayload::HealthFollowup {
                follow_up_at: DateTime::from_naive_utc_and_offset(row.follow_up_at, Utc),
                followup_type: row.followup_type,
                title: row.title,
            },
        }
    }
}

#[async_trait]
impl DomainReader for SqliteDomainReader {
    async fn list_active_medications(&self) -> AppResult<Vec<ReminderSpec>> {
        let rows: Vec<MedicationRow> = sqlx::query_as(
            "SELECT id, pet_id, enabled, start_date, end_date, indefinite, frequency_times, \
             frequency_period, specific_times, lead_time_minutes, dosage, status, reminders_enabled \
             FROM medications WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows.into_iter().map(ReminderSpec::from).collect())
    }

    async fn list_pending_tasks(&self, within_days: Option<i64>) -> AppResult<Vec<ReminderSpec>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, pet_id, enabled, scheduled_at, lead_times_minutes, priority, completed, \
             reminders_enabled FROM tasks WHERE completed = 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let specs: Vec<ReminderSpec> = rows.into_iter().map(ReminderSpec::from).collect();
        Ok(match within_days {
            Some(days) => {
                let cutoff = Utc::now() + chrono::Duration::days(days);
                specs
                    .into_iter()
                    .filter(|s| match &s.payload {
                        ReminderPayload::Task { scheduled_at, .. } => *scheduled_at <= cutoff,
                        _ => false,
                    })
                    .collect()
            }
            None => specs,
        })
    }

    async fn list_upcoming_meals(&self, within_days: i64) -> AppResult<Vec<ReminderSpec>> {
        let rows: Vec<MealRow> = sqlx::query_as(
            "SELECT id, pet_id, enabled, at, lead_time_minutes FROM meals",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let cutoff = Utc::now() + chrono::Duration::days(within_days);
        Ok(rows
            .into_iter()
            .map(ReminderSpec::from)
            .filter(|s| match &s.payload {
                ReminderPayload::Meal { at, .. } => *at <= cutoff,
                _ => false,
            })
            .collect())
    }

    async fn list_low_stock_items(&self) -> AppResult<Vec<ReminderSpec>> {
        let rows: Vec<FoodItemRow> = sqlx::query_as(
            "SELECT id, pet_id, enabled, current_amount, low_stock_threshold, days_remaining \
             FROM food_items WHERE current_amount <= low_stock_threshold",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows.into_iter().map(ReminderSpec::from).collect())
    }

    async fn list_pending_health_followups(
        &self,
        within_days: i64,
    ) -> AppResult<Vec<ReminderSpec>> {
        let rows: Vec<HealthFollowupRow> = sqlx::query_as(
            "SELECT id, pet_id, enabled, follow_up_at, followup_type, title, completed \
             FROM health_followups WHERE completed = 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let cutoff = Utc::now() + chrono::Duration::days(within_days);
        Ok(rows
            .into_iter()
            .map(ReminderSpec::from)
            .filter(|s| match &s.payload {
                ReminderPayload::HealthFollowup { follow_up_at, .. } => *follow_up_at <= cutoff,
                _ => false,
            })
            .collect())
    }

    async fn reconcile_expired_medications(&self) -> AppResult<u64> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            "UPDATE medications SET status = 'completed' \
             WHERE status = 'active' AND end_date IS NOT NULL AND end_date < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
