//! Row types for the reference domain tables (`migrations/0001_init.sql`)
//! backing the bundled `SqliteDomainReader`. Production hosts read their own
//! pet/medication/task/meal storage and never touch this module.

use chrono::NaiveDateTime;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct MedicationRow {
    pub id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub start_date: NaiveDateTime,
    pub end_date: Option<NaiveDateTime>,
    pub indefinite: bool,
    pub frequency_times: f64,
    pub frequency_period: String,
    pub specific_times: Option<String>,
    pub lead_time_minutes: Option<i64>,
    pub dosage: String,
    pub status: String,
    pub reminders_enabled: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub scheduled_at: NaiveDateTime,
    pub lead_times_minutes: String,
    pub priority: String,
    pub completed: bool,
    pub reminders_enabled: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct MealRow {
    pub id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub at: NaiveDateTime,
    pub lead_time_minutes: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FoodItemRow {
    pub id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub current_amount: f64,
    pub low_stock_threshold: f64,
    pub days_remaining: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct HealthFollowupRow {
    pub id: String,
    pub pet_id: String,
    pub enabled: bool,
    pub follow_up_at: NaiveDateTime,
    pub followup_type: String,
    pub title: String,
    pub completed: bool,
}
