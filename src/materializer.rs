//! C7 — Materializer: expands a `ReminderSpec` into a finite, sorted list
//! of `FiringInstance`s, bounded by a quota on total instances per spec
//! (spec §4.2).

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::MaterializerConfig;
use crate::model::{
    FiringInstance, FiringRole, FrequencyPeriod, MedicationStatus, NotificationContent,
    ReminderPayload, ReminderSpec,
};

/// Result of materializing a single spec.
pub struct MaterializeResult {
    pub instances: Vec<FiringInstance>,
    /// Set when quota truncation reduced the horizon below what the raw
    /// expansion needed; the Resilience Supervisor re-materializes on the
    /// next sweep to pick up the deferred tail.
    pub truncated: bool,
    /// Set when quota truncation drove the horizon to zero, yielding an
    /// empty list outright.
    pub horizon_exhausted: bool,
    /// The horizon in days the medication quota-truncation loop converged
    /// on (equal to `config.horizon_days` when no truncation was needed).
    /// `None` for non-medication kinds, which never run that loop.
    pub resolved_horizon_days: Option<i64>,
}

pub struct Materializer {
    config: MaterializerConfig,
    clock: Arc<dyn Clock>,
}

impl Materializer {
    pub fn new(config: MaterializerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn materialize(&self, spec: &ReminderSpec) -> MaterializeResult {
        if !spec.enabled || !spec.reminders_enabled {
            return MaterializeResult {
                instances: Vec::new(),
                truncated: false,
                horizon_exhausted: false,
                resolved_horizon_days: None,
            };
        }

        let now = self.clock.now();
        let mut result = match &spec.payload {
            ReminderPayload::Task {
                scheduled_at,
                lead_times_minutes,
                ..
            } => materialize_task(spec, now, *scheduled_at, lead_times_minutes),
            ReminderPayload::Meal {
                at,
                lead_time_minutes,
            } => materialize_meal(spec, now, *at, *lead_time_minutes),
            ReminderPayload::Medication { status, .. } => {
                if *status != MedicationStatus::Active {
                    MaterializeResult {
                        instances: Vec::new(),
                        truncated: false,
                        horizon_exhausted: false,
                        resolved_horizon_days: None,
                    }
                } else {
                    materialize_medication(spec, now, &self.config)
                }
            }
            ReminderPayload::InventoryAlert {
                days_remaining, ..
            } => materialize_inventory_alert(spec, now, *days_remaining),
            ReminderPayload::HealthFollowup { follow_up_at, .. } => {
                materialize_health_followup(spec, now, *follow_up_at)
            }
        };

        result.instances.sort_by_key(|i| i.fire_at);
        result
    }
}

fn no_truncation(instances: Vec<FiringInstance>) -> MaterializeResult {
    MaterializeResult {
        instances,
        truncated: false,
        horizon_exhausted: false,
        resolved_horizon_days: None,
    }
}

fn content_for(spec: &ReminderSpec, role: FiringRole, title: String, body: String) -> NotificationContent {
    NotificationContent {
        title,
        body,
        data: serde_json::json!({
            "type": reminder_type_tag(spec, role),
            "petId": spec.pet_id,
            "entityId": spec.entity_id,
        }),
    }
}

fn reminder_type_tag(spec: &ReminderSpec, role: FiringRole) -> String {
    format!("{}_{:?}", spec.kind(), role).to_lowercase()
}

fn instance(spec: &ReminderSpec, role: FiringRole, fire_at: DateTime<Utc>, title: &str, body: &str) -> FiringInstance {
    FiringInstance {
        spec_id: spec.spec_id(),
        role,
        fire_at,
        content: content_for(spec, role, title.to_string(), body.to_string()),
    }
}

fn materialize_task(
    spec: &ReminderSpec,
    now: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    lead_times_minutes: &[i64],
) -> MaterializeResult {
    let mut instances = Vec::new();
    for lead in lead_times_minutes {
        let fire_at = scheduled_at - Duration::minutes(*lead);
        if fire_at > now {
            instances.push(instance(
                spec,
                FiringRole::Lead,
                fire_at,
                "Upcoming task",
                &format!("Due in {} minutes", lead),
            ));
        }
    }
    no_truncation(instances)
}

fn materialize_meal(
    spec: &ReminderSpec,
    now: DateTime<Utc>,
    at: DateTime<Utc>,
    lead_time_minutes: i64,
) -> MaterializeResult {
    let mut instances = Vec::new();
    let lead_at = at - Duration::minutes(lead_time_minutes);
    if lead_at > now {
        instances.push(instance(spec, FiringRole::Lead, lead_at, "Feeding time soon", "Meal coming up"));
    }
    if at > now {
        instances.push(instance(spec, FiringRole::Dose, at, "Feeding time", "Time to feed"));
    }
    no_truncation(instances)
}

fn materialize_inventory_alert(spec: &ReminderSpec, now: DateTime<Utc>, days_remaining: f64) -> MaterializeResult {
    let mut instances = vec![instance(
        spec,
        FiringRole::Dose,
        now,
        "Low stock",
        "This item is running low",
    )];
    if days_remaining <= 2.0 {
        let next_day_9am = next_local_time(now, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        instances.push(instance(
            spec,
            FiringRole::Urgent,
            next_day_9am,
            "Stock almost out",
            "Reorder soon to avoid running out",
        ));
    }
    no_truncation(instances)
}

fn materialize_health_followup(spec: &ReminderSpec, now: DateTime<Utc>, follow_up_at: DateTime<Utc>) -> MaterializeResult {
    let mut instances = Vec::new();

    let day_before_18 = at_time_on_date(follow_up_at - Duration::days(1), NaiveTime::from_hms_opt(18, 0, 0).unwrap());
    if day_before_18 > now {
        instances.push(instance(
            spec,
            FiringRole::Reminder,
            day_before_18,
            "Health follow-up tomorrow",
            "You have a follow-up scheduled for tomorrow",
        ));
    }

    let day_of_9 = at_time_on_date(follow_up_at, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    if day_of_9 > now {
        instances.push(instance(
            spec,
            FiringRole::Dose,
            day_of_9,
            "Health follow-up today",
            "Today is the scheduled follow-up",
        ));
    }

    no_truncation(instances)
}

fn at_time_on_date(date: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.date_naive().and_time(time))
}

fn next_local_time(now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let today = at_time_on_date(now, time);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

fn minutes_to_time(minutes: i64) -> NaiveTime {
    let minutes = minutes.clamp(0, 24 * 60 - 1);
    NaiveTime::from_hms_opt((minutes / 60) as u32, (minutes % 60) as u32, 0).unwrap()
}

/// Evenly distribute `n` dose times between the wake and sleep anchors.
/// `n == 1` uses the midpoint; `n > 1` uses `wake + i*(sleep-wake)/(n-1)`.
fn evenly_distributed_times(n: u32, wake_minutes: i64, sleep_minutes: i64) -> Vec<NaiveTime> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![minutes_to_time((wake_minutes + sleep_minutes) / 2)];
    }
    (0..n)
        .map(|i| {
            let span = sleep_minutes - wake_minutes;
            let offset = (span * i as i64) / (n as i64 - 1);
            minutes_to_time(wake_minutes + offset)
        })
        .collect()
}

fn doses_per_day(frequency_times: f64, period: FrequencyPeriod) -> f64 {
    match period {
        FrequencyPeriod::Day => frequency_times,
        FrequencyPeriod::Week => frequency_times / 7.0,
        FrequencyPeriod::Month => frequency_times / 30.0,
    }
}

fn day_included(
    period: FrequencyPeriod,
    frequency_times: f64,
    start_date: DateTime<Utc>,
    candidate_date: DateTime<Utc>,
    days_from_start: i64,
) -> bool {
    match period {
        FrequencyPeriod::Day => true,
        FrequencyPeriod::Week => {
            if frequency_times >= 1.0 {
                candidate_date.weekday() == start_date.weekday()
            } else {
                let k = (1.0 / frequency_times).ceil() as i64;
                k > 0 && days_from_start % k == 0
            }
        }
        FrequencyPeriod::Month => candidate_date.day() == start_date.day(),
    }
}

fn expand_medication_window(
    spec: &ReminderSpec,
    now: DateTime<Utc>,
    horizon_days: i64,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    indefinite: bool,
    frequency_times: f64,
    frequency_period: FrequencyPeriod,
    specific_times: &Option<Vec<NaiveTime>>,
    lead_time_minutes: Option<i64>,
    wake_anchor_minutes: i64,
    sleep_anchor_minutes: i64,
) -> Vec<FiringInstance> {
    let window_start = std::cmp::max(now, start_date);
    let horizon_end = now + Duration::days(horizon_days);
    let window_end = match (end_date, indefinite) {
        (Some(end), false) => std::cmp::min(end, horizon_end),
        _ => horizon_end,
    };
    if window_start > window_end {
        return Vec::new();
    }

    let dpd = doses_per_day(frequency_times, frequency_period);
    if dpd <= 0.0 {
        return Vec::new();
    }

    let times: Vec<NaiveTime> = specific_times.clone().unwrap_or_else(|| {
        evenly_distributed_times(dpd.ceil() as u32, wake_anchor_minutes, sleep_anchor_minutes)
    });

    let mut instances = Vec::new();
    let mut cursor = window_start.date_naive();
    let window_end_date = window_end.date_naive();
    let start_date_naive = start_date.date_naive();

    while cursor <= window_end_date {
        let candidate = Utc.from_utc_datetime(&cursor.and_hms_opt(0, 0, 0).unwrap());
        let days_from_start = (cursor - start_date_naive).num_days();
        if days_from_start >= 0
            && day_included(frequency_period, frequency_times, start_date, candidate, days_from_start)
        {
            for time in &times {
                let fire_at = Utc.from_utc_datetime(&cursor.and_time(*time));
                if let Some(lead) = lead_time_minutes {
                    let lead_at = fire_at - Duration::minutes(lead);
                    if lead_at > now {
                        instances.push(instance(
                            spec,
                            FiringRole::Lead,
                            lead_at,
                            "Medication due soon",
                            "A dose is coming up",
                        ));
                    }
                }
                if fire_at > now {
                    instances.push(instance(spec, FiringRole::Dose, fire_at, "Medication time", "Time for a dose"));
                }
            }
        }
        cursor += Duration::days(1);
    }

    instances
}

fn materialize_medication(spec: &ReminderSpec, now: DateTime<Utc>, config: &MaterializerConfig) -> MaterializeResult {
    let (start_date, end_date, indefinite, frequency_times, frequency_period, specific_times, lead_time_minutes) =
        match &spec.payload {
            ReminderPayload::Medication {
                start_date,
                end_date,
                indefinite,
                frequency_times,
                frequency_period,
                specific_times,
                lead_time_minutes,
                ..
            } => (
                *start_date,
                *end_date,
                *indefinite,
                *frequency_times,
                *frequency_period,
                specific_times.clone(),
                *lead_time_minutes,
            ),
            _ => unreachable!("materialize_medication called on non-medication spec"),
        };

    let mut horizon = config.horizon_days;
    loop {
        let instances = expand_medication_window(
            spec,
            now,
            horizon,
            start_date,
            end_date,
            indefinite,
            frequency_times,
            frequency_period,
            &specific_times,
            lead_time_minutes,
            config.wake_anchor_minutes,
            config.sleep_anchor_minutes,
        );

        if instances.len() <= config.max_per_spec {
            return MaterializeResult {
                instances,
                truncated: horizon < config.horizon_days,
                horizon_exhausted: false,
                resolved_horizon_days: Some(horizon),
            };
        }

        if horizon <= 0 {
            return MaterializeResult {
                instances: Vec::new(),
                truncated: true,
                horizon_exhausted: true,
                resolved_horizon_days: Some(horizon),
            };
        }
        horizon -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MedicationStatus, ReminderPayload, TaskPriority};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 8, 30, 0).unwrap()
    }

    fn task_spec(scheduled_at: DateTime<Utc>, leads: Vec<i64>) -> ReminderSpec {
        ReminderSpec {
            entity_id: "t1".into(),
            pet_id: "p1".into(),
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

    #[test]
    fn s1_task_with_two_leads() {
        let scheduled_at = Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        let spec = task_spec(scheduled_at, vec![60, 15]);
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        let result = materializer.materialize(&spec);
        assert_eq!(result.instances.len(), 2);
        assert_eq!(
            result.instances[0].fire_at,
            Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap()
        );
        assert_eq!(
            result.instances[1].fire_at,
            Utc.with_ymd_and_hms(2025, 1, 10, 9, 45, 0).unwrap()
        );
    }

    #[test]
    fn s2_twice_daily_medication_three_day_horizon() {
        let start_date = now();
        let spec = ReminderSpec {
            entity_id: "m1".into(),
            pet_id: "p1".into(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date,
                end_date: Some(now() + Duration::days(30)),
                indefinite: false,
                frequency_times: 2.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: Some(vec![
                    NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
                ]),
                lead_time_minutes: Some(15),
                dosage: "1 tablet".into(),
                status: MedicationStatus::Active,
            },
        };
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        let result = materializer.materialize(&spec);
        assert_eq!(result.instances.len(), 12);
        assert!(!result.truncated);
        for w in result.instances.windows(2) {
            assert!(w[0].fire_at <= w[1].fire_at);
        }
        assert!(result.instances.iter().all(|i| i.fire_at > now()));
    }

    #[test]
    fn s3_horizon_truncation() {
        let start_date = now();
        let specific_times: Vec<NaiveTime> = (0..20)
            .map(|i| NaiveTime::from_hms_opt((i % 24) as u32, 0, 0).unwrap())
            .collect();
        let spec = ReminderSpec {
            entity_id: "m2".into(),
            pet_id: "p1".into(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date,
                end_date: Some(now() + Duration::days(10)),
                indefinite: false,
                frequency_times: 20.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: Some(specific_times),
                lead_time_minutes: None,
                dosage: "1 tablet".into(),
                status: MedicationStatus::Active,
            },
        };
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 10,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        let result = materializer.materialize(&spec);
        assert!(result.instances.len() <= 50);
        assert!(result.truncated);
        // 20 doses/day against a 50-instance quota forces the horizon down
        // to exactly 1 day (day 0 partial + day 1 full = 31 instances;
        // 2 days would be 51, over quota).
        assert_eq!(result.resolved_horizon_days, Some(1));
    }

    #[test]
    fn medication_end_date_in_past_yields_zero_instances() {
        let spec = ReminderSpec {
            entity_id: "m3".into(),
            pet_id: "p1".into(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date: now() - Duration::days(10),
                end_date: Some(now() - Duration::days(1)),
                indefinite: false,
                frequency_times: 2.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: None,
                lead_time_minutes: None,
                dosage: "1 tablet".into(),
                status: MedicationStatus::Active,
            },
        };
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        assert_eq!(materializer.materialize(&spec).instances.len(), 0);
    }

    #[test]
    fn medication_start_beyond_horizon_yields_zero_instances() {
        let spec = ReminderSpec {
            entity_id: "m4".into(),
            pet_id: "p1".into(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::Medication {
                start_date: now() + Duration::days(30),
                end_date: None,
                indefinite: true,
                frequency_times: 1.0,
                frequency_period: FrequencyPeriod::Day,
                specific_times: None,
                lead_time_minutes: None,
                dosage: "1 tablet".into(),
                status: MedicationStatus::Active,
            },
        };
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        assert_eq!(materializer.materialize(&spec).instances.len(), 0);
    }

    #[test]
    fn inventory_alert_low_days_remaining_emits_urgent() {
        let spec = ReminderSpec {
            entity_id: "f1".into(),
            pet_id: "p1".into(),
            enabled: true,
            reminders_enabled: true,
            payload: ReminderPayload::InventoryAlert {
                current_amount: 1.0,
                low_stock_threshold: 5.0,
                days_remaining: 2.0,
            },
        };
        let materializer = Materializer::new(
            MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            Arc::new(crate::clock::TestClock::new(now())),
        );
        let result = materializer.materialize(&spec);
        assert_eq!(result.instances.len(), 2);
        assert_eq!(result.instances[1].role, FiringRole::Urgent);
    }
}
