use std::env;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the reminder engine.
///
/// Follows the teacher's `Config::from_env()` pattern: every field is read
/// from an environment variable with a sensible default, and `Config` also
/// implements `Default` for tests that don't want to touch the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub remote_scheduler: RemoteSchedulerConfig,
    pub materializer: MaterializerConfig,
    pub notification_retry: NotificationRetryConfig,
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSchedulerConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

/// Knobs from spec §6 "Environment / configuration knobs".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// Forward window the Materializer expands into instances on one pass.
    pub horizon_days: i64,
    /// Cap on total FiringInstances produced for a single spec.
    pub max_per_spec: usize,
    /// Wake anchor (minutes since midnight) used to evenly distribute doses.
    pub wake_anchor_minutes: i64,
    /// Sleep anchor (minutes since midnight) used to evenly distribute doses.
    pub sleep_anchor_minutes: i64,
}

/// Config (persisted, mutable) per spec §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_minutes: i64,
    pub backoff_multiplier: u32,
    pub max_delay_hours: i64,
    pub retry_timeout_hours: i64,
}

/// Resilience Supervisor thresholds from spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub restart_gap_hours: i64,
    pub foreground_resync_minutes: i64,
    pub critical_renotify_minutes: i64,
    pub gc_age_days: i64,
    pub background_wake_minutes: i64,
    pub health_check_drift_ratio: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/reminders.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            remote_scheduler: RemoteSchedulerConfig {
                base_url: env::var("REMOTE_SCHEDULER_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:9090".to_string()),
                timeout_seconds: env::var("REMOTE_SCHEDULER_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            materializer: MaterializerConfig {
                horizon_days: env::var("MATERIALIZER_HORIZON_DAYS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("MATERIALIZER_HORIZON_DAYS".into()))?,
                max_per_spec: env::var("MATERIALIZER_MAX_PER_SPEC")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("MATERIALIZER_MAX_PER_SPEC".into()))?,
                wake_anchor_minutes: env::var("MATERIALIZER_WAKE_ANCHOR_MINUTES")
                    .unwrap_or_else(|_| "480".to_string()) // 08:00
                    .parse()
                    .unwrap_or(480),
                sleep_anchor_minutes: env::var("MATERIALIZER_SLEEP_ANCHOR_MINUTES")
                    .unwrap_or_else(|_| "1320".to_string()) // 22:00
                    .parse()
                    .unwrap_or(1320),
            },
            notification_retry: NotificationRetryConfig {
                enabled: match env::var("NOTIFICATION_RETRY_ENABLED") {
                    Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
                    Err(_) => true,
                },
                max_attempts: env::var("NOTIFICATION_RETRY_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                initial_delay_minutes: env::var("NOTIFICATION_RETRY_INITIAL_DELAY_MINUTES")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                backoff_multiplier: env::var("NOTIFICATION_RETRY_BACKOFF_MULTIPLIER")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                max_delay_hours: env::var("NOTIFICATION_RETRY_MAX_DELAY_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse()
                    .unwrap_or(24),
                retry_timeout_hours: env::var("NOTIFICATION_RETRY_TIMEOUT_HOURS")
                    .unwrap_or_else(|_| "72".to_string())
                    .parse()
                    .unwrap_or(72),
            },
            resilience: ResilienceConfig {
                restart_gap_hours: env::var("RESILIENCE_RESTART_GAP_HOURS")
                    .unwrap_or_else(|_| "6".to_string())
                    .parse()
                    .unwrap_or(6),
                foreground_resync_minutes: env::var("RESILIENCE_FOREGROUND_RESYNC_MINUTES")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                critical_renotify_minutes: env::var("RESILIENCE_CRITICAL_RENOTIFY_MINUTES")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                gc_age_days: env::var("RESILIENCE_GC_AGE_DAYS")
                    .unwrap_or_else(|_| "7".to_string())
                    .parse()
                    .unwrap_or(7),
                background_wake_minutes: env::var("RESILIENCE_BACKGROUND_WAKE_MINUTES")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .unwrap_or(15),
                health_check_drift_ratio: env::var("RESILIENCE_HEALTH_CHECK_DRIFT_RATIO")
                    .unwrap_or_else(|_| "0.8".to_string())
                    .parse()
                    .unwrap_or(0.8),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 5,
            },
            remote_scheduler: RemoteSchedulerConfig {
                base_url: "http://localhost:9090".to_string(),
                timeout_seconds: 10,
            },
            materializer: MaterializerConfig {
                horizon_days: 3,
                max_per_spec: 50,
                wake_anchor_minutes: 480,
                sleep_anchor_minutes: 1320,
            },
            notification_retry: NotificationRetryConfig {
                enabled: true,
                max_attempts: 3,
                initial_delay_minutes: 5,
                backoff_multiplier: 2,
                max_delay_hours: 24,
                retry_timeout_hours: 72,
            },
            resilience: ResilienceConfig {
                restart_gap_hours: 6,
                foreground_resync_minutes: 5,
                critical_renotify_minutes: 30,
                gc_age_days: 7,
                background_wake_minutes: 15,
                health_check_drift_ratio: 0.8,
            },
        }
    }
}
