use serde::Serialize;

/// Unified error type for every engine component (C1-C13).
///
/// Mirrors the shape of the teacher's service-layer error enum: each
/// externally observable failure mode gets its own variant so callers can
/// match on it, while anything unexpected collapses into `Internal`. There is
/// no `IntoResponse` impl here (transport-level HTTP handling is out of
/// scope for this crate) but the error shape is still kept renderable via
/// `ErrorBody` for hosts that do expose it over their own transport.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("KV store error: {0}")]
    Kv(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Platform notifier error: {0}")]
    Notifier(String),

    #[error("Remote scheduler request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Remote scheduler error: {0}")]
    RemoteScheduler(String),

    #[error("Domain reader error: {0}")]
    DomainReader(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Best-effort classification of whether the failure looks transient
    /// (worth a retry) as opposed to permanent (permission, malformed
    /// request). Grounded on the teacher's `is_retryable_error` heuristic in
    /// `services/notifications.rs`, generalized beyond Discord/Telegram
    /// error text to notifier/remote-scheduler error text.
    pub fn is_retryable(&self) -> bool {
        is_retryable_text(&self.to_string().to_lowercase())
    }
}

/// Shared heuristic: does this lowercased error message look like a
/// transient failure (timeout, network blip, rate limit, temporary
/// unavailability) rather than a permanent one (bad permission, malformed
/// payload)?
pub fn is_retryable_text(text: &str) -> bool {
    const TRANSIENT_MARKERS: &[&str] = &[
        "timeout",
        "timed out",
        "too many requests",
        "429",
        "temporarily unavailable",
        "service unavailable",
        "unavailable",
        "bad gateway",
        "connection reset",
        "connection refused",
        "failed to send",
        "network",
        "rate limit",
    ];
    TRANSIENT_MARKERS.iter().any(|m| text.contains(m))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Kv(_) => "KV_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Notifier(_) => "NOTIFIER_ERROR",
            AppError::Request(_) => "EXTERNAL_REQUEST_FAILED",
            AppError::RemoteScheduler(_) => "REMOTE_SCHEDULER_ERROR",
            AppError::DomainReader(_) => "DOMAIN_READER_ERROR",
            AppError::PermissionDenied => "PERMISSION_DENIED",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        };
        ErrorBody {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
