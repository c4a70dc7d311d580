use std::path::Path;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;

/// Redact potentially sensitive information from a database URL before
/// logging. Grounded on the teacher's `services::init::redact_db_url`.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url_crate_free_parse(db_url) {
        url
    } else if let Some(at_pos) = db_url.find('@') {
        format!("(redacted){}", &db_url[at_pos + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Minimal scheme://host[:port]/path redaction without pulling in the `url`
/// crate (the teacher used it only for this one helper).
fn url_crate_free_parse(db_url: &str) -> Result<String, ()> {
    let (scheme, rest) = db_url.split_once("://").ok_or(())?;
    if let Some(at_pos) = rest.find('@') {
        Ok(format!("{}://(redacted){}", scheme, &rest[at_pos + 1..]))
    } else {
        Ok(format!("{}://{}", scheme, rest))
    }
}

/// Initialize the sqlite connection pool and run migrations.
///
/// Creates the parent directory for the database file (if applicable),
/// opens a connection pool with `create_if_missing(true)`, and runs the
/// embedded migrations. Mirrors the teacher's `services::init::init_db`.
pub async fn init_db(config: &Config) -> Result<SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    if let Some(db_path) = db_url.strip_prefix("sqlite://") {
        let db_file_path = Path::new(db_path);
        if let Some(parent) = db_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    let is_in_memory = db_url == "sqlite::memory:";
    let connect_options: sqlx::sqlite::SqliteConnectOptions = if is_in_memory {
        sqlx::sqlite::SqliteConnectOptions::new().in_memory(true)
    } else {
        let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
        sqlx::sqlite::SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
    };

    // A single connection is required for an in-memory database: separate
    // pooled connections would each see their own empty database.
    let max_connections = if is_in_memory {
        1
    } else {
        config.database.max_connections
    };

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
