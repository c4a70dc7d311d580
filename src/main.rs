use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use petcare_reminders::api::Engine;
use petcare_reminders::background_runner::TokioBackgroundRunner;
use petcare_reminders::clock::SystemClock;
use petcare_reminders::config::Config;
use petcare_reminders::db::{migrate, SqliteKvStore};
use petcare_reminders::domain::SqliteDomainReader;
use petcare_reminders::notifier::SimulatedNotifier;
use petcare_reminders::remote_scheduler::HttpRemoteSchedulerClient;

/// Demo binary wiring the reference adapters (in-memory notifier, sqlite
/// domain reader, HTTP remote scheduler client) together behind `Engine`.
/// A real host application supplies its own `PlatformNotifier` and
/// `DomainReader` over the platform notification API and the app's actual
/// pet/medication/task/meal storage.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "petcare_reminders=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env().unwrap_or_default();

    tracing::info!("Starting reminder engine demo");

    let pool = migrate::init_db(&config).await?;

    let kv = Arc::new(SqliteKvStore::new(pool.clone()));
    let clock = Arc::new(SystemClock);
    let notifier = Arc::new(SimulatedNotifier::new());
    let domain = Arc::new(SqliteDomainReader::new(pool));
    let remote = Arc::new(HttpRemoteSchedulerClient::new(
        config.remote_scheduler.base_url.clone(),
        std::time::Duration::from_secs(config.remote_scheduler.timeout_seconds),
    )?);
    let background_runner = Arc::new(TokioBackgroundRunner::new());

    let engine = Engine::new(&config, kv, clock, notifier, domain, remote, background_runner).await?;

    let report = engine.initialize().await?;
    tracing::info!(
        permission_granted = report.permission_granted,
        restarted = report.restarted,
        rescheduled = report.rescheduled,
        "engine initialized"
    );

    let stats = engine.stats().await;
    tracing::info!(?stats, "engine stats");

    engine.cleanup();
    Ok(())
}
