use std::sync::Arc;

use rescheduler::{
    cell::SchedulerCell,
    clock::{Clock, SystemClock},
    config::StopOptions,
    notifier::{Event, EventKind},
    Scheduler,
};
use rescheduler_server::{
    config::{self, AppConfig},
    jobs::{self, send_email::PgEmailLog},
    logging,
    routes::router,
    state::AppState,
};
use rescheduler_sqlx::ReschedulerPgBackend;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = config::load_dotenv();
    logging::init_subscriber();
    if let Err(error) = dotenv {
        tracing::warn!(%error, "Failed to load .env: {error}");
    }
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    let backend = ReschedulerPgBackend::from_pool(pool.clone()).await?;
    let mut migrator = sqlx::migrate!();
    migrator.set_ignore_missing(true);
    migrator.run(&pool).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = jobs::register(
        Scheduler::new(backend)
            .with_config(config.scheduler())
            .with_clock(clock.clone()),
        clock,
        Arc::new(PgEmailLog::new(pool)),
    );
    scheduler.on(EventKind::Complete, |event| {
        let job = event.job();
        tracing::info!(job_id = %job.id, "[{}] completed", job.name);
    });
    scheduler.on(EventKind::Fail, |event| {
        if let Event::Fail {
            job,
            error,
            will_retry,
        } = event
        {
            tracing::warn!(job_id = %job.id, will_retry, "[{}] failed: {}", job.name, error.message);
        }
    });

    let cell = SchedulerCell::new();
    cell.init(scheduler.clone())?;
    scheduler.start().await?;
    tracing::info!("Scheduler started with {} workers", config.workers);
    jobs::schedule_daily_cleanup(&scheduler).await?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(AppState::new(cell)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down scheduler");
    scheduler.stop(StopOptions::graceful()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to listen for ctrl-c: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "Failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
