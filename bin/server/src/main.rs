use copper_metronome_scheduler::{Dispatcher, Enqueuer, RecoveryMonitor, Scheduler};
use copper_metronome_server::{config::ServerConfig, db::PgTriggerStore, jobs, routes};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let scheduler_config = Arc::new(config.scheduler.clone());
    let store = Arc::new(PgTriggerStore::new(
        db_pool,
        scheduler_config.table_prefix.clone(),
    ));
    let registry = Arc::new(jobs::registry());

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&scheduler_config),
    );
    let enqueuer = Enqueuer::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&scheduler_config),
    );

    // Admit configured jobs that are not yet scheduled
    scheduler
        .sync_configured_jobs()
        .await
        .expect("failed to sync configured jobs");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the acquisition loop
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&scheduler_config),
    );
    let dispatcher_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        dispatcher.run(dispatcher_shutdown).await;
    });

    // Spawn the recovery loops
    let monitor = Arc::new(RecoveryMonitor::new(
        Arc::clone(&store),
        Arc::clone(&scheduler_config),
    ));
    let error_shutdown = shutdown_rx.clone();
    let error_monitor = Arc::clone(&monitor);
    tokio::spawn(async move {
        error_monitor.run_error_loop(error_shutdown).await;
    });
    let blocked_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        monitor.run_blocked_loop(blocked_shutdown).await;
    });

    let app = routes::router(routes::AppState {
        scheduler,
        enqueuer,
        store,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");
}

/// Waits for SIGINT or SIGTERM, then tells the background loops to stop.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
