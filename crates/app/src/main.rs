mod dead_letter;
mod dispatcher;
mod handler;
mod idempotency;
mod maintenance;
mod problem;
mod queue;
mod router;
mod tap;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use tracing::{error, info, warn};
use url::Url;

use hookrelay_storage::Database;
use hookrelay_util::{load_env_file, AppConfig, StorageBackend};

use crate::{
    dead_letter::{DeadLetterSink, MemoryDeadLetterSink, SqliteDeadLetterSink},
    dispatcher::{DispatchContext, Dispatcher, DispatcherConfig},
    handler::{EventHandler, ForwardingHandler, LoggingHandler},
    idempotency::{IdempotencyStore, MemoryIdempotencyStore, SqliteIdempotencyStore},
    maintenance::MaintenanceWorker,
    queue::InboundQueue,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(config.environment)?;
    let metrics = telemetry::init_metrics()?;

    let tap_hub = tap::TapHub::new();
    if config.environment.is_development() {
        tap_hub.spawn_heartbeat();
    }

    let (store, dead_letters, database): (
        Arc<dyn IdempotencyStore>,
        Arc<dyn DeadLetterSink>,
        Option<Database>,
    ) = match &config.storage {
        StorageBackend::Sqlite(url) => {
            let database = Database::connect(url).await?;
            database.run_migrations().await?;
            info!(stage = "storage", "sqlite storage ready");
            (
                Arc::new(SqliteIdempotencyStore::new(database.idempotency())),
                Arc::new(SqliteDeadLetterSink::new(database.dead_letters())),
                Some(database),
            )
        }
        StorageBackend::Memory => {
            warn!(stage = "storage", "using in-memory storage; records are lost on restart");
            (
                Arc::new(MemoryIdempotencyStore::new()),
                Arc::new(MemoryDeadLetterSink::new()),
                None,
            )
        }
    };

    let handler: Arc<dyn EventHandler> = match &config.dispatch.forward_url {
        Some(raw) => {
            let url = Url::parse(raw)?;
            info!(stage = "app", forward_url = %url, "forwarding accepted events");
            Arc::new(ForwardingHandler::new(
                url,
                Arc::from(config.webhook.secret.as_slice()),
                config.dispatch.attempt_timeout,
            )?)
        }
        None => Arc::new(LoggingHandler),
    };

    let queue = InboundQueue::new(config.queue_capacity);
    let dispatcher = Dispatcher::spawn(
        DispatchContext {
            queue: queue.clone(),
            store: Arc::clone(&store),
            handler,
            dead_letters: Arc::clone(&dead_letters),
            tap: tap_hub.clone(),
        },
        DispatcherConfig::from_settings(&config.dispatch),
    );

    let mut maintenance = MaintenanceWorker::new(
        Arc::clone(&store),
        tap_hub.clone(),
        config.maintenance_interval,
        config.retention,
    );
    if let Some(database) = &database {
        maintenance = maintenance.with_database(database.clone());
    }
    let maintenance_handle = maintenance.spawn();

    let state = router::AppState::new(
        metrics,
        tap_hub,
        &config.webhook,
        store,
        queue,
        dead_letters,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        queue_capacity = config.queue_capacity,
        workers = config.dispatch.workers,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(err) = &served {
        error!(stage = "app", error = %err, "HTTP server stopped with error");
    }

    let report = dispatcher.shutdown(config.shutdown_grace).await;
    maintenance_handle.abort();
    if let Some(database) = database {
        database.close().await;
    }
    info!(
        stage = "app",
        completed = report.completed,
        discarded = report.discarded,
        abandoned = report.abandoned,
        "shutdown complete"
    );

    served.map_err(|err| err.into())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(stage = "app", error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(stage = "app", error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(stage = "app", "received Ctrl+C, shutting down"),
        _ = terminate => info!(stage = "app", "received SIGTERM, shutting down"),
    }
}
