use axum::{routing::get, Router};
use clap::Parser;
use collector::config::{Config, QueueKind, Storage};
use collector::db::{self, PgRepository};
use collector::jobs::worker::run_channel_worker;
use collector::jobs::{ChannelQueue, JobQueue, JobStore, MemoryJobStore, MqttQueue, PgJobStore, Worker};
use collector::memory::MemoryRepository;
use collector::metrics;
use collector::repo::Repository;
use collector::rest::{self, AppState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Initialize logging
    collector::init_tracing();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    info!("Starting telemetry collector");
    info!("HTTP server: {}", config.http_addr);
    info!("Job queue: {:?}", config.job_queue);

    // Initialize metrics
    metrics::init_metrics();

    let (repo, jobs): (Arc<dyn Repository>, Arc<dyn JobStore>) = match config.storage {
        Storage::Postgres => {
            info!("Database: {}", config.database_location());
            let pool = match db::make_pool(
                &config.database_url,
                config.db_max_connections,
                config.db_acquire_timeout(),
            )
            .await
            {
                Ok(pool) => pool,
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };
            (
                Arc::new(PgRepository::new(pool.clone())),
                Arc::new(PgJobStore::new(pool)),
            )
        }
        Storage::Memory => {
            warn!("Using in-memory storage, data is lost on shutdown");
            (
                Arc::new(MemoryRepository::new()),
                Arc::new(MemoryJobStore::new()),
            )
        }
    };

    let (queue, queue_handle): (Arc<dyn JobQueue>, JoinHandle<()>) = match config.job_queue {
        QueueKind::Channel => {
            info!("Job channel capacity: {}", config.job_channel_capacity);
            let (queue, rx) = ChannelQueue::new(config.job_channel_capacity);
            let worker = Arc::new(Worker::new(repo.clone(), jobs.clone()));
            let concurrency = config.worker_concurrency;
            let handle = tokio::spawn(async move {
                run_channel_worker(rx, worker, concurrency).await;
            });
            (Arc::new(queue), handle)
        }
        QueueKind::Mqtt => {
            let client_id = format!("collector-{}", uuid::Uuid::new_v4());
            let (queue, handle) = MqttQueue::connect(
                &config.mqtt_broker,
                config.mqtt_port,
                client_id,
                config.job_topic.clone(),
            );
            (Arc::new(queue), handle)
        }
    };

    let state = AppState { repo, jobs, queue };

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = queue_handle => {
            error!("Job queue task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
