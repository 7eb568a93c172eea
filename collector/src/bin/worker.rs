use clap::Parser;
use collector::config::{Config, Storage};
use collector::db::{self, PgRepository};
use collector::jobs::worker::run_mqtt_worker;
use collector::jobs::{PgJobStore, Worker};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    collector::init_tracing();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }
    if config.storage != Storage::Postgres {
        error!("collector-worker shares job results through postgres, run it with --storage postgres");
        std::process::exit(2);
    }

    info!("Starting statistics worker");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
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

    let worker = Arc::new(Worker::new(
        Arc::new(PgRepository::new(pool.clone())),
        Arc::new(PgJobStore::new(pool)),
    ));

    let client_id = config.worker_id.clone().unwrap_or_else(|| {
        let id = format!("collector-worker-{}", uuid::Uuid::new_v4());
        warn!("WORKER_ID not set, using {}; queued jobs will not survive a restart", id);
        id
    });

    tokio::select! {
        result = run_mqtt_worker(
            config.mqtt_broker.clone(),
            config.mqtt_port,
            client_id,
            config.job_topic.clone(),
            worker,
            config.worker_concurrency,
        ) => {
            if let Err(e) = result {
                error!("Worker stopped: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}
