use super::{JobMessage, JobStore};
use crate::errors::{Error, Result};
use crate::metrics::{
    INVALID_JOB_MESSAGES_TOTAL, JOBS_FAILED_TOTAL, JOBS_SKIPPED_TOTAL, JOBS_SUCCEEDED_TOTAL,
};
use crate::model::Statistics;
use crate::repo::Repository;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Shared-subscription group, so each job reaches one worker process.
const WORKER_GROUP: &str = "collector-workers";

/// Executes statistics jobs against a repository and records the outcome.
pub struct Worker {
    repo: Arc<dyn Repository>,
    store: Arc<dyn JobStore>,
}

impl Worker {
    pub fn new(repo: Arc<dyn Repository>, store: Arc<dyn JobStore>) -> Self {
        Self { repo, store }
    }

    /// Runs one delivery of a job. Deliveries for a job that cannot be
    /// claimed are dropped, so a redelivered message never runs twice.
    /// Errors returned here come from the job store only; a failing
    /// computation is recorded as a FAILURE, and so is a result that could
    /// not be stored.
    pub async fn execute(&self, job: &JobMessage) -> Result<()> {
        if !self.store.claim(job.task_id).await? {
            JOBS_SKIPPED_TOTAL.inc();
            debug!("Job {} already claimed or unknown, skipping", job.task_id);
            return Ok(());
        }

        info!("Running statistics job {}", job.task_id);
        match self.compute(job).await {
            Ok(statistics) => {
                if let Err(e) = self.store.complete(job.task_id, &statistics).await {
                    error!("Failed to store result of job {}: {}", job.task_id, e);
                    let message = format!("Failed to store result: {}", e);
                    self.store
                        .fail(job.task_id, &message, &format!("{:?}", e))
                        .await?;
                    JOBS_FAILED_TOTAL.inc();
                    return Err(e);
                }
                JOBS_SUCCEEDED_TOTAL.inc();
                info!("Statistics job {} completed", job.task_id);
            }
            Err(e) => {
                let message = e.to_string();
                let traceback = format!(
                    "{:?}",
                    anyhow::Error::from(e).context(format!("statistics job {} failed", job.task_id))
                );
                error!("Statistics job {} failed: {}", job.task_id, message);
                self.store.fail(job.task_id, &message, &traceback).await?;
                JOBS_FAILED_TOTAL.inc();
            }
        }

        Ok(())
    }

    async fn compute(&self, job: &JobMessage) -> Result<Statistics> {
        let filter = job.filter()?;
        self.repo.statistics(&filter).await
    }
}

pub fn shared_subscription(topic: &str) -> String {
    format!("$share/{}/{}", WORKER_GROUP, topic)
}

fn decode_message(payload: &[u8]) -> Result<JobMessage> {
    serde_json::from_slice(payload).map_err(Error::from)
}

/// Spawns `job` once a concurrency permit is free.
async fn dispatch(worker: &Arc<Worker>, permits: &Arc<Semaphore>, job: JobMessage) -> Result<()> {
    let permit = permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| Error::QueueClosed)?;

    let worker = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.execute(&job).await {
            error!("Failed to record outcome of job {}: {}", job.task_id, e);
        }
        drop(permit);
    });

    Ok(())
}

/// Drains the in-process job channel until every sender is gone.
pub async fn run_channel_worker(
    mut rx: mpsc::Receiver<JobMessage>,
    worker: Arc<Worker>,
    concurrency: usize,
) {
    info!("Starting job worker with concurrency={}", concurrency);
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(job) = rx.recv().await {
        if let Err(e) = dispatch(&worker, &permits, job).await {
            error!("Job dispatch failed: {}", e);
            break;
        }
    }

    info!("Job channel closed, worker stopped");
}

/// Consumes job messages from the MQTT broker. Only returns on a
/// subscription error.
pub async fn run_mqtt_worker(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    worker: Arc<Worker>,
    concurrency: usize,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    let subscription = shared_subscription(&topic);
    client
        .subscribe(subscription.as_str(), QoS::AtLeastOnce)
        .await?;
    info!("Subscribed to {} with QoS 1", subscription);

    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received job message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                match decode_message(&publish.payload) {
                    Ok(job) => dispatch(&worker, &permits, job).await?,
                    Err(e) => {
                        warn!("Dropping undecodable job message: {}", e);
                        INVALID_JOB_MESSAGES_TOTAL.inc();
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc automatically reconnects, so we just log and continue
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ReadingFilter, TimeRange};
    use crate::jobs::{JobState, MemoryJobStore};
    use crate::memory::MemoryRepository;
    use crate::jobs::JobRecord;
    use crate::model::{NewDevice, NewReading, NewUser};
    use async_trait::async_trait;
    use uuid::Uuid;

    /// Job store that rejects results but records everything else.
    struct RejectingResults(MemoryJobStore);

    #[async_trait]
    impl JobStore for RejectingResults {
        async fn insert(&self, job: &JobMessage) -> Result<()> {
            self.0.insert(job).await
        }

        async fn claim(&self, task_id: Uuid) -> Result<bool> {
            self.0.claim(task_id).await
        }

        async fn complete(&self, _task_id: Uuid, _result: &Statistics) -> Result<()> {
            Err(Error::Validation("result rejected".to_string()))
        }

        async fn fail(&self, task_id: Uuid, error: &str, traceback: &str) -> Result<()> {
            self.0.fail(task_id, error, traceback).await
        }

        async fn get(&self, task_id: Uuid) -> Result<Option<JobRecord>> {
            self.0.get(task_id).await
        }
    }

    async fn setup() -> (Arc<MemoryRepository>, Arc<MemoryJobStore>, Worker) {
        let repo = Arc::new(MemoryRepository::new());
        repo.create_user(&NewUser {
            name: "alice".to_string(),
        })
        .await
        .unwrap();
        repo.create_device(&NewDevice {
            name: "imu".to_string(),
            user_id: 1,
        })
        .await
        .unwrap();
        for x in [1.0, 2.0, 3.0] {
            repo.create_reading(&NewReading {
                x,
                y: x,
                z: x,
                device_id: 1,
            })
            .await
            .unwrap();
        }

        let store = Arc::new(MemoryJobStore::new());
        let worker = Worker::new(repo.clone(), store.clone());
        (repo, store, worker)
    }

    #[tokio::test]
    async fn test_job_result_matches_direct_statistics() {
        let (repo, store, worker) = setup().await;
        let filter = ReadingFilter::for_device(1, TimeRange::default());
        let job = JobMessage::new(&filter);
        store.insert(&job).await.unwrap();

        worker.execute(&job).await.unwrap();

        let record = store.get(job.task_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Success);
        assert_eq!(record.result, Some(repo.statistics(&filter).await.unwrap()));
    }

    #[tokio::test]
    async fn test_redelivered_job_runs_once() {
        let (_repo, store, worker) = setup().await;
        let job = JobMessage::new(&ReadingFilter::for_user(1, TimeRange::default()));
        store.insert(&job).await.unwrap();

        worker.execute(&job).await.unwrap();
        store
            .fail(job.task_id, "sentinel", "")
            .await
            .unwrap();
        worker.execute(&job).await.unwrap();

        // The second delivery was skipped and did not overwrite the record.
        let record = store.get(job.task_id).await.unwrap().unwrap();
        assert_eq!(record.error.as_deref(), Some("sentinel"));
    }

    #[tokio::test]
    async fn test_unparsable_parameters_fail_the_job() {
        let (_repo, store, worker) = setup().await;
        let mut job = JobMessage::new(&ReadingFilter::default());
        job.start_date = Some("31/12/2024".to_string());
        store.insert(&job).await.unwrap();

        worker.execute(&job).await.unwrap();

        let record = store.get(job.task_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failure);
        assert!(record.error.unwrap().contains("Invalid timestamp"));
        assert!(record
            .traceback
            .unwrap()
            .contains(&format!("statistics job {} failed", job.task_id)));
    }

    #[tokio::test]
    async fn test_unstorable_result_marks_job_failed() {
        let (repo, _store, _worker) = setup().await;
        let store = Arc::new(RejectingResults(MemoryJobStore::new()));
        let worker = Worker::new(repo, store.clone());
        let job = JobMessage::new(&ReadingFilter::for_device(1, TimeRange::default()));
        store.insert(&job).await.unwrap();

        assert!(worker.execute(&job).await.is_err());

        let record = store.get(job.task_id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failure);
        assert!(record.error.unwrap().contains("result rejected"));
    }

    #[tokio::test]
    async fn test_channel_worker_drains_queue() {
        let (_repo, store, worker) = setup().await;
        let (tx, rx) = mpsc::channel(8);
        let job = JobMessage::new(&ReadingFilter::for_device(1, TimeRange::default()));
        store.insert(&job).await.unwrap();
        tx.send(job.clone()).await.unwrap();
        drop(tx);

        run_channel_worker(rx, Arc::new(worker), 2).await;

        for _ in 0..100 {
            let record = store.get(job.task_id).await.unwrap().unwrap();
            if record.state.is_terminal() {
                assert_eq!(record.state, JobState::Success);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", job.task_id);
    }

    #[test]
    fn test_shared_subscription_topic() {
        assert_eq!(
            shared_subscription("analytics/jobs"),
            "$share/collector-workers/analytics/jobs"
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_message(b"{not json").is_err());
    }
}
