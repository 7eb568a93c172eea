use super::JobMessage;
use crate::errors::{Error, Result};
use crate::metrics::{JOBS_ENQUEUED_TOTAL, JOB_CHANNEL_FULL_TOTAL};
use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Publishing side of the job queue. Messages carry parameters only.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, job: &JobMessage) -> Result<()>;
}

/// Bounded in-process queue drained by [`super::worker::run_channel_worker`].
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<JobMessage>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn publish(&self, job: &JobMessage) -> Result<()> {
        match self.tx.try_send(job.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                JOB_CHANNEL_FULL_TOTAL.inc();
                debug!("Job channel full, waiting for capacity");
                self.tx.send(job).await.map_err(|_| Error::QueueClosed)?;
            }
            Err(TrySendError::Closed(_)) => {
                error!("Job channel closed, cannot enqueue job");
                return Err(Error::QueueClosed);
            }
        }

        JOBS_ENQUEUED_TOTAL.inc();
        Ok(())
    }
}

/// Publishes jobs as JSON to an MQTT topic for `collector-worker` processes.
#[derive(Clone)]
pub struct MqttQueue {
    client: AsyncClient,
    topic: String,
}

impl MqttQueue {
    /// Creates the client and spawns the task driving its event loop.
    pub fn connect(
        broker: &str,
        port: u16,
        client_id: String,
        topic: String,
    ) -> (Self, JoinHandle<()>) {
        info!("Connecting job publisher to MQTT broker at {}:{}", broker, port);

        let mut mqtt_options = MqttOptions::new(client_id, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    // rumqttc reconnects on the next poll
                    error!("MQTT publisher error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        (Self { client, topic }, handle)
    }
}

#[async_trait]
impl JobQueue for MqttQueue {
    async fn publish(&self, job: &JobMessage) -> Result<()> {
        let payload = serde_json::to_vec(job)?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await?;

        JOBS_ENQUEUED_TOTAL.inc();
        debug!("Published job {} to {}", job.task_id, self.topic);
        Ok(())
    }
}
