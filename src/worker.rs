use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{message::Delivery, options::*, types::FieldTable, Channel};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::broker::Broker;
use crate::processor::{JobReport, Processor};
use crate::resize::Resizer;
use crate::store::ObjectStore;
use crate::{BrokerError, JobError};

/// Unacknowledged deliveries a worker may hold. One job at a time.
pub const PREFETCH: u16 = 1;

/// How a delivery is settled with the broker.
#[derive(Debug)]
pub enum Settlement {
    Ack(JobReport),
    /// Reject without requeue
    Reject(JobError),
}

/// Runs the job in `payload` under `job_timeout` and decides its settlement.
pub async fn settle<S: ObjectStore, R: Resizer>(
    processor: &Processor<S, R>,
    payload: &[u8],
    job_timeout: Duration,
) -> Settlement {
    match timeout(job_timeout, processor.process(payload)).await {
        Ok(Ok(report)) => Settlement::Ack(report),
        Ok(Err(err)) => Settlement::Reject(err),
        Err(_) => {
            let err = JobError::Timeout(job_timeout);
            error!(stage = err.stage(), error = %err, "Resize job failed");
            Settlement::Reject(err)
        }
    }
}

/// Pulls resize jobs off the work queue one at a time.
pub struct Worker<S, R> {
    broker: Arc<Broker>,
    processor: Arc<Processor<S, R>>,
    job_timeout: Duration,
}

impl<S: ObjectStore, R: Resizer> Worker<S, R> {
    pub fn new(broker: Arc<Broker>, processor: Arc<Processor<S, R>>, job_timeout: Duration) -> Self {
        Self {
            broker,
            processor,
            job_timeout,
        }
    }

    /// Consume until `cancel_token` fires.
    ///
    /// Setup failures and a dead delivery stream are returned; failures of
    /// individual jobs are logged and the job rejected.
    pub async fn start(&self, cancel_token: CancellationToken) -> Result<(), BrokerError> {
        let config = self.broker.config();
        let channel = self.broker.channel().await?;
        self.broker.declare_queue(&channel).await?;

        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(BrokerError::subscribe)?;

        let consumer_tag = format!("thumbq-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                &config.queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::subscribe)?;

        info!(
            queue = %config.queue,
            consumer_tag = %consumer_tag,
            prefetch = PREFETCH,
            "Listening for resize jobs"
        );

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle(&channel, delivery).await,
                        Some(Err(err)) => {
                            error!(message = "Error receiving delivery, exiting", error = %err);
                            return Err(BrokerError::ChannelClosed(err.to_string()));
                        },
                        None => {
                            error!("Delivery stream ended unexpectedly, exiting");
                            return Err(BrokerError::ChannelClosed("delivery stream ended".into()));
                        }
                    }
                }
            }
        }

        if let Err(err) = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(error = %err, "Failed to cancel consumer");
        }

        info!("Worker stopped.");
        Ok(())
    }

    #[instrument(skip_all, fields(delivery_tag = delivery.delivery_tag))]
    async fn handle(&self, channel: &Channel, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;

        if delivery.redelivered {
            warn!("Job was delivered before and never settled");
        }
        if let Some(published_at) = *delivery.properties.timestamp() {
            let waited = chrono::Utc::now().timestamp() - published_at as i64;
            debug!(queued_secs = waited, "Picked up resize job");
        }

        match settle(self.processor.as_ref(), &delivery.data, self.job_timeout).await {
            Settlement::Ack(report) => {
                if let Err(err) = channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await
                {
                    error!(error = %err, "Failed to ack job");
                    return;
                }
                debug!(subject_id = %report.subject_id, "Job acknowledged");
            }
            Settlement::Reject(job_err) => {
                if let Err(err) = channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
                    .await
                {
                    error!(error = %err, "Failed to reject job");
                    return;
                }
                info!(stage = job_err.stage(), "Job rejected without requeue");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessorConfig;
    use crate::resize::tests::sample_jpeg;
    use crate::resize::ImageResizer;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use crate::{JobDescriptor, StoreError, TargetSize};
    use async_trait::async_trait;
    use bytes::Bytes;

    const BUCKET: &str = "pet-photos";

    /// Never answers a read.
    struct StalledStore;

    #[async_trait]
    impl ObjectStore for StalledStore {
        async fn get_object(&self, _bucket: &str, _key: &str) -> Result<Bytes, StoreError> {
            std::future::pending().await
        }

        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: Bytes,
            _content_type: &str,
            _acl: Option<&str>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn processor<S: ObjectStore>(store: Arc<S>) -> Processor<S, ImageResizer> {
        Processor::new(
            store,
            ImageResizer::default(),
            ProcessorConfig {
                bucket: BUCKET.to_string(),
                thumbnail_acl: None,
                retry: RetryPolicy::none(),
                max_dimension: crate::DEFAULT_MAX_DIMENSION,
            },
        )
    }

    fn payload(job: &JobDescriptor) -> Vec<u8> {
        serde_json::to_vec(job).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_rejected_at_the_deadline() {
        let processor = processor(Arc::new(StalledStore));
        let job = JobDescriptor::new("pet-1", "orig/pet-1.jpg", [TargetSize::new(10, 10)]);

        let started = tokio::time::Instant::now();
        let settlement = settle(&processor, &payload(&job), Duration::from_secs(30)).await;

        assert!(started.elapsed() >= Duration::from_secs(30));
        match settlement {
            Settlement::Reject(JobError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_secs(30))
            }
            other => panic!("expected timeout reject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_job_is_acked() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert(BUCKET, "orig/pet-2.jpg", sample_jpeg(64, 48), "image/jpeg")
            .await;
        let processor = processor(store.clone());
        let job = JobDescriptor::new("pet-2", "orig/pet-2.jpg", [TargetSize::new(16, 16)]);

        match settle(&processor, &payload(&job), Duration::from_secs(30)).await {
            Settlement::Ack(report) => {
                assert_eq!(report.subject_id, "pet-2");
                assert_eq!(report.uploaded, vec!["thumbnails/pet-2_16x16.jpg".to_string()]);
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_jobs_are_rejected() {
        let processor = processor(Arc::new(MemoryStore::new()));

        let settlement = settle(&processor, b"{not json", Duration::from_secs(30)).await;
        assert!(matches!(
            settlement,
            Settlement::Reject(JobError::MalformedPayload(_))
        ));

        let job = JobDescriptor::new("pet-3", "orig/missing.jpg", [TargetSize::new(16, 16)]);
        let settlement = settle(&processor, &payload(&job), Duration::from_secs(30)).await;
        assert!(matches!(
            settlement,
            Settlement::Reject(JobError::SourceFetch { .. })
        ));

        let huge = JobDescriptor::new("p", "orig/p.jpg", [TargetSize::new(u32::MAX, 1)]);
        let settlement = settle(&processor, &payload(&huge), Duration::from_secs(30)).await;
        assert!(matches!(
            settlement,
            Settlement::Reject(JobError::MalformedPayload(_))
        ));
    }
}
