use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::broker::Publish;
use crate::{EnqueueError, JobDescriptor, DEFAULT_MAX_DIMENSION};

/// Publishes resize jobs for the upload handler.
pub struct Producer<P> {
    publisher: Arc<P>,
    max_dimension: u32,
}

impl<P> Clone for Producer<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            max_dimension: self.max_dimension,
        }
    }
}

impl<P: Publish> Producer<P> {
    pub fn new(publisher: Arc<P>) -> Self {
        Self {
            publisher,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    /// Refuse targets with an edge above `max_dimension`. Should match the
    /// workers' `THUMBNAIL_MAX_DIMENSION`.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Validate and publish `job`.
    ///
    /// Invalid jobs are refused before any broker call. On success the
    /// message has been handed to the broker as persistent; processing
    /// failures later on are only visible in worker logs and the dead-letter
    /// queue.
    #[instrument(skip_all, fields(subject_id = %job.subject_id, targets = job.targets.len()))]
    pub async fn enqueue(&self, job: &JobDescriptor) -> Result<(), EnqueueError> {
        if let Err(err) = job.validate_within(self.max_dimension) {
            warn!(error = %err, "Refusing invalid resize job");
            return Err(err.into());
        }

        let payload = serde_json::to_vec(job)?;
        self.publisher.publish(payload).await?;

        debug!("Resize job enqueued");
        Ok(())
    }
}
