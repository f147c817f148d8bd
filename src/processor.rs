//! Per-message resize pipeline: parse, fetch, then resize and upload each
//! target in order.

use std::sync::Arc;

use image::{DynamicImage, ImageFormat};
use tracing::{debug, error, info, instrument, Span};

use crate::config::Config;
use crate::error::TransformError;
use crate::resize::{self, Resizer, Thumbnail};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::ObjectStore;
use crate::{JobDescriptor, JobError, TargetSize};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Bucket holding both originals and thumbnails
    pub bucket: String,
    pub thumbnail_acl: Option<String>,
    pub retry: RetryPolicy,
    /// Jobs with a larger target edge are refused as malformed
    pub max_dimension: u32,
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        let acl = config.store.thumbnail_acl.trim();
        Self {
            bucket: config.store.bucket.clone(),
            thumbnail_acl: match acl {
                "" | "none" => None,
                acl => Some(acl.to_string()),
            },
            retry: config.worker.retry_policy(),
            max_dimension: config.worker.max_thumbnail_dimension,
        }
    }
}

/// Outcome of a fully processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub subject_id: String,
    /// Thumbnail keys in target order
    pub uploaded: Vec<String>,
}

pub struct Processor<S, R> {
    store: Arc<S>,
    resizer: Arc<R>,
    config: ProcessorConfig,
}

impl<S: ObjectStore, R: Resizer> Processor<S, R> {
    pub fn new(store: Arc<S>, resizer: R, config: ProcessorConfig) -> Self {
        Self {
            store,
            resizer: Arc::new(resizer),
            config,
        }
    }

    /// Run the whole job carried by `payload`.
    ///
    /// The first failing step ends the job. Thumbnails uploaded before the
    /// failure are left in place.
    #[instrument(skip_all, fields(subject_id = tracing::field::Empty))]
    pub async fn process(&self, payload: &[u8]) -> Result<JobReport, JobError> {
        let result = self.run(payload).await;
        if let Err(err) = &result {
            error!(stage = err.stage(), error = %err, "Resize job failed");
        }
        result
    }

    async fn run(&self, payload: &[u8]) -> Result<JobReport, JobError> {
        let job = parse(payload, self.config.max_dimension)?;
        Span::current().record("subject_id", job.subject_id.as_str());

        let bucket = self.config.bucket.as_str();
        let source = with_retry(&self.config.retry, "get_object", || {
            self.store.get_object(bucket, &job.source_key)
        })
        .await
        .map_err(|source| JobError::SourceFetch {
            key: job.source_key.clone(),
            source,
        })?;

        let (image, format) = tokio::task::spawn_blocking(move || resize::decode(&source))
            .await
            .map_err(|e| TransformError(format!("decode task failed: {e}")))
            .and_then(|decoded| decoded)
            .map_err(|source| JobError::Transform {
                context: "source image".to_string(),
                source,
            })?;
        let image = Arc::new(image);

        let mut uploaded = Vec::with_capacity(job.targets.len());
        for target in &job.targets {
            let thumbnail = self
                .render(image.clone(), format, *target)
                .await
                .map_err(|source| JobError::Transform {
                    context: format!("to {target}"),
                    source,
                })?;

            let key = job.thumbnail_key(*target, thumbnail.extension);
            with_retry(&self.config.retry, "put_object", || {
                self.store.put_object(
                    bucket,
                    &key,
                    thumbnail.data.clone(),
                    thumbnail.content_type,
                    self.config.thumbnail_acl.as_deref(),
                )
            })
            .await
            .map_err(|source| JobError::Upload {
                key: key.clone(),
                source,
            })?;

            debug!(%key, %target, "Thumbnail uploaded");
            uploaded.push(key);
        }

        info!(thumbnails = uploaded.len(), "Resize job completed");

        Ok(JobReport {
            subject_id: job.subject_id,
            uploaded,
        })
    }

    async fn render(
        &self,
        image: Arc<DynamicImage>,
        format: ImageFormat,
        target: TargetSize,
    ) -> Result<Thumbnail, TransformError> {
        let resizer = self.resizer.clone();
        tokio::task::spawn_blocking(move || resizer.resize(&image, format, target))
            .await
            .map_err(|e| TransformError(format!("resize task failed: {e}")))?
    }
}

/// Decode and validate a job payload.
pub fn parse(payload: &[u8], max_dimension: u32) -> Result<JobDescriptor, JobError> {
    let job: JobDescriptor = serde_json::from_slice(payload)
        .map_err(|e| JobError::MalformedPayload(e.to_string()))?;
    job.validate_within(max_dimension)
        .map_err(|e| JobError::MalformedPayload(e.to_string()))?;
    Ok(job)
}
