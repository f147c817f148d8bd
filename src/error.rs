//! Error types for the producer, the worker and the collaborators they drive.

use std::time::Duration;

use thiserror::Error;

use crate::TargetSize;

/// Failures talking to the message broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker unreachable or credentials refused
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Queue or exchange declaration refused
    #[error("Declare failed: {0}")]
    Declare(String),

    /// Publish call failed or was nacked by the broker
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Subscribing to the work queue failed
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Delivery stream ended or errored
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl BrokerError {
    pub(crate) fn connection(err: lapin::Error) -> Self {
        BrokerError::Connection(err.to_string())
    }

    pub(crate) fn declare(err: lapin::Error) -> Self {
        BrokerError::Declare(err.to_string())
    }

    pub(crate) fn publish(err: lapin::Error) -> Self {
        BrokerError::Publish(err.to_string())
    }

    pub(crate) fn subscribe(err: lapin::Error) -> Self {
        BrokerError::Subscribe(err.to_string())
    }
}

/// A job request that must not be published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("subject id is empty")]
    EmptySubjectId,

    #[error("source key is empty")]
    EmptySourceKey,

    #[error("no target sizes requested")]
    NoTargets,

    #[error("target {index} has a zero dimension ({target})")]
    ZeroDimension { index: usize, target: TargetSize },

    #[error("target {index} exceeds the {max}px edge limit ({target})")]
    DimensionTooLarge {
        index: usize,
        target: TargetSize,
        max: u32,
    },
}

/// Errors returned to the caller of `Producer::enqueue`.
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Object store failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("object {bucket}/{key} has an empty body")]
    EmptyBody { bucket: String, key: String },

    /// The store answered and refused the request (auth, bad request, ...)
    #[error("store rejected request: {0}")]
    Rejected(String),

    /// Network or server-side failure; worth another attempt
    #[error("store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

/// Decoding, resizing or encoding an image failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransformError(pub String);

impl From<image::ImageError> for TransformError {
    fn from(err: image::ImageError) -> Self {
        TransformError(err.to_string())
    }
}

/// Per-message failures. Every variant ends in a reject without requeue.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed to fetch source {key}: {source}")]
    SourceFetch { key: String, source: StoreError },

    /// `context` names the source decode or the target size being produced
    #[error("failed to transform {context}: {source}")]
    Transform {
        context: String,
        source: TransformError,
    },

    #[error("failed to upload {key}: {source}")]
    Upload { key: String, source: StoreError },

    #[error("job exceeded deadline of {0:?}")]
    Timeout(Duration),
}

impl JobError {
    /// Short name of the pipeline stage that failed, for log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            JobError::MalformedPayload(_) => "parse",
            JobError::SourceFetch { .. } => "fetch",
            JobError::Transform { .. } => "transform",
            JobError::Upload { .. } => "upload",
            JobError::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(!StoreError::Rejected("403".into()).is_transient());
        assert!(!StoreError::NotFound {
            bucket: "b".into(),
            key: "k".into()
        }
        .is_transient());
    }

    #[test]
    fn job_error_stage_names() {
        let err = JobError::Transform {
            context: format!("to {}", TargetSize::new(10, 20)),
            source: TransformError("boom".into()),
        };
        assert_eq!(err.stage(), "transform");
        assert_eq!(err.to_string(), "failed to transform to 10x20: boom");
        assert_eq!(JobError::MalformedPayload("x".into()).stage(), "parse");
        assert_eq!(JobError::Timeout(Duration::from_secs(1)).stage(), "timeout");
    }
}
