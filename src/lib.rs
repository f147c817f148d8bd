use std::fmt;

use serde::{Deserialize, Serialize};

pub mod broker;
pub mod config;
pub mod error;
pub mod processor;
pub mod producer;
pub mod resize;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{
    BrokerError, EnqueueError, JobError, StoreError, TransformError, ValidationError,
};

/// Largest thumbnail edge accepted unless configured otherwise.
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;

/// A resize job as it travels over the queue.
///
/// The serialized field names are the wire contract shared with the
/// upload handler: `{"petId": .., "s3Key": .., "sizes": [{"width": .., "height": ..}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "petId")]
    pub subject_id: String,
    #[serde(rename = "s3Key")]
    pub source_key: String,
    #[serde(rename = "sizes")]
    pub targets: Vec<TargetSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl JobDescriptor {
    pub fn new(
        subject_id: impl Into<String>,
        source_key: impl Into<String>,
        targets: impl IntoIterator<Item = TargetSize>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            source_key: source_key.into(),
            targets: targets.into_iter().collect(),
        }
    }

    /// Checks the job against [`DEFAULT_MAX_DIMENSION`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_within(DEFAULT_MAX_DIMENSION)
    }

    /// Checks required fields and that every target edge lies in
    /// `1..=max_dimension`.
    pub fn validate_within(&self, max_dimension: u32) -> Result<(), ValidationError> {
        if self.subject_id.is_empty() {
            return Err(ValidationError::EmptySubjectId);
        }
        if self.source_key.is_empty() {
            return Err(ValidationError::EmptySourceKey);
        }
        if self.targets.is_empty() {
            return Err(ValidationError::NoTargets);
        }
        if let Some((index, target)) = self
            .targets
            .iter()
            .enumerate()
            .find(|(_, t)| t.width == 0 || t.height == 0)
        {
            return Err(ValidationError::ZeroDimension {
                index,
                target: *target,
            });
        }
        if let Some((index, target)) = self
            .targets
            .iter()
            .enumerate()
            .find(|(_, t)| t.width > max_dimension || t.height > max_dimension)
        {
            return Err(ValidationError::DimensionTooLarge {
                index,
                target: *target,
                max: max_dimension,
            });
        }
        Ok(())
    }

    /// Object key a thumbnail of `target` is stored under.
    pub fn thumbnail_key(&self, target: TargetSize, extension: &str) -> String {
        format!(
            "thumbnails/{}_{}x{}.{}",
            self.subject_id, target.width, target.height, extension
        )
    }
}
