//! Object store access: the S3 backend used in production and an in-memory
//! backend for local runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::ObjectCannedAcl,
    Client,
};
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::StoreError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full body of `bucket/key`. Empty bodies are an error.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        acl: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// AWS S3 (or S3-compatible) backend.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub async fn new(config: &StoreConfig) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "Initialized S3 store"
        );

        Self::from_client(Client::from_conf(s3_config.build()))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?
            .into_bytes();

        if body.is_empty() {
            return Err(StoreError::EmptyBody {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        debug!(bucket, key, size = body.len(), "Fetched object");
        Ok(body)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        acl: Option<&str>,
    ) -> Result<(), StoreError> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .set_acl(acl.map(ObjectCannedAcl::from))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        debug!(bucket, key, size, content_type, "Stored object");
        Ok(())
    }
}

/// Maps an SDK failure onto the retry classes the worker cares about.
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = match &err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    };
    let message = DisplayErrorContext(&err).to_string();

    match status {
        Some(404) => StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        Some(429) => StoreError::Transport(message),
        Some(code) if code >= 500 => StoreError::Transport(message),
        Some(_) => StoreError::Rejected(message),
        // Dispatch failures, timeouts and truncated responses
        None => StoreError::Transport(message),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub acl: Option<String>,
}

/// In-process store keyed by `(bucket, key)`.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        content_type: &str,
    ) {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                content_type: content_type.to_string(),
                acl: None,
            },
        );
    }

    pub async fn stored(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Sorted keys in `bucket` that start with `prefix`.
    pub async fn keys(&self, bucket: &str, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let objects = self.objects.read().await;
        match objects.get(&(bucket.to_string(), key.to_string())) {
            None => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Some(object) if object.body.is_empty() => Err(StoreError::EmptyBody {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Some(object) => Ok(object.body.clone()),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        acl: Option<&str>,
    ) -> Result<(), StoreError> {
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                acl: acl.map(str::to_string),
            },
        );
        Ok(())
    }
}
