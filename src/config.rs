//! Process configuration.
//!
//! Every setting can be given as a flag or through the environment; the
//! defaults target a local RabbitMQ with guest credentials.

use std::time::Duration;

use clap::{Args, Parser};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::retry::RetryPolicy;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Image resize worker")]
pub struct Config {
    #[command(flatten)]
    pub broker: BrokerConfig,

    #[command(flatten)]
    pub store: StoreConfig,

    #[command(flatten)]
    pub worker: WorkerConfig,

    #[arg(long, env = "JAEGER_ENDPOINT", help = "Jaeger collector endpoint")]
    pub jaeger_endpoint: Option<String>,
}

impl Config {
    /// Reads configuration from the environment only, ignoring argv.
    ///
    /// Used where the crate is embedded as a library (the producer side).
    pub fn from_env() -> Result<Self, clap::Error> {
        Self::try_parse_from([env!("CARGO_PKG_NAME")])
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    #[arg(long = "broker-host", env = "RABBITMQ_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "broker-port", env = "RABBITMQ_PORT", default_value = "5672")]
    pub port: u16,

    #[arg(long = "broker-user", env = "RABBITMQ_USER", default_value = "guest")]
    pub username: String,

    #[arg(
        long = "broker-password",
        env = "RABBITMQ_PASSWORD",
        default_value = "guest",
        hide_env_values = true
    )]
    pub password: String,

    #[arg(long = "broker-vhost", env = "RABBITMQ_VHOST", default_value = "/")]
    pub vhost: String,

    #[arg(long, env = "RESIZE_QUEUE", default_value = "image-resize")]
    pub queue: String,

    #[arg(
        long,
        env = "RESIZE_DEAD_LETTER_EXCHANGE",
        help = "Exchange rejected jobs are routed to; producers and workers must agree"
    )]
    pub dead_letter_exchange: Option<String>,

    #[arg(
        long,
        env = "RESIZE_PUBLISHER_CONFIRMS",
        default_value_t = false,
        help = "Wait for broker confirmation on every publish"
    )]
    pub publisher_confirms: bool,
}

impl BrokerConfig {
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.username, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.password, NON_ALPHANUMERIC),
            self.host,
            self.port,
            utf8_percent_encode(&self.vhost, NON_ALPHANUMERIC),
        )
    }

    /// Queue that collects dead-lettered jobs, if dead-lettering is configured.
    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter_exchange
            .as_ref()
            .map(|_| format!("{}.dead-letter", self.queue))
    }
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct StoreConfig {
    #[arg(long, env = "S3_BUCKET", default_value = "pet-photos")]
    pub bucket: String,

    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    #[arg(
        long = "s3-endpoint",
        env = "S3_ENDPOINT",
        help = "Custom endpoint for S3-compatible stores"
    )]
    pub endpoint: Option<String>,

    #[arg(long, env = "THUMBNAIL_ACL", default_value = "public-read")]
    pub thumbnail_acl: String,
}

#[derive(Args, Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    #[arg(long, env = "RESIZE_JOB_TIMEOUT_SECS", default_value = "120")]
    pub job_timeout_secs: u64,

    #[arg(long, env = "RESIZE_STORE_RETRIES", default_value = "3")]
    pub store_retries: u32,

    #[arg(long, env = "RESIZE_RETRY_BACKOFF_MS", default_value = "200")]
    pub retry_backoff_ms: u64,

    #[arg(
        long,
        env = "THUMBNAIL_JPEG_QUALITY",
        default_value = "85",
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    pub jpeg_quality: u8,

    #[arg(
        long = "max-thumbnail-dimension",
        env = "THUMBNAIL_MAX_DIMENSION",
        default_value_t = crate::DEFAULT_MAX_DIMENSION,
        value_parser = clap::value_parser!(u32).range(1..=crate::resize::MAX_SOURCE_DIMENSION as i64),
        help = "Largest thumbnail width or height a job may request"
    )]
    pub max_thumbnail_dimension: u32,
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}
