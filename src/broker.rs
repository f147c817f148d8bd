//! RabbitMQ connection and channel management.
//!
//! A [`Broker`] owns at most one live connection + channel pair. It is built
//! once at process start and shared by `Arc` between the producer and the
//! worker code.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::BrokerError;

/// Publishing seam used by the producer.
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish `payload` as a persistent message on the work queue.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError>;
}

pub(crate) trait Live {
    fn is_live(&self) -> bool;
}

/// Holds the current session. The lock is held across a connect attempt, so
/// callers racing on first use all wait for the one in-flight connect.
pub(crate) struct SessionSlot<S> {
    inner: Mutex<Option<S>>,
}

impl<S: Live + Clone> SessionSlot<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub(crate) async fn get_or_connect<F, Fut>(&self, connect: F) -> Result<S, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, BrokerError>>,
    {
        let mut slot = self.inner.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_live() {
                return Ok(session.clone());
            }
            debug!("Broker session no longer connected, reconnecting");
        }

        let session = connect().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    pub(crate) async fn take(&self) -> Option<S> {
        self.inner.lock().await.take()
    }
}

#[derive(Clone)]
struct AmqpSession {
    connection: Arc<Connection>,
    channel: Channel,
}

impl Live for AmqpSession {
    fn is_live(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

pub struct Broker {
    config: BrokerConfig,
    session: SessionSlot<AmqpSession>,
}

impl Broker {
    /// Does no I/O; the connection is opened on first use.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            session: SessionSlot::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The process-wide channel, connecting first if needed.
    ///
    /// Connection and authentication failures are returned as
    /// [`BrokerError::Connection`] and are not retried here.
    pub async fn channel(&self) -> Result<Channel, BrokerError> {
        let session = self.session.get_or_connect(|| self.connect()).await?;
        Ok(session.channel)
    }

    async fn connect(&self) -> Result<AmqpSession, BrokerError> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "Connecting to RabbitMQ"
        );

        let connection =
            Connection::connect(&self.config.amqp_url(), ConnectionProperties::default())
                .await
                .map_err(BrokerError::connection)?;

        let channel = close_on_error(
            Self::open_channel(&connection, self.config.publisher_confirms),
            || async {
                if let Err(e) = connection.close(200, "Channel setup failed").await {
                    warn!(error = %e, "Error closing connection after failed channel setup");
                }
            },
        )
        .await?;

        info!("Connected to RabbitMQ");

        Ok(AmqpSession {
            connection: Arc::new(connection),
            channel,
        })
    }

    async fn open_channel(connection: &Connection, confirms: bool) -> Result<Channel, BrokerError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(BrokerError::connection)?;

        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(BrokerError::connection)?;
        }

        Ok(channel)
    }

    /// Declare the durable work queue, and the dead-letter topology when
    /// configured. Safe to repeat.
    ///
    /// Every process declaring the queue must agree on the dead-letter
    /// exchange; the broker refuses a declare whose arguments differ from the
    /// existing queue.
    pub async fn declare_queue(&self, channel: &Channel) -> Result<(), BrokerError> {
        let mut arguments = FieldTable::default();

        if let (Some(exchange), Some(dead_letter_queue)) = (
            self.config.dead_letter_exchange.as_ref(),
            self.config.dead_letter_queue(),
        ) {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::declare)?;

            channel
                .queue_declare(
                    &dead_letter_queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::declare)?;

            channel
                .queue_bind(
                    &dead_letter_queue,
                    exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(BrokerError::declare)?;

            arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| declare_failure(&self.config.queue, e.to_string()))?;

        debug!(queue = %self.config.queue, "Queue declared");
        Ok(())
    }

    /// Close channel then connection. Errors are logged, never returned.
    pub async fn close(&self) {
        let Some(session) = self.session.take().await else {
            return;
        };

        info!("Closing RabbitMQ connection");

        if let Err(e) = session.channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "Error closing channel");
        }
        if let Err(e) = session.connection.close(200, "Normal shutdown").await {
            warn!(error = %e, "Error closing connection");
        }
    }
}

/// Awaits `setup`, running `cleanup` before handing back its error.
async fn close_on_error<T, Fut, C, CFut>(setup: Fut, cleanup: C) -> Result<T, BrokerError>
where
    Fut: Future<Output = Result<T, BrokerError>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = ()>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(err) => {
            cleanup().await;
            Err(err)
        }
    }
}

/// A 406 on the work queue means it already exists with other arguments,
/// in practice a different dead-letter exchange.
fn declare_failure(queue: &str, message: String) -> BrokerError {
    if message.contains("PRECONDITION_FAILED") {
        BrokerError::Declare(format!(
            "queue {queue} exists with different arguments; producers and workers \
             must use the same RESIZE_DEAD_LETTER_EXCHANGE ({message})"
        ))
    } else {
        BrokerError::Declare(message)
    }
}

#[async_trait]
impl Publish for Broker {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        let channel = self.channel().await?;
        self.declare_queue(&channel).await?;

        let props = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        let confirm = channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &payload,
                props,
            )
            .await
            .map_err(BrokerError::publish)?;

        if self.config.publisher_confirms {
            let confirmation = confirm.await.map_err(BrokerError::publish)?;
            if confirmation.is_nack() {
                return Err(BrokerError::Publish(format!(
                    "broker nacked message for queue {}",
                    self.config.queue
                )));
            }
        }

        debug!(queue = %self.config.queue, size = payload.len(), "Published job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct FakeSession {
        id: usize,
        live: Arc<AtomicBool>,
    }

    impl Live for FakeSession {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
    }

    fn connector(
        connects: Arc<AtomicUsize>,
        live: Arc<AtomicBool>,
    ) -> impl FnOnce() -> std::pin::Pin<
        Box<dyn Future<Output = Result<FakeSession, BrokerError>> + Send>,
    > {
        move || {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let id = connects.fetch_add(1, Ordering::SeqCst);
                Ok(FakeSession { id, live })
            })
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let slot = Arc::new(SessionSlot::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicBool::new(true));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let connects = connects.clone();
                let live = live.clone();
                tokio::spawn(async move {
                    slot.get_or_connect(connector(connects, live))
                        .await
                        .map(|s| s.id)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnects_when_session_is_dead() {
        let slot = SessionSlot::new();
        let connects = Arc::new(AtomicUsize::new(0));
        let first_live = Arc::new(AtomicBool::new(true));

        let first = slot
            .get_or_connect(connector(connects.clone(), first_live.clone()))
            .await
            .unwrap();
        assert_eq!(first.id, 0);

        first_live.store(false, Ordering::SeqCst);
        let second = slot
            .get_or_connect(connector(
                connects.clone(),
                Arc::new(AtomicBool::new(true)),
            ))
            .await
            .unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_errors_propagate_and_leave_slot_empty() {
        let slot: SessionSlot<FakeSession> = SessionSlot::new();

        let result = slot
            .get_or_connect(|| async { Err(BrokerError::Connection("refused".into())) })
            .await;
        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert!(slot.take().await.is_none());
    }

    #[tokio::test]
    async fn failed_setup_runs_cleanup() {
        let cleaned = AtomicBool::new(false);

        let result: Result<(), _> = close_on_error(
            async { Err(BrokerError::Connection("channel refused".into())) },
            || async { cleaned.store(true, Ordering::SeqCst) },
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn successful_setup_skips_cleanup() {
        let cleaned = AtomicBool::new(false);

        let value = close_on_error(async { Ok(7) }, || async {
            cleaned.store(true, Ordering::SeqCst)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert!(!cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn mismatched_declare_names_the_setting() {
        let err = declare_failure(
            "image-resize",
            "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange'".to_string(),
        );
        let message = err.to_string();
        assert!(matches!(err, BrokerError::Declare(_)));
        assert!(message.contains("RESIZE_DEAD_LETTER_EXCHANGE"));
        assert!(message.contains("image-resize"));

        let err = declare_failure("image-resize", "ACCESS_REFUSED".to_string());
        assert_eq!(err.to_string(), "Declare failed: ACCESS_REFUSED");
    }

    #[tokio::test]
    async fn close_without_session_is_a_no_op() {
        let config = crate::config::Config::try_parse_from(["thumbq"]).unwrap();
        let broker = Broker::new(config.broker);
        broker.close().await;
        broker.close().await;
    }
}
