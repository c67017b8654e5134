//! Outbound publishing.
//!
//! Publishers own exactly one channel each and are handed out by a bounded
//! [`PublisherPool`]. The [`PublisherManager`] keeps one pool per
//! [`DeliveryGuarantee`].
//!
//! ## Key components
//!
//! - [`Publisher`]: Sends messages over its own channel
//! - [`ConfirmedPublisher`]: Persistent delivery, waits for broker confirms
//! - [`FireAndForgetPublisher`]: No confirmation, lowest latency
//! - [`PublisherPool`]: Auto-scaling pool with RAII checkout
//! - [`PublishError`]: Unified error type with tracing context

mod manager;
mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing_error::SpanTrace;

use crate::{
    Publishing, ValidationError,
    transport::{Channel, Connection, PublishOptions, TransportError},
};

pub use manager::{PoolRef, PublisherManager};
pub use pool::{PoolConfig, Pooled, PublisherPool};

/// Delivery semantics requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Persistent delivery, the publish returns once the broker confirmed it.
    #[default]
    AtLeastOnce,
    /// Fire-and-forget.
    AtMostOnce,
}

/// Sends messages over a channel it owns.
#[async_trait]
pub trait Publisher: Send + 'static {
    async fn publish(&mut self, publishing: &Publishing) -> Result<(), TransportError>;

    /// Close the underlying channel, if one is open.
    async fn close(&mut self);
}

/// Channel opened on first use and discarded after a failure.
struct LazyChannel<C: Connection> {
    connection: Arc<C>,
    channel: Option<C::Channel>,
    confirm: bool,
}

impl<C: Connection> LazyChannel<C> {
    fn new(connection: Arc<C>, confirm: bool) -> Self {
        Self {
            connection,
            channel: None,
            confirm,
        }
    }

    async fn get(&mut self) -> Result<&C::Channel, TransportError> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => {
                let channel = self.connection.open_channel().await?;
                if self.confirm {
                    channel.confirm_select().await?;
                }
                tracing::debug!(confirm = self.confirm, "Opened publisher channel");
                channel
            }
        };
        Ok(self.channel.insert(channel))
    }

    async fn send(
        &mut self,
        publishing: &Publishing,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let result = self.get().await?.publish(publishing, options).await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(error) = channel.close().await {
                tracing::debug!(%error, "Failed to close publisher channel");
            }
        }
    }
}

/// Publisher for [`DeliveryGuarantee::AtLeastOnce`].
///
/// The channel is put in confirm mode, messages are persistent and every
/// publish waits for the broker confirmation.
pub struct ConfirmedPublisher<C: Connection> {
    channel: LazyChannel<C>,
}

impl<C: Connection> ConfirmedPublisher<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            channel: LazyChannel::new(connection, true),
        }
    }
}

#[async_trait]
impl<C: Connection> Publisher for ConfirmedPublisher<C> {
    async fn publish(&mut self, publishing: &Publishing) -> Result<(), TransportError> {
        let options = PublishOptions {
            persistent: true,
            wait_for_confirm: true,
        };
        self.channel.send(publishing, options).await
    }

    async fn close(&mut self) {
        self.channel.close().await
    }
}

/// Publisher for [`DeliveryGuarantee::AtMostOnce`].
pub struct FireAndForgetPublisher<C: Connection> {
    channel: LazyChannel<C>,
}

impl<C: Connection> FireAndForgetPublisher<C> {
    pub fn new(connection: Arc<C>) -> Self {
        Self {
            channel: LazyChannel::new(connection, false),
        }
    }
}

#[async_trait]
impl<C: Connection> Publisher for FireAndForgetPublisher<C> {
    async fn publish(&mut self, publishing: &Publishing) -> Result<(), TransportError> {
        self.channel.send(publishing, PublishOptions::default()).await
    }

    async fn close(&mut self) {
        self.channel.close().await
    }
}

/// Error returned when publishing fails.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish errors kind.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The caller gave up while waiting for a free publisher.
    Cancelled,
    /// The pool was closed by shutdown.
    PoolClosed,
    /// The broker runs without a connection.
    Standalone,
    /// The transport failed or the broker refused the message.
    Transport(TransportError),
    /// The payload broke its constraints.
    Validation(ValidationError),
    /// The payload could not be encoded.
    Serde(serde_json::Error),
}

impl PublishError {
    pub fn cancelled() -> Self {
        Self::new(PublishErrorKind::Cancelled)
    }

    pub fn pool_closed() -> Self {
        Self::new(PublishErrorKind::PoolClosed)
    }

    pub fn standalone() -> Self {
        Self::new(PublishErrorKind::Standalone)
    }

    pub fn transport(err: TransportError) -> Self {
        Self::new(PublishErrorKind::Transport(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(PublishErrorKind::Validation(err))
    }

    pub fn serde(err: serde_json::Error) -> Self {
        Self::new(PublishErrorKind::Serde(err))
    }

    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Cancelled => {
                writeln!(f, "Publish error: cancelled while acquiring a publisher")
            }
            PublishErrorKind::PoolClosed => writeln!(f, "Publish error: publisher pool closed"),
            PublishErrorKind::Standalone => {
                writeln!(f, "Publish error: no broker connection (standalone mode)")
            }
            PublishErrorKind::Transport(err) => writeln!(f, "Publish error: {err}"),
            PublishErrorKind::Validation(err) => writeln!(f, "Publish error: {err}"),
            PublishErrorKind::Serde(err) => writeln!(f, "Serialization error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Transport(err) => Some(err),
            PublishErrorKind::Validation(err) => Some(err),
            PublishErrorKind::Serde(err) => Some(err),
            PublishErrorKind::Cancelled
            | PublishErrorKind::PoolClosed
            | PublishErrorKind::Standalone => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Destination,
        transport::{ExchangeKind, InMemory, QueueDeclaration},
    };

    async fn broker_with_queue(queue: &str) -> Arc<InMemory> {
        let broker = Arc::new(InMemory::default());
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("events", ExchangeKind::Direct, true)
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDeclaration {
                name: queue.to_owned(),
                durable: true,
                ..QueueDeclaration::default()
            })
            .await
            .unwrap();
        channel
            .bind_queue(queue, "events", queue, &Default::default())
            .await
            .unwrap();
        channel.close().await.unwrap();
        broker
    }

    fn publishing(routing_key: &str) -> Publishing {
        Publishing {
            headers: Destination::new("events", routing_key),
            message: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn confirmed_publisher_opens_channel_lazily() {
        let broker = broker_with_queue("jobs").await;
        let mut publisher = ConfirmedPublisher::new(broker.clone());
        assert_eq!(broker.open_channels(), 0);

        publisher.publish(&publishing("jobs")).await.unwrap();
        publisher.publish(&publishing("jobs")).await.unwrap();

        assert_eq!(broker.open_channels(), 1);
        assert_eq!(broker.queue_len("jobs"), 2);

        publisher.close().await;
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn failed_publish_discards_the_channel() {
        let broker = broker_with_queue("jobs").await;
        let mut publisher = ConfirmedPublisher::new(broker.clone());
        publisher.publish(&publishing("jobs")).await.unwrap();

        broker.fail_next_publishes(1);
        let err = publisher.publish(&publishing("jobs")).await.unwrap_err();
        assert!(matches!(err.kind(), crate::TransportErrorKind::Nacked));
        assert_eq!(broker.open_channels(), 0);

        publisher.publish(&publishing("jobs")).await.unwrap();
        assert_eq!(broker.open_channels(), 1);
        assert_eq!(broker.queue_len("jobs"), 2);
    }

    #[tokio::test]
    async fn fire_and_forget_does_not_need_confirm_mode() {
        let broker = broker_with_queue("jobs").await;
        let mut publisher = FireAndForgetPublisher::new(broker.clone());

        publisher.publish(&publishing("jobs")).await.unwrap();

        assert_eq!(broker.queue_len("jobs"), 1);
    }
}
