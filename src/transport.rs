//! Transport abstractions and broker backends.
//!
//! This module defines the small slice of an AMQP-style broker the rest of the
//! crate relies on: a shared [`Connection`] that opens multiplexed
//! [`Channel`]s, topology declaration, publishing with optional publisher
//! confirms, and consumption with manual acknowledgement.
//!
//! ## Key components
//!
//! - [`Connection`]: Shared, read-only handle that opens channels
//! - [`Channel`]: Owned by exactly one publisher or consumer lane
//! - [`Acker`]: Settles one delivery (ack / nack with requeue)
//! - [`TransportError`]: Unified error type with tracing context
//!
//! Backends: [`InMemory`] is always available and is what tests and
//! standalone development run against; `rabbitmq` (feature-gated) drives a
//! real broker through `lapin`.

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tracing_error::SpanTrace;

use crate::{Headers, Message, Publishing};

pub use inmemory::{AckOutcome, AckRecord, InMemory, InMemoryAcker, InMemoryChannel};

/// Shared connection to the broker.
///
/// Implementations must be cheap to share behind an `Arc`; channels are the
/// unit of concurrency, never the connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Channel type opened by this connection.
    type Channel: Channel;

    /// Open a new channel multiplexed over the connection.
    async fn open_channel(&self) -> Result<Self::Channel, TransportError>;
}

/// A single broker channel.
///
/// A channel is owned by one publisher or one consumer lane and is never
/// shared between tasks.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Handle used to settle deliveries received on this channel.
    type Acker: Acker;

    /// Put the channel in publisher-confirm mode.
    async fn confirm_select(&self) -> Result<(), TransportError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Headers,
    ) -> Result<(), TransportError>;

    /// Limit the number of unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Publish a message.
    ///
    /// With [`PublishOptions::wait_for_confirm`] the call returns only once the
    /// broker acknowledged the message and fails if it was nacked; the channel
    /// must be in confirm mode for that.
    async fn publish(
        &self,
        publishing: &Publishing,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(
        &self,
        queue: &str,
        exclusive: bool,
    ) -> Result<BoxStream<'static, Result<Delivery<Self::Acker>, TransportError>>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;

    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message pulled off a queue together with the handle that settles it.
pub struct Delivery<A> {
    pub message: Message,
    pub acker: A,
}

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Extra `x-` arguments such as dead-letter settings.
    pub arguments: Headers,
}

/// Per-publish behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    /// Mark the message persistent (delivery mode 2).
    pub persistent: bool,
    /// Wait for the broker confirmation before returning.
    pub wait_for_confirm: bool,
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Opening or using a channel failed.
    Channel(tower::BoxError),
    /// Declaring or binding topology failed.
    Topology(tower::BoxError),
    /// The message could not be published.
    Publish(tower::BoxError),
    /// The broker negatively acknowledged a confirmed publish.
    Nacked,
    /// Acknowledging a delivery failed.
    Settle(tower::BoxError),
}

impl TransportError {
    /// Create a channel-related transport error.
    pub fn channel(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Channel(err.into()))
    }

    /// Create a topology-related transport error.
    pub fn topology(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Topology(err.into()))
    }

    /// Create a publish-related transport error.
    pub fn publish(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Publish(err.into()))
    }

    /// The broker refused a confirmed message.
    pub fn nacked() -> Self {
        Self::new(TransportErrorKind::Nacked)
    }

    /// Create an acknowledgement-related transport error.
    pub fn settle(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Settle(err.into()))
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
            TransportErrorKind::Topology(err) => writeln!(f, "Topology error: {err}"),
            TransportErrorKind::Publish(err) => writeln!(f, "Publish error: {err}"),
            TransportErrorKind::Nacked => writeln!(f, "Publish error: message nacked by broker"),
            TransportErrorKind::Settle(err) => writeln!(f, "Acknowledgement error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Channel(err)
            | TransportErrorKind::Topology(err)
            | TransportErrorKind::Publish(err)
            | TransportErrorKind::Settle(err) => Some(err.as_ref()),
            TransportErrorKind::Nacked => None,
        }
    }
}
