//! Inbound consumption.
//!
//! A [`ConsumerGroup`] owns a set of registered consumers. Each consumer binds
//! one queue to a handler, declares its topology once and then runs
//! `concurrency` lanes, every lane on a channel of its own.
//!
//! ## Key components
//!
//! - [`ConsumerConfig`]: Queue, binding, QoS, retry and dead-letter settings
//! - [`Handler`]: Type-erased tower service invoked per message
//! - [`Middleware`]: Wraps handlers; any `tower::Layer<Handler>` qualifies
//! - [`ConsumeError`]: Unified error type with tracing context
//!
//! ## Message outcome
//!
//! | handler result | settlement                        |
//! |----------------|-----------------------------------|
//! | `Ok(())`       | ack                               |
//! | `Err(_)`       | nack, requeue = `retry_on_error`  |
//! | panic          | nack, requeue = `true`            |

mod group;
mod middleware;

use std::{future::Future, marker::PhantomData, panic::AssertUnwindSafe, pin::Pin};

use futures_util::FutureExt as _;
use serde::{Deserialize, de::DeserializeOwned};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::{
    DeliveryMeta, Headers, Message, Validate, ValidationError, Validator,
    transport::{Acker, Channel, Delivery, ExchangeKind, QueueDeclaration, TransportError},
};

pub use group::ConsumerGroup;
pub use middleware::{
    BoxMiddleware, HandlerPanic, LoggingLayer, LoggingService, Middleware, RecoverLayer,
    RecoverService,
};

/// Type-erased message handler.
///
/// Typed and raw handlers, middlewares and the event router all produce this
/// one service type.
pub type Handler = tower::util::BoxCloneSyncService<Message, (), BoxError>;

/// Consumer settings.
///
/// Deserializable from configuration; unspecified fields take the defaults
/// listed on each field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Exchange the queue is bound to. No binding when `None`.
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub routing_key: String,
    /// Binding arguments, e.g. `x-match` and header values for headers
    /// exchanges.
    #[serde(default)]
    pub binding_args: Headers,
    /// Defaults to `true`.
    #[serde(default = "default_durable")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: bool,
    /// Defaults to 1.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    /// Lanes run for this consumer. Defaults to 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Requeue messages whose handler returned an error.
    ///
    /// Defaults to `false`: failed messages are dropped, or dead-lettered
    /// when a dead-letter exchange is configured. Enable it only for handlers
    /// whose failures are transient, otherwise a poison message loops
    /// forever.
    #[serde(default)]
    pub retry_on_error: bool,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    /// Routing key of dead-lettered messages. Defaults to the queue name.
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

fn default_durable() -> bool {
    true
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_concurrency() -> usize {
    1
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: None,
            routing_key: String::new(),
            binding_args: Headers::new(),
            durable: default_durable(),
            auto_delete: false,
            exclusive: false,
            prefetch_count: default_prefetch_count(),
            concurrency: default_concurrency(),
            retry_on_error: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Bind the queue to `exchange` with `routing_key`.
    pub fn with_binding(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.exchange = Some(exchange.into());
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_binding_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.binding_args.insert(key.into(), value.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_on_error(mut self, retry_on_error: bool) -> Self {
        self.retry_on_error = retry_on_error;
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    /// Name of the dead-letter queue.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }

    fn lanes(&self) -> usize {
        self.concurrency.max(1)
    }

    fn prefetch(&self) -> u16 {
        self.prefetch_count.max(1)
    }
}

/// A registered consumer: its settings and fully wrapped handler.
pub(crate) struct Consumer {
    config: ConsumerConfig,
    handler: Handler,
}

impl Consumer {
    pub(crate) fn new(
        config: ConsumerConfig,
        handler: Handler,
        middlewares: &[BoxMiddleware],
    ) -> Self {
        Self {
            config,
            handler: middleware::chain(middlewares, handler),
        }
    }

    pub(crate) fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Declare the queue, its dead-letter topology and its binding.
    #[tracing::instrument(skip_all, fields(queue = %self.config.queue))]
    pub(crate) async fn declare<Ch: Channel>(&self, channel: &Ch) -> Result<(), ConsumeError> {
        let config = &self.config;
        let declare_err = |err: TransportError| ConsumeError::declare(&config.queue, err);

        let mut queue = QueueDeclaration {
            name: config.queue.clone(),
            durable: config.durable,
            auto_delete: config.auto_delete,
            exclusive: config.exclusive,
            arguments: Headers::new(),
        };

        if let Some(exchange) = &config.dead_letter_exchange {
            let dead_letter_queue = config.dead_letter_queue();
            let routing_key = config
                .dead_letter_routing_key
                .clone()
                .unwrap_or_else(|| config.queue.clone());

            channel
                .declare_exchange(exchange, ExchangeKind::Topic, true)
                .await
                .map_err(declare_err)?;
            channel
                .declare_queue(&QueueDeclaration {
                    name: dead_letter_queue.clone(),
                    durable: true,
                    ..QueueDeclaration::default()
                })
                .await
                .map_err(declare_err)?;
            channel
                .bind_queue(&dead_letter_queue, exchange, &routing_key, &Headers::new())
                .await
                .map_err(declare_err)?;

            queue
                .arguments
                .insert("x-dead-letter-exchange".to_owned(), exchange.clone().into());
            queue
                .arguments
                .insert("x-dead-letter-routing-key".to_owned(), routing_key.into());
        }

        channel.declare_queue(&queue).await.map_err(declare_err)?;

        if let Some(exchange) = &config.exchange {
            channel
                .bind_queue(&config.queue, exchange, &config.routing_key, &config.binding_args)
                .await
                .map_err(declare_err)?;
        }

        tracing::debug!("Declared consumer topology");
        Ok(())
    }

    /// Pull and process deliveries until either token fires or the stream
    /// ends.
    ///
    /// Tokens are only checked between messages; a handler that already
    /// started always runs to completion and settles its delivery.
    pub(crate) async fn consume<Ch: Channel>(
        &self,
        channel: &Ch,
        lanes: &CancellationToken,
        delivery: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        channel
            .qos(self.config.prefetch())
            .await
            .map_err(ConsumeError::channel)?;
        let mut deliveries = channel
            .consume(&self.config.queue, self.config.exclusive)
            .await
            .map_err(ConsumeError::channel)?;

        loop {
            let next = tokio::select! {
                biased;
                _ = lanes.cancelled() => break,
                _ = delivery.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(err)) => return Err(ConsumeError::delivery(err)),
                None => break,
            }
        }

        Ok(())
    }

    /// Run the handler on one delivery and settle it.
    #[tracing::instrument(
        skip_all,
        fields(
            queue = %self.config.queue,
            routing_key = %delivery.message.headers.routing_key
        )
    )]
    pub(crate) async fn process<A: Acker>(&self, delivery: Delivery<A>) {
        let Delivery { message, acker } = delivery;
        let handler = self.handler.clone();

        let outcome = AssertUnwindSafe(handler.oneshot(message))
            .catch_unwind()
            .await;

        let settled = match outcome {
            Ok(Ok(())) => acker.ack().await,
            Ok(Err(error)) => {
                let requeue = error.is::<HandlerPanic>() || self.config.retry_on_error;
                tracing::error!(%error, requeue, "Handler failed");
                acker.nack(requeue).await
            }
            Err(panic) => {
                let panic = HandlerPanic::from_payload(panic.as_ref());
                tracing::error!(%panic, "Handler panicked, requeueing message");
                acker.nack(true).await
            }
        };

        if let Err(error) = settled {
            tracing::error!(%error, "Failed to settle delivery");
        }
    }
}

/// Tower `Service` that decodes and validates JSON payloads before calling a
/// typed handler.
pub struct TypedService<F, T> {
    validator: Validator,
    handler: F,
    payload: PhantomData<fn() -> T>,
}

impl<F, T> TypedService<F, T> {
    pub fn new(validator: Validator, handler: F) -> Self {
        Self {
            validator,
            handler,
            payload: PhantomData,
        }
    }
}

impl<F: Clone, T> Clone for TypedService<F, T> {
    fn clone(&self) -> Self {
        Self {
            validator: self.validator.clone(),
            handler: self.handler.clone(),
            payload: PhantomData,
        }
    }
}

impl<F, Fut, T> Service<Message> for TypedService<F, T>
where
    T: DeserializeOwned + Validate + Send + 'static,
    F: Fn(T, DeliveryMeta) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Message) -> Self::Future {
        let decoded = decode::<T>(&self.validator, &req.message);
        let handler = self.handler.clone();

        Box::pin(async move {
            let payload = decoded?;
            handler(payload, req.headers).await
        })
    }
}

/// JSON-decode `body` into `T` and validate it.
pub(crate) fn decode<T: DeserializeOwned + Validate>(
    validator: &Validator,
    body: &[u8],
) -> Result<T, DecodeError> {
    let value: T = serde_json::from_slice(body).map_err(DecodeError::deserialize)?;
    validator.validate(&value).map_err(DecodeError::validation)?;
    Ok(value)
}

/// Error returned when a payload cannot be turned into a handler input.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    kind: DecodeErrorKind,
}

/// Decode errors kind.
#[derive(Debug)]
pub enum DecodeErrorKind {
    Deserialize(serde_json::Error),
    Validation(ValidationError),
}

impl DecodeError {
    fn deserialize(err: serde_json::Error) -> Self {
        Self::new(DecodeErrorKind::Deserialize(err))
    }

    fn validation(err: ValidationError) -> Self {
        Self::new(DecodeErrorKind::Validation(err))
    }

    fn new(kind: DecodeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DecodeErrorKind::Deserialize(err) => writeln!(f, "Decode error: {err}"),
            DecodeErrorKind::Validation(err) => writeln!(f, "Decode error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DecodeErrorKind::Deserialize(err) => Some(err),
            DecodeErrorKind::Validation(err) => Some(err),
        }
    }
}

/// Error returned by a consumer group run.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct ConsumeError {
    context: SpanTrace,
    kind: ConsumeErrorKind,
}

/// Consume errors kind.
#[derive(Debug)]
pub enum ConsumeErrorKind {
    /// Opening or configuring a lane channel failed.
    Channel(TransportError),
    /// Declaring a consumer's topology failed.
    Declare { queue: String, source: TransportError },
    /// The delivery stream failed.
    Delivery(TransportError),
    /// A lane task panicked or was aborted.
    Lane(tokio::task::JoinError),
}

impl ConsumeError {
    pub fn channel(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Channel(err))
    }

    pub fn declare(queue: &str, err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Declare {
            queue: queue.to_owned(),
            source: err,
        })
    }

    pub fn delivery(err: TransportError) -> Self {
        Self::new(ConsumeErrorKind::Delivery(err))
    }

    pub fn lane(err: tokio::task::JoinError) -> Self {
        Self::new(ConsumeErrorKind::Lane(err))
    }

    fn new(kind: ConsumeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConsumeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumeErrorKind::Channel(err) => writeln!(f, "Consumer channel error: {err}"),
            ConsumeErrorKind::Declare { queue, source } => {
                writeln!(f, "Consumer declare error for queue '{queue}': {source}")
            }
            ConsumeErrorKind::Delivery(err) => writeln!(f, "Consumer delivery error: {err}"),
            ConsumeErrorKind::Lane(err) => writeln!(f, "Consumer lane error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumeErrorKind::Channel(err) | ConsumeErrorKind::Delivery(err) => Some(err),
            ConsumeErrorKind::Declare { source, .. } => Some(source),
            ConsumeErrorKind::Lane(err) => Some(err),
        }
    }
}
