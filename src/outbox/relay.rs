//! Relay loop delivering outbox rows through the broker.
//!
//! Each cycle:
//!
//! - Begins a transaction and fetches a batch of unpublished rows
//! - Publishes them in id order, stopping at the first failure
//! - Marks the published prefix and commits
//!
//! A failed commit rolls the marks back, so those rows are published again on
//! the next cycle. Delivery is at-least-once and in order.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing_error::SpanTrace;

use crate::{
    Broker, DeliveryGuarantee, Destination,
    outbox::{OutboxEntry, RelayEntries},
    transport::Connection,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_BATCH_SIZE: usize = 100;

/// Relay settings.
///
/// Zero values are replaced with the defaults when the config is handed to a
/// [`Relay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Time between two polls. Defaults to one second.
    pub poll_interval: Duration,
    /// Rows fetched per poll. Defaults to 100.
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RelayConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Replace a zero interval or batch size with its default.
    pub fn normalized(self) -> Self {
        Self {
            poll_interval: if self.poll_interval.is_zero() {
                DEFAULT_POLL_INTERVAL
            } else {
                self.poll_interval
            },
            batch_size: if self.batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                self.batch_size
            },
        }
    }
}

/// Sends one outbox row to the broker.
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn publish(
        &self,
        entry: &OutboxEntry,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>;
}

/// [`RelayPublisher`] publishing through a [`Broker`].
///
/// Every row goes to one exchange (`"events"` unless configured otherwise)
/// with the event name as routing key, the row headers as message headers and
/// [`DeliveryGuarantee::AtLeastOnce`].
pub struct BrokerForwarder<C: Connection> {
    broker: Arc<Broker<C>>,
    exchange: String,
}

impl<C: Connection> BrokerForwarder<C> {
    pub fn new(broker: Arc<Broker<C>>) -> Self {
        Self {
            broker,
            exchange: "events".to_owned(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }
}

#[async_trait]
impl<C: Connection> RelayPublisher for BrokerForwarder<C> {
    async fn publish(
        &self,
        entry: &OutboxEntry,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        let body = serde_json::to_vec(&entry.payload)?;
        let destination = Destination::new(self.exchange.as_str(), entry.event_name.as_str())
            .with_headers(entry.headers.clone());

        self.broker
            .publish(cancel, destination, body, DeliveryGuarantee::AtLeastOnce)
            .await?;
        Ok(())
    }
}

/// Outbox relay.
///
/// Generic parameters:
/// - `R`: Outbox backend
/// - `P`: Publisher used for every row
/// - `HK`: Hook implementation for lifecycle events
pub struct Relay<R, P, HK = DefaultRelayHook> {
    repository: R,
    publisher: P,
    config: RelayConfig,
    hook: HK,
}

impl<R, P> Relay<R, P, DefaultRelayHook>
where
    R: RelayEntries,
    P: RelayPublisher,
{
    /// Create a new relay with the default config and hook.
    pub fn new(repository: R, publisher: P) -> Self {
        Self {
            repository,
            publisher,
            config: RelayConfig::default(),
            hook: DefaultRelayHook,
        }
    }
}

impl<R, P, HK> Relay<R, P, HK>
where
    R: RelayEntries,
    R::Error: Into<BoxError>,
    P: RelayPublisher,
    HK: RelayHook,
{
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Replace the relay hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> Relay<R, P, HK2> {
        Relay {
            repository: self.repository,
            publisher: self.publisher,
            config: self.config,
            hook,
        }
    }

    /// Poll on a fixed interval until `cancel` fires.
    ///
    /// Poll errors are reported to the hook and the loop continues. A poll
    /// that already started runs to completion before cancellation is
    /// observed.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.poll(&cancel).await {
                        self.hook.on_poll_error(&error);
                    }
                }
            }
        }

        self.hook.on_shutdown();
    }

    /// Run one relay cycle, returning how many rows were marked published.
    #[tracing::instrument(skip_all, fields(batch_size = self.config.batch_size))]
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<usize, RelayError> {
        let mut tx = self.repository.begin().await.map_err(RelayError::storage)?;

        let entries = match self
            .repository
            .fetch_unpublished(self.config.batch_size, &mut tx)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                self.rollback(tx).await;
                return Err(RelayError::storage(err));
            }
        };
        if entries.is_empty() {
            self.rollback(tx).await;
            return Ok(0);
        }
        self.hook.on_batch_fetched(entries.len());

        let mut published = Vec::with_capacity(entries.len());
        for entry in &entries {
            match self.publisher.publish(entry, cancel).await {
                Ok(()) => {
                    self.hook.on_entry_published(entry);
                    published.push(entry.id);
                }
                Err(error) => {
                    self.hook.on_publish_error(entry, error.as_ref());
                    break;
                }
            }
        }

        if published.is_empty() {
            self.rollback(tx).await;
            return Ok(0);
        }

        if let Err(err) = self.repository.mark_published(&published, &mut tx).await {
            self.rollback(tx).await;
            return Err(RelayError::storage(err));
        }
        self.repository
            .commit(tx)
            .await
            .map_err(RelayError::storage)?;

        self.hook.on_batch_committed(published.len());
        Ok(published.len())
    }

    async fn rollback(&self, tx: R::Transaction) {
        if let Err(err) = self.repository.rollback(tx).await {
            let err: BoxError = err.into();
            tracing::warn!(error = %err, "Failed to roll back relay transaction");
        }
    }
}

/// Error returned when a relay cycle fails.
#[derive(Debug)]
pub struct RelayError {
    context: SpanTrace,
    kind: RelayErrorKind,
}

/// Classification of relay errors.
#[derive(Debug)]
pub enum RelayErrorKind {
    /// Errors originating from the outbox backend.
    Storage(BoxError),
}

impl RelayError {
    fn storage(err: impl Into<BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RelayErrorKind::Storage(err.into()),
        }
    }

    pub fn kind(&self) -> &RelayErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayErrorKind::Storage(err) => writeln!(f, "Outbox error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayErrorKind::Storage(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_batch_fetched(&self, count: usize);
    fn on_entry_published(&self, entry: &OutboxEntry);
    fn on_publish_error(&self, entry: &OutboxEntry, error: &dyn std::error::Error);
    fn on_batch_committed(&self, count: usize);
    fn on_poll_error(&self, error: &RelayError);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Outbox relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Outbox relay is shutting down");
    }

    fn on_batch_fetched(&self, count: usize) {
        tracing::debug!(count, "Fetched unpublished entries");
    }

    fn on_entry_published(&self, entry: &OutboxEntry) {
        tracing::debug!(id = entry.id, event = %entry.event_name, "Entry published");
    }

    fn on_publish_error(&self, entry: &OutboxEntry, error: &dyn std::error::Error) {
        tracing::error!(
            id = entry.id,
            event = %entry.event_name,
            %error,
            "Failed to publish entry, stopping batch"
        );
    }

    fn on_batch_committed(&self, count: usize) {
        tracing::info!(count, "Marked entries published");
    }

    fn on_poll_error(&self, error: &RelayError) {
        tracing::error!(%error, "Outbox poll failed");
    }
}
