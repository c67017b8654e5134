//! Outbox abstractions and backend drivers.
//!
//! This module implements the *transactional outbox pattern*: events are
//! written to an outbox table inside the same transaction that mutates
//! application state, and a [`Relay`] later publishes them to the broker in
//! id order.
//!
//! The outbox is responsible for **durability and ordering**, while delivery
//! concerns are delegated to the relay and the broker.
//!
//! ## Responsibilities
//!
//! - Persist events atomically with application state
//! - Hand out unpublished rows with skip-locked semantics
//! - Mark rows published once the broker confirmed them
//!
//! ## Components
//!
//! - [`OutboxBus`]: Writes [`Event`](crate::Event)s into the outbox
//! - [`InsertEntries`]: Trait for inserting rows in a caller transaction
//! - [`RelayEntries`]: Trait for the relay side (fetch, mark, commit)
//! - [`Relay`]: Polling loop delivering rows through the broker
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and `sqlx` (behind the `sqlx` feature).

mod bus;
pub mod inmemory;
mod relay;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{Event, Headers};

pub use bus::OutboxBus;
pub use relay::{
    BrokerForwarder, DefaultRelayHook, Relay, RelayConfig, RelayError, RelayErrorKind, RelayHook,
    RelayPublisher,
};

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Outbox errors kind.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The storage backend failed.
    Backend(tower::BoxError),
    /// The event could not be encoded.
    Serde(serde_json::Error),
}

impl OutboxError {
    /// Create a backend-related outbox error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self::new(OutboxErrorKind::Backend(err.into()))
    }

    pub fn serde(err: serde_json::Error) -> Self {
        Self::new(OutboxErrorKind::Serde(err))
    }

    fn new(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            OutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
            OutboxErrorKind::Serde(err) => Some(err),
        }
    }
}

/// A row of the outbox table.
///
/// `id` is assigned by storage and increases monotonically; it is the FIFO
/// key of the relay. `published` only ever goes from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    /// Routing key of the event.
    pub event_name: String,
    /// JSON document, opaque to the relay.
    pub payload: serde_json::Value,
    pub headers: Headers,
    /// Epoch seconds.
    pub created_at: i64,
    pub published: bool,
}

/// A row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub event_name: String,
    pub payload: serde_json::Value,
    pub headers: Headers,
    pub created_at: i64,
}

impl NewOutboxEntry {
    pub fn new(event_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_name: event_name.into(),
            payload,
            headers: Headers::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Encode `event` with one `tag.<name> = true` header per tag.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(event)?;
        let headers = event
            .tags()
            .iter()
            .map(|tag| (format!("tag.{tag}"), serde_json::Value::Bool(true)))
            .collect();

        Ok(Self {
            headers,
            ..Self::new(event.event_name(), payload)
        })
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Trait for inserting rows into the outbox.
///
/// Rows are written with the caller's transaction so they commit or roll
/// back together with the business state.
#[async_trait::async_trait]
pub trait InsertEntries {
    /// Backend-specific error type.
    type Error;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Insert one row, returning its id.
    async fn insert(
        &self,
        entry: NewOutboxEntry,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<i64, Self::Error>;
}

/// Trait for the relay side of the outbox.
///
/// Rows returned by [`fetch_unpublished`](Self::fetch_unpublished) stay
/// locked by `tx` until it commits or rolls back; concurrent relays skip them
/// instead of waiting.
#[async_trait::async_trait]
pub trait RelayEntries: Send + Sync {
    /// Backend-specific error type.
    type Error;
    /// Transaction owned by one relay cycle.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Up to `limit` unpublished rows in ascending id order.
    async fn fetch_unpublished(
        &self,
        limit: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxEntry>, Self::Error>;

    /// Mark exactly `ids` as published. Empty `ids` is a no-op.
    async fn mark_published(
        &self,
        ids: &[i64],
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}
