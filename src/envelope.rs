/// Message container shared by the publish and consume paths.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic and transport-agnostic.
///
/// ## Design
///
/// - `H` represents message metadata. Outgoing messages carry a
///   [`Destination`], deliveries carry a [`DeliveryMeta`].
/// - `M` represents the actual message payload, raw bytes on the wire.
///
/// Keeping headers and payload separated lets handlers, middlewares and
/// publishers look at routing information without touching the body.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use outbox_broker::{Destination, Envelope};
///
/// let envelope = Envelope {
///     headers: Destination::new("events", "user.created"),
///     message: b"{}".to_vec(),
/// };
///
/// // or, equivalently
/// let envelope: Envelope<_, Vec<u8>> =
///     (Destination::new("events", "user.created"), b"{}".to_vec()).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Key/value side-channel data attached to messages and outbox rows.
///
/// Stored as a JSON object so the same value can be persisted in the outbox
/// table and mapped onto AMQP header tables.
pub type Headers = serde_json::Map<String, serde_json::Value>;

/// A message on its way to an exchange.
pub type Publishing = Envelope<Destination, Vec<u8>>;

/// A message received from a queue, as seen by handlers.
pub type Message = Envelope<DeliveryMeta, Vec<u8>>;

/// Where a published message is routed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Destination {
    /// Target exchange. The empty string is the default exchange, which routes
    /// by queue name.
    pub exchange: String,
    /// Routing key used by the exchange.
    pub routing_key: String,
    /// Message headers, used by headers exchanges for tag routing.
    pub headers: Headers,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers: Headers::new(),
        }
    }

    /// Replace the message headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Add a single header.
    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Metadata accompanying an inbound message.
///
/// Read-only view derived from the raw delivery; handlers receive it next to
/// the decoded payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryMeta {
    pub headers: Headers,
    pub routing_key: String,
    pub exchange: String,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Publish time in epoch seconds, when the publisher set one.
    pub timestamp: Option<i64>,
}

impl DeliveryMeta {
    /// Metadata for a message routed with `routing_key` and nothing else.
    pub fn for_routing_key(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }
}
