#![doc = include_str!("../README.md")]

pub mod broker;
pub mod consumer;
pub mod envelope;
pub mod event;
pub mod outbox;
pub mod publisher;
pub mod router;
pub mod transport;
pub mod validate;

mod sync;

#[doc(inline)]
pub use envelope::{DeliveryMeta, Destination, Envelope, Headers, Message, Publishing};

#[doc(inline)]
pub use broker::Broker;

#[doc(inline)]
pub use consumer::{
    BoxMiddleware, ConsumeError, ConsumeErrorKind, ConsumerConfig, ConsumerGroup, DecodeError,
    DecodeErrorKind, Handler, HandlerPanic, LoggingLayer, Middleware, RecoverLayer,
};

#[doc(inline)]
pub use event::Event;

#[doc(inline)]
pub use outbox::{
    BrokerForwarder, DefaultRelayHook, InsertEntries, NewOutboxEntry, OutboxBus, OutboxEntry,
    OutboxError, OutboxErrorKind, Relay, RelayConfig, RelayEntries, RelayError, RelayErrorKind,
    RelayHook, RelayPublisher,
};

#[doc(inline)]
pub use publisher::{DeliveryGuarantee, PoolConfig, PublishError, PublishErrorKind};

#[doc(inline)]
pub use router::EventRouter;

#[doc(inline)]
pub use transport::{TransportError, TransportErrorKind};

#[doc(inline)]
pub use validate::{Validate, ValidationError, Validator, Violations};
