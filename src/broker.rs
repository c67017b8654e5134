//! Composition root for publishing and consuming.

use std::{future::Future, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tower::BoxError;

use crate::{
    DeliveryMeta, Destination, Publishing, Validate, Validator,
    consumer::{BoxMiddleware, ConsumeError, ConsumerConfig, ConsumerGroup},
    publisher::{DeliveryGuarantee, PoolConfig, PublishError, PublisherManager},
    transport::{Channel, Connection, ExchangeKind, TransportError},
};

/// Broker facade.
///
/// Owns the publisher pools and the consumer group built on one shared
/// connection. Without a connection the broker runs in standalone mode:
/// publishes fail with `Standalone` and [`run`](Self::run) idles until
/// cancelled.
///
/// ```rust
/// # use std::sync::Arc;
/// # use outbox_broker::{Broker, DeliveryGuarantee, Destination, PoolConfig};
/// # use outbox_broker::transport::{ExchangeKind, InMemory};
/// # use tokio_util::sync::CancellationToken;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = Broker::new(Some(Arc::new(InMemory::default())), PoolConfig::default());
/// broker.declare_exchange("events", ExchangeKind::Topic).await?;
///
/// let cancel = CancellationToken::new();
/// broker
///     .publish_json(
///         &cancel,
///         Destination::new("events", "user.created"),
///         &serde_json::json!({"user_id": "u-1"}),
///         DeliveryGuarantee::AtLeastOnce,
///     )
///     .await?;
///
/// broker.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Broker<C: Connection> {
    connection: Option<Arc<C>>,
    validator: Validator,
    publishers: PublisherManager<C>,
    consumers: ConsumerGroup<C>,
}

impl<C: Connection> Broker<C> {
    pub fn new(connection: Option<Arc<C>>, pool: PoolConfig) -> Self {
        let validator = Validator::new();
        Self {
            publishers: PublisherManager::new(connection.clone(), pool),
            consumers: ConsumerGroup::new(connection.clone(), validator.clone()),
            connection,
            validator,
        }
    }

    /// Replace the validator used by `publish_json` and typed consumers.
    ///
    /// Consumers already registered keep the validator they were built with.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.consumers.set_validator(validator.clone());
        self.validator = validator;
        self
    }

    pub fn is_standalone(&self) -> bool {
        self.connection.is_none()
    }

    /// Publish raw bytes.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        destination: Destination,
        body: Vec<u8>,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError> {
        let publishing = Publishing {
            headers: destination,
            message: body,
        };
        self.publishers.publish(cancel, guarantee, &publishing).await
    }

    /// Validate `payload`, encode it as JSON and publish it.
    pub async fn publish_json<T>(
        &self,
        cancel: &CancellationToken,
        destination: Destination,
        payload: &T,
        guarantee: DeliveryGuarantee,
    ) -> Result<(), PublishError>
    where
        T: Serialize + Validate + ?Sized,
    {
        self.validator
            .validate(payload)
            .map_err(PublishError::validation)?;
        let body = serde_json::to_vec(payload).map_err(PublishError::serde)?;
        self.publish(cancel, destination, body, guarantee).await
    }

    /// Declare a durable exchange. A no-op in standalone mode.
    #[tracing::instrument(skip(self))]
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), TransportError> {
        let Some(connection) = &self.connection else {
            return Ok(());
        };

        let channel = connection.open_channel().await?;
        let declared = channel.declare_exchange(name, kind, true).await;
        if let Err(error) = channel.close().await {
            tracing::debug!(%error, "Failed to close declare channel");
        }
        declared
    }

    pub fn use_middleware(&mut self, middleware: BoxMiddleware) -> &mut Self {
        self.consumers.use_middleware(middleware);
        self
    }

    /// See [`ConsumerGroup::add_consumer`].
    pub fn add_consumer<T, F, Fut>(
        &mut self,
        config: ConsumerConfig,
        handler: F,
        middlewares: &[BoxMiddleware],
    ) -> &mut Self
    where
        T: DeserializeOwned + Validate + Send + 'static,
        F: Fn(T, DeliveryMeta) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.consumers.add_consumer(config, handler, middlewares);
        self
    }

    /// See [`ConsumerGroup::add_raw_consumer`].
    pub fn add_raw_consumer<F, Fut>(
        &mut self,
        config: ConsumerConfig,
        handler: F,
        middlewares: &[BoxMiddleware],
    ) -> &mut Self
    where
        F: Fn(Vec<u8>, DeliveryMeta) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.consumers.add_raw_consumer(config, handler, middlewares);
        self
    }

    /// Move the consumers of `group` into the broker's group.
    pub fn merge(&mut self, group: ConsumerGroup<C>) -> &mut Self {
        self.consumers.merge(group);
        self
    }

    /// Run the consumer group until `cancel` fires or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumeError> {
        self.consumers.run(cancel).await
    }

    /// Stop consumers, then close every publisher pool. Idempotent.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.consumers.shutdown();
        self.publishers.close_all().await;
        tracing::info!("Broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;
    use crate::{
        PublishErrorKind, Violations,
        transport::{AckOutcome, InMemory},
    };

    #[derive(Serialize)]
    struct Signup {
        email: String,
    }

    impl Validate for Signup {
        fn validate(&self, violations: &mut Violations) {
            violations.email("email", &self.email);
        }
    }

    async fn broker_with_queue() -> (Arc<InMemory>, Broker<InMemory>) {
        let connection = Arc::new(InMemory::default());
        let mut broker = Broker::new(Some(connection.clone()), PoolConfig::default());
        broker.add_raw_consumer(
            ConsumerConfig::new("signups").with_binding("events", "user.signed_up"),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );
        broker
            .declare_exchange("events", ExchangeKind::Topic)
            .await
            .unwrap();
        (connection, broker)
    }

    #[tokio::test]
    async fn standalone_publish_fails() {
        let broker = Broker::<InMemory>::new(None, PoolConfig::default());
        assert!(broker.is_standalone());
        broker
            .declare_exchange("events", ExchangeKind::Topic)
            .await
            .unwrap();

        let err = broker
            .publish(
                &CancellationToken::new(),
                Destination::new("events", "user.created"),
                b"{}".to_vec(),
                DeliveryGuarantee::AtMostOnce,
            )
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), PublishErrorKind::Standalone));
    }

    #[tokio::test]
    async fn publish_json_validates_before_sending() {
        let (connection, broker) = broker_with_queue().await;
        let cancel = CancellationToken::new();

        let err = broker
            .publish_json(
                &cancel,
                Destination::new("events", "user.signed_up"),
                &Signup {
                    email: "nope".into(),
                },
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), PublishErrorKind::Validation(_)));
        assert!(connection.published().is_empty());

        broker
            .publish_json(
                &cancel,
                Destination::new("events", "user.signed_up"),
                &Signup {
                    email: "jane@example.com".into(),
                },
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
            .unwrap();

        let published = connection.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message, br#"{"email":"jane@example.com"}"#);
    }

    #[tokio::test]
    async fn run_consumes_published_messages() {
        let (connection, broker) = broker_with_queue().await;
        let broker = Arc::new(broker);
        let cancel = CancellationToken::new();
        let runner = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.run(cancel).await })
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !connection.is_bound("signups", "events", "user.signed_up") {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        broker
            .publish(
                &cancel,
                Destination::new("events", "user.signed_up"),
                b"{}".to_vec(),
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while connection.acknowledgements().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        broker.shutdown().await;
        runner.await.unwrap().unwrap();
        assert_eq!(connection.acknowledgements()[0].outcome, AckOutcome::Ack);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_pools() {
        let (connection, broker) = broker_with_queue().await;
        let cancel = CancellationToken::new();
        broker
            .publish(
                &cancel,
                Destination::new("events", "user.signed_up"),
                b"{}".to_vec(),
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
            .unwrap();
        assert_eq!(connection.open_channels(), 1);

        broker.shutdown().await;
        broker.shutdown().await;

        assert_eq!(connection.open_channels(), 0);
        let err = broker
            .publish(
                &cancel,
                Destination::new("events", "user.signed_up"),
                b"{}".to_vec(),
                DeliveryGuarantee::AtLeastOnce,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), PublishErrorKind::PoolClosed));
    }
}
