use std::{future::Future, sync::Arc};

use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::Instrument as _;

use crate::{
    DeliveryMeta, Message, Validate, Validator,
    consumer::{BoxMiddleware, ConsumeError, Consumer, ConsumerConfig, Handler, TypedService},
    transport::{Channel, Connection},
};

/// Set of consumers run together.
///
/// Registration takes `&mut self` and [`run`](Self::run) takes `&self`, so
/// the set of consumers is frozen once the group runs.
pub struct ConsumerGroup<C: Connection> {
    connection: Option<Arc<C>>,
    validator: Validator,
    consumers: Vec<Arc<Consumer>>,
    middlewares: Vec<BoxMiddleware>,
    delivery: CancellationToken,
}

impl<C: Connection> ConsumerGroup<C> {
    /// Create a group. Without a connection the group runs in standalone
    /// mode and consumes nothing.
    pub fn new(connection: Option<Arc<C>>, validator: Validator) -> Self {
        Self {
            connection,
            validator,
            consumers: Vec::new(),
            middlewares: Vec::new(),
            delivery: CancellationToken::new(),
        }
    }

    pub(crate) fn set_validator(&mut self, validator: Validator) {
        self.validator = validator;
    }

    /// Append a group-wide middleware.
    ///
    /// Applies to consumers registered after this call.
    pub fn use_middleware(&mut self, middleware: BoxMiddleware) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Register a consumer whose handler receives the decoded, validated
    /// JSON payload.
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
        let handler = Handler::new(TypedService::new(self.validator.clone(), handler));
        self.register(config, handler, middlewares)
    }

    /// Register a consumer whose handler receives the raw body.
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
        let handler = Handler::new(tower::service_fn(move |message: Message| {
            handler(message.message, message.headers)
        }));
        self.register(config, handler, middlewares)
    }

    /// Move every consumer of `other` into this group.
    pub fn merge(&mut self, other: ConsumerGroup<C>) -> &mut Self {
        self.consumers.extend(other.consumers);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    fn register(
        &mut self,
        config: ConsumerConfig,
        handler: Handler,
        middlewares: &[BoxMiddleware],
    ) -> &mut Self {
        let chain: Vec<BoxMiddleware> = self
            .middlewares
            .iter()
            .chain(middlewares)
            .cloned()
            .collect();
        tracing::debug!(queue = %config.queue, middlewares = chain.len(), "Registered consumer");
        self.consumers
            .push(Arc::new(Consumer::new(config, handler, &chain)));
        self
    }

    /// Declare every consumer's topology and run all lanes.
    ///
    /// Returns when `cancel` fires, after [`shutdown`](Self::shutdown), or
    /// with the first lane error once the remaining lanes stopped.
    #[tracing::instrument(skip_all, fields(consumers = self.consumers.len()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumeError> {
        let Some(connection) = &self.connection else {
            tracing::warn!("No broker connection, consumers stay idle (standalone mode)");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.delivery.cancelled() => {}
            }
            return Ok(());
        };

        self.declare(connection).await?;

        let lanes = cancel.child_token();
        let mut tasks = JoinSet::new();
        for consumer in &self.consumers {
            for lane in 0..consumer.config().lanes() {
                let consumer = Arc::clone(consumer);
                let connection = Arc::clone(connection);
                let lanes = lanes.clone();
                let delivery = self.delivery.clone();
                let span =
                    tracing::info_span!("consumer_lane", queue = %consumer.config().queue, lane);

                tasks.spawn(
                    async move {
                        let channel = connection
                            .open_channel()
                            .await
                            .map_err(ConsumeError::channel)?;
                        tracing::debug!("Lane started");
                        let result = consumer.consume(&channel, &lanes, &delivery).await;
                        if let Err(error) = channel.close().await {
                            tracing::debug!(%error, "Failed to close lane channel");
                        }
                        tracing::debug!("Lane stopped");
                        result
                    }
                    .instrument(span),
                );
            }
        }
        tracing::info!(lanes = tasks.len(), "Consumer group running");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(ConsumeError::lane).and_then(|result| result);
            if let Err(error) = result {
                if first_error.is_none() {
                    tracing::error!(%error, "Consumer lane failed, stopping group");
                    lanes.cancel();
                    first_error = Some(error);
                } else {
                    tracing::debug!(%error, "Additional lane failure");
                }
            }
        }

        tracing::info!("Consumer group stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Stop pulling new deliveries. Idempotent.
    ///
    /// In-flight handlers finish and settle their message.
    pub fn shutdown(&self) {
        if !self.delivery.is_cancelled() {
            tracing::info!("Shutting down consumer group");
        }
        self.delivery.cancel();
    }

    async fn declare(&self, connection: &C) -> Result<(), ConsumeError> {
        let channel = connection
            .open_channel()
            .await
            .map_err(ConsumeError::channel)?;

        let mut result = Ok(());
        for consumer in &self.consumers {
            result = consumer.declare(&channel).await;
            if result.is_err() {
                break;
            }
        }

        if let Err(error) = channel.close().await {
            tracing::debug!(%error, "Failed to close declare channel");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        ConsumeErrorKind, Destination, Publishing, Violations,
        transport::{AckOutcome, ExchangeKind, InMemory, PublishOptions},
    };

    #[derive(serde::Deserialize)]
    struct Job {
        id: u32,
    }

    impl Validate for Job {
        fn validate(&self, violations: &mut Violations) {
            violations.check("id", self.id > 0, "must be positive");
        }
    }

    async fn publish(broker: &InMemory, queue: &str, body: &str) {
        let channel = broker.open_channel().await.unwrap();
        channel
            .publish(
                &Publishing {
                    headers: Destination::new("", queue),
                    message: body.as_bytes().to_vec(),
                },
                PublishOptions::default(),
            )
            .await
            .unwrap();
    }

    async fn wait_for_acknowledgements(broker: &InMemory, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.acknowledgements().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("acknowledgements did not arrive in time");
    }

    #[tokio::test]
    async fn standalone_run_waits_for_cancel() {
        let group = ConsumerGroup::<InMemory>::new(None, Validator::new());
        let cancel = CancellationToken::new();

        let run = group.run(cancel.clone());
        tokio::pin!(run);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut run)
                .await
                .is_err()
        );

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn standalone_run_returns_on_shutdown() {
        let group = ConsumerGroup::<InMemory>::new(None, Validator::new());
        group.shutdown();

        group.run(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_run_returns_after_declare() {
        let broker = Arc::new(InMemory::default());
        let mut group = ConsumerGroup::new(Some(broker.clone()), Validator::new());
        group.add_raw_consumer(
            ConsumerConfig::new("jobs").with_concurrency(3),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );

        group.shutdown();
        group.shutdown();
        group.run(CancellationToken::new()).await.unwrap();

        assert!(broker.queue_exists("jobs"));
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn declare_failure_fails_fast() {
        let broker = Arc::new(InMemory::default());
        let mut group = ConsumerGroup::new(Some(broker.clone()), Validator::new());
        group.add_raw_consumer(
            ConsumerConfig::new("jobs").with_binding("missing-exchange", "jobs"),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );

        let err = group.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err.kind(), ConsumeErrorKind::Declare { queue, .. } if queue == "jobs"));
    }

    #[tokio::test]
    async fn panic_is_contained_and_lane_keeps_consuming() {
        let broker = Arc::new(InMemory::default());
        let panicked = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        let mut group = ConsumerGroup::new(Some(broker.clone()), Validator::new());
        {
            let panicked = panicked.clone();
            let handled = handled.clone();
            group.add_consumer(
                ConsumerConfig::new("jobs"),
                move |job: Job, _meta: DeliveryMeta| {
                    let panicked = panicked.clone();
                    let handled = handled.clone();
                    async move {
                        if job.id == 1 && !panicked.swap(true, Ordering::SeqCst) {
                            panic!("first attempt explodes");
                        }
                        handled.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    }
                },
                &[],
            );
        }

        let cancel = CancellationToken::new();
        let group = Arc::new(group);
        let runner = {
            let group = group.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { group.run(cancel).await })
        };

        // Wait for the queue to exist before publishing.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !broker.queue_exists("jobs") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        publish(&broker, "jobs", r#"{"id": 1}"#).await;
        publish(&broker, "jobs", r#"{"id": 2}"#).await;

        wait_for_acknowledgements(&broker, 3).await;
        cancel.cancel();
        runner.await.unwrap().unwrap();

        let outcomes: Vec<_> = broker
            .acknowledgements()
            .into_iter()
            .map(|record| record.outcome)
            .collect();
        let requeues = outcomes
            .iter()
            .filter(|outcome| **outcome == AckOutcome::Nack { requeue: true })
            .count();
        assert_eq!(requeues, 1);
        assert_eq!(outcomes.iter().filter(|o| **o == AckOutcome::Ack).count(), 2);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lanes_share_the_queue() {
        let broker = Arc::new(InMemory::default());
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();

        let mut group = ConsumerGroup::new(Some(broker.clone()), Validator::new());
        group.add_raw_consumer(
            ConsumerConfig::new("jobs")
                .with_binding("events", "job.#")
                .with_concurrency(3),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );

        let cancel = CancellationToken::new();
        let group = Arc::new(group);
        let runner = {
            let group = group.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { group.run(cancel).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.open_channels() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for n in 0..10 {
            channel
                .publish(
                    &Publishing {
                        headers: Destination::new("events", format!("job.{n}")),
                        message: b"{}".to_vec(),
                    },
                    PublishOptions::default(),
                )
                .await
                .unwrap();
        }
        wait_for_acknowledgements(&broker, 10).await;

        group.shutdown();
        runner.await.unwrap().unwrap();
        assert_eq!(broker.queue_len("jobs"), 0);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn merge_moves_consumers() {
        let mut group = ConsumerGroup::<InMemory>::new(None, Validator::new());
        group.add_raw_consumer(
            ConsumerConfig::new("a"),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );
        let mut other = ConsumerGroup::<InMemory>::new(None, Validator::new());
        other.add_raw_consumer(
            ConsumerConfig::new("b"),
            |_, _| async { Ok::<(), BoxError>(()) },
            &[],
        );

        group.merge(other);

        assert_eq!(group.len(), 2);
    }
}
