use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::Notify;

use crate::{
    DeliveryMeta, Destination, Headers, Message, Publishing,
    sync::lock,
    transport::{
        Acker, Channel, Connection, Delivery, ExchangeKind, PublishOptions, QueueDeclaration,
        TransportError,
    },
};

/// In-memory broker for testing or local pipelines.
///
/// Implements exchanges (direct, fanout, topic, headers), durable-less queues,
/// bindings, publisher confirms, manual acknowledgement with requeue, and
/// dead-lettering. It is useful for:
/// - Unit and integration testing
/// - Running the service without a real broker
/// - Debugging message flows
///
/// Prefetch limits are accepted but not enforced.
///
/// Cloning is cheap; all clones share the same broker state.
#[derive(Clone, Default)]
pub struct InMemory {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_message_id: AtomicU64,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, Arc<Queue>>,
    published: Vec<Publishing>,
    acknowledgements: Vec<AckRecord>,
    open_channels: usize,
    failing_publishes: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
    arguments: Headers,
}

struct Queue {
    declaration: QueueDeclaration,
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl Queue {
    fn push(&self, message: Message) {
        lock(&self.messages).push_back(message);
        self.available.notify_one();
    }

    fn requeue(&self, message: Message) {
        lock(&self.messages).push_front(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        lock(&self.messages).pop_front()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// One settlement observed by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct AckRecord {
    pub queue: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub outcome: AckOutcome,
}

impl InMemory {
    /// Every message accepted by the broker, in publish order.
    pub fn published(&self) -> Vec<Publishing> {
        lock(&self.inner.state).published.clone()
    }

    /// Every ack and nack, in settlement order.
    pub fn acknowledgements(&self) -> Vec<AckRecord> {
        lock(&self.inner.state).acknowledgements.clone()
    }

    /// Number of ready messages in `queue`; zero if it does not exist.
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map_or(0, |q| lock(&q.messages).len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        lock(&self.inner.state).queues.contains_key(queue)
    }

    /// Declared arguments of `queue`.
    pub fn queue_arguments(&self, queue: &str) -> Option<Headers> {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| q.declaration.arguments.clone())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.inner.state).exchanges.get(exchange).copied()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        lock(&self.inner.state)
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    /// Channels opened and not yet closed or dropped.
    pub fn open_channels(&self) -> usize {
        lock(&self.inner.state).open_channels
    }

    /// Make the next `count` publishes fail. Confirmed publishes see a nack,
    /// fire-and-forget publishes a send error.
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.inner.state).failing_publishes = count;
    }

    fn next_message_id(&self) -> String {
        let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg-{id}")
    }

    fn route(
        &self,
        state: &State,
        destination: &Destination,
    ) -> Result<Vec<Arc<Queue>>, TransportError> {
        if destination.exchange.is_empty() {
            return Ok(state
                .queues
                .get(&destination.routing_key)
                .cloned()
                .into_iter()
                .collect());
        }

        let kind = state.exchanges.get(&destination.exchange).ok_or_else(|| {
            TransportError::publish(format!("no exchange '{}'", destination.exchange))
        })?;

        let mut names: Vec<&str> = Vec::new();
        for binding in &state.bindings {
            if binding.exchange != destination.exchange || names.contains(&binding.queue.as_str()) {
                continue;
            }
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == destination.routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => {
                    topic_matches(&binding.routing_key, &destination.routing_key)
                }
                ExchangeKind::Headers => headers_match(&binding.arguments, &destination.headers),
            };
            if matched {
                names.push(&binding.queue);
            }
        }

        Ok(names
            .into_iter()
            .filter_map(|name| state.queues.get(name).cloned())
            .collect())
    }

    fn dead_letter(&self, queue: &Queue, message: Message) {
        let arguments = &queue.declaration.arguments;
        let Some(exchange) = arguments.get("x-dead-letter-exchange").and_then(|v| v.as_str()) else {
            return;
        };
        let routing_key = arguments
            .get("x-dead-letter-routing-key")
            .and_then(|v| v.as_str())
            .unwrap_or(&message.headers.routing_key);

        let destination = Destination::new(exchange, routing_key)
            .with_headers(message.headers.headers.clone());
        let targets = {
            let state = lock(&self.inner.state);
            self.route(&state, &destination)
        };

        match targets {
            Ok(targets) => {
                for target in targets {
                    let mut dead = message.clone();
                    dead.headers.exchange = destination.exchange.clone();
                    dead.headers.routing_key = destination.routing_key.clone();
                    target.push(dead);
                }
            }
            Err(error) => tracing::warn!(%error, "Dropping dead-lettered message"),
        }
    }
}

#[async_trait]
impl Connection for InMemory {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportError> {
        lock(&self.inner.state).open_channels += 1;
        Ok(InMemoryChannel {
            broker: self.clone(),
            confirm: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
            consuming: Mutex::new(Vec::new()),
        })
    }
}

/// Channel on an [`InMemory`] broker.
pub struct InMemoryChannel {
    broker: InMemory,
    confirm: AtomicBool,
    closed: Arc<AtomicBool>,
    consuming: Mutex<Vec<Arc<Queue>>>,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::channel("channel is closed"))
        } else {
            Ok(())
        }
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut state = lock(&self.broker.inner.state);
            state.open_channels = state.open_channels.saturating_sub(1);
            drop(state);
            for queue in lock(&self.consuming).iter() {
                queue.available.notify_waiters();
            }
        }
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    type Acker = InMemoryAcker;

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.confirm.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.inner.state);
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(TransportError::topology(format!(
                "exchange '{name}' already declared as {existing:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.inner.state);
        match state.queues.get(&queue.name) {
            Some(existing)
                if existing.declaration.durable != queue.durable
                    || existing.declaration.arguments != queue.arguments =>
            {
                Err(TransportError::topology(format!(
                    "queue '{}' already declared with different parameters",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    Arc::new(Queue {
                        declaration: queue.clone(),
                        messages: Mutex::new(VecDeque::new()),
                        available: Notify::new(),
                    }),
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Headers,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.inner.state);
        if !state.queues.contains_key(queue) {
            return Err(TransportError::topology(format!("no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::topology(format!("no exchange '{exchange}'")));
        }
        let duplicate = state.bindings.iter().any(|b| {
            b.queue == queue
                && b.exchange == exchange
                && b.routing_key == routing_key
                && &b.arguments == arguments
        });
        if !duplicate {
            state.bindings.push(Binding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                arguments: arguments.clone(),
            });
        }
        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn publish(
        &self,
        publishing: &Publishing,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if options.wait_for_confirm && !self.confirm.load(Ordering::Acquire) {
            return Err(TransportError::publish("channel is not in confirm mode"));
        }

        let targets = {
            let mut state = lock(&self.broker.inner.state);
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(if options.wait_for_confirm {
                    TransportError::nacked()
                } else {
                    TransportError::publish("injected publish failure")
                });
            }
            let targets = self.broker.route(&state, &publishing.headers)?;
            state.published.push(publishing.clone());
            targets
        };

        let meta = DeliveryMeta {
            headers: publishing.headers.headers.clone(),
            routing_key: publishing.headers.routing_key.clone(),
            exchange: publishing.headers.exchange.clone(),
            message_id: Some(self.broker.next_message_id()),
            content_type: Some("application/json".to_owned()),
            timestamp: Some(chrono::Utc::now().timestamp()),
        };
        for target in targets {
            target.push(Message {
                headers: meta.clone(),
                message: publishing.message.clone(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _exclusive: bool,
    ) -> Result<BoxStream<'static, Result<Delivery<Self::Acker>, TransportError>>, TransportError>
    {
        self.ensure_open()?;
        let target = lock(&self.broker.inner.state)
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| TransportError::channel(format!("no queue '{queue}'")))?;
        lock(&self.consuming).push(Arc::clone(&target));

        let broker = self.broker.clone();
        let closed = Arc::clone(&self.closed);
        let stream = stream! {
            loop {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                match target.pop() {
                    Some(message) => {
                        let acker = InMemoryAcker {
                            broker: broker.clone(),
                            queue: Arc::clone(&target),
                            message: message.clone(),
                            settled: AtomicBool::new(false),
                        };
                        yield Ok(Delivery { message, acker });
                    }
                    None => target.available.notified().await,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

/// Settles deliveries from an [`InMemoryChannel`].
pub struct InMemoryAcker {
    broker: InMemory,
    queue: Arc<Queue>,
    message: Message,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn settle(&self, outcome: AckOutcome) -> Result<(), TransportError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(TransportError::settle("delivery already settled"));
        }
        lock(&self.broker.inner.state).acknowledgements.push(AckRecord {
            queue: self.queue.declaration.name.clone(),
            routing_key: self.message.headers.routing_key.clone(),
            message_id: self.message.headers.message_id.clone(),
            outcome,
        });
        Ok(())
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.settle(AckOutcome::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.settle(AckOutcome::Nack { requeue })?;
        if requeue {
            self.queue.requeue(self.message.clone());
        } else {
            self.broker.dead_letter(&self.queue, self.message.clone());
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

/// Headers-exchange matching on `x-match` = `all` (default) or `any`.
fn headers_match(arguments: &Headers, headers: &Headers) -> bool {
    let any = arguments.get("x-match").and_then(|v| v.as_str()) == Some("any");
    let mut required = arguments.iter().filter(|(k, _)| !k.starts_with("x-"));
    if any {
        required.any(|(k, v)| headers.get(k) == Some(v))
    } else {
        required.all(|(k, v)| headers.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn publishing(exchange: &str, routing_key: &str, body: &str) -> Publishing {
        Publishing {
            headers: Destination::new(exchange, routing_key),
            message: body.as_bytes().to_vec(),
        }
    }

    fn queue(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_owned(),
            durable: true,
            ..QueueDeclaration::default()
        }
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("user.#", "user.created"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.*", "user.created"));
        assert!(!topic_matches("user.*", "user.profile.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "user.created"));
        assert!(!topic_matches("user.created", "user.deleted"));
    }

    #[test]
    fn headers_any_and_all() {
        let any = json!({"x-match": "any", "tag.profile": true, "tag.user": true});
        let all = json!({"tag.profile": true, "tag.user": true});
        let headers = json!({"tag.profile": true});

        let any = any.as_object().unwrap();
        let all = all.as_object().unwrap();
        let headers = headers.as_object().unwrap();

        assert!(headers_match(any, headers));
        assert!(!headers_match(all, headers));
    }

    #[tokio::test]
    async fn topic_exchange_routes_to_bound_queues() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel.declare_queue(&queue("users")).await.unwrap();
        channel.declare_queue(&queue("orders")).await.unwrap();
        channel
            .bind_queue("users", "events", "user.#", &Headers::new())
            .await
            .unwrap();
        channel
            .bind_queue("orders", "events", "order.#", &Headers::new())
            .await
            .unwrap();

        channel
            .publish(&publishing("events", "user.created", "{}"), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_len("users"), 1);
        assert_eq!(broker.queue_len("orders"), 0);
    }

    #[tokio::test]
    async fn publishing_to_unknown_exchange_fails() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();

        let err = channel
            .publish(&publishing("missing", "key", "{}"), PublishOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), crate::TransportErrorKind::Publish(_)));
    }

    #[tokio::test]
    async fn confirmed_publish_requires_confirm_mode() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue(&queue("jobs")).await.unwrap();
        let options = PublishOptions {
            persistent: true,
            wait_for_confirm: true,
        };

        assert!(channel.publish(&publishing("", "jobs", "{}"), options).await.is_err());

        channel.confirm_select().await.unwrap();
        channel
            .publish(&publishing("", "jobs", "{}"), options)
            .await
            .unwrap();
        assert_eq!(broker.queue_len("jobs"), 1);
    }

    #[tokio::test]
    async fn injected_failure_nacks_confirmed_publish() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel.confirm_select().await.unwrap();
        broker.fail_next_publishes(1);
        let options = PublishOptions {
            persistent: true,
            wait_for_confirm: true,
        };

        let err = channel
            .publish(&publishing("", "jobs", "{}"), options)
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), crate::TransportErrorKind::Nacked));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_first() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue(&queue("jobs")).await.unwrap();
        for body in ["a", "b"] {
            channel
                .publish(&publishing("", "jobs", body), PublishOptions::default())
                .await
                .unwrap();
        }

        let mut deliveries = channel.consume("jobs", false).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.message.message, b"a");
        first.acker.nack(true).await.unwrap();

        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.message.message, b"a");
        again.acker.ack().await.unwrap();
        assert!(again.acker.ack().await.is_err());

        let outcomes: Vec<_> = broker
            .acknowledgements()
            .into_iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![AckOutcome::Nack { requeue: true }, AckOutcome::Ack]
        );
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("dlx", ExchangeKind::Topic, true)
            .await
            .unwrap();
        channel.declare_queue(&queue("jobs.dlq")).await.unwrap();
        channel
            .bind_queue("jobs.dlq", "dlx", "jobs", &Headers::new())
            .await
            .unwrap();
        let mut jobs = queue("jobs");
        jobs.arguments
            .insert("x-dead-letter-exchange".into(), json!("dlx"));
        jobs.arguments
            .insert("x-dead-letter-routing-key".into(), json!("jobs"));
        channel.declare_queue(&jobs).await.unwrap();
        channel
            .publish(&publishing("", "jobs", "{}"), PublishOptions::default())
            .await
            .unwrap();

        let mut deliveries = channel.consume("jobs", false).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.queue_len("jobs"), 0);
        assert_eq!(broker.queue_len("jobs.dlq"), 1);
    }

    #[tokio::test]
    async fn channel_count_tracks_close_and_drop() {
        let broker = InMemory::default();
        let first = broker.open_channel().await.unwrap();
        let second = broker.open_channel().await.unwrap();
        assert_eq!(broker.open_channels(), 2);

        first.close().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(broker.open_channels(), 1);

        drop(second);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn redeclaring_with_different_kind_fails() {
        let broker = InMemory::default();
        let channel = broker.open_channel().await.unwrap();
        channel
            .declare_exchange("events", ExchangeKind::Topic, true)
            .await
            .unwrap();

        assert!(
            channel
                .declare_exchange("events", ExchangeKind::Fanout, true)
                .await
                .is_err()
        );
    }
}
