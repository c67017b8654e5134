//! Routing-key based dispatch to typed handlers.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use tower::BoxError;

use crate::{DeliveryMeta, Event, Validate, Validator, consumer::decode};

type Route =
    Arc<dyn Fn(Vec<u8>, DeliveryMeta) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Dispatches raw deliveries to the handler registered for their routing key.
///
/// Payloads are JSON-decoded and validated before the typed handler runs; a
/// decode or validation failure is returned as the handler error. Turn the
/// router into a raw handler with [`handler`](Self::handler) and register it
/// on a consumer:
///
/// ```rust
/// # use std::sync::Arc;
/// # use outbox_broker::{
/// #     Broker, ConsumerConfig, DeliveryMeta, Event, EventRouter, PoolConfig, Validate, Validator,
/// #     Violations,
/// # };
/// # use outbox_broker::transport::InMemory;
/// # use serde::{Deserialize, Serialize};
/// #[derive(Serialize, Deserialize)]
/// struct UserCreated {
///     user_id: String,
/// }
///
/// impl Event for UserCreated {
///     const NAME: &'static str = "user.created";
/// }
///
/// impl Validate for UserCreated {
///     fn validate(&self, violations: &mut Violations) {
///         violations.required("user_id", &self.user_id);
///     }
/// }
///
/// async fn welcome(
///     event: UserCreated,
///     _meta: DeliveryMeta,
/// ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     println!("welcome {}", event.user_id);
///     Ok(())
/// }
///
/// let mut router = EventRouter::new(Validator::new());
/// router.route(welcome);
///
/// let mut broker = Broker::new(Some(Arc::new(InMemory::default())), PoolConfig::default());
/// broker.add_raw_consumer(
///     ConsumerConfig::new("users").with_binding("events", "user.*"),
///     router.handler(),
///     &[],
/// );
/// ```
pub struct EventRouter {
    validator: Validator,
    routes: HashMap<&'static str, Route>,
    fallback: Option<Route>,
}

impl EventRouter {
    pub fn new(validator: Validator) -> Self {
        Self {
            validator,
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Register `handler` for `T::NAME`, replacing any previous route.
    pub fn route<T, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        T: Event + DeserializeOwned + Validate + 'static,
        F: Fn(T, DeliveryMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let validator = self.validator.clone();
        let route: Route = Arc::new(
            move |body: Vec<u8>, meta: DeliveryMeta| -> BoxFuture<'static, Result<(), BoxError>> {
                let call = decode::<T>(&validator, &body).map(|event| handler(event, meta));
                Box::pin(async move { call?.await })
            },
        );

        if self.routes.insert(T::NAME, route).is_some() {
            tracing::warn!(event = T::NAME, "Replaced existing route");
        }
        self
    }

    /// Handler for routing keys without a route.
    pub fn default_handler<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Vec<u8>, DeliveryMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(
            move |body: Vec<u8>, meta: DeliveryMeta| -> BoxFuture<'static, Result<(), BoxError>> {
                Box::pin(handler(body, meta))
            },
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch one message.
    ///
    /// Unmatched keys go to the default handler; with none registered the
    /// message is logged and treated as handled.
    pub fn dispatch(
        &self,
        body: Vec<u8>,
        meta: DeliveryMeta,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        let route = self
            .routes
            .get(meta.routing_key.as_str())
            .or(self.fallback.as_ref());

        match route {
            Some(route) => route(body, meta),
            None => {
                tracing::warn!(routing_key = %meta.routing_key, "No handler for routing key");
                Box::pin(async { Ok(()) })
            }
        }
    }

    /// Raw handler for [`Broker::add_raw_consumer`](crate::Broker::add_raw_consumer).
    pub fn handler(
        self,
    ) -> impl Fn(Vec<u8>, DeliveryMeta) -> BoxFuture<'static, Result<(), BoxError>>
    + Clone
    + Send
    + Sync
    + 'static {
        let router = Arc::new(self);
        move |body: Vec<u8>, meta: DeliveryMeta| router.dispatch(body, meta)
    }
}
