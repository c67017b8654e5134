//! Handler middlewares.
//!
//! Any `tower::Layer<Handler>` whose service handles [`Message`]s is a
//! [`Middleware`]. Chains apply in registration order: the first middleware is
//! the outermost, so it sees the message first and the result last.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    time::Instant,
};

use futures_util::FutureExt as _;
use tower::{BoxError, Layer, Service};

use crate::{Message, consumer::Handler};

/// Wraps a handler into another handler.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, handler: Handler) -> Handler;
}

impl<L> Middleware for L
where
    L: Layer<Handler> + Send + Sync + 'static,
    L::Service: Service<Message, Response = (), Error = BoxError> + Clone + Send + Sync + 'static,
    <L::Service as Service<Message>>::Future: Send + 'static,
{
    fn wrap(&self, handler: Handler) -> Handler {
        Handler::new(self.layer(handler))
    }
}

/// Shared, type-erased middleware.
pub type BoxMiddleware = Arc<dyn Middleware>;

/// Apply `middlewares` around `handler`, first one outermost.
pub(crate) fn chain(middlewares: &[BoxMiddleware], handler: Handler) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |handler, middleware| middleware.wrap(handler))
}

/// Error produced when a handler panicked.
///
/// Messages failing with this error are always requeued, regardless of
/// `retry_on_error`.
#[derive(Debug, Clone)]
pub struct HandlerPanic {
    message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler panicked: {}", self.message)
    }
}

impl std::error::Error for HandlerPanic {}

/// Tower `Service` that turns panics of the inner service into
/// [`HandlerPanic`] errors.
#[derive(Clone)]
pub struct RecoverService<S> {
    inner: S,
}

impl<S> Service<Message> for RecoverService<S>
where
    S: Service<Message, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Message) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(HandlerPanic::from_payload(payload.as_ref()).into()),
            }
        })
    }
}

/// Tower `Layer` that applies [`RecoverService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverLayer;

impl<S> Layer<S> for RecoverLayer {
    type Service = RecoverService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecoverService { inner: service }
    }
}

/// Tower `Service` that logs routing key, duration and outcome of every
/// message.
#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S> Service<Message> for LoggingService<S>
where
    S: Service<Message, Response = (), Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Message) -> Self::Future {
        let mut inner = self.inner.clone();
        let routing_key = req.headers.routing_key.clone();

        Box::pin(async move {
            let start = Instant::now();
            let result = inner.call(req).await;
            let duration = start.elapsed();

            match &result {
                Ok(()) => tracing::debug!(%routing_key, ?duration, "Message handled"),
                Err(error) => {
                    tracing::error!(%routing_key, ?duration, %error, "Message handling failed")
                }
            }
            result
        })
    }
}

/// Tower `Layer` that applies [`LoggingService`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        LoggingService { inner: service }
    }
}
