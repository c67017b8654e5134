use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    Publishing,
    publisher::{
        ConfirmedPublisher, DeliveryGuarantee, FireAndForgetPublisher, PoolConfig, PublishError,
        PublisherPool,
    },
    transport::Connection,
};

/// One publisher pool per [`DeliveryGuarantee`].
///
/// Without a connection (standalone mode) there are no pools and every
/// lookup fails with `Standalone`.
pub struct PublisherManager<C: Connection> {
    at_least_once: Option<PublisherPool<ConfirmedPublisher<C>>>,
    at_most_once: Option<PublisherPool<FireAndForgetPublisher<C>>>,
}

impl<C: Connection> PublisherManager<C> {
    pub fn new(connection: Option<Arc<C>>, config: PoolConfig) -> Self {
        let Some(connection) = connection else {
            return Self {
                at_least_once: None,
                at_most_once: None,
            };
        };

        let confirmed = Arc::clone(&connection);
        let at_least_once =
            PublisherPool::new(config, move || ConfirmedPublisher::new(Arc::clone(&confirmed)));
        let at_most_once = PublisherPool::new(config, move || {
            FireAndForgetPublisher::new(Arc::clone(&connection))
        });

        Self {
            at_least_once: Some(at_least_once),
            at_most_once: Some(at_most_once),
        }
    }

    /// Pool serving `guarantee`.
    pub fn get(&self, guarantee: DeliveryGuarantee) -> Result<PoolRef<'_, C>, PublishError> {
        match guarantee {
            DeliveryGuarantee::AtLeastOnce => self.at_least_once.as_ref().map(PoolRef::Confirmed),
            DeliveryGuarantee::AtMostOnce => {
                self.at_most_once.as_ref().map(PoolRef::FireAndForget)
            }
        }
        .ok_or_else(PublishError::standalone)
    }

    #[tracing::instrument(
        skip_all,
        fields(
            exchange = %publishing.headers.exchange,
            routing_key = %publishing.headers.routing_key,
            guarantee = ?guarantee
        )
    )]
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        guarantee: DeliveryGuarantee,
        publishing: &Publishing,
    ) -> Result<(), PublishError> {
        self.get(guarantee)?.publish(cancel, publishing).await
    }

    /// Close every pool. Idempotent.
    pub async fn close_all(&self) {
        if let Some(pool) = &self.at_least_once {
            pool.close_all().await;
        }
        if let Some(pool) = &self.at_most_once {
            pool.close_all().await;
        }
    }
}

/// Borrowed view of one of the manager's pools.
pub enum PoolRef<'a, C: Connection> {
    Confirmed(&'a PublisherPool<ConfirmedPublisher<C>>),
    FireAndForget(&'a PublisherPool<FireAndForgetPublisher<C>>),
}

impl<C: Connection> PoolRef<'_, C> {
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        publishing: &Publishing,
    ) -> Result<(), PublishError> {
        match self {
            PoolRef::Confirmed(pool) => pool.publish(cancel, publishing).await,
            PoolRef::FireAndForget(pool) => pool.publish(cancel, publishing).await,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            PoolRef::Confirmed(pool) => pool.size(),
            PoolRef::FireAndForget(pool) => pool.size(),
        }
    }
}
