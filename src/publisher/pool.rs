use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use serde::Deserialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Publishing, publisher::PublishError, publisher::Publisher, sync::lock};

const DEFAULT_INITIAL_SIZE: usize = 1;
const DEFAULT_MAX_SIZE: usize = 5;

/// Publisher pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Publishers created up front. Their channels still open lazily.
    pub initial_size: usize,
    /// Upper bound on live publishers.
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn with_initial_size(mut self, initial_size: usize) -> Self {
        self.initial_size = initial_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Replace zero values with the defaults and raise `max_size` to
    /// `initial_size` when it is smaller.
    pub fn normalized(self) -> Self {
        let initial_size = if self.initial_size == 0 {
            DEFAULT_INITIAL_SIZE
        } else {
            self.initial_size
        };
        let max_size = if self.max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            self.max_size
        };

        Self {
            initial_size,
            max_size: max_size.max(initial_size),
        }
    }
}

/// Bounded pool of publishers.
///
/// ## Acquisition
///
/// 1. Take an idle publisher if there is one
/// 2. Otherwise grow the pool if it is below `max_size`
/// 3. Otherwise wait for a release or for cancellation
///
/// Checked-out publishers are wrapped in a [`Pooled`] guard that puts them
/// back when dropped, so a slot is returned on every path out of a publish.
pub struct PublisherPool<P> {
    factory: Box<dyn Fn() -> P + Send + Sync>,
    idle: Mutex<VecDeque<P>>,
    available: Notify,
    size: AtomicUsize,
    max_size: usize,
    closed: AtomicBool,
}

impl<P: Publisher> PublisherPool<P> {
    pub fn new(config: PoolConfig, factory: impl Fn() -> P + Send + Sync + 'static) -> Self {
        let config = config.normalized();
        let idle = (0..config.initial_size).map(|_| factory()).collect();

        Self {
            factory: Box::new(factory),
            idle: Mutex::new(idle),
            available: Notify::new(),
            size: AtomicUsize::new(config.initial_size),
            max_size: config.max_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a publisher.
    ///
    /// Fails with `Cancelled` if `cancel` fires while waiting and with
    /// `PoolClosed` once [`close_all`](Self::close_all) ran.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Pooled<'_, P>, PublishError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(PublishError::pool_closed());
            }

            if let Some(publisher) = self.take_idle() {
                return Ok(Pooled::new(self, publisher));
            }

            if self.try_grow() {
                tracing::debug!(size = self.size(), "Growing publisher pool");
                return Ok(Pooled::new(self, (self.factory)()));
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A release may have landed between the checks above and
            // registering interest.
            if let Some(publisher) = self.take_idle() {
                return Ok(Pooled::new(self, publisher));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PublishError::cancelled()),
                _ = &mut notified => {}
            }
        }
    }

    /// Return a publisher to the pool.
    pub fn release(&self, pooled: Pooled<'_, P>) {
        drop(pooled)
    }

    /// Acquire a publisher, publish, release.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        publishing: &Publishing,
    ) -> Result<(), PublishError> {
        let mut publisher = self.acquire(cancel).await?;
        publisher
            .publish(publishing)
            .await
            .map_err(PublishError::transport)
    }

    /// Close every idle publisher and refuse further acquisitions.
    ///
    /// Publishers still checked out are closed on a spawned task when their
    /// guard is dropped. Outside a runtime they are only dropped, which leaves
    /// the channel to the transport's own `Drop`. Calling this more than once
    /// is a no-op.
    pub async fn close_all(&self) {
        let drained: Vec<P> = {
            let mut idle = lock(&self.idle);
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        self.available.notify_waiters();

        for mut publisher in drained {
            publisher.close().await;
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Live publishers, idle or checked out.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    fn take_idle(&self) -> Option<P> {
        lock(&self.idle).pop_front()
    }

    fn try_grow(&self) -> bool {
        let mut size = self.size.load(Ordering::Acquire);
        while size < self.max_size {
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => size = actual,
            }
        }
        false
    }

    fn put_back(&self, publisher: P) {
        let mut idle = lock(&self.idle);
        if self.closed.load(Ordering::Acquire) {
            drop(idle);
            self.size.fetch_sub(1, Ordering::AcqRel);
            close_detached(publisher);
            return;
        }
        idle.push_back(publisher);
        drop(idle);
        self.available.notify_one();
    }
}

fn close_detached<P: Publisher>(mut publisher: P) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { publisher.close().await });
        }
        Err(_) => tracing::debug!("No runtime to close a late publisher, dropping it"),
    }
}

/// A publisher checked out of a [`PublisherPool`].
///
/// Dereferences to the publisher; dropping the guard releases it.
pub struct Pooled<'a, P: Publisher> {
    pool: &'a PublisherPool<P>,
    publisher: Option<P>,
}

impl<'a, P: Publisher> Pooled<'a, P> {
    fn new(pool: &'a PublisherPool<P>, publisher: P) -> Self {
        Self {
            pool,
            publisher: Some(publisher),
        }
    }
}

impl<P: Publisher> Deref for Pooled<'_, P> {
    type Target = P;

    fn deref(&self) -> &P {
        self.publisher
            .as_ref()
            .unwrap_or_else(|| unreachable!("publisher is only taken on drop"))
    }
}

impl<P: Publisher> DerefMut for Pooled<'_, P> {
    fn deref_mut(&mut self) -> &mut P {
        self.publisher
            .as_mut()
            .unwrap_or_else(|| unreachable!("publisher is only taken on drop"))
    }
}

impl<P: Publisher> Drop for Pooled<'_, P> {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            self.pool.put_back(publisher);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, atomic::AtomicUsize},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::{PublishErrorKind, TransportError};

    struct CountingPublisher {
        sent: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&mut self, _publishing: &Publishing) -> Result<(), TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(
        config: PoolConfig,
    ) -> (PublisherPool<CountingPublisher>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (s, c) = (sent.clone(), closed.clone());
        let pool = PublisherPool::new(config, move || CountingPublisher {
            sent: s.clone(),
            closed: c.clone(),
        });
        (pool, sent, closed)
    }

    fn one_to_three() -> PoolConfig {
        PoolConfig::default().with_initial_size(1).with_max_size(3)
    }

    #[test]
    fn config_defaults_and_normalization() {
        assert_eq!(PoolConfig::default(), PoolConfig { initial_size: 1, max_size: 5 });

        let zeroed = PoolConfig { initial_size: 0, max_size: 0 }.normalized();
        assert_eq!(zeroed, PoolConfig { initial_size: 1, max_size: 5 });

        let inverted = PoolConfig { initial_size: 4, max_size: 2 }.normalized();
        assert_eq!(inverted, PoolConfig { initial_size: 4, max_size: 4 });
    }

    #[tokio::test]
    async fn grows_up_to_max_then_blocks_until_release() {
        let (pool, _, _) = pool(one_to_three());
        let cancel = CancellationToken::new();
        assert_eq!(pool.size(), 1);

        let first = pool.acquire(&cancel).await.unwrap();
        let _second = pool.acquire(&cancel).await.unwrap();
        let _third = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.size(), 3);

        let waiter = pool.acquire(&cancel);
        tokio::pin!(waiter);
        assert!(timeout(Duration::from_millis(20), &mut waiter).await.is_err());

        pool.release(first);
        let fourth = timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(fourth, Ok(Ok(_))));
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn waiting_acquire_observes_cancellation() {
        let (pool, _, _) = pool(PoolConfig::default().with_max_size(1));
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let waiter = pool.acquire(&cancel);
        tokio::pin!(waiter);
        assert!(timeout(Duration::from_millis(20), &mut waiter).await.is_err());

        cancel.cancel();
        let err = waiter.await.err().unwrap();
        assert!(matches!(err.kind(), PublishErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn publish_returns_the_slot() {
        let (pool, sent, _) = pool(one_to_three());
        let cancel = CancellationToken::new();
        let publishing = Publishing {
            headers: crate::Destination::new("events", "user.created"),
            message: Vec::new(),
        };

        for _ in 0..5 {
            pool.publish(&cancel, &publishing).await.unwrap();
        }

        assert_eq!(sent.load(Ordering::SeqCst), 5);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn close_all_is_idempotent_and_closes_late_releases() {
        let (pool, _, closed) = pool(one_to_three());
        let cancel = CancellationToken::new();
        let first = pool.acquire(&cancel).await.unwrap();
        let in_flight = pool.acquire(&cancel).await.unwrap();
        drop(first);
        assert_eq!(pool.size(), 2);

        pool.close_all().await;
        pool.close_all().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);

        drop(in_flight);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle_count(), 0);
        let late_close = timeout(Duration::from_secs(1), async {
            while closed.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        });
        assert!(late_close.await.is_ok());

        let err = pool.acquire(&cancel).await.err().unwrap();
        assert!(matches!(err.kind(), PublishErrorKind::PoolClosed));
    }

    #[tokio::test]
    async fn close_all_wakes_waiters() {
        let pool = Arc::new(pool(PoolConfig::default().with_max_size(1)).0);
        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let err = pool.acquire(&cancel).await.err();
                err.map(|e| matches!(e.kind(), PublishErrorKind::PoolClosed))
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close_all().await;
        assert_eq!(waiter.await.unwrap(), Some(true));
        drop(held);
    }

    #[test]
    fn late_release_outside_a_runtime_only_drops() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (pool, _, closed) = pool(PoolConfig::default());
        let cancel = CancellationToken::new();
        let held = runtime.block_on(pool.acquire(&cancel)).unwrap();
        runtime.block_on(pool.close_all());
        drop(runtime);

        drop(held);
        assert_eq!(pool.size(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }
}
