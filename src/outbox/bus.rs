use tracing::instrument;

use crate::{
    Event,
    outbox::{InsertEntries, NewOutboxEntry, OutboxError},
};

/// Writes events into the outbox.
///
/// Events are inserted but **not** sent; delivery is handled asynchronously
/// by a [`Relay`](crate::Relay). Call [`publish`](Self::publish) with the
/// same transaction that mutates application state.
#[derive(Debug, Clone)]
pub struct OutboxBus<D>(D);

impl<D> OutboxBus<D> {
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    pub fn driver(&self) -> &D {
        &self.0
    }
}

impl<D> OutboxBus<D>
where
    D: InsertEntries + Sync,
    D::Error: Into<tower::BoxError>,
{
    /// Encode `event`, tag it and insert it with `tx`.
    ///
    /// Adds a `tag.<name> = true` header per tag and a `created_at` of now.
    #[instrument(skip_all, fields(event = event.event_name()))]
    pub async fn publish<E: Event>(
        &self,
        event: &E,
        tx: &mut D::Transaction<'_>,
    ) -> Result<i64, OutboxError> {
        let entry = NewOutboxEntry::from_event(event).map_err(OutboxError::serde)?;
        let id = self
            .0
            .insert(entry, tx)
            .await
            .map_err(OutboxError::backend)?;
        tracing::debug!(id, "Event written to outbox");
        Ok(id)
    }
}
