use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sqlx::{PgPool, PgTransaction, Row, postgres::PgRow};

use crate::{
    Headers,
    outbox::{InsertEntries, NewOutboxEntry, OutboxEntry, RelayEntries},
};

/// Postgres outbox driver.
///
/// Application code inserts through [`InsertEntries`] with its own
/// transaction; the relay side opens transactions from the pool.
#[derive(Debug, Clone)]
pub struct PgOutbox {
    pool: PgPool,
}

impl PgOutbox {
    /// Creates an outbox on a pool whose schema already exists.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates an outbox and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `work` in a new transaction, committing on `Ok` and rolling back
    /// on `Err`.
    ///
    /// The returned future may only borrow the transaction, so move owned
    /// handles (for example a cloned [`OutboxBus`](crate::OutboxBus)) into it.
    pub async fn run_in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut PgTransaction<'static>) -> BoxFuture<'c, Result<T, E>>
            + Send,
        E: From<Error>,
    {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(Error::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(error) = tx.rollback().await {
                    tracing::warn!(%error, "Failed to roll back transaction");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl InsertEntries for PgOutbox {
    type Error = Error;
    type Transaction<'a> = PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(event = %entry.event_name))]
    async fn insert(
        &self,
        entry: NewOutboxEntry,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<i64, Self::Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO outbox (event_name, payload, headers, created_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(&entry.event_name)
        .bind(&entry.payload)
        .bind(serde_json::Value::Object(entry.headers))
        .bind(entry.created_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl RelayEntries for PgOutbox {
    type Error = Error;
    type Transaction = PgTransaction<'static>;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    #[tracing::instrument(skip_all)]
    async fn fetch_unpublished(
        &self,
        limit: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxEntry>, Self::Error> {
        let rows = sqlx::query(
            "SELECT id, event_name, payload, headers, created_at, published
             FROM outbox
             WHERE published = FALSE
             ORDER BY id
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    async fn mark_published(
        &self,
        ids: &[i64],
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE outbox SET published = TRUE WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.rollback().await?)
    }
}

fn entry_from_row(row: &PgRow) -> Result<OutboxEntry, Error> {
    let headers: serde_json::Value = row.try_get("headers")?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        event_name: row.try_get("event_name")?,
        payload: row.try_get("payload")?,
        headers: serde_json::from_value::<Headers>(headers)?,
        created_at: row.try_get("created_at")?,
        published: row.try_get("published")?,
    })
}

/// Ensures the outbox table and its unpublished index exist.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            id BIGSERIAL PRIMARY KEY,
            event_name TEXT NOT NULL,
            payload JSONB NOT NULL,
            headers JSONB NOT NULL DEFAULT '{}',
            created_at BIGINT NOT NULL,
            published BOOL NOT NULL DEFAULT FALSE
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS outbox_unpublished_idx
         ON outbox (id) WHERE published = FALSE",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgOutboxErrorKind,
}

/// Kinds of Postgres outbox errors.
#[derive(Debug)]
pub enum PgOutboxErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
}

impl Error {
    pub fn kind(&self) -> &PgOutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgOutboxErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgOutboxErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgOutboxErrorKind::Database(err) => Some(err),
            PgOutboxErrorKind::Serde(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgOutboxErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgOutboxErrorKind::Serde(err),
        }
    }
}
