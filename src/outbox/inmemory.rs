use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    outbox::{InsertEntries, NewOutboxEntry, OutboxEntry, RelayEntries},
    sync::lock,
};

/// An in-memory outbox for testing or local usage.
///
/// Mirrors the guarantees of the SQL backend: inserts become visible on
/// commit, fetched rows stay locked by their transaction and are skipped by
/// concurrent fetches, marks are applied on commit only.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    store: Arc<Mutex<Store>>,
}

#[derive(Default)]
struct Store {
    rows: BTreeMap<i64, OutboxEntry>,
    locked: HashSet<i64>,
    last_id: i64,
    failing_commits: usize,
}

impl InMemoryOutbox {
    /// Start a transaction.
    pub fn transaction(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            outbox: self.clone(),
            inserts: Vec::new(),
            marks: Vec::new(),
            locked: Vec::new(),
        }
    }

    /// Committed rows in id order.
    pub fn entries(&self) -> Vec<OutboxEntry> {
        lock(&self.store).rows.values().cloned().collect()
    }

    pub fn unpublished_count(&self) -> usize {
        lock(&self.store)
            .rows
            .values()
            .filter(|row| !row.published)
            .count()
    }

    /// Make the next `count` commits fail and roll back.
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.store).failing_commits = count;
    }
}

/// Transaction on an [`InMemoryOutbox`].
///
/// Dropping it without committing rolls it back.
pub struct InMemoryTransaction {
    outbox: InMemoryOutbox,
    inserts: Vec<OutboxEntry>,
    marks: Vec<i64>,
    locked: Vec<i64>,
}

impl InMemoryTransaction {
    /// Apply staged inserts and marks, then release row locks.
    pub fn commit(mut self) -> Result<(), InMemoryOutboxError> {
        let mut store = lock(&self.outbox.store);
        if store.failing_commits > 0 {
            store.failing_commits -= 1;
            return Err(InMemoryOutboxError::commit_failed());
        }

        for row in self.inserts.drain(..) {
            store.rows.insert(row.id, row);
        }
        for id in &self.marks {
            if let Some(row) = store.rows.get_mut(id) {
                row.published = true;
            }
        }
        Ok(())
    }

    /// Discard staged changes and release row locks.
    pub fn rollback(self) {}
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let mut store = lock(&self.outbox.store);
        for id in &self.locked {
            store.locked.remove(id);
        }
    }
}

#[async_trait]
impl InsertEntries for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = InMemoryTransaction;

    async fn insert(
        &self,
        entry: NewOutboxEntry,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<i64, Self::Error> {
        let id = {
            let mut store = lock(&self.store);
            store.last_id += 1;
            store.last_id
        };
        tx.inserts.push(OutboxEntry {
            id,
            event_name: entry.event_name,
            payload: entry.payload,
            headers: entry.headers,
            created_at: entry.created_at,
            published: false,
        });
        Ok(id)
    }
}

#[async_trait]
impl RelayEntries for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.transaction())
    }

    async fn fetch_unpublished(
        &self,
        limit: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxEntry>, Self::Error> {
        let mut store = lock(&self.store);
        let rows: Vec<OutboxEntry> = store
            .rows
            .values()
            .filter(|row| !row.published && !store.locked.contains(&row.id))
            .take(limit)
            .cloned()
            .collect();

        for row in &rows {
            store.locked.insert(row.id);
            tx.locked.push(row.id);
        }
        Ok(rows)
    }

    async fn mark_published(
        &self,
        ids: &[i64],
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        tx.marks.extend_from_slice(ids);
        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.commit()
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        tx.rollback();
        Ok(())
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn commit_failed() -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::CommitFailed,
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::CommitFailed => {
                write!(f, "Commit failed in in-memory driver, transaction rolled back")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    CommitFailed,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn seed(outbox: &InMemoryOutbox, count: usize) {
        let mut tx = outbox.transaction();
        for n in 0..count {
            outbox
                .insert(NewOutboxEntry::new("user.created", json!({"n": n})), &mut tx)
                .await
                .unwrap();
        }
        tx.commit().unwrap();
    }

    fn ids(rows: &[OutboxEntry]) -> Vec<i64> {
        rows.iter().map(|row| row.id).collect()
    }

    #[tokio::test]
    async fn fetch_mark_fetch_moves_through_the_backlog() {
        let outbox = InMemoryOutbox::default();
        seed(&outbox, 5).await;

        let mut tx = outbox.begin().await.unwrap();
        let first = outbox.fetch_unpublished(3, &mut tx).await.unwrap();
        assert_eq!(ids(&first), vec![1, 2, 3]);
        outbox.mark_published(&ids(&first), &mut tx).await.unwrap();
        outbox.commit(tx).await.unwrap();

        let mut tx = outbox.begin().await.unwrap();
        let rest = outbox.fetch_unpublished(3, &mut tx).await.unwrap();
        assert_eq!(ids(&rest), vec![4, 5]);
    }

    #[tokio::test]
    async fn concurrent_fetches_skip_locked_rows() {
        let outbox = InMemoryOutbox::default();
        seed(&outbox, 5).await;

        let mut a = outbox.begin().await.unwrap();
        let mut b = outbox.begin().await.unwrap();
        let first = outbox.fetch_unpublished(3, &mut a).await.unwrap();
        let second = outbox.fetch_unpublished(3, &mut b).await.unwrap();

        assert_eq!(ids(&first), vec![1, 2, 3]);
        assert_eq!(ids(&second), vec![4, 5]);

        outbox.rollback(a).await.unwrap();
        let mut c = outbox.begin().await.unwrap();
        assert_eq!(ids(&outbox.fetch_unpublished(10, &mut c).await.unwrap()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_commit_discards_marks() {
        let outbox = InMemoryOutbox::default();
        seed(&outbox, 2).await;
        outbox.fail_next_commits(1);

        let mut tx = outbox.begin().await.unwrap();
        let rows = outbox.fetch_unpublished(10, &mut tx).await.unwrap();
        outbox.mark_published(&ids(&rows), &mut tx).await.unwrap();
        assert!(outbox.commit(tx).await.is_err());

        assert_eq!(outbox.unpublished_count(), 2);
        let mut tx = outbox.begin().await.unwrap();
        assert_eq!(outbox.fetch_unpublished(10, &mut tx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_mark_is_a_no_op() {
        let outbox = InMemoryOutbox::default();
        seed(&outbox, 1).await;

        let mut tx = outbox.begin().await.unwrap();
        outbox.mark_published(&[], &mut tx).await.unwrap();
        outbox.commit(tx).await.unwrap();

        assert_eq!(outbox.unpublished_count(), 1);
    }
}
