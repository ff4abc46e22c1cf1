use std::{
    collections::BTreeMap,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use async_trait::async_trait;
use common::types::{
    RowId,
    Snapshot,
    TableId,
    Timestamp,
    TransactionId,
};
use parking_lot::Mutex;
use tokio::sync::{
    Mutex as AsyncMutex,
    MutexGuard as AsyncMutexGuard,
};

/// Answers the questions the index lifecycle needs about concurrent
/// transactions.
#[async_trait]
pub trait TransactionOracle: Send + Sync + 'static {
    /// A snapshot that includes every commit published so far.
    async fn current_snapshot(&self) -> anyhow::Result<Snapshot>;

    /// Is any transaction that began before `mark` still running?
    async fn has_active_transactions_started_before(&self, mark: Timestamp)
        -> anyhow::Result<bool>;
}

/// Hands out begin timestamps, serializes commits and tracks which
/// transactions are still running.
///
/// Every committed unit of work, including each catalog flag flip, takes the
/// commit lock, gets the next timestamp and publishes it. Readers only ever
/// see published timestamps.
pub struct TransactionRegistry {
    state: Mutex<RegistryState>,
    commit_lock: AsyncMutex<()>,
    next_row_id: AtomicU64,
    next_table_id: AtomicU64,
}

struct RegistryState {
    last_published: Timestamp,
    next_transaction_id: u64,
    active: BTreeMap<TransactionId, Timestamp>,
}

/// Held while a unit of work commits. Dropping it without `publish` leaves
/// the timestamp unpublished, and the next commit reuses it.
pub struct CommitGuard<'a> {
    registry: &'a TransactionRegistry,
    ts: Timestamp,
    _lock: AsyncMutexGuard<'a, ()>,
}

impl CommitGuard<'_> {
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Snapshot of every commit published before this one. Stable while the
    /// guard is held.
    pub fn snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(Snapshot::at(self.ts.pred()?))
    }

    /// Make every write at `ts` visible to new snapshots.
    pub fn publish(self) -> Timestamp {
        self.registry.state.lock().last_published = self.ts;
        self.ts
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                last_published: Timestamp::MIN,
                next_transaction_id: 1,
                active: BTreeMap::new(),
            }),
            commit_lock: AsyncMutex::new(()),
            next_row_id: AtomicU64::new(1),
            next_table_id: AtomicU64::new(1),
        }
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        Snapshot::at(self.state.lock().last_published)
    }

    /// Register a new transaction reading at the latest published commit.
    pub fn begin(&self) -> (TransactionId, Timestamp) {
        let mut state = self.state.lock();
        let id = TransactionId::new(state.next_transaction_id);
        state.next_transaction_id += 1;
        let begin_ts = state.last_published;
        state.active.insert(id, begin_ts);
        (id, begin_ts)
    }

    /// Mark a transaction finished, whether it committed or aborted.
    pub fn finish(&self, id: TransactionId) {
        self.state.lock().active.remove(&id);
    }

    pub fn num_active(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Begin timestamp of the oldest running transaction.
    pub fn oldest_active(&self) -> Option<Timestamp> {
        self.state.lock().active.values().min().copied()
    }

    pub async fn begin_commit(&self) -> anyhow::Result<CommitGuard<'_>> {
        let lock = self.commit_lock.lock().await;
        let ts = self.state.lock().last_published.succ()?;
        Ok(CommitGuard {
            registry: self,
            ts,
            _lock: lock,
        })
    }

    pub fn next_row_id(&self) -> RowId {
        RowId::new(self.next_row_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_table_id(&self) -> TableId {
        TableId::new(self.next_table_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl TransactionOracle for TransactionRegistry {
    async fn current_snapshot(&self) -> anyhow::Result<Snapshot> {
        Ok(self.latest_snapshot())
    }

    async fn has_active_transactions_started_before(
        &self,
        mark: Timestamp,
    ) -> anyhow::Result<bool> {
        Ok(self
            .state
            .lock()
            .active
            .values()
            .any(|begin_ts| *begin_ts < mark))
    }
}

#[cfg(test)]
mod tests {
    use common::types::Timestamp;

    use super::{
        TransactionOracle,
        TransactionRegistry,
    };

    #[tokio::test]
    async fn test_quiescence_tracks_begin_timestamps() -> anyhow::Result<()> {
        let registry = TransactionRegistry::new();
        let (old, old_ts) = registry.begin();
        assert_eq!(old_ts, Timestamp::MIN);

        let commit = registry.begin_commit().await?;
        let mark = commit.publish();
        assert_eq!(mark, Timestamp::new(1));

        let (new, new_ts) = registry.begin();
        assert_eq!(new_ts, mark);
        assert!(registry.has_active_transactions_started_before(mark).await?);
        assert_eq!(registry.oldest_active(), Some(Timestamp::MIN));

        registry.finish(old);
        assert!(!registry.has_active_transactions_started_before(mark).await?);
        registry.finish(new);
        assert_eq!(registry.num_active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unpublished_commit_is_invisible() -> anyhow::Result<()> {
        let registry = TransactionRegistry::new();
        {
            let commit = registry.begin_commit().await?;
            assert_eq!(commit.ts(), Timestamp::new(1));
        }
        assert_eq!(registry.latest_snapshot().read_ts, Timestamp::MIN);
        let commit = registry.begin_commit().await?;
        assert_eq!(commit.ts(), Timestamp::new(1));
        Ok(())
    }
}
