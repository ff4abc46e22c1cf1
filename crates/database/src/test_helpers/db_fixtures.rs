use std::sync::{
    atomic::{
        AtomicU32,
        Ordering,
    },
    Arc,
};

use async_trait::async_trait;
use common::{
    datum::Datum,
    pause::PauseClient,
    persistence::{
        InMemoryPersistence,
        Persistence,
    },
    types::{
        RowId,
        Snapshot,
        TableId,
        Timestamp,
    },
};
use errors::ErrorMetadata;

use crate::{
    Database,
    TransactionOracle,
    TransactionRegistry,
};

pub struct DbFixtures {
    pub tp: Arc<dyn Persistence>,
    pub db: Database,
}

impl DbFixtures {
    pub async fn new() -> anyhow::Result<Self> {
        Self::new_with_pause_client(PauseClient::new()).await
    }

    pub async fn new_with_pause_client(pause_client: PauseClient) -> anyhow::Result<Self> {
        cmd_util::env::config_test();
        let tp: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        let db = Database::new_with_pause_client(tp.clone(), pause_client);
        Ok(Self { tp, db })
    }

    /// Create a table and commit `rows` into it in one transaction.
    pub async fn table_with_rows(
        &self,
        num_columns: usize,
        rows: impl IntoIterator<Item = Vec<Datum>>,
    ) -> anyhow::Result<(TableId, Vec<RowId>)> {
        let table_id = self.db.create_table(num_columns).await?;
        let row_ids = self.insert_rows(table_id, rows).await?;
        Ok((table_id, row_ids))
    }

    pub async fn insert_rows(
        &self,
        table_id: TableId,
        rows: impl IntoIterator<Item = Vec<Datum>>,
    ) -> anyhow::Result<Vec<RowId>> {
        let mut tx = self.db.begin();
        let mut row_ids = vec![];
        for values in rows {
            row_ids.push(tx.insert(table_id, values).await?);
        }
        tx.commit().await?;
        Ok(row_ids)
    }
}

/// Oracle that fails its first `failures` calls before delegating to a
/// registry. `u32::MAX` failures makes it permanently unavailable.
pub struct FlakyOracle {
    registry: Arc<TransactionRegistry>,
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyOracle {
    pub fn new(registry: Arc<TransactionRegistry>, failures: u32) -> Self {
        Self {
            registry,
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if failing {
            anyhow::bail!(ErrorMetadata::oracle_unavailable(
                "Injected oracle failure"
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionOracle for FlakyOracle {
    async fn current_snapshot(&self) -> anyhow::Result<Snapshot> {
        self.maybe_fail()?;
        self.registry.current_snapshot().await
    }

    async fn has_active_transactions_started_before(
        &self,
        mark: Timestamp,
    ) -> anyhow::Result<bool> {
        self.maybe_fail()?;
        self.registry
            .has_active_transactions_started_before(mark)
            .await
    }
}
