use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    mem,
    sync::Arc,
};

use common::{
    bootstrap_model::index::IndexKey,
    datum::Datum,
    persistence::{
        IndexEntry,
        Persistence,
        RowWrite,
        TableRow,
    },
    types::{
        IndexId,
        RowId,
        Snapshot,
        TableId,
        Timestamp,
        TransactionId,
    },
};
use errors::ErrorMetadata;

use crate::{
    catalog::IndexCatalog,
    metrics::{
        log_transaction_committed,
        log_unique_violation,
    },
    planner_gate::PlannerGate,
    transaction_registry::TransactionRegistry,
};

/// A read-write transaction.
///
/// Reads see the snapshot taken at `begin`; the transaction's own pending
/// writes become visible once it commits. At commit time the transaction
/// maintains exactly the indexes that were ready in its begin snapshot,
/// which is what lets a concurrent build stop scanning for new rows once
/// its ready flag is visible.
pub struct Transaction {
    id: TransactionId,
    snapshot: Snapshot,
    registry: Arc<TransactionRegistry>,
    catalog: Arc<IndexCatalog>,
    persistence: Arc<dyn Persistence>,
    gate: PlannerGate,
    writes: Vec<RowWrite>,
    deleted: BTreeSet<RowId>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(
        registry: Arc<TransactionRegistry>,
        catalog: Arc<IndexCatalog>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let (id, begin_ts) = registry.begin();
        tracing::debug!("Began {id} at {begin_ts}");
        Self {
            id,
            snapshot: Snapshot::at(begin_ts),
            gate: PlannerGate::new(catalog.clone()),
            registry,
            catalog,
            persistence,
            writes: vec![],
            deleted: BTreeSet::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn begin_ts(&self) -> Timestamp {
        self.snapshot.read_ts
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// A fresh snapshot for a single statement. It sees every commit
    /// published so far, but its `xmin` stays at this transaction's begin
    /// timestamp.
    pub fn statement_snapshot(&self) -> Snapshot {
        Snapshot {
            read_ts: self.registry.latest_snapshot().read_ts,
            xmin: self.snapshot.xmin,
        }
    }

    pub async fn insert(&mut self, table_id: TableId, values: Vec<Datum>) -> anyhow::Result<RowId> {
        let num_columns = self.persistence.table_columns(table_id).await?;
        if values.len() != num_columns {
            anyhow::bail!(ErrorMetadata::bad_request(
                "ColumnCountMismatch",
                format!(
                    "{table_id} has {num_columns} columns but {} values were given",
                    values.len()
                ),
            ));
        }
        let row_id = self.registry.next_row_id();
        self.writes.push(RowWrite::Insert {
            table_id,
            row_id,
            values,
        });
        Ok(row_id)
    }

    pub async fn delete(&mut self, table_id: TableId, row_id: RowId) -> anyhow::Result<()> {
        let pending = self.writes.iter().position(|write| {
            matches!(write, RowWrite::Insert { row_id: id, .. } if *id == row_id)
        });
        if let Some(position) = pending {
            self.writes.remove(position);
            return Ok(());
        }
        if self.deleted.contains(&row_id)
            || !self
                .persistence
                .row_visible(table_id, row_id, self.snapshot)
                .await?
        {
            anyhow::bail!(ErrorMetadata::not_found(
                "RowNotFound",
                format!("{row_id} doesn't exist in {table_id}"),
            ));
        }
        self.deleted.insert(row_id);
        self.writes.push(RowWrite::Delete { table_id, row_id });
        Ok(())
    }

    /// Replace a row. The new version gets a new `RowId`.
    pub async fn update(
        &mut self,
        table_id: TableId,
        row_id: RowId,
        values: Vec<Datum>,
    ) -> anyhow::Result<RowId> {
        self.delete(table_id, row_id).await?;
        self.insert(table_id, values).await
    }

    /// All committed rows of `table_id` visible to this transaction.
    pub async fn scan_table(&self, table_id: TableId) -> anyhow::Result<Vec<TableRow>> {
        self.persistence
            .scan_table(table_id, self.snapshot, None, usize::MAX)
            .await
    }

    /// Read rows through an index, in key order. Fails unless the planner
    /// gate allows this transaction to use the index.
    pub async fn scan_index(&self, index_id: IndexId) -> anyhow::Result<Vec<TableRow>> {
        self.scan_index_at(index_id, self.snapshot).await
    }

    /// `scan_index` under a statement snapshot from `statement_snapshot`.
    pub async fn scan_index_at(
        &self,
        index_id: IndexId,
        snapshot: Snapshot,
    ) -> anyhow::Result<Vec<TableRow>> {
        let record = self.gate.require_usable(index_id, snapshot)?;
        let entries = self
            .persistence
            .scan_index(index_id, record.table_id(), snapshot)
            .await?;
        Ok(entries.into_iter().map(|(_, row)| row).collect())
    }

    /// Commit every pending write. Returns the commit timestamp, or the begin
    /// timestamp if there was nothing to write. The transaction is finished
    /// whether or not the commit succeeds.
    pub async fn commit(mut self) -> anyhow::Result<Timestamp> {
        let result = self.commit_inner().await;
        self.finish();
        result
    }

    async fn commit_inner(&mut self) -> anyhow::Result<Timestamp> {
        let writes = mem::take(&mut self.writes);
        if writes.is_empty() {
            return Ok(self.snapshot.read_ts);
        }
        let commit = self.registry.begin_commit().await?;
        let latest = commit.snapshot()?;

        let mut inserts: BTreeMap<TableId, Vec<(RowId, &[Datum])>> = BTreeMap::new();
        for write in &writes {
            if let RowWrite::Insert {
                table_id,
                row_id,
                values,
            } = write
            {
                inserts
                    .entry(*table_id)
                    .or_default()
                    .push((*row_id, values.as_slice()));
            }
        }

        let mut index_updates = vec![];
        for (table_id, rows) in &inserts {
            for record in self.gate.maintained_indexes(*table_id, self.snapshot) {
                let index_id = record.index_id;
                // Dropped after this transaction began.
                if self.catalog.read(index_id, latest).is_none() {
                    continue;
                }
                let mut entries = vec![];
                let mut new_keys = BTreeSet::new();
                for (row_id, values) in rows {
                    let Some(key) = record.definition.key_for_row(values)? else {
                        continue;
                    };
                    if record.definition.is_unique && !key.has_null() {
                        self.check_unique(index_id, *table_id, &key, latest, &mut new_keys)
                            .await?;
                    }
                    entries.push(IndexEntry {
                        key,
                        row_id: *row_id,
                    });
                }
                index_updates.push((index_id, entries));
            }
        }

        // Index entries first: they're invisible until their rows are, so a
        // failure below leaves nothing behind that a reader could see.
        for (index_id, entries) in index_updates {
            self.persistence
                .insert_index_entries(index_id, entries)
                .await?;
        }
        self.persistence.write_rows(commit.ts(), writes).await?;
        let ts = commit.publish();
        tracing::debug!("Committed {} at {ts}", self.id);
        log_transaction_committed();
        Ok(ts)
    }

    async fn check_unique(
        &self,
        index_id: IndexId,
        table_id: TableId,
        key: &IndexKey,
        latest: Snapshot,
        new_keys: &mut BTreeSet<IndexKey>,
    ) -> anyhow::Result<()> {
        let conflicts_with_pending = !new_keys.insert(key.clone());
        let conflicts_with_committed = self
            .persistence
            .lookup_index(index_id, table_id, key, latest)
            .await?
            .into_iter()
            .any(|row_id| !self.deleted.contains(&row_id));
        if conflicts_with_pending || conflicts_with_committed {
            log_unique_violation();
            anyhow::bail!(ErrorMetadata::bad_request(
                "UniqueViolation",
                format!("Key {key} already exists in unique {index_id}"),
            ));
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.registry.finish(self.id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!("Aborting {}", self.id);
            self.finish();
        }
    }
}
