use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;

use super::{
    IndexEntry,
    Persistence,
    RowWrite,
    TableRow,
};
use crate::{
    bootstrap_model::index::IndexKey,
    datum::Datum,
    types::{
        IndexId,
        RowId,
        Snapshot,
        TableId,
        Timestamp,
    },
};

/// A `Persistence` that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<TableId, TableHeap>,
    indexes: BTreeMap<IndexId, BTreeSet<IndexEntry>>,
}

struct TableHeap {
    num_columns: usize,
    rows: BTreeMap<RowId, RowVersion>,
}

struct RowVersion {
    values: Vec<Datum>,
    created: Timestamp,
    deleted: Option<Timestamp>,
}

impl RowVersion {
    fn visible_at(&self, snapshot: Snapshot) -> bool {
        snapshot.is_visible(self.created, self.deleted)
    }
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn table(&self, table_id: TableId) -> anyhow::Result<&TableHeap> {
        self.tables
            .get(&table_id)
            .ok_or_else(|| table_not_found(table_id).into())
    }

    fn index(&self, index_id: IndexId) -> anyhow::Result<&BTreeSet<IndexEntry>> {
        self.indexes
            .get(&index_id)
            .ok_or_else(|| anyhow::anyhow!("No storage for {index_id}"))
    }

    fn visible_row(&self, table_id: TableId, row_id: RowId, snapshot: Snapshot) -> Option<TableRow> {
        let version = self.tables.get(&table_id)?.rows.get(&row_id)?;
        version.visible_at(snapshot).then(|| TableRow {
            id: row_id,
            values: version.values.clone(),
        })
    }

    fn check_writes(&self, writes: &[RowWrite]) -> anyhow::Result<()> {
        let mut deleted = BTreeSet::new();
        for write in writes {
            match write {
                RowWrite::Insert {
                    table_id,
                    row_id,
                    values,
                } => {
                    let table = self.table(*table_id)?;
                    if values.len() != table.num_columns {
                        anyhow::bail!(ErrorMetadata::bad_request(
                            "ColumnCountMismatch",
                            format!(
                                "{table_id} has {} columns but the row has {}",
                                table.num_columns,
                                values.len()
                            ),
                        ));
                    }
                    anyhow::ensure!(
                        !table.rows.contains_key(row_id),
                        "{row_id} already exists in {table_id}"
                    );
                },
                RowWrite::Delete { table_id, row_id } => {
                    let table = self.table(*table_id)?;
                    let live = table
                        .rows
                        .get(row_id)
                        .is_some_and(|version| version.deleted.is_none());
                    if !live || !deleted.insert(*row_id) {
                        anyhow::bail!(ErrorMetadata::bad_request(
                            "WriteConflict",
                            format!("{row_id} in {table_id} was concurrently deleted or updated"),
                        ));
                    }
                },
            }
        }
        Ok(())
    }
}

fn table_not_found(table_id: TableId) -> ErrorMetadata {
    ErrorMetadata::not_found("TableNotFound", format!("{table_id} doesn't exist"))
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_table(&self, table_id: TableId, num_columns: usize) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            !inner.tables.contains_key(&table_id),
            "{table_id} already exists"
        );
        inner.tables.insert(
            table_id,
            TableHeap {
                num_columns,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn table_columns(&self, table_id: TableId) -> anyhow::Result<usize> {
        Ok(self.inner.lock().table(table_id)?.num_columns)
    }

    async fn write_rows(&self, ts: Timestamp, writes: Vec<RowWrite>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writes(&writes)?;
        for write in writes {
            match write {
                RowWrite::Insert {
                    table_id,
                    row_id,
                    values,
                } => {
                    let table = inner
                        .tables
                        .get_mut(&table_id)
                        .ok_or_else(|| table_not_found(table_id))?;
                    table.rows.insert(
                        row_id,
                        RowVersion {
                            values,
                            created: ts,
                            deleted: None,
                        },
                    );
                },
                RowWrite::Delete { table_id, row_id } => {
                    let version = inner
                        .tables
                        .get_mut(&table_id)
                        .and_then(|table| table.rows.get_mut(&row_id))
                        .ok_or_else(|| anyhow::anyhow!("{row_id} vanished during write"))?;
                    version.deleted = Some(ts);
                },
            }
        }
        Ok(())
    }

    async fn scan_table(
        &self,
        table_id: TableId,
        snapshot: Snapshot,
        cursor: Option<RowId>,
        limit: usize,
    ) -> anyhow::Result<Vec<TableRow>> {
        let inner = self.inner.lock();
        let table = inner.table(table_id)?;
        let rows = match cursor {
            Some(cursor) => table.rows.range((
                std::ops::Bound::Excluded(cursor),
                std::ops::Bound::Unbounded,
            )),
            None => table.rows.range(..),
        };
        Ok(rows
            .filter(|(_, version)| version.visible_at(snapshot))
            .take(limit)
            .map(|(id, version)| TableRow {
                id: *id,
                values: version.values.clone(),
            })
            .collect())
    }

    async fn row_visible(
        &self,
        table_id: TableId,
        row_id: RowId,
        snapshot: Snapshot,
    ) -> anyhow::Result<bool> {
        let inner = self.inner.lock();
        inner.table(table_id)?;
        Ok(inner.visible_row(table_id, row_id, snapshot).is_some())
    }

    async fn create_index_storage(&self, index_id: IndexId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            !inner.indexes.contains_key(&index_id),
            "Storage for {index_id} already exists"
        );
        inner.indexes.insert(index_id, BTreeSet::new());
        Ok(())
    }

    async fn has_index_storage(&self, index_id: IndexId) -> anyhow::Result<bool> {
        Ok(self.inner.lock().indexes.contains_key(&index_id))
    }

    async fn insert_index_entries(
        &self,
        index_id: IndexId,
        entries: Vec<IndexEntry>,
    ) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let index = inner
            .indexes
            .get_mut(&index_id)
            .ok_or_else(|| anyhow::anyhow!("No storage for {index_id}"))?;
        Ok(entries
            .into_iter()
            .filter(|entry| index.insert(entry.clone()))
            .count())
    }

    async fn scan_index(
        &self,
        index_id: IndexId,
        table_id: TableId,
        snapshot: Snapshot,
    ) -> anyhow::Result<Vec<(IndexKey, TableRow)>> {
        let inner = self.inner.lock();
        Ok(inner
            .index(index_id)?
            .iter()
            .filter_map(|entry| {
                let row = inner.visible_row(table_id, entry.row_id, snapshot)?;
                Some((entry.key.clone(), row))
            })
            .collect())
    }

    async fn lookup_index(
        &self,
        index_id: IndexId,
        table_id: TableId,
        key: &IndexKey,
        snapshot: Snapshot,
    ) -> anyhow::Result<Vec<RowId>> {
        let inner = self.inner.lock();
        let start = IndexEntry {
            key: key.clone(),
            row_id: RowId::new(0),
        };
        Ok(inner
            .index(index_id)?
            .range(start..)
            .take_while(|entry| &entry.key == key)
            .filter(|entry| {
                inner
                    .visible_row(table_id, entry.row_id, snapshot)
                    .is_some()
            })
            .map(|entry| entry.row_id)
            .collect())
    }

    async fn index_entry_count(&self, index_id: IndexId) -> anyhow::Result<usize> {
        Ok(self.inner.lock().index(index_id)?.len())
    }

    async fn reclaim_index_storage(&self, index_id: IndexId) -> anyhow::Result<()> {
        if let Some(entries) = self.inner.lock().indexes.remove(&index_id) {
            tracing::debug!("Reclaimed {} entries of {index_id}", entries.len());
        }
        Ok(())
    }
}
