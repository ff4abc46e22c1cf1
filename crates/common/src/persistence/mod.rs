//! The storage engine the index catalog drives: versioned table rows plus
//! one physical key structure per index.
//!
//! Row versions carry the commit timestamps that created and deleted them,
//! so any reader can reconstruct a table as of a `Snapshot`. Index entries
//! are never deleted individually: an entry whose row version isn't visible
//! to the reader is skipped at scan time, and an index's entries all go
//! away together when its storage is reclaimed.
mod in_memory;

use async_trait::async_trait;

pub use self::in_memory::InMemoryPersistence;
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

/// A row version visible to some snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRow {
    pub id: RowId,
    pub values: Vec<Datum>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowWrite {
    Insert {
        table_id: TableId,
        row_id: RowId,
        values: Vec<Datum>,
    },
    Delete {
        table_id: TableId,
        row_id: RowId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexEntry {
    pub key: IndexKey,
    pub row_id: RowId,
}

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn create_table(&self, table_id: TableId, num_columns: usize) -> anyhow::Result<()>;

    /// Number of columns in each row of `table_id`. `NotFound` if the table
    /// doesn't exist.
    async fn table_columns(&self, table_id: TableId) -> anyhow::Result<usize>;

    /// Apply every write at commit timestamp `ts`. Either all writes are
    /// applied or none are: deleting a row that's already deleted fails the
    /// whole batch with a `WriteConflict`.
    async fn write_rows(&self, ts: Timestamp, writes: Vec<RowWrite>) -> anyhow::Result<()>;

    /// Up to `limit` rows of `table_id` visible at `snapshot`, in `RowId`
    /// order, starting after `cursor`.
    async fn scan_table(
        &self,
        table_id: TableId,
        snapshot: Snapshot,
        cursor: Option<RowId>,
        limit: usize,
    ) -> anyhow::Result<Vec<TableRow>>;

    /// Is this row version live at `snapshot`?
    async fn row_visible(
        &self,
        table_id: TableId,
        row_id: RowId,
        snapshot: Snapshot,
    ) -> anyhow::Result<bool>;

    async fn create_index_storage(&self, index_id: IndexId) -> anyhow::Result<()>;

    async fn has_index_storage(&self, index_id: IndexId) -> anyhow::Result<bool>;

    /// Add entries, ignoring ones already present. Returns how many were new.
    async fn insert_index_entries(
        &self,
        index_id: IndexId,
        entries: Vec<IndexEntry>,
    ) -> anyhow::Result<usize>;

    /// Entries whose row is visible at `snapshot`, in key order, with their
    /// rows.
    async fn scan_index(
        &self,
        index_id: IndexId,
        table_id: TableId,
        snapshot: Snapshot,
    ) -> anyhow::Result<Vec<(IndexKey, TableRow)>>;

    /// Rows visible at `snapshot` stored under exactly `key`.
    async fn lookup_index(
        &self,
        index_id: IndexId,
        table_id: TableId,
        key: &IndexKey,
        snapshot: Snapshot,
    ) -> anyhow::Result<Vec<RowId>>;

    /// Number of physical entries, visible or not.
    async fn index_entry_count(&self, index_id: IndexId) -> anyhow::Result<usize>;

    /// Release the index's storage. Reclaiming storage that doesn't exist is
    /// a no-op.
    async fn reclaim_index_storage(&self, index_id: IndexId) -> anyhow::Result<()>;
}
