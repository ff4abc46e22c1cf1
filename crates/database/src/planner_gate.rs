use std::sync::Arc;

use common::{
    bootstrap_model::index::IndexCatalogRecord,
    types::{
        IndexId,
        Snapshot,
        TableId,
    },
};
use errors::ErrorMetadata;

use crate::catalog::{
    index_not_found,
    IndexCatalog,
    IndexCatalogEntry,
};

/// Decides which indexes queries may read and which writes must maintain,
/// always through the caller's own snapshot.
#[derive(Clone)]
pub struct PlannerGate {
    catalog: Arc<IndexCatalog>,
}

impl PlannerGate {
    pub fn new(catalog: Arc<IndexCatalog>) -> Self {
        Self { catalog }
    }

    /// May a query running at `snapshot` read `index_id`?
    pub fn is_usable(&self, index_id: IndexId, snapshot: Snapshot) -> bool {
        self.catalog
            .read(index_id, snapshot)
            .is_some_and(|entry| usable_at(&entry, snapshot))
    }

    /// The record for `index_id` if a query at `snapshot` may read it.
    pub fn require_usable(
        &self,
        index_id: IndexId,
        snapshot: Snapshot,
    ) -> anyhow::Result<IndexCatalogRecord> {
        let entry = self
            .catalog
            .read(index_id, snapshot)
            .ok_or_else(|| index_not_found(index_id))?;
        if !entry.record.is_valid() {
            anyhow::bail!(ErrorMetadata::invalid_index_state(
                "IndexNotValid",
                format!(
                    "{index_id} is {} and not available to queries yet",
                    entry.record.phase
                ),
            ));
        }
        if !usable_at(&entry, snapshot) {
            anyhow::bail!(ErrorMetadata::invalid_index_state(
                "IndexNewerThanSnapshot",
                format!(
                    "{index_id} became valid at {} but this transaction's snapshot {snapshot} is \
                     older",
                    entry.committed_at
                ),
            ));
        }
        Ok(entry.record)
    }

    /// Indexes on `table_id` a query at `snapshot` may read.
    pub fn usable_indexes(&self, table_id: TableId, snapshot: Snapshot) -> Vec<IndexCatalogRecord> {
        self.catalog
            .indexes_for_table(table_id, snapshot)
            .into_iter()
            .filter(|entry| usable_at(entry, snapshot))
            .map(|entry| entry.record)
            .collect()
    }

    /// Indexes on `table_id` that a writer whose snapshot is `snapshot` must
    /// maintain: exactly those that are ready in that snapshot.
    pub fn maintained_indexes(
        &self,
        table_id: TableId,
        snapshot: Snapshot,
    ) -> Vec<IndexCatalogRecord> {
        self.catalog
            .indexes_for_table(table_id, snapshot)
            .into_iter()
            .filter(|entry| entry.record.is_ready())
            .map(|entry| entry.record)
            .collect()
    }
}

fn usable_at(entry: &IndexCatalogEntry, snapshot: Snapshot) -> bool {
    entry.record.is_valid() && (!entry.record.check_xmin || snapshot.xmin >= entry.committed_at)
}
