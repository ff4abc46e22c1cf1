use std::collections::BTreeSet;

use anyhow::Context;
use common::{
    bootstrap_model::index::{
        IndexCatalogRecord,
        IndexPhase,
    },
    types::{
        IndexId,
        RowId,
        Snapshot,
    },
};

use crate::Database;

/// The latest committed phase of `index_id`, failing if it was dropped.
pub fn latest_phase(db: &Database, index_id: IndexId) -> anyhow::Result<IndexPhase> {
    let entry = db
        .catalog()
        .latest(index_id)
        .with_context(|| format!("{index_id} doesn't exist"))?;
    Ok(entry.record.phase)
}

/// Every phase `index_id` has passed through, oldest first, with `None` for
/// a drop.
pub fn phase_history(db: &Database, index_id: IndexId) -> Vec<Option<IndexPhase>> {
    db.catalog()
        .history(index_id)
        .into_iter()
        .map(|(_, record)| record.map(|r| r.phase))
        .collect()
}

/// No committed version of `index_id` was ever valid without being ready,
/// and none was valid while failed.
pub fn assert_flag_history_legal(db: &Database, index_id: IndexId) {
    for (ts, record) in db.catalog().history(index_id) {
        let Some(record) = record else {
            continue;
        };
        let (ready, valid) = record.phase.legacy_flags();
        assert!(
            ready || !valid,
            "{index_id} was valid but not ready at {ts}"
        );
        let serialized = common::bootstrap_model::index::SerializedIndexCatalogRecord::try_from(
            record.clone(),
        )
        .expect("record serializes");
        let decoded = IndexCatalogRecord::try_from(serialized).expect("record decodes");
        assert_eq!(decoded, record);
    }
}

/// Rows reachable through `index_id` at `snapshot` are exactly the visible
/// heap rows the index covers, and come back in key order.
pub async fn assert_index_matches_heap(
    db: &Database,
    index_id: IndexId,
    snapshot: Snapshot,
) -> anyhow::Result<()> {
    let record = db.catalog().require(index_id, snapshot)?.record;
    let table_id = record.table_id();
    let entries = db
        .persistence()
        .scan_index(index_id, table_id, snapshot)
        .await?;
    let keys: Vec<_> = entries.iter().map(|(key, _)| key.clone()).collect();
    let mut sorted_keys = keys.clone();
    sorted_keys.sort();
    assert_eq!(keys, sorted_keys, "{index_id} scan is out of key order");

    let from_index: Vec<RowId> = entries.iter().map(|(_, row)| row.id).collect();
    let unique_from_index: BTreeSet<RowId> = from_index.iter().copied().collect();
    assert_eq!(
        from_index.len(),
        unique_from_index.len(),
        "{index_id} returned a row twice"
    );

    let mut from_heap = BTreeSet::new();
    for row in db
        .persistence()
        .scan_table(table_id, snapshot, None, usize::MAX)
        .await?
    {
        if record.definition.key_for_row(&row.values)?.is_some() {
            from_heap.insert(row.id);
        }
    }
    assert_eq!(unique_from_index, from_heap);
    Ok(())
}
