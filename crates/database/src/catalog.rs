use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use common::{
    bootstrap_model::index::{
        IndexCatalogRecord,
        IndexDefinition,
        IndexFlag,
        IndexPhase,
    },
    persistence::Persistence,
    types::{
        IndexId,
        Snapshot,
        TableId,
        Timestamp,
    },
};
use errors::ErrorMetadata;
use parking_lot::{
    Mutex,
    RwLock,
};

use crate::{
    metrics::log_catalog_versions_pruned,
    transaction_registry::{
        CommitGuard,
        TransactionRegistry,
    },
};

/// A catalog record as seen by some snapshot, with the timestamp of the
/// commit that produced this version of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexCatalogEntry {
    pub record: IndexCatalogRecord,
    pub committed_at: Timestamp,
}

/// Result of `IndexCatalog::create`.
#[derive(Debug)]
pub enum IndexCreation {
    /// The new record, leased to the caller from the moment it's published.
    Created(BuildLease),
    /// An identical definition already existed and `if_not_exists` was set.
    AlreadyExists(IndexId),
}

impl IndexCreation {
    pub fn index_id(&self) -> IndexId {
        match self {
            IndexCreation::Created(lease) => lease.index_id(),
            IndexCreation::AlreadyExists(id) => *id,
        }
    }
}

/// Exclusive claim on an index held by the session building or retiring it.
/// Ordinary drops of a leased index fail with `InvalidIndexState`.
#[derive(Debug)]
pub struct BuildLease {
    index_id: IndexId,
    leases: Arc<Mutex<BTreeSet<IndexId>>>,
}

impl BuildLease {
    pub fn index_id(&self) -> IndexId {
        self.index_id
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.index_id);
    }
}

/// Multi-versioned store of index catalog records.
///
/// Every mutation is its own committed unit of work: it takes the commit
/// lock, appends a new version at a fresh timestamp and publishes it before
/// returning. Readers pick the newest version at or below their snapshot,
/// so a flag flip becomes visible to new snapshots as soon as it returns,
/// independently of any long-running build.
pub struct IndexCatalog {
    registry: Arc<TransactionRegistry>,
    persistence: Arc<dyn Persistence>,
    state: RwLock<CatalogState>,
    leases: Arc<Mutex<BTreeSet<IndexId>>>,
}

#[derive(Default)]
struct CatalogState {
    next_index_id: u64,
    /// Versions in increasing timestamp order. `None` marks a drop.
    versions: BTreeMap<IndexId, Vec<(Timestamp, Option<IndexCatalogRecord>)>>,
}

impl CatalogState {
    fn latest(&self, index_id: IndexId) -> Option<&IndexCatalogRecord> {
        self.versions.get(&index_id)?.last()?.1.as_ref()
    }

    fn at(&self, index_id: IndexId, snapshot: Snapshot) -> Option<IndexCatalogEntry> {
        let (committed_at, record) = self
            .versions
            .get(&index_id)?
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= snapshot.read_ts)?;
        Some(IndexCatalogEntry {
            record: record.clone()?,
            committed_at: *committed_at,
        })
    }

    fn latest_records(&self) -> impl Iterator<Item = &IndexCatalogRecord> {
        self.versions
            .values()
            .filter_map(|versions| versions.last()?.1.as_ref())
    }

    fn require_latest(&self, index_id: IndexId) -> anyhow::Result<&IndexCatalogRecord> {
        self.latest(index_id)
            .ok_or_else(|| index_not_found(index_id).into())
    }

    fn push(&mut self, ts: Timestamp, index_id: IndexId, record: Option<IndexCatalogRecord>) {
        self.versions.entry(index_id).or_default().push((ts, record));
    }
}

pub fn index_not_found(index_id: IndexId) -> ErrorMetadata {
    ErrorMetadata::not_found("IndexNotFound", format!("{index_id} doesn't exist"))
}

fn index_build_in_progress(index_id: IndexId) -> ErrorMetadata {
    ErrorMetadata::invalid_index_state(
        "IndexBuildInProgress",
        format!(
            "{index_id} is owned by a concurrent build or drop. Cancel that operation or wait \
             for it to finish."
        ),
    )
}

impl IndexCatalog {
    pub fn new(registry: Arc<TransactionRegistry>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            registry,
            persistence,
            state: RwLock::new(CatalogState {
                next_index_id: 1,
                ..Default::default()
            }),
            leases: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Insert a record in phase `Building` as its own committed unit. The
    /// record is leased to the caller before it's published, so no ordinary
    /// drop can slip in before the build starts. Dropping the returned
    /// `IndexCreation` releases the lease.
    pub async fn create(
        &self,
        definition: IndexDefinition,
        if_not_exists: bool,
    ) -> anyhow::Result<IndexCreation> {
        definition.validate()?;
        let commit = self.registry.begin_commit().await?;
        let lease = {
            let mut state = self.state.write();
            if let Some(existing) = state.latest_records().find(|r| r.definition == definition) {
                let existing = existing.index_id;
                if if_not_exists {
                    tracing::info!("Identical index {existing} already exists, skipping");
                    return Ok(IndexCreation::AlreadyExists(existing));
                }
                anyhow::bail!(ErrorMetadata::duplicate_definition(
                    "IndexAlreadyExists",
                    format!(
                        "{existing} on {} already has this definition",
                        definition.table_id
                    ),
                ));
            }
            let index_id = IndexId::new(state.next_index_id);
            state.next_index_id += 1;
            let record = IndexCatalogRecord::new(index_id, definition);
            state.push(commit.ts(), index_id, Some(record));
            self.lease(index_id)?
        };
        let ts = commit.publish();
        tracing::info!("Created catalog record for {} at {ts}", lease.index_id());
        Ok(IndexCreation::Created(lease))
    }

    /// Update exactly one phase flag as its own committed unit. Returns the
    /// commit timestamp.
    pub async fn set_flag(
        &self,
        index_id: IndexId,
        flag: IndexFlag,
        value: bool,
    ) -> anyhow::Result<Timestamp> {
        self.update(index_id, |record| {
            match flag {
                IndexFlag::CheckXmin => record.check_xmin = value,
                IndexFlag::Ready | IndexFlag::Valid => {
                    record.phase = record.phase.with_flag(flag, value)?;
                },
            }
            Ok(())
        })
        .await
        .inspect(|ts| tracing::info!("Set {flag}={value} on {index_id} at {ts}"))
    }

    /// Move a record that never became valid to `Failed`.
    pub async fn mark_failed(&self, index_id: IndexId) -> anyhow::Result<Timestamp> {
        self.update(index_id, |record| {
            if record.phase.is_valid() {
                anyhow::bail!(ErrorMetadata::invalid_index_state(
                    "IndexAlreadyValid",
                    format!("{index_id} is valid and can't be marked failed"),
                ));
            }
            record.phase = IndexPhase::Failed;
            Ok(())
        })
        .await
        .inspect(|ts| tracing::warn!("Marked {index_id} failed at {ts}"))
    }

    /// Mark `index_id` as the index its table is clustered on, clearing the
    /// mark on the table's other indexes in the same commit.
    pub async fn set_clustered(
        &self,
        table_id: TableId,
        index_id: IndexId,
    ) -> anyhow::Result<Timestamp> {
        let commit = self.registry.begin_commit().await?;
        {
            let mut state = self.state.write();
            let target = state.require_latest(index_id)?;
            if target.table_id() != table_id {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "IndexTableMismatch",
                    format!("{index_id} is not an index on {table_id}"),
                ));
            }
            if !target.is_valid() {
                anyhow::bail!(ErrorMetadata::invalid_index_state(
                    "IndexNotValid",
                    format!("Can't cluster on {index_id} because it isn't valid"),
                ));
            }
            let updates: Vec<_> = state
                .latest_records()
                .filter(|r| r.table_id() == table_id)
                .filter(|r| r.is_clustered != (r.index_id == index_id))
                .map(|r| {
                    let mut record = r.clone();
                    record.is_clustered = record.index_id == index_id;
                    record
                })
                .collect();
            for record in updates {
                state.push(commit.ts(), record.index_id, Some(record));
            }
        }
        Ok(commit.publish())
    }

    /// Remove the record and reclaim its storage. Any interior phase is fine
    /// as long as no build or concurrent drop owns the index.
    pub async fn drop_index(&self, index_id: IndexId) -> anyhow::Result<Timestamp> {
        if self.leases.lock().contains(&index_id) {
            anyhow::bail!(index_build_in_progress(index_id));
        }
        let ts = self.remove(index_id, false).await?;
        self.persistence.reclaim_index_storage(index_id).await?;
        Ok(ts)
    }

    /// Drop an index on behalf of the session that owns its lease.
    pub async fn drop_leased(&self, lease: BuildLease) -> anyhow::Result<Timestamp> {
        let index_id = lease.index_id();
        let ts = self.remove(index_id, true).await?;
        drop(lease);
        self.persistence.reclaim_index_storage(index_id).await?;
        Ok(ts)
    }

    async fn remove(&self, index_id: IndexId, leased: bool) -> anyhow::Result<Timestamp> {
        let commit = self.registry.begin_commit().await?;
        {
            let mut state = self.state.write();
            // Recheck under the commit lock so a build can't start in between.
            if !leased && self.leases.lock().contains(&index_id) {
                anyhow::bail!(index_build_in_progress(index_id));
            }
            state.require_latest(index_id)?;
            state.push(commit.ts(), index_id, None);
        }
        let ts = commit.publish();
        tracing::info!("Dropped catalog record for {index_id} at {ts}");
        Ok(ts)
    }

    /// Block every commit, catalog changes included, until the guard drops.
    /// Nothing is published through the guard.
    pub async fn hold_commits(&self) -> anyhow::Result<CommitGuard<'_>> {
        self.registry.begin_commit().await
    }

    pub fn lease(&self, index_id: IndexId) -> anyhow::Result<BuildLease> {
        if !self.leases.lock().insert(index_id) {
            anyhow::bail!(index_build_in_progress(index_id));
        }
        Ok(BuildLease {
            index_id,
            leases: self.leases.clone(),
        })
    }

    pub fn is_leased(&self, index_id: IndexId) -> bool {
        self.leases.lock().contains(&index_id)
    }

    /// The version of the record visible at `snapshot`, or `None` if the
    /// index doesn't exist there.
    pub fn read(&self, index_id: IndexId, snapshot: Snapshot) -> Option<IndexCatalogEntry> {
        self.state.read().at(index_id, snapshot)
    }

    /// Like `read`, failing with `NotFound` if the index doesn't exist.
    pub fn require(&self, index_id: IndexId, snapshot: Snapshot) -> anyhow::Result<IndexCatalogEntry> {
        self.read(index_id, snapshot)
            .ok_or_else(|| index_not_found(index_id).into())
    }

    pub fn latest(&self, index_id: IndexId) -> Option<IndexCatalogEntry> {
        self.read(index_id, self.registry.latest_snapshot())
    }

    /// Every index on `table_id` visible at `snapshot`, in id order.
    pub fn indexes_for_table(&self, table_id: TableId, snapshot: Snapshot) -> Vec<IndexCatalogEntry> {
        let state = self.state.read();
        state
            .versions
            .keys()
            .filter_map(|index_id| state.at(*index_id, snapshot))
            .filter(|entry| entry.record.table_id() == table_id)
            .collect()
    }

    /// Every index visible at `snapshot`.
    pub fn all_indexes(&self, snapshot: Snapshot) -> Vec<IndexCatalogEntry> {
        let state = self.state.read();
        state
            .versions
            .keys()
            .filter_map(|index_id| state.at(*index_id, snapshot))
            .collect()
    }

    /// Every committed version of a record, oldest first.
    pub fn history(&self, index_id: IndexId) -> Vec<(Timestamp, Option<IndexCatalogRecord>)> {
        self.state
            .read()
            .versions
            .get(&index_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget versions no snapshot at or after `horizon` can read. Returns
    /// how many versions were removed.
    pub fn prune_versions(&self, horizon: Timestamp) -> usize {
        let mut state = self.state.write();
        let mut pruned = 0;
        state.versions.retain(|_, versions| {
            // Keep the newest version at or below the horizon plus everything
            // newer.
            let visible_at_horizon = versions.iter().rposition(|(ts, _)| *ts <= horizon);
            if let Some(keep_from) = visible_at_horizon {
                pruned += keep_from;
                versions.drain(..keep_from);
                if versions.len() == 1 && versions[0].1.is_none() {
                    pruned += 1;
                    return false;
                }
            }
            true
        });
        if pruned > 0 {
            tracing::debug!("Pruned {pruned} catalog versions below {horizon}");
            log_catalog_versions_pruned(pruned);
        }
        pruned
    }

    async fn update(
        &self,
        index_id: IndexId,
        f: impl FnOnce(&mut IndexCatalogRecord) -> anyhow::Result<()>,
    ) -> anyhow::Result<Timestamp> {
        let commit = self.registry.begin_commit().await?;
        {
            let mut state = self.state.write();
            let mut record = state.require_latest(index_id)?.clone();
            f(&mut record)?;
            state.push(commit.ts(), index_id, Some(record));
        }
        Ok(commit.publish())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        bootstrap_model::index::{
            IndexColumn,
            IndexDefinition,
            IndexFlag,
            IndexPhase,
        },
        persistence::InMemoryPersistence,
        types::{
            OperatorClassId,
            Snapshot,
            TableId,
            Timestamp,
        },
    };
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;

    use super::{
        IndexCatalog,
        IndexCreation,
    };
    use crate::transaction_registry::TransactionRegistry;

    fn catalog() -> IndexCatalog {
        IndexCatalog::new(
            Arc::new(TransactionRegistry::new()),
            Arc::new(InMemoryPersistence::new()),
        )
    }

    fn definition(attnum: i16) -> IndexDefinition {
        IndexDefinition::new(
            TableId::new(1),
            vec![IndexColumn::column(attnum, OperatorClassId::new(1))],
        )
    }

    #[tokio::test]
    async fn test_duplicate_definitions() -> anyhow::Result<()> {
        let catalog = catalog();
        let id = catalog.create(definition(1), false).await?.index_id();
        let err = catalog.create(definition(1), false).await.unwrap_err();
        assert!(err.is_duplicate_definition());
        assert!(matches!(
            catalog.create(definition(1), true).await?,
            IndexCreation::AlreadyExists(existing) if existing == id
        ));
        // A different definition on the same table is fine.
        assert!(matches!(
            catalog.create(definition(2), false).await?,
            IndexCreation::Created(_)
        ));
        // Dropping frees the definition.
        catalog.drop_index(id).await?;
        assert!(matches!(
            catalog.create(definition(1), false).await?,
            IndexCreation::Created(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_reads_are_snapshot_consistent() -> anyhow::Result<()> {
        let catalog = catalog();
        let id = catalog.create(definition(1), false).await?.index_id();
        let created = catalog.latest(id).unwrap();
        assert_eq!(created.record.phase, IndexPhase::Building);

        let ready_ts = catalog.set_flag(id, IndexFlag::Ready, true).await?;
        let before = Snapshot::at(created.committed_at);
        assert_eq!(catalog.read(id, before).unwrap().record.phase, IndexPhase::Building);
        let after = catalog.read(id, Snapshot::at(ready_ts)).unwrap();
        assert_eq!(after.record.phase, IndexPhase::Ready);
        assert_eq!(after.committed_at, ready_ts);
        assert!(catalog.read(id, Snapshot::at(Timestamp::MIN)).is_none());

        let drop_ts = catalog.drop_index(id).await?;
        assert!(catalog.read(id, Snapshot::at(drop_ts)).is_none());
        assert!(catalog.read(id, Snapshot::at(ready_ts)).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_leased_index_cannot_be_dropped() -> anyhow::Result<()> {
        let catalog = catalog();
        let id = catalog.create(definition(1), false).await?.index_id();
        let lease = catalog.lease(id)?;
        assert!(catalog.lease(id).unwrap_err().is_invalid_index_state());
        let err = catalog.drop_index(id).await.unwrap_err();
        assert!(err.is_invalid_index_state());
        assert_eq!(err.short_msg(), "IndexBuildInProgress");
        drop(lease);
        catalog.drop_index(id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_created_index_is_leased_until_released() -> anyhow::Result<()> {
        let catalog = catalog();
        let created = catalog.create(definition(1), false).await?;
        let id = created.index_id();
        assert!(catalog.is_leased(id));
        // No window between the create commit and the lease for a drop.
        let err = catalog.drop_index(id).await.unwrap_err();
        assert!(err.is_invalid_index_state());
        assert_eq!(err.short_msg(), "IndexBuildInProgress");
        assert!(catalog.latest(id).is_some());

        let IndexCreation::Created(lease) = created else {
            panic!("expected a new index");
        };
        catalog.drop_leased(lease).await?;
        assert!(catalog.latest(id).is_none());
        assert!(!catalog.is_leased(id));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_clustered_moves_the_mark() -> anyhow::Result<()> {
        let catalog = catalog();
        let a = catalog.create(definition(1), false).await?.index_id();
        let b = catalog.create(definition(2), false).await?.index_id();
        for id in [a, b] {
            catalog.set_flag(id, IndexFlag::Ready, true).await?;
            catalog.set_flag(id, IndexFlag::Valid, true).await?;
        }
        catalog.set_clustered(TableId::new(1), a).await?;
        assert!(catalog.latest(a).unwrap().record.is_clustered);
        catalog.set_clustered(TableId::new(1), b).await?;
        assert!(!catalog.latest(a).unwrap().record.is_clustered);
        assert!(catalog.latest(b).unwrap().record.is_clustered);
        assert!(catalog.set_clustered(TableId::new(2), b).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_keeps_versions_visible_at_horizon() -> anyhow::Result<()> {
        let catalog = catalog();
        let id = catalog.create(definition(1), false).await?.index_id();
        let ready_ts = catalog.set_flag(id, IndexFlag::Ready, true).await?;
        let valid_ts = catalog.set_flag(id, IndexFlag::Valid, true).await?;
        assert_eq!(catalog.history(id).len(), 3);

        assert_eq!(catalog.prune_versions(ready_ts), 1);
        assert_eq!(
            catalog.read(id, Snapshot::at(ready_ts)).unwrap().record.phase,
            IndexPhase::Ready
        );
        assert_eq!(catalog.prune_versions(valid_ts), 1);
        assert_eq!(catalog.history(id).len(), 1);

        let drop_ts = catalog.drop_index(id).await?;
        assert_eq!(catalog.prune_versions(drop_ts), 2);
        assert!(catalog.history(id).is_empty());
        Ok(())
    }
}
