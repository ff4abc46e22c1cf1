use std::sync::Arc;

use common::{
    bootstrap_model::index::IndexDefinition,
    pause::PauseClient,
    persistence::Persistence,
    types::{
        IndexId,
        Snapshot,
        TableId,
        Timestamp,
    },
};
use errors::ErrorMetadata;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::IndexCatalog,
    index_builder::{
        BuildReport,
        ConcurrentIndexBuilder,
        IndexBuildOptions,
    },
    maintenance::IndexMaintenance,
    metrics::log_index_dropped,
    planner_gate::PlannerGate,
    transaction::Transaction,
    transaction_registry::{
        TransactionOracle,
        TransactionRegistry,
    },
};

/// Handle to the tables, the index catalog and the transactions running
/// against them. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    registry: Arc<TransactionRegistry>,
    catalog: Arc<IndexCatalog>,
    persistence: Arc<dyn Persistence>,
    pause_client: PauseClient,
}

impl Database {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::new_with_pause_client(persistence, PauseClient::new())
    }

    /// A database whose index builds and drops park at the breakpoints
    /// registered on `pause_client`.
    pub fn new_with_pause_client(
        persistence: Arc<dyn Persistence>,
        pause_client: PauseClient,
    ) -> Self {
        let registry = Arc::new(TransactionRegistry::new());
        let catalog = Arc::new(IndexCatalog::new(registry.clone(), persistence.clone()));
        tracing::info!("Loaded database");
        Self {
            registry,
            catalog,
            persistence,
            pause_client,
        }
    }

    pub async fn create_table(&self, num_columns: usize) -> anyhow::Result<TableId> {
        if num_columns == 0 {
            anyhow::bail!(ErrorMetadata::bad_request(
                "EmptyTable",
                "A table needs at least one column"
            ));
        }
        let table_id = self.registry.next_table_id();
        self.persistence
            .create_table(table_id, num_columns)
            .await?;
        tracing::info!("Created {table_id} with {num_columns} columns");
        Ok(table_id)
    }

    pub fn begin(&self) -> Transaction {
        Transaction::begin(
            self.registry.clone(),
            self.catalog.clone(),
            self.persistence.clone(),
        )
    }

    pub fn catalog(&self) -> &Arc<IndexCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        self.registry.latest_snapshot()
    }

    pub fn planner_gate(&self) -> PlannerGate {
        PlannerGate::new(self.catalog.clone())
    }

    pub fn index_builder(&self) -> ConcurrentIndexBuilder {
        self.index_builder_with_oracle(self.registry.clone())
    }

    /// A builder that asks `oracle` about snapshots and running
    /// transactions instead of this database's registry.
    pub fn index_builder_with_oracle(
        &self,
        oracle: Arc<dyn TransactionOracle>,
    ) -> ConcurrentIndexBuilder {
        ConcurrentIndexBuilder::new(
            self.catalog.clone(),
            self.persistence.clone(),
            oracle,
            self.pause_client.clone(),
        )
    }

    pub fn maintenance(&self) -> IndexMaintenance {
        IndexMaintenance::new(self.catalog.clone(), self.registry.clone())
    }

    pub async fn build_index_concurrently(
        &self,
        definition: IndexDefinition,
        options: IndexBuildOptions,
    ) -> anyhow::Result<BuildReport> {
        self.index_builder().build(definition, options).await
    }

    /// Drop an index immediately, in any phase, unless a build or
    /// concurrent drop owns it.
    pub async fn drop_index(&self, index_id: IndexId) -> anyhow::Result<Timestamp> {
        let ts = self.catalog.drop_index(index_id).await?;
        log_index_dropped(false);
        Ok(ts)
    }

    pub async fn drop_index_concurrently(
        &self,
        index_id: IndexId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.index_builder()
            .drop_concurrently(index_id, cancel)
            .await
    }

    pub async fn set_clustered(
        &self,
        table_id: TableId,
        index_id: IndexId,
    ) -> anyhow::Result<Timestamp> {
        self.catalog.set_clustered(table_id, index_id).await
    }
}
