//! Background upkeep of the index catalog.
//!
//! Each pass clears `indcheckxmin` on indexes that no running transaction can
//! still see as not valid, then prunes catalog versions older than any view a
//! running transaction holds.
use std::sync::Arc;

use common::{
    backoff::Backoff,
    bootstrap_model::index::IndexFlag,
    errors::report_error,
    knobs::INDEX_MAINTENANCE_INTERVAL,
    types::IndexId,
};
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::IndexCatalog,
    metrics::log_active_transactions,
    transaction_registry::{
        TransactionOracle,
        TransactionRegistry,
    },
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub check_xmin_cleared: Vec<IndexId>,
    pub versions_pruned: usize,
}

#[derive(Clone)]
pub struct IndexMaintenance {
    catalog: Arc<IndexCatalog>,
    registry: Arc<TransactionRegistry>,
}

impl IndexMaintenance {
    pub fn new(catalog: Arc<IndexCatalog>, registry: Arc<TransactionRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub async fn run_once(&self) -> anyhow::Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let latest = self.registry.latest_snapshot();
        for entry in self.catalog.all_indexes(latest) {
            // Mid-build records keep the flag until the builder makes them
            // valid.
            if !entry.record.check_xmin || !entry.record.is_valid() {
                continue;
            }
            // Anything that began before this version's commit may still
            // take statement snapshots that predate the valid flag.
            if self
                .registry
                .has_active_transactions_started_before(entry.committed_at)
                .await?
            {
                continue;
            }
            let index_id = entry.record.index_id;
            self.catalog
                .set_flag(index_id, IndexFlag::CheckXmin, false)
                .await?;
            report.check_xmin_cleared.push(index_id);
        }

        let num_active = self.registry.num_active();
        log_active_transactions(num_active);
        let horizon = self
            .registry
            .oldest_active()
            .unwrap_or(self.registry.latest_snapshot().read_ts);
        report.versions_pruned = self.catalog.prune_versions(horizon);
        tracing::debug!(
            "Index maintenance: cleared check_xmin on {:?}, pruned {} versions, {num_active} \
             active transactions",
            report.check_xmin_cleared,
            report.versions_pruned
        );
        Ok(report)
    }

    /// Run passes every `INDEX_MAINTENANCE_INTERVAL` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Starting IndexMaintenance");
        let mut backoff = Backoff::new(*INDEX_MAINTENANCE_INTERVAL, *INDEX_MAINTENANCE_INTERVAL * 16);
        loop {
            let delay = match self.run_once().await {
                Ok(_) => {
                    backoff.reset();
                    *INDEX_MAINTENANCE_INTERVAL
                },
                Err(e) => {
                    let mut e = e.context("IndexMaintenance pass failed");
                    report_error(&mut e).await;
                    let delay = backoff.fail(&mut rand::rng());
                    tracing::error!(
                        "IndexMaintenance failed, num_failures: {}. Backing off for {}ms",
                        backoff.failures(),
                        delay.as_millis()
                    );
                    delay
                },
            };
            select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        tracing::info!("IndexMaintenance stopped");
    }
}
