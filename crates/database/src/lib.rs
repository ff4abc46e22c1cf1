//! Index catalog, transactions and the concurrent index lifecycle.
//!
//! Indexes are built and retired on live tables without blocking writers.
//! See [`ConcurrentIndexBuilder`] for the build protocol and [`PlannerGate`]
//! for how readers and writers decide which indexes apply to them.

mod catalog;
mod database;
mod index_builder;
mod maintenance;
mod metrics;
mod planner_gate;
mod transaction;
mod transaction_registry;

#[cfg(any(test, feature = "testing"))]
pub mod test_helpers;
#[cfg(test)]
mod tests;

pub use self::{
    catalog::{
        index_not_found,
        BuildLease,
        IndexCatalog,
        IndexCatalogEntry,
        IndexCreation,
    },
    database::Database,
    index_builder::{
        BuildReport,
        ConcurrentIndexBuilder,
        IndexBuildOptions,
        BEFORE_DROP,
        BEFORE_READY,
        BEFORE_VALID,
        BUILD_SCAN_CHUNK,
        VALIDATION_CHUNK,
    },
    maintenance::{
        IndexMaintenance,
        MaintenanceReport,
    },
    planner_gate::PlannerGate,
    transaction::Transaction,
    transaction_registry::{
        CommitGuard,
        TransactionOracle,
        TransactionRegistry,
    },
};
