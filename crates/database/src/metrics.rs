use metrics::{
    log_counter,
    log_counter_with_labels,
    log_gauge,
    register_catalog_counter,
    register_catalog_gauge,
    register_catalog_histogram,
    StatusTimer,
    STATUS_LABEL,
};

register_catalog_counter!(
    INDEX_BUILDS_STARTED_TOTAL,
    "Number of concurrent index builds started"
);
pub fn log_index_build_started() {
    log_counter(&INDEX_BUILDS_STARTED_TOTAL, 1);
}

register_catalog_counter!(
    INDEX_BUILDS_COMPLETED_TOTAL,
    "Number of concurrent index builds that reached Valid"
);
pub fn log_index_build_completed() {
    log_counter(&INDEX_BUILDS_COMPLETED_TOTAL, 1);
}

register_catalog_counter!(
    INDEX_BUILDS_FAILED_TOTAL,
    "Number of concurrent index builds that failed, by outcome",
    &["outcome"]
);
pub fn log_index_build_failed(rolled_back: bool) {
    let outcome = if rolled_back { "rolled_back" } else { "marked_failed" };
    log_counter_with_labels(&INDEX_BUILDS_FAILED_TOTAL, 1, &[outcome]);
}

register_catalog_gauge!(
    INDEX_BUILDS_IN_PROGRESS_TOTAL,
    "Number of concurrent index builds currently running"
);

/// Counts a build as in progress until dropped.
pub struct BuildInProgressGuard(());

impl BuildInProgressGuard {
    pub fn new() -> Self {
        INDEX_BUILDS_IN_PROGRESS_TOTAL.inc();
        Self(())
    }
}

impl Drop for BuildInProgressGuard {
    fn drop(&mut self) {
        INDEX_BUILDS_IN_PROGRESS_TOTAL.dec();
    }
}

register_catalog_histogram!(
    INDEX_BUILD_SECONDS,
    "Time to build an index concurrently, from create to valid",
    &STATUS_LABEL
);
pub fn index_build_timer() -> StatusTimer {
    StatusTimer::new(&INDEX_BUILD_SECONDS)
}

register_catalog_histogram!(
    INDEX_QUIESCENCE_WAIT_SECONDS,
    "Time spent waiting for transactions older than a phase change to finish",
    &STATUS_LABEL
);
pub fn quiescence_wait_timer() -> StatusTimer {
    StatusTimer::new(&INDEX_QUIESCENCE_WAIT_SECONDS)
}

register_catalog_counter!(
    INDEX_BUILD_INSERTED_ENTRIES,
    "Index entries inserted by builds, by phase",
    &["phase"]
);
pub fn log_index_entries_inserted(phase: &'static str, count: usize) {
    log_counter_with_labels(&INDEX_BUILD_INSERTED_ENTRIES, count as u64, &[phase]);
}

register_catalog_counter!(
    INDEX_ORACLE_RETRIES_TOTAL,
    "Transaction oracle calls retried after a transient failure"
);
pub fn log_oracle_retry() {
    log_counter(&INDEX_ORACLE_RETRIES_TOTAL, 1);
}

register_catalog_counter!(
    INDEX_DROPS_TOTAL,
    "Number of indexes dropped, by mode",
    &["mode"]
);
pub fn log_index_dropped(concurrently: bool) {
    let mode = if concurrently { "concurrent" } else { "immediate" };
    log_counter_with_labels(&INDEX_DROPS_TOTAL, 1, &[mode]);
}

register_catalog_counter!(
    COMMITTED_TRANSACTIONS_TOTAL,
    "Number of writer transactions committed"
);
pub fn log_transaction_committed() {
    log_counter(&COMMITTED_TRANSACTIONS_TOTAL, 1);
}

register_catalog_counter!(
    UNIQUE_VIOLATIONS_TOTAL,
    "Writer commits rejected by a unique index"
);
pub fn log_unique_violation() {
    log_counter(&UNIQUE_VIOLATIONS_TOTAL, 1);
}

register_catalog_counter!(
    CATALOG_VERSIONS_PRUNED_TOTAL,
    "Catalog record versions pruned by maintenance"
);
pub fn log_catalog_versions_pruned(count: usize) {
    log_counter(&CATALOG_VERSIONS_PRUNED_TOTAL, count as u64);
}

register_catalog_gauge!(
    ACTIVE_TRANSACTIONS_TOTAL,
    "Number of running transactions at the last maintenance pass"
);
pub fn log_active_transactions(count: usize) {
    log_gauge(&ACTIVE_TRANSACTIONS_TOTAL, count as f64);
}
