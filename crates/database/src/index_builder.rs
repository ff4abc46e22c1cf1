//! Building and retiring indexes on live tables without blocking writers.
//!
//! A concurrent build moves an index through
//! `Building -> Ready -> (wait) -> Validating -> Valid`:
//!
//! 1. The catalog record is created in its own commit, so every later
//!    snapshot knows the index exists.
//! 2. The table is scanned at a snapshot and storage populated. Then
//!    `indisready` is set in its own commit. Every transaction that begins
//!    after that commit maintains the index on write.
//! 3. We wait until every transaction that began before the ready commit has
//!    finished. After this point no running writer can skip the index.
//! 4. The table is scanned again at a fresh snapshot and every missing entry
//!    is inserted. This catches rows written by transactions that were
//!    already running when the ready flag flipped.
//! 5. `indisvalid` is set in its own commit. From then on the planner gate
//!    lets queries read the index.
//!
//! Any failure or cancellation in steps 2-5 marks the record `Failed` (or
//! rolls it back entirely), so an incomplete index is never readable.
use std::{
    fmt,
    future::Future,
    sync::Arc,
};

use common::{
    backoff::Backoff,
    bootstrap_model::index::{
        IndexDefinition,
        IndexFlag,
        IndexPhase,
    },
    errors::report_error,
    knobs::{
        INDEX_BUILD_CHUNK_SIZE,
        INDEX_BUILD_ROLLBACK_ON_FAILURE,
        ORACLE_INITIAL_BACKOFF,
        ORACLE_MAX_BACKOFF,
        ORACLE_MAX_RETRIES,
        QUIESCENCE_POLL_INITIAL,
        QUIESCENCE_POLL_MAX,
    },
    pause::PauseClient,
    persistence::{
        IndexEntry,
        Persistence,
    },
    types::{
        IndexId,
        Snapshot,
        Timestamp,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use metrics::STATUS_CANCELED;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{
        index_not_found,
        BuildLease,
        IndexCatalog,
        IndexCreation,
    },
    metrics::{
        index_build_timer,
        log_index_build_completed,
        log_index_build_failed,
        log_index_build_started,
        log_index_dropped,
        log_index_entries_inserted,
        log_oracle_retry,
        quiescence_wait_timer,
        BuildInProgressGuard,
    },
    transaction_registry::TransactionOracle,
};

/// Breakpoint after each chunk of the initial build scan.
pub const BUILD_SCAN_CHUNK: &str = "index_build_scan_chunk";
/// Breakpoint before the ready flag is set.
pub const BEFORE_READY: &str = "index_build_before_ready";
/// Breakpoint after each chunk of the validation scan.
pub const VALIDATION_CHUNK: &str = "index_build_validation_chunk";
/// Breakpoint before the valid flag is set.
pub const BEFORE_VALID: &str = "index_build_before_valid";
/// Breakpoint before a concurrent drop removes the record.
pub const BEFORE_DROP: &str = "index_drop_before_remove";

#[derive(Clone, Debug)]
pub struct IndexBuildOptions {
    /// Return the existing index instead of failing with
    /// `DuplicateDefinition`.
    pub if_not_exists: bool,
    /// On failure remove the record and its storage instead of marking the
    /// record `Failed`.
    pub rollback_on_failure: bool,
    /// Rows per scan chunk.
    pub chunk_size: usize,
    pub cancel: CancellationToken,
}

impl Default for IndexBuildOptions {
    fn default() -> Self {
        Self {
            if_not_exists: false,
            rollback_on_failure: *INDEX_BUILD_ROLLBACK_ON_FAILURE,
            chunk_size: *INDEX_BUILD_CHUNK_SIZE,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a finished build did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub index_id: IndexId,
    /// `if_not_exists` found an identical index; nothing was built.
    pub already_existed: bool,
    pub rows_scanned: usize,
    pub entries_built: usize,
    pub rows_validated: usize,
    /// Entries the validation scan found missing and inserted.
    pub entries_added_by_validation: usize,
    pub ready_ts: Option<Timestamp>,
    pub valid_ts: Option<Timestamp>,
    pub check_xmin: bool,
}

impl BuildReport {
    fn new(index_id: IndexId) -> Self {
        Self {
            index_id,
            already_existed: false,
            rows_scanned: 0,
            entries_built: 0,
            rows_validated: 0,
            entries_added_by_validation: 0,
            ready_ts: None,
            valid_ts: None,
            check_xmin: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ScanPhase {
    Build,
    Validate,
}

impl ScanPhase {
    fn label(&self) -> &'static str {
        match self {
            ScanPhase::Build => "build",
            ScanPhase::Validate => "validate",
        }
    }

    fn chunk_breakpoint(&self) -> &'static str {
        match self {
            ScanPhase::Build => BUILD_SCAN_CHUNK,
            ScanPhase::Validate => VALIDATION_CHUNK,
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPhase::Build => write!(f, "Build scan"),
            ScanPhase::Validate => write!(f, "Validation scan"),
        }
    }
}

fn canceled(index_id: IndexId) -> ErrorMetadata {
    ErrorMetadata::build_aborted(
        "IndexBuildCanceled",
        format!("Work on {index_id} was canceled"),
    )
}

fn check_canceled(index_id: IndexId, cancel: &CancellationToken) -> anyhow::Result<()> {
    if cancel.is_cancelled() {
        anyhow::bail!(canceled(index_id));
    }
    Ok(())
}

/// Runs concurrent builds and concurrent drops.
#[derive(Clone)]
pub struct ConcurrentIndexBuilder {
    catalog: Arc<IndexCatalog>,
    persistence: Arc<dyn Persistence>,
    oracle: Arc<dyn TransactionOracle>,
    pause_client: PauseClient,
}

impl ConcurrentIndexBuilder {
    pub fn new(
        catalog: Arc<IndexCatalog>,
        persistence: Arc<dyn Persistence>,
        oracle: Arc<dyn TransactionOracle>,
        pause_client: PauseClient,
    ) -> Self {
        Self {
            catalog,
            persistence,
            oracle,
            pause_client,
        }
    }

    /// Build an index on a live table. Returns once the index is valid, or
    /// with `BuildAborted`/`OracleUnavailable` after taking the failure path.
    pub async fn build(
        &self,
        definition: IndexDefinition,
        options: IndexBuildOptions,
    ) -> anyhow::Result<BuildReport> {
        let num_columns = self.persistence.table_columns(definition.table_id).await?;
        definition.validate_for_table(num_columns)?;
        let lease = match self
            .catalog
            .create(definition.clone(), options.if_not_exists)
            .await?
        {
            IndexCreation::Created(lease) => lease,
            IndexCreation::AlreadyExists(index_id) => {
                return Ok(BuildReport {
                    already_existed: true,
                    ..BuildReport::new(index_id)
                });
            },
        };
        let index_id = lease.index_id();
        log_index_build_started();
        let _in_progress = BuildInProgressGuard::new();
        let timer = index_build_timer();
        tracing::info!(
            "Starting concurrent build of {index_id} on {}",
            definition.table_id
        );

        let mut report = BuildReport::new(index_id);
        match self
            .run_phases(index_id, &definition, &options, &mut report)
            .await
        {
            Ok(()) => {
                let elapsed = timer.finish();
                log_index_build_completed();
                tracing::info!(
                    "{index_id} is valid after {elapsed:?}: {} rows scanned, {} entries built, {} \
                     added by validation",
                    report.rows_scanned,
                    report.entries_built,
                    report.entries_added_by_validation
                );
                Ok(report)
            },
            Err(e) => {
                if options.cancel.is_cancelled() {
                    timer.finish_with(STATUS_CANCELED);
                }
                Err(self.fail_build(lease, &options, e).await)
            },
        }
    }

    async fn run_phases(
        &self,
        index_id: IndexId,
        definition: &IndexDefinition,
        options: &IndexBuildOptions,
        report: &mut BuildReport,
    ) -> anyhow::Result<()> {
        let cancel = &options.cancel;
        self.persistence.create_index_storage(index_id).await?;

        // Building: the record is visible, writers don't maintain it yet.
        let snapshot = self
            .oracle_call("current_snapshot", index_id, cancel, || {
                self.oracle.current_snapshot()
            })
            .await?;
        tracing::info!("Building {index_id} from snapshot {snapshot}");
        let (scanned, inserted) = self
            .populate(index_id, definition, snapshot, options, ScanPhase::Build)
            .await?;
        report.rows_scanned = scanned;
        report.entries_built = inserted;
        if definition.is_unique {
            self.check_unique(index_id, definition, snapshot).await?;
        }
        self.pause_client.wait(BEFORE_READY).await.into_result()?;
        check_canceled(index_id, cancel)?;

        // Ready: writers that begin from here on maintain the index.
        let ready_ts = self
            .catalog
            .set_flag(index_id, IndexFlag::Ready, true)
            .await?;
        report.ready_ts = Some(ready_ts);

        // WaitOlderTxns: writers that missed the ready flag must finish.
        self.wait_for_older_transactions(index_id, ready_ts, cancel)
            .await?;

        // Validating: pick up rows those writers committed.
        let snapshot = self
            .oracle_call("current_snapshot", index_id, cancel, || {
                self.oracle.current_snapshot()
            })
            .await?;
        tracing::info!("Validating {index_id} at snapshot {snapshot}");
        let (scanned, inserted) = self
            .populate(index_id, definition, snapshot, options, ScanPhase::Validate)
            .await?;
        report.rows_validated = scanned;
        report.entries_added_by_validation = inserted;
        if definition.is_unique {
            // Writers that committed during validation checked their keys
            // before validation inserted the entries of older rows. Hold
            // commits so every such writer is visible and any later one
            // sees the complete index.
            let commits = self.catalog.hold_commits().await?;
            self.check_unique(index_id, definition, commits.snapshot()?)
                .await?;
        }
        self.pause_client.wait(BEFORE_VALID).await.into_result()?;
        check_canceled(index_id, cancel)?;

        // Valid. Transactions already running when the index turns valid
        // may still take statement snapshots with an older xmin; make the
        // gate check for them.
        let latest = self
            .oracle_call("current_snapshot", index_id, cancel, || {
                self.oracle.current_snapshot()
            })
            .await?;
        let mark = latest.read_ts.succ()?;
        let check_xmin = self
            .oracle_call("has_active_transactions_started_before", index_id, cancel, || {
                self.oracle.has_active_transactions_started_before(mark)
            })
            .await?;
        if check_xmin {
            self.catalog
                .set_flag(index_id, IndexFlag::CheckXmin, true)
                .await?;
        }
        let valid_ts = self
            .catalog
            .set_flag(index_id, IndexFlag::Valid, true)
            .await?;
        report.valid_ts = Some(valid_ts);
        report.check_xmin = check_xmin;
        Ok(())
    }

    /// Scan the table at `snapshot` and insert an entry for every visible
    /// row the index covers. Returns `(rows scanned, entries inserted)`.
    async fn populate(
        &self,
        index_id: IndexId,
        definition: &IndexDefinition,
        snapshot: Snapshot,
        options: &IndexBuildOptions,
        phase: ScanPhase,
    ) -> anyhow::Result<(usize, usize)> {
        let chunk_size = options.chunk_size.max(1);
        let mut cursor = None;
        let mut scanned = 0;
        let mut inserted = 0;
        loop {
            check_canceled(index_id, &options.cancel)?;
            let rows = self
                .persistence
                .scan_table(definition.table_id, snapshot, cursor, chunk_size)
                .await?;
            let Some(last) = rows.last() else {
                break;
            };
            cursor = Some(last.id);
            let exhausted = rows.len() < chunk_size;
            scanned += rows.len();

            let mut entries = Vec::with_capacity(rows.len());
            for row in rows {
                let key = definition.key_for_row(&row.values).map_err(|e| {
                    let msg = format!("Couldn't compute the key of {} for {index_id}: {e}", row.id);
                    e.context(ErrorMetadata::build_aborted("IndexExpressionError", msg))
                })?;
                if let Some(key) = key {
                    entries.push(IndexEntry {
                        key,
                        row_id: row.id,
                    });
                }
            }
            let count = self
                .persistence
                .insert_index_entries(index_id, entries)
                .await?;
            inserted += count;
            log_index_entries_inserted(phase.label(), count);
            self.pause_client
                .wait(phase.chunk_breakpoint())
                .await
                .into_result()?;
            if exhausted {
                break;
            }
        }
        tracing::info!("{phase} of {index_id} covered {scanned} rows and inserted {inserted} entries");
        Ok((scanned, inserted))
    }

    /// Fail if two rows visible at `snapshot` share a key. NULLs never
    /// collide.
    async fn check_unique(
        &self,
        index_id: IndexId,
        definition: &IndexDefinition,
        snapshot: Snapshot,
    ) -> anyhow::Result<()> {
        let entries = self
            .persistence
            .scan_index(index_id, definition.table_id, snapshot)
            .await?;
        for pair in entries.windows(2) {
            let ((key, first), (other_key, second)) = (&pair[0], &pair[1]);
            if key == other_key && !key.has_null() {
                anyhow::bail!(ErrorMetadata::build_aborted(
                    "UniqueViolation",
                    format!(
                        "Could not create unique {index_id}: key {key} is duplicated by {} and {}",
                        first.id, second.id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Block until no transaction that began before `mark` is running.
    async fn wait_for_older_transactions(
        &self,
        index_id: IndexId,
        mark: Timestamp,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let timer = quiescence_wait_timer();
        let mut backoff = Backoff::new(*QUIESCENCE_POLL_INITIAL, *QUIESCENCE_POLL_MAX)
            .with_floor(*QUIESCENCE_POLL_INITIAL);
        loop {
            let busy = self
                .oracle_call("has_active_transactions_started_before", index_id, cancel, || {
                    self.oracle.has_active_transactions_started_before(mark)
                })
                .await?;
            if !busy {
                let elapsed = timer.finish();
                tracing::info!("Transactions older than {mark} finished after {elapsed:?}");
                return Ok(());
            }
            let delay = backoff.fail(&mut rand::rng());
            if backoff.failures() == 1 {
                tracing::info!("{index_id} waiting for transactions older than {mark}");
            }
            select! {
                _ = cancel.cancelled() => {
                    timer.finish_with(STATUS_CANCELED);
                    anyhow::bail!(canceled(index_id));
                },
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    /// Call the oracle, retrying transient failures with backoff. After
    /// `ORACLE_MAX_RETRIES` retries the error surfaces as
    /// `OracleUnavailable`.
    async fn oracle_call<T, F, Fut>(
        &self,
        what: &'static str,
        index_id: IndexId,
        cancel: &CancellationToken,
        mut call: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut backoff = Backoff::new(*ORACLE_INITIAL_BACKOFF, *ORACLE_MAX_BACKOFF);
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if backoff.failures() < *ORACLE_MAX_RETRIES => {
                    let delay = backoff.fail(&mut rand::rng());
                    log_oracle_retry();
                    tracing::warn!(
                        "Oracle call {what} for {index_id} failed (attempt {}), retrying in \
                         {delay:?}: {e:#}",
                        backoff.failures()
                    );
                    select! {
                        _ = cancel.cancelled() => anyhow::bail!(canceled(index_id)),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                Err(e) => {
                    let msg = format!(
                        "Transaction oracle call {what} failed {} times",
                        backoff.failures() + 1
                    );
                    return Err(if e.is_oracle_unavailable() {
                        e.wrap_error_message(|inner| format!("{msg}: {inner}"))
                    } else {
                        e.context(ErrorMetadata::oracle_unavailable(msg))
                    });
                },
            }
        }
    }

    async fn fail_build(
        &self,
        lease: BuildLease,
        options: &IndexBuildOptions,
        mut err: anyhow::Error,
    ) -> anyhow::Error {
        let index_id = lease.index_id();
        let rollback = options.rollback_on_failure;
        report_error(&mut err).await;

        let cleanup = if rollback {
            self.catalog.drop_leased(lease).await.map(|_| ())
        } else {
            let result = self.catalog.mark_failed(index_id).await.map(|_| ());
            drop(lease);
            result
        };
        log_index_build_failed(rollback);
        if let Err(cleanup_err) = cleanup {
            let mut cleanup_err =
                cleanup_err.context(format!("Failed to clean up after build of {index_id}"));
            report_error(&mut cleanup_err).await;
        }

        let advice = if rollback {
            "The index was rolled back. Retry the build."
        } else {
            "The index is marked invalid. Drop it and retry the build."
        };
        if err.is_oracle_unavailable() || err.is_build_aborted() {
            return err.wrap_error_message(|msg| format!("Building {index_id} failed: {msg}. {advice}"));
        }
        let msg = format!("Building {index_id} failed: {err:#}. {advice}");
        err.context(ErrorMetadata::build_aborted("IndexBuildFailed", msg))
    }

    /// Retire an index without blocking concurrent transactions: stop reads,
    /// wait, stop maintenance, wait, then remove the record and its storage.
    ///
    /// If interrupted the index is left not valid, and running the drop again
    /// picks up where it stopped.
    pub async fn drop_concurrently(
        &self,
        index_id: IndexId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let lease = self.catalog.lease(index_id)?;
        let entry = self
            .catalog
            .latest(index_id)
            .ok_or_else(|| index_not_found(index_id))?;
        self.retire(lease, entry.record.phase, &cancel).await.map_err(|e| {
            let phase = self
                .catalog
                .latest(index_id)
                .map(|entry| entry.record.phase.to_string())
                .unwrap_or_else(|| "unknown".to_owned());
            e.context(ErrorMetadata::invalid_index_state(
                "IndexDropInterrupted",
                format!(
                    "Dropping {index_id} was interrupted in phase {phase}. Run the drop again."
                ),
            ))
        })
    }

    async fn retire(
        &self,
        lease: BuildLease,
        mut phase: IndexPhase,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let index_id = lease.index_id();
        tracing::info!("Dropping {index_id} concurrently from phase {phase}");
        if phase == IndexPhase::Valid {
            let ts = self
                .catalog
                .set_flag(index_id, IndexFlag::Valid, false)
                .await?;
            self.wait_for_older_transactions(index_id, ts, cancel)
                .await?;
            phase = IndexPhase::Ready;
        }
        if phase == IndexPhase::Ready {
            let ts = self
                .catalog
                .set_flag(index_id, IndexFlag::Ready, false)
                .await?;
            self.wait_for_older_transactions(index_id, ts, cancel)
                .await?;
        }
        self.pause_client.wait(BEFORE_DROP).await.into_result()?;
        self.catalog.drop_leased(lease).await?;
        log_index_dropped(true);
        tracing::info!("Dropped {index_id} concurrently");
        Ok(())
    }
}
