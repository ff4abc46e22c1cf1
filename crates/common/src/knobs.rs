//! Tunable limits and parameters for the index catalog.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each one documents what it's for and its sane bounds so it can be
//! adjusted safely on a running deployment.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Number of table rows converted into index entries per storage call during
/// the initial build and the validation scan. Cancellation and fault
/// injection are checked between chunks, so smaller chunks cancel faster.
pub static INDEX_BUILD_CHUNK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config::<usize>("INDEX_BUILD_CHUNK_SIZE", 256).max(1));

/// Initial backoff when the transaction oracle is unavailable.
pub static ORACLE_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("ORACLE_INITIAL_BACKOFF_MS", 10)));

/// Upper bound on the backoff between oracle retries.
pub static ORACLE_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("ORACLE_MAX_BACKOFF_MS", 1000)));

/// How many consecutive oracle failures a build tolerates before it gives up
/// with `OracleUnavailable` and takes the failure path.
pub static ORACLE_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("ORACLE_MAX_RETRIES", 8));

/// First poll interval while waiting for older transactions to finish.
pub static QUIESCENCE_POLL_INITIAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("QUIESCENCE_POLL_INITIAL_MS", 1)));

/// Longest poll interval while waiting for older transactions to finish.
/// The wait itself has no deadline; it lasts as long as the longest running
/// older transaction.
pub static QUIESCENCE_POLL_MAX: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("QUIESCENCE_POLL_MAX_MS", 100)));

/// Whether a failed concurrent build removes its catalog record and storage
/// instead of leaving an invalid record behind for the operator to drop.
pub static INDEX_BUILD_ROLLBACK_ON_FAILURE: LazyLock<bool> =
    LazyLock::new(|| env_config("INDEX_BUILD_ROLLBACK_ON_FAILURE", false));

/// Maximum number of key columns in one index.
pub static MAX_INDEX_COLUMNS: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_INDEX_COLUMNS", 32));

/// How often the background maintenance loop clears `check-xmin` on indexes
/// no running transaction can misread and prunes catalog versions no
/// snapshot can see.
pub static INDEX_MAINTENANCE_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("INDEX_MAINTENANCE_INTERVAL_MS", 1000)));
