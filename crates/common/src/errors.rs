use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use metrics::log_counter;

use crate::metrics::log_errors_reported_total;

/// Log an error with its full chain and bump the counters for its
/// classification.
///
/// Caller errors (duplicate definitions, illegal phase moves) are logged at
/// `info`, transient oracle failures at `warn` and everything else,
/// including aborted builds, at `error`.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);

    // Yield in case this is during shutdown, so a pending cancellation can
    // complete.
    tokio::task::yield_now().await;

    count_error(err);
}

/// Synchronous version of `report_error`, for use from `Drop` impls and
/// other sync contexts.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
    count_error(err);
}

fn trace_error(err: &anyhow::Error) {
    let label = error_label(err);
    log_errors_reported_total(label);

    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    let full_msg = format!(
        "Caught {label} error (RUST_BACKTRACE=1 RUST_LOG=info,{}=debug for full trace): \
         {err_for_tracing}",
        module_path!()
    );
    match err.downcast_ref::<ErrorMetadata>().map(|e| e.report_level()) {
        Some(tracing::Level::INFO) => tracing::info!("{full_msg}"),
        Some(tracing::Level::WARN) => tracing::warn!("{full_msg}"),
        _ => tracing::error!("{full_msg}"),
    }
    tracing::debug!("{err:?}");
}

fn count_error(err: &anyhow::Error) {
    if let Some(e) = err.downcast_ref::<ErrorMetadata>() {
        log_counter(e.custom_metric(), 1);
    }
}

fn error_label(err: &anyhow::Error) -> &'static str {
    match err.error_code() {
        Some(code) => match code {
            errors::ErrorCode::BadRequest => "bad_request",
            errors::ErrorCode::NotFound => "not_found",
            errors::ErrorCode::DuplicateDefinition => "duplicate_definition",
            errors::ErrorCode::InvalidIndexState => "invalid_index_state",
            errors::ErrorCode::BuildAborted => "build_aborted",
            errors::ErrorCode::OracleUnavailable => "oracle_unavailable",
        },
        None => "internal",
    }
}
