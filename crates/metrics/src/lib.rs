//! Prometheus plumbing shared by the catalog crates.
//!
//! Metrics are declared next to the code that reports them with the
//! `register_catalog_*!` macros and reported through small, high level
//! functions ("a build finished") rather than raw metric handles.
mod macros;
mod registry;
mod reporting;
mod timer;

pub use crate::{
    macros::*,
    registry::*,
    reporting::{
        log_counter,
        log_counter_with_labels,
        log_gauge,
    },
    timer::StatusTimer,
};

/// Label key used by `StatusTimer`.
pub const STATUS_LABEL: [&str; 1] = ["status"];
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELED: &str = "canceled";
