//! Naming rules and the process-wide registry.
//!
//! Names follow the [Prometheus conventions](https://prometheus.io/docs/practices/naming/):
//! lower snake case, alphanumerics and underscores only, and a unit suffix
//! from [`UNIT_SUFFIXES`]. Every name is prefixed with `SERVICE_NAME` by the
//! registry.
use std::{
    collections::BTreeSet,
    env,
    sync::LazyLock,
};

use parking_lot::Mutex;
use prometheus::Registry;

use crate::register_catalog_counter;

pub const UNIT_SUFFIXES: &[&str] = &[
    "_seconds",
    "_rows",
    "_entries",
    "_versions",
    "_transactions",
    "_total",
];

pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    match env::var("SERVICE_NAME") {
        Ok(name) if !name.is_empty() => name.replace('-', "_"),
        _ => "index_catalog".to_owned(),
    }
});

/// Registry all `register_catalog_*!` metrics land in. `CATALOG_INSTANCE`,
/// when set, becomes a constant `instance_name` label.
pub static CATALOG_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let const_labels = env::var("CATALOG_INSTANCE")
        .ok()
        .map(|instance| [("instance_name".to_owned(), instance)].into());
    Registry::new_custom(Some(SERVICE_NAME.clone()), const_labels)
        .unwrap_or_else(|e| panic!("Invalid catalog metrics registry: {e}"))
});

/// A metric name that passed [`MetricName::new`]'s checks. Built in a
/// `const` so a bad name fails the build instead of the first report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(&'static str);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        let bytes = name.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            assert!(
                c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_',
                "metric names are lower snake case"
            );
            i += 1;
        }
        let mut i = 0;
        while i < UNIT_SUFFIXES.len() {
            if has_suffix(bytes, UNIT_SUFFIXES[i].as_bytes()) {
                return Self(name);
            }
            i += 1;
        }
        panic!("metric names must end with a unit suffix such as `_seconds` or `_total`");
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

const fn has_suffix(name: &[u8], suffix: &[u8]) -> bool {
    let Some(offset) = name.len().checked_sub(suffix.len()) else {
        return false;
    };
    let mut i = 0;
    while i < suffix.len() {
        if name[offset + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

pub const fn checked_help(help: &'static str) -> &'static str {
    assert!(!help.is_empty(), "metric help strings must be nonempty");
    help
}

register_catalog_counter!(
    INVALID_METRIC_REPORTS_TOTAL,
    "Reports dropped because the metric rejected them",
    &["metric_name"]
);

// Names already logged, so a broken metric on a hot path logs once.
static REPORTED_INVALID: LazyLock<Mutex<BTreeSet<String>>> = LazyLock::new(Default::default);

pub fn log_invalid_metric(name: String, error: prometheus::Error) {
    if let Ok(counter) = INVALID_METRIC_REPORTS_TOTAL.get_metric_with_label_values(&[&name]) {
        counter.inc();
    }
    let first_report = REPORTED_INVALID.lock().insert(name.clone());
    if !first_report {
        return;
    }
    if cfg!(any(test, feature = "testing")) {
        panic!("Invalid report for metric {name:?}: {error}");
    }
    tracing::error!("Invalid report for metric {name:?}: {error}");
}
