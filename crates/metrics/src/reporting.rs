use prometheus::{
    Gauge,
    HistogramVec,
    IntCounter,
    IntCounterVec,
    core::Collector,
};

use crate::log_invalid_metric;

pub fn log_counter(counter: &IntCounter, increment: u64) {
    counter.inc_by(increment);
}

/// Bumps the child of `counter` for `labels`. A label mismatch is reported
/// through `log_invalid_metric` instead of failing the caller.
pub fn log_counter_with_labels(counter: &IntCounterVec, increment: u64, labels: &[&str]) {
    match counter.get_metric_with_label_values(labels) {
        Ok(child) => child.inc_by(increment),
        Err(e) => log_invalid_metric(fq_name(counter), e),
    }
}

pub fn log_gauge(gauge: &Gauge, value: f64) {
    gauge.set(value);
}

pub(crate) fn observe_with_labels(histogram: &HistogramVec, value: f64, labels: &[&str]) {
    match histogram.get_metric_with_label_values(labels) {
        Ok(child) => child.observe(value),
        Err(e) => log_invalid_metric(fq_name(histogram), e),
    }
}

pub(crate) fn fq_name(collector: &impl Collector) -> String {
    collector
        .desc()
        .first()
        .map(|desc| desc.fq_name.clone())
        .unwrap_or_default()
}
