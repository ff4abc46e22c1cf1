use metrics::{
    log_counter_with_labels,
    register_catalog_counter,
};

register_catalog_counter!(
    pub ERRORS_REPORTED_TOTAL,
    "Count of errors reported, by classification",
    &["code"]
);
pub fn log_errors_reported_total(code: &str) {
    log_counter_with_labels(&ERRORS_REPORTED_TOTAL, 1, &[code]);
}
