use metrics::register_catalog_counter;

register_catalog_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
register_catalog_counter!(pub NOT_FOUND_ERROR_TOTAL, "Count of not found errors");
register_catalog_counter!(
    pub DUPLICATE_DEFINITION_ERROR_TOTAL,
    "Count of index definitions rejected as duplicates"
);
register_catalog_counter!(
    pub INVALID_INDEX_STATE_ERROR_TOTAL,
    "Count of operations rejected because of the index phase"
);
register_catalog_counter!(pub BUILD_ABORTED_ERROR_TOTAL, "Count of aborted index builds");
register_catalog_counter!(
    pub ORACLE_UNAVAILABLE_ERROR_TOTAL,
    "Count of transaction oracle failures"
);
