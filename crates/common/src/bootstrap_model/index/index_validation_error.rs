use errors::ErrorMetadata;

use crate::types::{
    AttrNumber,
    TableId,
};

pub fn empty_index(table_id: TableId) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "EmptyIndex",
        format!("An index on {table_id} must have at least one key column."),
    )
}

pub fn too_many_columns(num_columns: usize, max: usize) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "TooManyIndexColumns",
        format!("Indexes can have at most {max} key columns, but {num_columns} were given."),
    )
}

pub fn invalid_attnum(attnum: AttrNumber) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "InvalidIndexColumn",
        format!("Column number {attnum} can't be indexed. Key columns are numbered from 1."),
    )
}

pub fn column_out_of_range(attnum: AttrNumber, table_id: TableId, num_columns: usize) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "IndexColumnOutOfRange",
        format!("Column {attnum} doesn't exist on {table_id}, which has {num_columns} columns."),
    )
}

pub fn expression_count_mismatch(expression_columns: usize, expressions: usize) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "IndexExpressionCountMismatch",
        format!(
            "The index has {expression_columns} expression key columns but {expressions} \
             expressions. There must be exactly one expression per zero column number."
        ),
    )
}

pub fn primary_not_unique() -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "PrimaryIndexNotUnique",
        "An index backing a primary key must also be unique.",
    )
}

pub fn column_count_mismatch(
    indnatts: i16,
    indkey: usize,
    indclass: usize,
    indoption: usize,
) -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "IndexColumnCountMismatch",
        format!(
            "indnatts is {indnatts} but indkey, indclass and indoption have {indkey}, {indclass} \
             and {indoption} entries."
        ),
    )
}

pub fn illegal_phase_flags(ready: bool, valid: bool, failed: bool) -> ErrorMetadata {
    ErrorMetadata::invalid_index_state(
        "IllegalPhaseFlags",
        format!(
            "indisready={ready}, indisvalid={valid}, indisfailed={failed} is not a state an \
             index can be in. A valid index is always ready, and a failed one is neither."
        ),
    )
}
