mod ids;
mod timestamp;

pub use self::{
    ids::{
        AttrNumber,
        IndexId,
        OperatorClassId,
        RowId,
        TableId,
        TransactionId,
    },
    timestamp::{
        Snapshot,
        Timestamp,
    },
};
