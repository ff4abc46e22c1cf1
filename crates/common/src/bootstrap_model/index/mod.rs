//! The index catalog: one record per index describing its key columns and
//! its position in the concurrent build lifecycle.
mod catalog_record;
mod index_column;
mod index_expr;
mod index_key;
mod index_phase;
pub mod index_validation_error;

pub use self::{
    catalog_record::{
        IndexCatalogRecord,
        IndexDefinition,
        SerializedIndexCatalogRecord,
    },
    index_column::{
        IndexColumn,
        IndexOptions,
    },
    index_expr::{
        CompareOp,
        IndexExpr,
    },
    index_key::{
        IndexKey,
        KeyPart,
    },
    index_phase::{
        IndexFlag,
        IndexPhase,
    },
};
