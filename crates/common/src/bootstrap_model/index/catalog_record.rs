use std::collections::BTreeSet;

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};

use super::{
    index_validation_error,
    IndexColumn,
    IndexExpr,
    IndexKey,
    IndexOptions,
    IndexPhase,
    KeyPart,
};
use crate::{
    datum::Datum,
    knobs::MAX_INDEX_COLUMNS,
    types::{
        AttrNumber,
        IndexId,
        OperatorClassId,
        TableId,
    },
};

/// Everything that describes what an index contains. Two indexes with equal
/// definitions are duplicates of each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexDefinition {
    pub table_id: TableId,
    pub is_unique: bool,
    pub is_primary: bool,
    pub columns: Vec<IndexColumn>,
    /// One entry per expression column, in key order.
    pub expressions: Vec<IndexExpr>,
    /// Present only for partial indexes.
    pub predicate: Option<IndexExpr>,
}

impl IndexDefinition {
    pub fn new(table_id: TableId, columns: Vec<IndexColumn>) -> Self {
        Self {
            table_id,
            is_unique: false,
            is_primary: false,
            columns,
            expressions: vec![],
            predicate: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Primary indexes are always unique too.
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_unique = true;
        self
    }

    pub fn with_expressions(mut self, expressions: Vec<IndexExpr>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_predicate(mut self, predicate: IndexExpr) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_partial(&self) -> bool {
        self.predicate.is_some()
    }

    /// Check the structural invariants that don't need the table's schema.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.columns.is_empty() {
            anyhow::bail!(index_validation_error::empty_index(self.table_id));
        }
        if self.columns.len() > *MAX_INDEX_COLUMNS {
            anyhow::bail!(index_validation_error::too_many_columns(
                self.columns.len(),
                *MAX_INDEX_COLUMNS
            ));
        }
        if self.is_primary && !self.is_unique {
            anyhow::bail!(index_validation_error::primary_not_unique());
        }
        let expression_columns = self.columns.iter().filter(|c| c.is_expression()).count();
        if expression_columns != self.expressions.len() {
            anyhow::bail!(index_validation_error::expression_count_mismatch(
                expression_columns,
                self.expressions.len()
            ));
        }
        for attnum in self.referenced_columns() {
            if attnum.get() <= 0 {
                anyhow::bail!(index_validation_error::invalid_attnum(attnum));
            }
        }
        Ok(())
    }

    /// Check the definition against a table with `num_columns` columns.
    pub fn validate_for_table(&self, num_columns: usize) -> anyhow::Result<()> {
        self.validate()?;
        for attnum in self.referenced_columns() {
            if attnum.row_offset().is_none_or(|offset| offset >= num_columns) {
                anyhow::bail!(index_validation_error::column_out_of_range(
                    attnum,
                    self.table_id,
                    num_columns
                ));
            }
        }
        Ok(())
    }

    /// Every table column the index reads, for keys or for its predicate.
    pub fn referenced_columns(&self) -> BTreeSet<AttrNumber> {
        let mut out: BTreeSet<_> = self
            .columns
            .iter()
            .filter(|c| !c.is_expression())
            .map(|c| c.attnum)
            .collect();
        for expr in self.expressions.iter().chain(self.predicate.iter()) {
            out.extend(expr.referenced_columns());
        }
        out
    }

    /// The key this index stores for `row`, or `None` if a partial index's
    /// predicate excludes the row.
    pub fn key_for_row(&self, row: &[Datum]) -> anyhow::Result<Option<IndexKey>> {
        if let Some(ref predicate) = self.predicate
            && !predicate.eval(row)?.is_true()
        {
            return Ok(None);
        }
        let mut expressions = self.expressions.iter();
        let mut parts = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let datum = match column.attnum.row_offset() {
                Some(offset) => row
                    .get(offset)
                    .cloned()
                    .with_context(|| format!("Row has no column {}", column.attnum))?,
                None => expressions
                    .next()
                    .context("Expression column without an expression")?
                    .eval(row)?,
            };
            parts.push(KeyPart {
                datum,
                options: column.options,
            });
        }
        Ok(Some(IndexKey::new(parts)))
    }
}

/// The catalog row for one index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexCatalogRecord {
    pub index_id: IndexId,
    pub definition: IndexDefinition,
    pub phase: IndexPhase,
    /// The table's physical order follows this index. Advisory only.
    pub is_clustered: bool,
    /// Readers must also check that their snapshot isn't older than the
    /// commit that made the index valid.
    pub check_xmin: bool,
}

impl IndexCatalogRecord {
    /// A freshly created record: not maintained, not readable.
    pub fn new(index_id: IndexId, definition: IndexDefinition) -> Self {
        Self {
            index_id,
            definition,
            phase: IndexPhase::Building,
            is_clustered: false,
            check_xmin: false,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.definition.table_id
    }

    pub fn is_ready(&self) -> bool {
        self.phase.is_ready()
    }

    pub fn is_valid(&self) -> bool {
        self.phase.is_valid()
    }
}

/// Wire and storage form of `IndexCatalogRecord`, using the legacy catalog
/// column names and the two-boolean phase encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedIndexCatalogRecord {
    pub indexrelid: u64,
    pub indrelid: u64,
    pub indnatts: i16,
    pub indisunique: bool,
    pub indisprimary: bool,
    pub indisclustered: bool,
    pub indisvalid: bool,
    pub indcheckxmin: bool,
    pub indisready: bool,
    /// Tells a failed build apart from one still building. Older records
    /// don't carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indisfailed: Option<bool>,
    pub indkey: Vec<i16>,
    pub indclass: Vec<u32>,
    pub indoption: Vec<u16>,
    /// JSON text of the expression list.
    pub indexprs: Option<String>,
    /// JSON text of the partial-index predicate.
    pub indpred: Option<String>,
}

impl TryFrom<IndexCatalogRecord> for SerializedIndexCatalogRecord {
    type Error = anyhow::Error;

    fn try_from(record: IndexCatalogRecord) -> anyhow::Result<Self> {
        let (indisready, indisvalid) = record.phase.legacy_flags();
        let definition = record.definition;
        let indnatts = i16::try_from(definition.columns.len())
            .context("Too many index columns to serialize")?;
        let indexprs = if definition.expressions.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&definition.expressions)?)
        };
        let indpred = definition
            .predicate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            indexrelid: record.index_id.get(),
            indrelid: definition.table_id.get(),
            indnatts,
            indisunique: definition.is_unique,
            indisprimary: definition.is_primary,
            indisclustered: record.is_clustered,
            indisvalid,
            indcheckxmin: record.check_xmin,
            indisready,
            indisfailed: record.phase.is_failed().then_some(true),
            indkey: definition.columns.iter().map(|c| c.attnum.get()).collect(),
            indclass: definition.columns.iter().map(|c| c.opclass.get()).collect(),
            indoption: definition.columns.iter().map(|c| c.options.bits()).collect(),
            indexprs,
            indpred,
        })
    }
}

impl TryFrom<SerializedIndexCatalogRecord> for IndexCatalogRecord {
    type Error = anyhow::Error;

    fn try_from(serialized: SerializedIndexCatalogRecord) -> anyhow::Result<Self> {
        let phase = IndexPhase::from_legacy_flags(
            serialized.indisready,
            serialized.indisvalid,
            serialized.indisfailed.unwrap_or(false),
        )?;
        let num_columns = serialized.indkey.len();
        if usize::try_from(serialized.indnatts).ok() != Some(num_columns)
            || serialized.indclass.len() != num_columns
            || serialized.indoption.len() != num_columns
        {
            anyhow::bail!(index_validation_error::column_count_mismatch(
                serialized.indnatts,
                serialized.indkey.len(),
                serialized.indclass.len(),
                serialized.indoption.len(),
            ));
        }
        let columns = serialized
            .indkey
            .into_iter()
            .zip(serialized.indclass)
            .zip(serialized.indoption)
            .map(|((attnum, opclass), options)| IndexColumn {
                attnum: AttrNumber::new(attnum),
                opclass: OperatorClassId::new(opclass),
                options: IndexOptions::from_bits_retain(options),
            })
            .collect();
        let expressions = match serialized.indexprs {
            Some(text) => serde_json::from_str(&text).context("Invalid indexprs")?,
            None => vec![],
        };
        let predicate = serialized
            .indpred
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .context("Invalid indpred")?;
        let definition = IndexDefinition {
            table_id: TableId::new(serialized.indrelid),
            is_unique: serialized.indisunique,
            is_primary: serialized.indisprimary,
            columns,
            expressions,
            predicate,
        };
        definition.validate()?;
        Ok(Self {
            index_id: IndexId::new(serialized.indexrelid),
            definition,
            phase,
            is_clustered: serialized.indisclustered,
            check_xmin: serialized.indcheckxmin,
        })
    }
}
