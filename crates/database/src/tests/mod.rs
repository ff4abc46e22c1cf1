use common::{
    bootstrap_model::index::{
        IndexColumn,
        IndexDefinition,
    },
    datum::Datum,
    types::{
        OperatorClassId,
        TableId,
    },
};

mod index_build_tests;
mod planner_gate_tests;

const INT_OPS: OperatorClassId = OperatorClassId::new(1978);
const TEXT_OPS: OperatorClassId = OperatorClassId::new(3126);

/// `(id, name)` rows with ids in `range`.
fn named_rows(range: std::ops::Range<i64>) -> impl Iterator<Item = Vec<Datum>> {
    range.map(|i| vec![Datum::Int(i), Datum::Text(format!("Name{i}"))])
}

fn by_id(table_id: TableId) -> IndexDefinition {
    IndexDefinition::new(table_id, vec![IndexColumn::column(1, INT_OPS)])
}

fn by_name(table_id: TableId) -> IndexDefinition {
    IndexDefinition::new(table_id, vec![IndexColumn::column(2, TEXT_OPS)])
}
