use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
};

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    datum::Datum,
    types::AttrNumber,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Le => ordering.is_le(),
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Ge => ordering.is_ge(),
        }
    }
}

/// Expression tree used for computed key columns (`indexprs`) and for the
/// predicate of a partial index (`indpred`).
///
/// Evaluation follows SQL NULL semantics: NULL operands make the result
/// NULL, and `And` is three-valued.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IndexExpr {
    Column { attnum: AttrNumber },
    Const { value: Datum },
    Lower { arg: Box<IndexExpr> },
    Add { left: Box<IndexExpr>, right: Box<IndexExpr> },
    IsNotNull { arg: Box<IndexExpr> },
    Compare { op: CompareOp, left: Box<IndexExpr>, right: Box<IndexExpr> },
    And { args: Vec<IndexExpr> },
    Not { arg: Box<IndexExpr> },
}

impl IndexExpr {
    pub fn column(attnum: i16) -> Self {
        IndexExpr::Column {
            attnum: AttrNumber::new(attnum),
        }
    }

    pub fn constant(value: impl Into<Datum>) -> Self {
        IndexExpr::Const {
            value: value.into(),
        }
    }

    pub fn lower(arg: IndexExpr) -> Self {
        IndexExpr::Lower { arg: Box::new(arg) }
    }

    pub fn add(left: IndexExpr, right: IndexExpr) -> Self {
        IndexExpr::Add {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn is_not_null(arg: IndexExpr) -> Self {
        IndexExpr::IsNotNull { arg: Box::new(arg) }
    }

    pub fn compare(op: CompareOp, left: IndexExpr, right: IndexExpr) -> Self {
        IndexExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(args: Vec<IndexExpr>) -> Self {
        IndexExpr::And { args }
    }

    pub fn not(arg: IndexExpr) -> Self {
        IndexExpr::Not { arg: Box::new(arg) }
    }

    /// Table columns this expression reads.
    pub fn referenced_columns(&self) -> BTreeSet<AttrNumber> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<AttrNumber>) {
        match self {
            IndexExpr::Column { attnum } => {
                out.insert(*attnum);
            },
            IndexExpr::Const { .. } => {},
            IndexExpr::Lower { arg } | IndexExpr::IsNotNull { arg } | IndexExpr::Not { arg } => {
                arg.collect_columns(out)
            },
            IndexExpr::Add { left, right } | IndexExpr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            },
            IndexExpr::And { args } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            },
        }
    }

    pub fn eval(&self, row: &[Datum]) -> anyhow::Result<Datum> {
        let result = match self {
            IndexExpr::Column { attnum } => {
                let value = attnum
                    .row_offset()
                    .and_then(|offset| row.get(offset))
                    .ok_or_else(|| {
                        eval_error(format!("column {attnum} is not part of the row"))
                    })?;
                value.clone()
            },
            IndexExpr::Const { value } => value.clone(),
            IndexExpr::Lower { arg } => match arg.eval(row)? {
                Datum::Null => Datum::Null,
                Datum::Text(s) => Datum::Text(s.to_lowercase()),
                other => anyhow::bail!(eval_error(format!("lower() expects text, got {other}"))),
            },
            IndexExpr::Add { left, right } => match (left.eval(row)?, right.eval(row)?) {
                (Datum::Null, _) | (_, Datum::Null) => Datum::Null,
                (Datum::Int(l), Datum::Int(r)) => Datum::Int(
                    l.checked_add(r)
                        .ok_or_else(|| eval_error(format!("integer overflow in {l} + {r}")))?,
                ),
                (l, r) => anyhow::bail!(eval_error(format!("cannot add {l} and {r}"))),
            },
            IndexExpr::IsNotNull { arg } => Datum::Bool(!arg.eval(row)?.is_null()),
            IndexExpr::Compare { op, left, right } => match (left.eval(row)?, right.eval(row)?) {
                (Datum::Null, _) | (_, Datum::Null) => Datum::Null,
                (l, r) if std::mem::discriminant(&l) == std::mem::discriminant(&r) => {
                    Datum::Bool(op.holds(l.cmp(&r)))
                },
                (l, r) => anyhow::bail!(eval_error(format!("cannot compare {l} with {r}"))),
            },
            IndexExpr::And { args } => {
                let mut saw_null = false;
                for arg in args {
                    match arg.eval(row)? {
                        Datum::Bool(false) => return Ok(Datum::Bool(false)),
                        Datum::Bool(true) => {},
                        Datum::Null => saw_null = true,
                        other => anyhow::bail!(eval_error(format!(
                            "AND expects booleans, got {other}"
                        ))),
                    }
                }
                if saw_null {
                    Datum::Null
                } else {
                    Datum::Bool(true)
                }
            },
            IndexExpr::Not { arg } => match arg.eval(row)? {
                Datum::Null => Datum::Null,
                Datum::Bool(b) => Datum::Bool(!b),
                other => anyhow::bail!(eval_error(format!("NOT expects a boolean, got {other}"))),
            },
        };
        Ok(result)
    }
}

fn eval_error(msg: String) -> ErrorMetadata {
    ErrorMetadata::bad_request("IndexExpressionError", msg)
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Column { attnum } => write!(f, "${attnum}"),
            IndexExpr::Const { value } => write!(f, "{value}"),
            IndexExpr::Lower { arg } => write!(f, "lower({arg})"),
            IndexExpr::Add { left, right } => write!(f, "({left} + {right})"),
            IndexExpr::IsNotNull { arg } => write!(f, "({arg} IS NOT NULL)"),
            IndexExpr::Compare { op, left, right } => {
                let op = match op {
                    CompareOp::Eq => "=",
                    CompareOp::Ne => "<>",
                    CompareOp::Lt => "<",
                    CompareOp::Le => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::Ge => ">=",
                };
                write!(f, "({left} {op} {right})")
            },
            IndexExpr::And { args } => {
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            },
            IndexExpr::Not { arg } => write!(f, "(NOT {arg})"),
        }
    }
}
