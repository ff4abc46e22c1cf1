use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            pub const fn new(id: $inner) -> Self {
                Self(id)
            }

            pub const fn get(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identity of an index object (`indexrelid`).
    IndexId(u64),
    "index:"
);
id_type!(
    /// Identity of the indexed table (`indrelid`).
    TableId(u64),
    "table:"
);
id_type!(
    /// Physical identity of a heap row version.
    RowId(u64),
    "row:"
);
id_type!(TransactionId(u64), "txn:");
id_type!(
    /// Operator class used by the access method for one key column.
    OperatorClassId(u32),
    "opclass:"
);

/// 1-based column position within a table row. Zero marks a key column
/// computed from an expression rather than a plain column reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrNumber(i16);

impl AttrNumber {
    pub const EXPRESSION: AttrNumber = AttrNumber(0);

    pub const fn new(attnum: i16) -> Self {
        Self(attnum)
    }

    pub const fn get(&self) -> i16 {
        self.0
    }

    pub fn is_expression(&self) -> bool {
        self.0 == 0
    }

    /// Zero-based offset into a row, or `None` for expression columns.
    pub fn row_offset(&self) -> Option<usize> {
        if self.0 > 0 {
            Some(self.0 as usize - 1)
        } else {
            None
        }
    }
}

impl fmt::Display for AttrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
