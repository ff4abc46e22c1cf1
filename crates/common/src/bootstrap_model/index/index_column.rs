use bitflags::bitflags;

use crate::types::{
    AttrNumber,
    OperatorClassId,
};

bitflags! {
    /// Per-column option bits (`indoption`).
    ///
    /// The two low bits have fixed meanings. Every other bit belongs to the
    /// access method and is carried through untouched.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct IndexOptions: u16 {
        /// Keys sort in descending order.
        const DESC = 1 << 0;
        /// NULLs sort before non-NULL keys.
        const NULLS_FIRST = 1 << 1;

        const _ = !0;
    }
}

impl IndexOptions {
    pub fn is_descending(&self) -> bool {
        self.contains(IndexOptions::DESC)
    }

    pub fn nulls_first(&self) -> bool {
        self.contains(IndexOptions::NULLS_FIRST)
    }
}

/// One key column of an index: what it indexes, how it's compared and how
/// it's ordered.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexColumn {
    pub attnum: AttrNumber,
    pub opclass: OperatorClassId,
    pub options: IndexOptions,
}

impl IndexColumn {
    /// An ascending, nulls-last key on table column `attnum` (1-based).
    pub fn column(attnum: i16, opclass: OperatorClassId) -> Self {
        Self {
            attnum: AttrNumber::new(attnum),
            opclass,
            options: IndexOptions::empty(),
        }
    }

    /// A key computed from the next unused entry of the index's expression
    /// list.
    pub fn expression(opclass: OperatorClassId) -> Self {
        Self {
            attnum: AttrNumber::EXPRESSION,
            opclass,
            options: IndexOptions::empty(),
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_expression(&self) -> bool {
        self.attnum.is_expression()
    }
}

#[cfg(test)]
mod tests {
    use super::IndexOptions;

    #[test]
    fn test_unknown_bits_round_trip() {
        let options = IndexOptions::from_bits_retain(0x8003);
        assert!(options.is_descending());
        assert!(options.nulls_first());
        assert_eq!(options.bits(), 0x8003);

        let options = IndexOptions::from_bits_retain(0x0100);
        assert!(!options.is_descending());
        assert_eq!(options.bits(), 0x0100);
    }
}
