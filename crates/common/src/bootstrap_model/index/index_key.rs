use std::{
    cmp::Ordering,
    fmt,
};

use super::IndexOptions;
use crate::datum::Datum;

/// One component of an index key, ordered according to its column's
/// `DESC` and `NULLS_FIRST` bits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyPart {
    pub datum: Datum,
    pub options: IndexOptions,
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let nulls_first = self.options.nulls_first();
        let ordering = match (self.datum.is_null(), other.datum.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) if self.options.is_descending() => other.datum.cmp(&self.datum),
            (false, false) => self.datum.cmp(&other.datum),
        };
        // Keys within one index always share options. The tie-break keeps
        // `Ord` consistent with `Eq` if they ever don't.
        ordering.then_with(|| self.options.cmp(&other.options))
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The key an index stores for one row. Compares lexicographically by
/// `KeyPart`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Vec<KeyPart>);

impl IndexKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn datums(&self) -> impl Iterator<Item = &Datum> {
        self.0.iter().map(|part| &part.datum)
    }

    /// NULLs never collide under a unique index.
    pub fn has_null(&self) -> bool {
        self.0.iter().any(|part| part.datum.is_null())
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part.datum)?;
        }
        write!(f, ")")
    }
}
