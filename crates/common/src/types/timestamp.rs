use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Logical commit timestamp. Every committed unit of work, including each
/// catalog flag flip, gets a distinct, strictly increasing timestamp.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    pub fn succ(&self) -> anyhow::Result<Self> {
        let next = self
            .0
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("Timestamp {self} has no successor"))?;
        Ok(Self(next))
    }

    pub fn pred(&self) -> anyhow::Result<Self> {
        let prev = self
            .0
            .checked_sub(1)
            .ok_or_else(|| anyhow::anyhow!("Timestamp {self} has no predecessor"))?;
        Ok(Self(prev))
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consistent view of the database.
///
/// `read_ts` is the last commit included in the view. `xmin` is the oldest
/// view the owning transaction may still hold: it equals `read_ts` for a
/// transaction-scoped snapshot, and stays at the transaction's begin
/// timestamp when a long transaction takes fresh per-statement snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub read_ts: Timestamp,
    pub xmin: Timestamp,
}

impl Snapshot {
    pub fn at(ts: Timestamp) -> Self {
        Self {
            read_ts: ts,
            xmin: ts,
        }
    }

    /// Is a row version created at `created` and deleted at `deleted` visible
    /// in this snapshot?
    pub fn is_visible(&self, created: Timestamp, deleted: Option<Timestamp>) -> bool {
        created <= self.read_ts && deleted.is_none_or(|d| d > self.read_ts)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read_ts == self.xmin {
            write!(f, "@{}", self.read_ts)
        } else {
            write!(f, "@{} (xmin {})", self.read_ts, self.xmin)
        }
    }
}
