//! Each module here represents a bootstrap table: a system catalog the
//! database needs before it can do anything else.
//!
//! The types live in `common` because both the catalog itself and its
//! consumers (writers, the planner gate, the index builder) depend on them.
pub mod index;
