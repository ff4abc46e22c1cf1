mod db_fixtures;
pub mod index_utils;

pub use db_fixtures::{
    DbFixtures,
    FlakyOracle,
};
