//! Common code and types shared by the index catalog crates.

pub mod backoff;
pub mod bootstrap_model;
pub mod datum;
pub mod errors;
pub mod knobs;
mod metrics;
pub mod pause;
pub mod persistence;
pub mod types;

pub use tokio;
