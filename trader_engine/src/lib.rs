pub mod config;
pub mod context;
pub mod cycle;
pub mod decision;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod history;
pub mod ledger;
pub mod market;
pub mod prompt;
pub mod scheduler;
pub mod sizing;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::{ErrorKind, Result, TraderError};
