//! Axis Storage Layer
//!
//! SQLite ledger of fulfillment attempts: which books were requested, where
//! their artifacts live, and how each attempt ended.

mod database;
mod error;
mod ledger;
mod migrations;
mod record;

pub use database::Database;
pub use error::StorageError;
pub use ledger::FulfillmentLedger;
pub use record::{FulfillmentRecord, FulfillmentState};

pub type Result<T> = std::result::Result<T, StorageError>;
