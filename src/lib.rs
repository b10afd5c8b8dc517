pub mod addresses;
pub mod cache;
pub mod config;
pub mod context;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod node;
pub mod price;
pub mod reader;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod stats;
pub mod user_settings;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{SyncEngine, TxKind};
pub use error::SyncError;
