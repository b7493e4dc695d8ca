//! CareBill Shared Types and Utilities
//!
//! This crate contains the domain value types, persisted records and database helpers
//! shared by the billing engine, the API server and the background worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod db;
pub mod error;
pub mod models;
pub mod types;

pub use db::*;
pub use error::*;
pub use models::*;
pub use types::*;
