//! DojoGate Shared Types and Utilities
//!
//! This crate contains the domain types, errors, and database helpers shared
//! by the entitlement engine, the API server, and the sweep worker.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
