//! Entitlement engine integration tests
//!
//! Everything here runs against the in-memory store, add-on ledger and audit
//! sink. The Postgres variants are `#[ignore]` and need `DATABASE_URL`.
//!
//! ```bash
//! cargo test -p dojogate-entitlements --test integration
//! DATABASE_URL=postgres://... cargo test -p dojogate-entitlements --test integration -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test helpers unwrap for brevity

mod common;
mod overrides_and_catalog;
mod postgres;
mod sweep;
mod trial_lifecycle;
