//! Rewritely shared types
//!
//! Domain enums used by the billing core, the API server and the worker,
//! plus Postgres pool construction and the embedded schema migrations.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{BillingPeriod, OrderStatus, ParseEnumError, SubscriptionStatus};
