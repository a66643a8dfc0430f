#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! IdeaKit shared infrastructure
//!
//! Database pool construction, embedded migrations and the small set of
//! types shared between the billing engine and the API server.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations, DbError};
pub use types::{PlanStatus, UnknownPlanStatus};
