//! Tally Shared
//!
//! Types and database plumbing shared by the billing library and the worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DbError};
pub use types::TenantId;
