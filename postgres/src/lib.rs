//! `PostgreSQL` storage for Matchup.
//!
//! This crate provides the authoritative store and the cluster lock table:
//!
//! - [`PostgresMatchStore`]: versioned compare-and-set writes for matches and
//!   participations, with active-participation uniqueness enforced by a partial
//!   unique index
//! - [`PostgresLock`]: named expiring leases in a `shedlock` table
//!
//! Both share one connection pool.
//!
//! # Example
//!
//! ```ignore
//! use matchup_postgres::{PostgresLock, PostgresMatchStore};
//!
//! let store = PostgresMatchStore::connect(&database_url, 10).await?;
//! store.migrate().await?;
//! let lock = PostgresLock::new(store.pool().clone(), clock, "instance-1");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod lock;
mod store;

pub use lock::PostgresLock;
pub use store::{ACTIVE_PARTICIPATION_INDEX, PostgresMatchStore};
