//! Service shell for the matchup concurrency core.
//!
//! Loads [`Config`] from the environment, connects the Postgres, Redis and
//! Redpanda adapters into [`Components`], and runs the background loops
//! (lifecycle scheduler, spatial index synchronizer and reconciler) under one
//! shutdown signal. The write-path services are reachable through [`App`] for
//! embedding into a transport layer.

pub mod app;
pub mod config;

pub use app::{App, AppError, Components, Running};
pub use config::{Config, ConfigError, LockBackend};
