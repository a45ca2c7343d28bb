//! Orchestration core for multi-state accessibility testing: leased test
//! jobs, execution sessions with script trigger rules, and per-page state
//! runs.

#![forbid(unsafe_code)]

pub mod config;
pub mod driver;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
