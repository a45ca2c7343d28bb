//! Orchestration core.
//!
//! Covers the persisted job lifecycle, execution sessions with their
//! trigger policy, the per-page state runner, and the reference worker that
//! ties them together.

pub mod cleanup;
pub mod job_manager;
pub mod session_manager;
pub mod state_runner;
pub mod worker;
