//! opsdeck worker library.
//!
//! Consumes job ids from the task queue and runs each one through the
//! retry driver ([`executor::JobExecutor`]), the
//! [`orchestrator::Orchestrator`] and the [`runner::ProcessRunner`].
//! Exposed as a library so integration tests and the binary share it.

pub mod config;
pub mod consumer;
pub mod executor;
pub mod orchestrator;
pub mod revoke;
pub mod runner;
