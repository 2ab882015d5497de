//! opsdeck domain logic.
//!
//! Everything in this crate is pure: job state transitions, the event
//! wire format, target validation, command construction, output parsing,
//! progress estimation and the retry policy. I/O lives in the store,
//! worker and api crates.

pub mod command;
pub mod error;
pub mod events;
pub mod job;
pub mod progress;
pub mod retry;
pub mod summary;
pub mod target;
pub mod types;
