//! opsdeck API server library.
//!
//! Hosts the Event Gateway (live job event WebSockets) and the health
//! probe. Exposed as a library so integration tests and the binary
//! entrypoint share the same router and state.

pub mod background;
pub mod config;
pub mod error;
pub mod gateway;
pub mod router;
pub mod routes;
pub mod state;
