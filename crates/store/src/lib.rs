//! State Store access for opsdeck.
//!
//! - [`StateStore`]: key/value + list + pub/sub primitives, with a Redis
//!   backend for deployments and an in-memory backend for tests and
//!   single-process runs.
//! - [`JobTracker`]: the durable source of truth for job state, logs and
//!   the per-owner index; publishes every change.
//! - [`TaskQueue`]: submit/revoke/consume job ids on top of the store.

pub mod backend;
pub mod error;
pub mod keys;
pub mod memory;
pub mod queue;
pub mod redis_store;
pub mod tracker;

pub use backend::{PubSubMessage, StateStore, Subscription};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use queue::{StoreTaskQueue, TaskQueue};
pub use redis_store::RedisStore;
pub use tracker::JobTracker;
