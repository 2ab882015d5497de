use opsdeck_core::error::CoreError;

/// Errors from the state store, the tracker and the task queue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A record kept changing underneath a read-modify-write cycle.
    #[error("Write conflict on key {0}")]
    Contention(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
