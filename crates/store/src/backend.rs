//! The State Store seam.
//!
//! Every operation is a single atomic per-key command; nothing needs a
//! multi-key transaction.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;

use crate::error::StoreResult;

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription. Ends when the underlying connection drops.
pub type Subscription = BoxStream<'static, PubSubMessage>;

/// Key/value + list + pub/sub store shared by workers and the API.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` and (re)start its expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Set `key` only if it does not exist. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Replace `key` only if its current value equals `expected`.
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Append to the tail of a list, keep the last `max_len` entries and
    /// restart the list's expiry.
    async fn append_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Prepend to the head of a list, keep the first `max_len` entries and
    /// restart the list's expiry.
    async fn prepend_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Inclusive range with negative indices counting from the tail.
    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    /// Remove every occurrence of `value` from a list.
    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Append to a queue list without expiry.
    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Pop the head of a queue list, waiting up to `timeout` for an entry.
    /// A zero timeout never blocks indefinitely.
    async fn pop_front_blocking(&self, key: &str, timeout: Duration)
        -> StoreResult<Option<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribe to every channel matching a glob pattern.
    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription>;

    /// Round-trip check used by health probes.
    async fn ping(&self) -> StoreResult<()>;
}

/// Compile a glob supporting `*` (any run) and `?` (one character) into
/// an anchored regex. Every other character matches itself.
pub fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("(?s:.*)"),
            '?' => re.push_str("(?s:.)"),
            _ => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    Regex::new(&re)
}
