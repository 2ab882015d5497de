//! In-process [`StateStore`] backend.
//!
//! Mirrors the Redis semantics the tracker and queue rely on (expiry,
//! capped lists, blocking pop, pattern subscriptions) so integration tests
//! and single-process runs need no external service.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use opsdeck_core::error::CoreError;
use regex::Regex;

use crate::backend::{glob_regex, PubSubMessage, StateStore, Subscription};
use crate::error::StoreResult;

/// Broadcast buffer for published messages. Slow subscribers lose the
/// oldest messages, as with Redis pub/sub.
const PUBSUB_CAPACITY: usize = 4096;

enum Value {
    Str(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    pubsub: broadcast::Sender<PubSubMessage>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            pubsub,
            pushed: Notify::new(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.pubsub.receiver_count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        data.retain(|_, entry| !entry.is_expired(now));
        data
    }

    fn list_mut<'a>(
        data: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> &'a mut VecDeque<String> {
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        if !matches!(entry.value, Value::List(_)) {
            entry.value = Value::List(VecDeque::new());
        }
        match &mut entry.value {
            Value::List(list) => list,
            Value::Str(_) => unreachable!("entry was just converted to a list"),
        }
    }

    fn try_pop(&self, key: &str) -> Option<String> {
        let mut data = self.lock();
        let popped = match data.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => list.pop_front(),
            _ => None,
        };
        if matches!(data.get(key).map(|e| &e.value), Some(Value::List(l)) if l.is_empty()) {
            data.remove(key);
        }
        popped
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve Redis-style inclusive indices against a list length.
fn compile_glob(pattern: &str) -> StoreResult<Regex> {
    glob_regex(pattern)
        .map_err(|e| CoreError::Validation(format!("Invalid pattern {pattern:?}: {e}")).into())
}

fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let norm = |i: isize| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    (start <= stop && len > 0).then_some((start as usize, stop as usize))
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let data = self.lock();
        Ok(match data.get(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.lock();
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut data = self.lock();
        match data.get_mut(key) {
            Some(entry) if matches!(&entry.value, Value::Str(s) if s == expected) => {
                entry.value = Value::Str(value.to_string());
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn append_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut data = self.lock();
        let list = Self::list_mut(&mut data, key);
        list.push_back(value.to_string());
        while list.len() > max_len {
            list.pop_front();
        }
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn prepend_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut data = self.lock();
        let list = Self::list_mut(&mut data, key);
        list.push_front(value.to_string());
        list.truncate(max_len);
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let data = self.lock();
        let Some(Value::List(list)) = data.get(key).map(|e| &e.value) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut data = self.lock();
        if let Some(Value::List(list)) = data.get_mut(key).map(|e| &mut e.value) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = compile_glob(pattern)?;
        let data = self.lock();
        Ok(data
            .keys()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect())
    }

    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()> {
        {
            let mut data = self.lock();
            Self::list_mut(&mut data, key).push_back(value.to_string());
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(key) {
                return Ok(Some(value));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(self.try_pop(key));
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // Zero subscribers is not an error, same as Redis.
        let _ = self.pubsub.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        let matcher = compile_glob(pattern)?;
        let rx = self.pubsub.subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "In-memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |msg| futures::future::ready(matcher.is_match(&msg.channel)));

        Ok(stream.boxed())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
