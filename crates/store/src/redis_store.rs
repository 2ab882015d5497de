//! Redis-backed [`StateStore`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, Script};
use tokio::sync::Mutex;

use crate::backend::{PubSubMessage, StateStore, Subscription};
use crate::error::StoreResult;

/// Replace a key only when it still holds the value the caller read.
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
    return 1
end
return 0
";

/// Batch size hint for SCAN.
const SCAN_COUNT: usize = 200;

/// Shortest BLPOP timeout sent to Redis, which reads 0 as "block forever".
const MIN_BLOCKING_TIMEOUT: Duration = Duration::from_millis(10);

fn blpop_timeout_secs(timeout: Duration) -> f64 {
    timeout.max(MIN_BLOCKING_TIMEOUT).as_secs_f64()
}

pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    /// BLPOP parks its connection, so queue consumers get their own.
    blocking: Mutex<Option<MultiplexedConnection>>,
    cas: Script,
}

impl RedisStore {
    /// Open a client and establish the shared connection.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        tracing::info!("Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn append_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(-(max_len as isize))
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn prepend_capped(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(max_len.saturating_sub(1))
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await?;
        Ok(values)
    }

    async fn list_remove(&self, key: &str, value: &str) -> StoreResult<()> {
        let _: () = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()> {
        let _: () = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn pop_front_blocking(
        &self,
        key: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };

        let popped: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BLPOP")
            .arg(key)
            .arg(blpop_timeout_secs(timeout))
            .query_async(conn)
            .await;

        match popped {
            Ok(entry) => Ok(entry.map(|(_, value)| value)),
            Err(e) => {
                // Reconnect on the next call.
                *guard = None;
                Err(e.into())
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping non-UTF-8 pub/sub payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn ping(&self) -> StoreResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(())
    }
}
