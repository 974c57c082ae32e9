use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

/// Per-command budget for plain commands. Blocking pops get the server-side
/// timeout plus a small margin instead.
const COMMAND_TIMEOUT_MILLISECS: u64 = 2000;
const BLOCKING_POP_MARGIN_SECS: u64 = 2;
const SUBSCRIBE_BUFFER: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key or field not found")]
    NotFound,
    #[error("store command timed out")]
    Timeout,
    #[error("malformed store payload: {0}")]
    Parse(String),
    #[error("store error: {0}")]
    Other(String),
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

/// The slice of Redis the relay uses. Kept narrow so tests can swap in
/// `MockRedisClient` from the `mock` module.
#[async_trait]
pub trait Client {
    /// Pop the head of a list, blocking server-side for up to `timeout_secs`.
    /// Returns `Ok(None)` when the timeout elapses with nothing to pop.
    async fn blpop(&self, key: String, timeout_secs: u64) -> Result<Option<String>, StoreError>;
    async fn rpush(&self, key: String, value: String) -> Result<(), StoreError>;
    async fn ltrim(&self, key: String, start: i64, stop: i64) -> Result<(), StoreError>;

    /// Missing key or field maps to `StoreError::NotFound`.
    async fn hget(&self, key: String, field: String) -> Result<String, StoreError>;
    async fn hset(&self, key: String, field: String, value: String) -> Result<(), StoreError>;
    async fn hset_multiple(
        &self,
        key: String,
        entries: &[(String, String)],
    ) -> Result<(), StoreError>;
    async fn hexpire(&self, key: String, field: String, seconds: u64) -> Result<(), StoreError>;

    async fn set(&self, key: String, value: String) -> Result<(), StoreError>;
    async fn set_ex(&self, key: String, value: String, seconds: u64) -> Result<(), StoreError>;

    /// Subscribe to a pub/sub channel. Payloads arrive on the returned
    /// receiver; a closed receiver ends the subscription.
    async fn subscribe(&self, channel: String) -> Result<mpsc::Receiver<String>, StoreError>;
}

pub type SharedClient = Arc<dyn Client + Send + Sync>;

pub struct RedisClient {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, StoreError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisClient { client, connection })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn blpop(&self, key: String, timeout_secs: u64) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.blpop(key, timeout_secs as f64);
        // The server bounds the block; the client-side margin only catches a
        // dead connection.
        let popped: Option<(String, String)> = timeout(
            Duration::from_secs(timeout_secs + BLOCKING_POP_MARGIN_SECS),
            results,
        )
        .await??;
        Ok(popped.map(|(_, value)| value))
    }

    async fn rpush(&self, key: String, value: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.rpush(key, value);
        let _: i64 = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn ltrim(&self, key: String, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.ltrim(key, start as isize, stop as isize);
        let _: () = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn hget(&self, key: String, field: String) -> Result<String, StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.hget(key, field);
        let value: Option<String> =
            timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        value.ok_or(StoreError::NotFound)
    }

    async fn hset(&self, key: String, field: String, value: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.hset(key, field, value);
        let _: () = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn hset_multiple(
        &self,
        key: String,
        entries: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.hset_multiple(key, entries);
        let _: () = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn hexpire(&self, key: String, field: String, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("HEXPIRE");
        cmd.arg(&key).arg(seconds).arg("FIELDS").arg(1).arg(&field);
        let results = cmd.query_async::<_, Vec<i64>>(&mut conn);
        timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.set(key, value);
        let _: () = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn set_ex(&self, key: String, value: String, seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let results = conn.set_ex(key, value, seconds as usize);
        let _: () = timeout(Duration::from_millis(COMMAND_TIMEOUT_MILLISECS), results).await??;
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<mpsc::Receiver<String>, StoreError> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&channel).await?;

        let (sender, receiver) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("dropping unreadable pub/sub payload: {}", err);
                        continue;
                    }
                };
                if sender.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(receiver)
    }
}
