//! An in-memory stand-in for the Redis client, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::redis::{Client, StoreError};

/// One recorded store operation, for call-order assertions.
#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: &'static str,
    pub key: String,
    pub value: String,
    pub ttl: Option<u64>,
}

#[derive(Default)]
struct MockStore {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, String>,
    ttls: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
    calls: Vec<MockRedisCall>,
}

/// Mimics the subset of Redis behavior the relay relies on: FIFO lists,
/// hashes, strings with TTLs and pub/sub fan-out. Every mutation is recorded.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    inner: Arc<Mutex<MockStore>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockStore> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &'static str, key: &str, value: &str, ttl: Option<u64>) {
        self.lock().calls.push(MockRedisCall {
            op,
            key: key.to_owned(),
            value: value.to_owned(),
            ttl,
        });
    }

    // Seeding helpers.

    pub fn seed_list(&self, key: &str, value: &str) {
        self.lock()
            .lists
            .entry(key.to_owned())
            .or_default()
            .push_back(value.to_owned());
    }

    pub fn seed_hash_field(&self, key: &str, field: &str, value: &str) {
        self.lock()
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
    }

    // Inspection helpers.

    pub fn list(&self, key: &str) -> Vec<String> {
        self.lock()
            .lists
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.lock()
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field).cloned())
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.lock().strings.get(key).cloned()
    }

    /// TTL recorded by `set_ex`, or by `hexpire` under `<key>:<field>`.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.lock().ttls.get(key).copied()
    }

    pub fn calls(&self) -> Vec<MockRedisCall> {
        self.lock().calls.clone()
    }

    /// Deliver a payload to every live subscriber of `channel`.
    pub async fn publish(&self, channel: &str, payload: &str) {
        let senders = self
            .lock()
            .subscribers
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for sender in senders {
            sender.send(payload.to_owned()).await.ok();
        }
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn blpop(&self, key: String, _timeout_secs: u64) -> Result<Option<String>, StoreError> {
        self.record("blpop", &key, "", None);
        if let Some(value) = self.lock().lists.get_mut(&key).and_then(VecDeque::pop_front) {
            return Ok(Some(value));
        }
        // Stand in for the server-side block without stalling tests.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(self.lock().lists.get_mut(&key).and_then(VecDeque::pop_front))
    }

    async fn rpush(&self, key: String, value: String) -> Result<(), StoreError> {
        self.record("rpush", &key, &value, None);
        self.lock()
            .lists
            .entry(key)
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn ltrim(&self, key: String, start: i64, stop: i64) -> Result<(), StoreError> {
        self.record("ltrim", &key, &format!("{start}:{stop}"), None);
        let mut store = self.lock();
        if let Some(values) = store.lists.get_mut(&key) {
            let keep = (stop - start + 1).max(0) as usize;
            values.drain(..(start.max(0) as usize).min(values.len()));
            values.truncate(keep);
        }
        Ok(())
    }

    async fn hget(&self, key: String, field: String) -> Result<String, StoreError> {
        self.record("hget", &key, &field, None);
        self.lock()
            .hashes
            .get(&key)
            .and_then(|fields| fields.get(&field).cloned())
            .ok_or(StoreError::NotFound)
    }

    async fn hset(&self, key: String, field: String, value: String) -> Result<(), StoreError> {
        self.record("hset", &key, &format!("{field}={value}"), None);
        self.lock()
            .hashes
            .entry(key)
            .or_default()
            .insert(field, value);
        Ok(())
    }

    async fn hset_multiple(
        &self,
        key: String,
        entries: &[(String, String)],
    ) -> Result<(), StoreError> {
        for (field, value) in entries {
            self.hset(key.clone(), field.clone(), value.clone()).await?;
        }
        Ok(())
    }

    async fn hexpire(&self, key: String, field: String, seconds: u64) -> Result<(), StoreError> {
        self.record("hexpire", &key, &field, Some(seconds));
        self.lock().ttls.insert(format!("{key}:{field}"), seconds);
        Ok(())
    }

    async fn set(&self, key: String, value: String) -> Result<(), StoreError> {
        self.record("set", &key, &value, None);
        self.lock().strings.insert(key, value);
        Ok(())
    }

    async fn set_ex(&self, key: String, value: String, seconds: u64) -> Result<(), StoreError> {
        self.record("set_ex", &key, &value, Some(seconds));
        let mut store = self.lock();
        store.ttls.insert(key.clone(), seconds);
        store.strings.insert(key, value);
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<mpsc::Receiver<String>, StoreError> {
        self.record("subscribe", &channel, "", None);
        let (sender, receiver) = mpsc::channel(16);
        self.lock()
            .subscribers
            .entry(channel)
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_pop_in_fifo_order() {
        let store = MockRedisClient::new();
        store.rpush("q".to_string(), "one".to_string()).await.unwrap();
        store.rpush("q".to_string(), "two".to_string()).await.unwrap();

        assert_eq!(store.blpop("q".to_string(), 1).await.unwrap(), Some("one".to_string()));
        assert_eq!(store.blpop("q".to_string(), 1).await.unwrap(), Some("two".to_string()));
        assert_eq!(store.blpop("q".to_string(), 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ltrim_keeps_the_head() {
        let store = MockRedisClient::new();
        for value in ["a", "b", "c", "d"] {
            store.rpush("q".to_string(), value.to_string()).await.unwrap();
        }
        store.ltrim("q".to_string(), 0, 2).await.unwrap();

        assert_eq!(store.list("q"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn missing_hash_field_is_not_found() {
        let store = MockRedisClient::new();
        let err = store
            .hget("h".to_string(), "field".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MockRedisClient::new();
        let mut feed = store.subscribe("chan".to_string()).await.unwrap();
        store.publish("chan", "hello").await;

        assert_eq!(feed.recv().await, Some("hello".to_string()));
    }
}
