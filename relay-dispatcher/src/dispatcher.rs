use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info};

use relay_common::message::{extract_webhook_id, Message};
use relay_common::redis::StoreError;

use crate::registry::DispatchContext;
use crate::worker::BUCKET_QUEUE_PREFIX;

pub(crate) const INPUT_QUEUE: &str = "discord_webhook_queue:input";
pub(crate) const FIRST_TIME_QUEUE: &str = "discord_webhook_queue:first_time";
pub(crate) const ROUTING_HASH: &str = "discord_webhook:webhook_buckets";

pub(crate) const SHARED_POP_TIMEOUT_SECS: u64 = 30;
pub(crate) const POP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The ingestion loop: pops the producer's queue and fans messages out to
/// per-bucket queues, or to the first-time queue when the webhook's bucket is
/// still unknown.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) {
        info!("dispatching from {}", INPUT_QUEUE);
        loop {
            let raw = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return,
                popped = self.ctx.store.blpop(INPUT_QUEUE.to_string(), SHARED_POP_TIMEOUT_SECS) => {
                    match popped {
                        Ok(Some(raw)) => raw,
                        Ok(None) => continue,
                        Err(err) => {
                            error!("input pop error: {}", err);
                            sleep(POP_ERROR_BACKOFF).await;
                            continue;
                        }
                    }
                }
            };
            self.route(&raw).await;
        }
    }

    /// Route one raw input value. The producer double-encodes: the list value
    /// is a JSON string which itself encodes the message.
    pub async fn route(&self, raw: &str) {
        let inner: String = match serde_json::from_str(raw) {
            Ok(inner) => inner,
            Err(err) => {
                error!("input unmarshal error: {}, JSON: {}", err, raw);
                return;
            }
        };
        let msg: Message = match serde_json::from_str(&inner) {
            Ok(msg) => msg,
            Err(err) => {
                error!("unmarshal error: {}, JSON: {}", err, inner);
                return;
            }
        };

        // Routing is by webhook id: multiple webhooks can share one bucket.
        let Some(webhook_id) = extract_webhook_id(&msg.payload.url) else {
            error!("could not parse a webhook id from: {}", msg.payload.url);
            return;
        };

        let encoded = match serde_json::to_string(&msg) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("marshal error for {}: {}", msg, err);
                return;
            }
        };

        match self
            .ctx
            .store
            .hget(ROUTING_HASH.to_string(), webhook_id.clone())
            .await
        {
            Ok(bucket) => {
                let queue_key = format!("{BUCKET_QUEUE_PREFIX}{bucket}");
                self.push_trimmed(&queue_key, encoded).await;
                self.ctx.ensure_worker(&bucket);
            }
            Err(err) => {
                if !matches!(err, StoreError::NotFound) {
                    // Lookup failures go through discovery too: the resolver
                    // re-checks the routing hash before sending.
                    error!("routing lookup error for {}: {}", webhook_id, err);
                }
                self.push_trimmed(FIRST_TIME_QUEUE, encoded).await;
            }
        }
    }

    async fn push_trimmed(&self, key: &str, value: String) {
        if let Err(err) = self.ctx.store.rpush(key.to_string(), value).await {
            error!("failed to push to {}: {}", key, err);
            return;
        }
        let keep = self.ctx.settings.max_queue_length - 1;
        if let Err(err) = self.ctx.store.ltrim(key.to_string(), 0, keep).await {
            error!("failed to trim {}: {}", key, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_common::mock::MockRedisClient;

    use super::*;
    use crate::registry::tests::test_context;

    fn double_encoded(url: &str) -> String {
        let inner = format!(
            r#"{{"server_number": 1, "payload": {{"url": "{url}", "webhook_id": "42"}}}}"#
        );
        serde_json::to_string(&inner).unwrap()
    }

    #[tokio::test]
    async fn known_webhooks_route_to_their_bucket_queue() {
        let store = MockRedisClient::new();
        store.seed_hash_field(ROUTING_HASH, "42", "b1");
        let ctx = test_context(&store);
        let dispatcher = Dispatcher::new(ctx.clone());

        dispatcher
            .route(&double_encoded("https://discord.com/api/webhooks/42/tok"))
            .await;

        let queued = store.list("discord_webhook_queue:bucket:b1");
        assert_eq!(queued.len(), 1);
        let msg: Message = serde_json::from_str(&queued[0]).unwrap();
        assert_eq!(msg.payload.webhook_id, "42");
        assert!(store.list(FIRST_TIME_QUEUE).is_empty());
        assert!(ctx.registry.get("b1").is_some());
    }

    #[tokio::test]
    async fn unknown_webhooks_route_to_the_first_time_queue() {
        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let dispatcher = Dispatcher::new(ctx.clone());

        dispatcher
            .route(&double_encoded("https://discord.com/api/webhooks/42/tok"))
            .await;

        assert_eq!(store.list(FIRST_TIME_QUEUE).len(), 1);
        assert!(store.list("discord_webhook_queue:bucket:b1").is_empty());
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn unparseable_urls_are_dropped() {
        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let dispatcher = Dispatcher::new(ctx);

        dispatcher
            .route(&double_encoded("https://discord.com/api/other/42"))
            .await;

        assert!(store.list(FIRST_TIME_QUEUE).is_empty());
        // Only the routing lookup never happened; nothing was pushed at all.
        assert!(store.calls().iter().all(|call| call.op != "rpush"));
    }

    #[tokio::test]
    async fn single_encoded_input_is_rejected() {
        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let dispatcher = Dispatcher::new(ctx);

        // A bare message object, not the JSON-string wrapping of it.
        dispatcher
            .route(r#"{"server_number": 1, "payload": {"url": "https://x/webhooks/42/t"}}"#)
            .await;

        assert!(store.list(FIRST_TIME_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn queues_are_trimmed_after_every_push() {
        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let dispatcher = Dispatcher::new(ctx);

        dispatcher
            .route(&double_encoded("https://discord.com/api/webhooks/42/tok"))
            .await;

        let trimmed = store
            .calls()
            .into_iter()
            .find(|call| call.op == "ltrim" && call.key == FIRST_TIME_QUEUE)
            .expect("push should be followed by a trim");
        assert_eq!(trimmed.value, "0:149");
    }
}
