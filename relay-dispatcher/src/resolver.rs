use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info};

use relay_common::message::{extract_webhook_id, Message};

use crate::dispatcher::{FIRST_TIME_QUEUE, POP_ERROR_BACKOFF, ROUTING_HASH, SHARED_POP_TIMEOUT_SECS};
use crate::error::WebhookError;
use crate::registry::DispatchContext;
use crate::worker::{BACKOFF_STEP, BUCKET_QUEUE_PREFIX};

/// Serial discovery of webhook → bucket routings. Retries here block the
/// first-time queue, which is acceptable: after any successful attempt the
/// webhook routes through its bucket queue, and there are only so many
/// distinct places the producer dispatches webhooks from.
pub struct FirstTimeResolver {
    ctx: Arc<DispatchContext>,
}

impl FirstTimeResolver {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) {
        info!("resolving new webhooks from {}", FIRST_TIME_QUEUE);
        loop {
            let raw = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return,
                popped = self.ctx.store.blpop(FIRST_TIME_QUEUE.to_string(), SHARED_POP_TIMEOUT_SECS) => {
                    match popped {
                        Ok(Some(raw)) => raw,
                        Ok(None) => continue,
                        Err(err) => {
                            error!("first-time pop error: {}", err);
                            sleep(POP_ERROR_BACKOFF).await;
                            continue;
                        }
                    }
                }
            };
            self.resolve(&raw).await;
        }
    }

    /// Resolve one first-time message: either its bucket became known while
    /// it sat in the queue, or it is sent directly and the discovered bucket
    /// is recorded for everyone else.
    pub async fn resolve(&self, raw: &str) {
        let mut msg: Message = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(err) => {
                error!("first-time unmarshal error: {}, JSON: {}", err, raw);
                return;
            }
        };
        msg.message_number = rand::random();

        let Some(webhook_id) = extract_webhook_id(&msg.payload.url) else {
            error!("could not parse a webhook id from: {}", msg.payload.url);
            return;
        };

        // The bucket may have been discovered between enqueue and pop.
        if let Ok(bucket) = self
            .ctx
            .store
            .hget(ROUTING_HASH.to_string(), webhook_id.clone())
            .await
        {
            self.forward(&bucket, &msg).await;
            return;
        }

        let worker = self.ctx.new_worker("");
        for attempt in 0..self.ctx.settings.max_reattempts {
            if msg.discardable {
                break;
            }
            match worker.send_once(&mut msg).await {
                Ok(bucket) => {
                    if let Err(err) = self
                        .ctx
                        .store
                        .hset(ROUTING_HASH.to_string(), webhook_id.clone(), bucket.clone())
                        .await
                    {
                        error!("failed to record the routing for {}: {}", webhook_id, err);
                    }
                    // The worker keeps the rate limit state this send built.
                    self.ctx.adopt_worker(&bucket, worker.clone());
                    self.trim_bucket_queue(&bucket).await;
                    return;
                }
                Err(WebhookError::RateLimited { sleep: wait }) => {
                    error!("first-time rate limited: retrying in {:?}", wait);
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => return,
                        _ = sleep(wait) => {}
                    }
                }
                Err(err) => {
                    error!("first-time send error: {}", err);
                    if msg.discardable {
                        break;
                    }
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => return,
                        _ = sleep(BACKOFF_STEP * (attempt as u32 + 1)) => {}
                    }
                }
            }
        }
    }

    async fn forward(&self, bucket: &str, msg: &Message) {
        let encoded = match serde_json::to_string(msg) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("marshal error for {}: {}", msg, err);
                return;
            }
        };
        let queue_key = format!("{BUCKET_QUEUE_PREFIX}{bucket}");
        if let Err(err) = self.ctx.store.rpush(queue_key.clone(), encoded).await {
            error!("failed to push to {}: {}", queue_key, err);
            return;
        }
        self.trim_bucket_queue(bucket).await;
    }

    async fn trim_bucket_queue(&self, bucket: &str) {
        let queue_key = format!("{BUCKET_QUEUE_PREFIX}{bucket}");
        let keep = self.ctx.settings.max_queue_length - 1;
        if let Err(err) = self.ctx.store.ltrim(queue_key.clone(), 0, keep).await {
            error!("failed to trim {}: {}", queue_key, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method, MockServer};
    use relay_common::mock::MockRedisClient;

    use super::*;
    use crate::registry::tests::test_context;

    fn first_time_message(url: &str) -> String {
        format!(r#"{{"server_number": 1, "payload": {{"url": "{url}", "webhook_id": "42"}}}}"#)
    }

    #[tokio::test]
    async fn discovery_records_the_routing_and_registers_a_worker() {
        let server = MockServer::start();
        let provider = server.mock(|when, then| {
            when.method(Method::POST).path("/webhooks/42/tok");
            then.status(200)
                .header("X-RateLimit-Bucket", "b7")
                .header("X-RateLimit-Remaining", "4");
        });

        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let resolver = FirstTimeResolver::new(ctx.clone());

        resolver
            .resolve(&first_time_message(&server.url("/webhooks/42/tok")))
            .await;

        provider.assert_hits(1);
        assert_eq!(store.hash_field(ROUTING_HASH, "42").as_deref(), Some("b7"));
        let worker = ctx.registry.get("b7").expect("worker for b7");
        assert_eq!(worker.bucket(), "b7");
        // The message was delivered directly, never re-queued.
        assert!(store.list(FIRST_TIME_QUEUE).is_empty());
        assert!(store.list("discord_webhook_queue:bucket:b7").is_empty());
    }

    #[tokio::test]
    async fn already_known_webhooks_are_forwarded() {
        let store = MockRedisClient::new();
        store.seed_hash_field(ROUTING_HASH, "42", "b1");
        let ctx = test_context(&store);
        let resolver = FirstTimeResolver::new(ctx.clone());

        resolver
            .resolve(&first_time_message("http://localhost:1/webhooks/42/tok"))
            .await;

        // Forwarded without an HTTP attempt (the URL is unreachable anyway).
        assert_eq!(store.list("discord_webhook_queue:bucket:b1").len(), 1);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_rejections_end_discovery() {
        let server = MockServer::start();
        let provider = server.mock(|when, then| {
            when.method(Method::POST);
            then.status(401);
        });

        let store = MockRedisClient::new();
        let ctx = test_context(&store);
        let resolver = FirstTimeResolver::new(ctx.clone());

        resolver
            .resolve(&first_time_message(&server.url("/webhooks/42/tok")))
            .await;

        provider.assert_hits(1);
        assert_eq!(store.hash_field(ROUTING_HASH, "42"), None);
        assert!(ctx.registry.is_empty());
    }
}
