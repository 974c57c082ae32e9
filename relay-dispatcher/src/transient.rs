use std::sync::Arc;

use tokio::time::sleep;
use tracing::{error, info, warn};

use relay_common::message::{extract_webhook_id, Message};

use crate::dispatcher::{POP_ERROR_BACKOFF, ROUTING_HASH};
use crate::registry::DispatchContext;

pub(crate) const TRANSIENT_CHANNEL: &str = "discord_webhook_transient:channel";

/// Fire-and-forget delivery off the broadcast channel. Pub/sub drops
/// unhandled payloads on its own, which is exactly the contract these
/// messages want: no queueing, no retries.
pub struct TransientSubscriber {
    ctx: Arc<DispatchContext>,
}

impl TransientSubscriber {
    pub fn new(ctx: Arc<DispatchContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) {
        loop {
            let mut feed = match self.ctx.store.subscribe(TRANSIENT_CHANNEL.to_string()).await {
                Ok(feed) => feed,
                Err(err) => {
                    error!("transient subscribe error: {}", err);
                    tokio::select! {
                        _ = self.ctx.shutdown.cancelled() => return,
                        _ = sleep(POP_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };
            info!("subscribed to {}", TRANSIENT_CHANNEL);

            loop {
                tokio::select! {
                    _ = self.ctx.shutdown.cancelled() => return,
                    received = feed.recv() => match received {
                        Some(payload) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                process_transient(ctx, payload).await;
                            });
                        }
                        None => {
                            warn!("transient channel closed, resubscribing");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Send one transient message through its bucket's worker, or through a
/// throwaway worker when the bucket is still unknown. A successful send
/// records the discovered routing for the durable paths.
pub(crate) async fn process_transient(ctx: Arc<DispatchContext>, payload: String) {
    let mut msg: Message = match serde_json::from_str(&payload) {
        Ok(msg) => msg,
        Err(err) => {
            error!("transient unmarshal error: {}, JSON: {}", err, payload);
            return;
        }
    };
    msg.message_number = rand::random();

    let Some(webhook_id) = extract_webhook_id(&msg.payload.url) else {
        error!("could not parse a webhook id from: {}", msg.payload.url);
        return;
    };

    let worker = match ctx
        .store
        .hget(ROUTING_HASH.to_string(), webhook_id.clone())
        .await
    {
        Ok(bucket) => ctx
            .registry
            .get(&bucket)
            .unwrap_or_else(|| ctx.new_worker(&bucket)),
        Err(_) => ctx.new_worker(""),
    };

    // Transient messages are inherently discardable: one attempt only.
    match worker.send_once(&mut msg).await {
        Ok(bucket) => {
            if !bucket.is_empty() {
                if let Err(err) = ctx
                    .store
                    .hset(ROUTING_HASH.to_string(), webhook_id, bucket)
                    .await
                {
                    error!("failed to record the transient routing: {}", err);
                }
            }
        }
        Err(err) => {
            error!(
                "transient message send error for {}: {}",
                msg.payload.webhook_id, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::{Method, MockServer};
    use relay_common::mock::MockRedisClient;

    use super::*;
    use crate::registry::tests::test_context;

    fn transient_message(url: &str) -> String {
        format!(
            r#"{{"server_number": 1, "message_type": "scoreboard",
                 "payload": {{"url": "{url}", "webhook_id": "42", "content": "scores"}}}}"#
        )
    }

    #[tokio::test]
    async fn sends_once_and_records_the_routing() {
        let server = MockServer::start();
        let provider = server.mock(|when, then| {
            when.method(Method::POST).path("/webhooks/42/tok");
            then.status(204).header("X-RateLimit-Bucket", "b3");
        });

        let store = MockRedisClient::new();
        let ctx = test_context(&store);

        process_transient(ctx, transient_message(&server.url("/webhooks/42/tok"))).await;

        provider.assert_hits(1);
        assert_eq!(store.hash_field(ROUTING_HASH, "42").as_deref(), Some("b3"));
    }

    #[tokio::test]
    async fn failures_are_not_retried() {
        let server = MockServer::start();
        let provider = server.mock(|when, then| {
            when.method(Method::POST);
            then.status(500);
        });

        let store = MockRedisClient::new();
        let ctx = test_context(&store);

        process_transient(
            ctx,
            transient_message(&server.url("/webhooks/42/tok")),
        )
        .await;

        provider.assert_hits(1);
        assert_eq!(store.hash_field(ROUTING_HASH, "42"), None);
    }

    #[tokio::test]
    async fn known_buckets_reuse_the_registered_worker() {
        let server = MockServer::start();
        let provider = server.mock(|when, then| {
            when.method(Method::POST);
            then.status(204).header("X-RateLimit-Bucket", "b1");
        });

        let store = MockRedisClient::new();
        store.seed_hash_field(ROUTING_HASH, "42", "b1");
        let ctx = test_context(&store);
        let existing = ctx.ensure_worker("b1");

        process_transient(
            ctx.clone(),
            transient_message(&server.url("/webhooks/42/tok")),
        )
        .await;

        provider.assert_hits(1);
        // No second worker appeared for the bucket.
        assert_eq!(ctx.registry.len(), 1);
        assert!(Arc::ptr_eq(&ctx.registry.get("b1").unwrap(), &existing));
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let store = MockRedisClient::new();
        let ctx = test_context(&store);

        process_transient(ctx, "not json".to_string()).await;

        assert!(store.calls().iter().all(|call| call.op != "hget"));
    }
}
