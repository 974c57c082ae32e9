use relay_common::redis::{SharedClient, StoreError};

const WEBHOOK_ERRORS_PREFIX: &str = "discord_webhook_queue:webhook_id_errors";

/// Publishes per-webhook error flags to the shared store so peer services can
/// surface broken webhooks. Flags are cleared on any successful (or merely
/// rate limited) response from the same webhook.
#[derive(Clone)]
pub struct WebhookErrorState {
    store: SharedClient,
}

impl WebhookErrorState {
    pub fn new(store: SharedClient) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        webhook_id: &str,
        http_401: bool,
        http_403: bool,
        http_404: bool,
    ) -> Result<(), StoreError> {
        self.store
            .hset_multiple(key(webhook_id), &flag_fields(http_401, http_403, http_404))
            .await
    }

    pub async fn clear(&self, webhook_id: &str) -> Result<(), StoreError> {
        self.record(webhook_id, false, false, false).await
    }
}

fn key(webhook_id: &str) -> String {
    format!("{WEBHOOK_ERRORS_PREFIX}:{webhook_id}")
}

fn flag_fields(http_401: bool, http_403: bool, http_404: bool) -> Vec<(String, String)> {
    vec![
        ("http_401".to_string(), flag(http_401)),
        ("http_403".to_string(), flag(http_403)),
        ("http_404".to_string(), flag(http_404)),
    ]
}

// Peers decode these the way the store driver wrote booleans: 1/0.
fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}
