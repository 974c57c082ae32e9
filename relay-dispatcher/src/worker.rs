use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::StatusCode;
use reqwest::header;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_common::message::{extract_webhook_id, AllowedMentions, Embed, Message};
use relay_common::redis::SharedClient;

use crate::error::WebhookError;
use crate::limit::{LocalWindow, RateLimitState};
use crate::registry::DispatchSettings;
use crate::webhook_errors::WebhookErrorState;

pub(crate) const BUCKET_QUEUE_PREFIX: &str = "discord_webhook_queue:bucket:";
const MESSAGE_404_PREFIX: &str = "discord_webhook:message_404";
const BUCKET_RL_COUNT_PREFIX: &str = "discord_webhook_bucket_rl_count";
const GLOBAL_RL_KEY: &str = "discord_webhook:global_rate_limited";

const BUCKET_POP_TIMEOUT_SECS: u64 = 5;
/// A message that keeps failing is dropped after this many attempts, even
/// when the configured reattempt cap is higher.
const DROPPED_AFTER_ATTEMPTS: usize = 3;
pub(crate) const BACKOFF_STEP: Duration = Duration::from_secs(2);

/// The JSON body the provider accepts. Everything else on the message is
/// internal bookkeeping and must not go over the wire.
#[derive(Serialize)]
struct OutboundBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a String>,
    embeds: &'a [Embed],
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_mentions: Option<&'a AllowedMentions>,
}

/// Owns one rate limit bucket: its queue, its quota snapshot, and the only
/// durable send loop allowed to talk to the provider for that bucket.
pub struct BucketWorker {
    store: SharedClient,
    http: reqwest::Client,
    local_window: Arc<LocalWindow>,
    webhook_errors: WebhookErrorState,
    bucket: Mutex<String>,
    state: Mutex<RateLimitState>,
    settings: DispatchSettings,
    shutdown: CancellationToken,
}

impl BucketWorker {
    pub fn new(
        store: SharedClient,
        http: reqwest::Client,
        local_window: Arc<LocalWindow>,
        webhook_errors: WebhookErrorState,
        bucket: &str,
        settings: DispatchSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            http,
            local_window,
            webhook_errors,
            bucket: Mutex::new(bucket.to_owned()),
            state: Mutex::new(RateLimitState::default()),
            settings,
            shutdown,
        }
    }

    pub fn bucket(&self) -> String {
        self.bucket.lock().expect("poisoned bucket mutex").clone()
    }

    /// Rename the worker once the provider reveals its bucket. Only the
    /// discovery paths call this, before the worker's loop is spawned.
    pub fn set_bucket(&self, bucket: &str) {
        *self.bucket.lock().expect("poisoned bucket mutex") = bucket.to_owned();
    }

    fn queue_key(&self) -> String {
        format!("{BUCKET_QUEUE_PREFIX}{}", self.bucket())
    }

    /// Drain this bucket's queue until shutdown. One message at a time keeps
    /// the per-bucket FIFO order and the one-in-flight-request invariant.
    pub async fn process_queue(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let now = SystemTime::now();
            let wait = {
                let mut state = self.state.lock().expect("poisoned rate limit state mutex");
                state.maybe_reset(now);
                if state.limited || state.remaining <= 0 {
                    Some(state.time_until_reset(now))
                } else {
                    None
                }
            };
            if let Some(wait) = wait {
                if !wait.is_zero() {
                    info!("bucket {} waiting {:?}", self.bucket(), wait);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(wait) => {}
                    }
                }
                continue;
            }

            let queue_key = self.queue_key();
            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                popped = self.store.blpop(queue_key.clone(), BUCKET_POP_TIMEOUT_SECS) => {
                    match popped {
                        Ok(Some(raw)) => raw,
                        Ok(None) => continue,
                        Err(err) => {
                            error!("error popping from {}: {}", queue_key, err);
                            continue;
                        }
                    }
                }
            };

            let mut msg: Message = match serde_json::from_str(&raw) {
                Ok(msg) => msg,
                Err(err) => {
                    error!("unmarshal error: {}, JSON: {}", err, raw);
                    continue;
                }
            };
            msg.message_number = rand::random();

            self.deliver(&mut msg).await;
        }
    }

    /// Retry one message in place rather than re-enqueueing it. A bad message
    /// cannot block its queue forever, and when this message errors the ones
    /// behind it would very likely error the same way.
    async fn deliver(&self, msg: &mut Message) {
        let labels = [("bucket", self.bucket())];
        metrics::counter!("relay_messages_total", &labels).increment(1);

        for attempt in 0..self.settings.max_reattempts {
            if msg.discardable {
                break;
            }

            match self.send_once(msg).await {
                Ok(_) => {
                    metrics::counter!("relay_messages_delivered", &labels).increment(1);
                    return;
                }
                Err(err) => {
                    info!(
                        "retry {} for {} in bucket {}: {}",
                        attempt + 1,
                        msg.message_number,
                        self.bucket(),
                        err
                    );
                    if attempt + 1 == DROPPED_AFTER_ATTEMPTS {
                        warn!(
                            "dropped after {} retries: {}",
                            DROPPED_AFTER_ATTEMPTS, msg.payload.url
                        );
                        break;
                    }
                    if msg.discardable {
                        break;
                    }

                    let wait = {
                        let state = self.state.lock().expect("poisoned rate limit state mutex");
                        state.rate_limit_sleep(SystemTime::now())
                    };
                    let wait = if wait.is_zero() {
                        // Failed for some reason other than rate limiting.
                        BACKOFF_STEP * (attempt as u32 + 1)
                    } else {
                        wait
                    };
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(wait) => {}
                    }
                }
            }
        }

        metrics::counter!("relay_messages_dropped", &labels).increment(1);
    }

    /// One attempt against the provider: admission through the local window,
    /// the request itself, response classification, and the rate limit
    /// bookkeeping. Returns the bucket id the provider reported.
    pub async fn send_once(&self, msg: &mut Message) -> Result<String, WebhookError> {
        self.local_window.acquire()?;

        let body = serde_json::to_string(&OutboundBody {
            content: msg.payload.content.as_ref(),
            embeds: &msg.payload.embeds,
            allowed_mentions: msg.payload.allowed_mentions.as_ref(),
        })?;

        let response = if msg.edit {
            let Some(message_id) = msg.payload.message_id.as_deref() else {
                msg.discardable = true;
                return Err(WebhookError::MissingMessageId);
            };
            let url = format!("{}/messages/{}", msg.payload.url, message_id);
            execute(&self.http, http::Method::PATCH, url, body).await?
        } else {
            execute(&self.http, http::Method::POST, msg.payload.url.clone(), body).await?
        };

        let status = response.status();
        let headers = response.headers();

        // Anything that is neither a 429 nor a server error will not get
        // better on a retry.
        if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
            msg.discardable = true;
        }

        // The id was parseable when the message was routed here.
        let webhook_id = extract_webhook_id(&msg.payload.url).unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => self.flag_webhook(&webhook_id, true, false, false).await,
            StatusCode::FORBIDDEN => self.flag_webhook(&webhook_id, false, true, false).await,
            StatusCode::NOT_FOUND => self.flag_webhook(&webhook_id, false, false, true).await,
            _ => {}
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(message_id) = msg.payload.message_id.as_deref() {
                let key = format!("{MESSAGE_404_PREFIX}:{message_id}");
                if let Err(err) = self.store.set(key, "1".to_string()).await {
                    error!("failed to record the 404 marker for {}: {}", message_id, err);
                }
            }
            return Err(WebhookError::MessageNotFound {
                message_id: msg.payload.message_id.clone(),
            });
        }

        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(WebhookError::InvalidWebhookUrl(msg.payload.url.clone()));
        }

        if matches!(
            status,
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::TOO_MANY_REQUESTS
        ) {
            // These responses carry valid rate limit headers, and prove the
            // webhook itself is fine.
            if let Err(err) = self.webhook_errors.clear(&webhook_id).await {
                error!("failed to clear error flags for {}: {}", webhook_id, err);
            }

            let bucket = headers
                .get("X-RateLimit-Bucket")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();

            let (sleep_time, reset_at, reset_after) = {
                let mut state = self.state.lock().expect("poisoned rate limit state mutex");
                state.update_from_headers(headers);
                state.limited = status == StatusCode::TOO_MANY_REQUESTS;
                (
                    state.rate_limit_sleep(SystemTime::now()),
                    state.reset_at,
                    state.reset_after,
                )
            };

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("HTTP 429 for bucket {}", bucket);
                metrics::counter!("relay_rate_limited_total", &[("bucket", bucket.clone())])
                    .increment(1);
                self.record_rate_limit(&bucket).await;

                if headers.contains_key("X-RateLimit-Global") {
                    // Every worker discovers the pause on its own; the store
                    // flag is for peers, and it expires with the TTL.
                    warn!("global rate limit hit, pausing for {:?}", reset_after);
                    self.set_globally_rate_limited(reset_at, reset_after).await;
                    self.local_window.exhaust();
                }
                return Err(WebhookError::RateLimited { sleep: sleep_time });
            }

            return Ok(bucket);
        }

        Err(WebhookError::UnhandledStatus(status))
    }

    async fn flag_webhook(&self, webhook_id: &str, http_401: bool, http_403: bool, http_404: bool) {
        if let Err(err) = self
            .webhook_errors
            .record(webhook_id, http_401, http_403, http_404)
            .await
        {
            error!("failed to record error flags for {}: {}", webhook_id, err);
        }
    }

    /// Count this 429 so peers can report how often a bucket was limited
    /// within the configured window. Entries expire on their own.
    async fn record_rate_limit(&self, bucket: &str) {
        let key = format!("{BUCKET_RL_COUNT_PREFIX}:{bucket}");
        let field = unix_seconds(SystemTime::now()).to_string();
        if let Err(err) = self.store.hset(key.clone(), field.clone(), "1".to_string()).await {
            error!("failed to count a rate limit for {}: {}", bucket, err);
            return;
        }
        let window = self.settings.rate_limit_count_window.as_secs();
        if let Err(err) = self.store.hexpire(key, field, window).await {
            error!("failed to expire the rate limit count for {}: {}", bucket, err);
        }
    }

    async fn set_globally_rate_limited(&self, reset_at: Option<SystemTime>, reset_after: Duration) {
        let reset_unix = reset_at.map(unix_seconds).unwrap_or_default();
        let ttl = reset_after.as_secs().max(1);
        if let Err(err) = self
            .store
            .set_ex(GLOBAL_RL_KEY.to_string(), reset_unix.to_string(), ttl)
            .await
        {
            error!("failed to flag the global rate limit: {}", err);
        }
    }
}

/// Issue one request to the provider. Content type aside, this layer never
/// interprets anything; classification and retries live upstream.
async fn execute(
    client: &reqwest::Client,
    method: http::Method,
    url: String,
    body: String,
) -> Result<reqwest::Response, reqwest::Error> {
    client
        .request(method, url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
}

fn unix_seconds(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
