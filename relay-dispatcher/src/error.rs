use std::time::Duration;

use http::StatusCode;
use relay_common::redis::StoreError;
use thiserror::Error;

/// Everything that can go wrong delivering one message. The worker loop
/// decides retry vs. drop from the variant and the message's discardable flag.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("local rate limit exceeded")]
    LocalRateLimitExceeded,
    #[error("rate limited, bucket resets in {sleep:?}")]
    RateLimited { sleep: Duration },
    #[error("{0} is not a valid webhook URL")]
    InvalidWebhookUrl(String),
    #[error("HTTP 404 for message {message_id:?}")]
    MessageNotFound { message_id: Option<String> },
    #[error("edit requested without a message id")]
    MissingMessageId,
    #[error("unhandled HTTP status {0}")]
    UnhandledStatus(StatusCode),
    #[error("error sending webhook request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("error serializing webhook body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Startup failures. Anything past startup is logged and retried, never fatal.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("store connection failed: {0}")]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
