//! Relay durable and transient webhook messages from the shared store to the
//! provider, one rate limit bucket at a time.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_common::metrics::{serve, setup_metrics_routes};
use relay_common::redis::{RedisClient, SharedClient};
use relay_dispatcher::config::Config;
use relay_dispatcher::dispatcher::Dispatcher;
use relay_dispatcher::error::ServiceError;
use relay_dispatcher::limit::LocalWindow;
use relay_dispatcher::registry::{DispatchContext, DispatchSettings, WorkerRegistry};
use relay_dispatcher::resolver::FirstTimeResolver;
use relay_dispatcher::transient::TransientSubscriber;
use relay_dispatcher::webhook_errors::WebhookErrorState;

/// The container health probe looks for this file.
const HEALTH_FILE: &str = "/app/webhook-service-healthy";

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;
    info!("starting webhook relay, tag {}", config.tagged_version);

    let store: SharedClient = Arc::new(RedisClient::new(config.redis_url()).await?);

    if let Err(err) = std::fs::File::create(HEALTH_FILE) {
        warn!("could not create the health probe file: {}", err);
    }

    let http = reqwest::Client::builder()
        .user_agent("hll-webhook-relay")
        .build()
        .expect("failed to construct the reqwest client for the relay");

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(DispatchContext {
        store: store.clone(),
        http,
        local_window: Arc::new(LocalWindow::new(config.max_sends_per_sec)),
        webhook_errors: WebhookErrorState::new(store),
        registry: WorkerRegistry::default(),
        settings: DispatchSettings {
            max_queue_length: config.max_queue_length,
            max_reattempts: config.max_reattempts,
            rate_limit_count_window: config.rate_limit_count_window.0,
        },
        shutdown: shutdown.clone(),
    });

    let dispatcher = Dispatcher::new(ctx.clone());
    tokio::spawn(async move { dispatcher.run().await });

    let resolver = FirstTimeResolver::new(ctx.clone());
    tokio::spawn(async move { resolver.run().await });

    let subscriber = TransientSubscriber::new(ctx.clone());
    tokio::spawn(async move { subscriber.run().await });

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(index));
    let router = setup_metrics_routes(router);
    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    tokio::spawn(async move {
        if let Err(err) = serve(listener, router).await {
            error!("metrics server error: {}", err);
        }
    });

    wait_for_shutdown_signal().await;
    info!("graceful shutdown");
    shutdown.cancel();

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install the SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn index() -> &'static str {
    "webhook relay"
}
