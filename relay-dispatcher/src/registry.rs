use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_common::redis::SharedClient;

use crate::limit::LocalWindow;
use crate::webhook_errors::WebhookErrorState;
use crate::worker::BucketWorker;

/// Runtime knobs shared by every component, taken from the environment once.
#[derive(Clone)]
pub struct DispatchSettings {
    pub max_queue_length: i64,
    pub max_reattempts: usize,
    pub rate_limit_count_window: Duration,
}

/// bucket-id → worker, behind a single mutex. One worker per bucket is the
/// invariant that makes per-bucket rate limit headers authoritative.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<String, Arc<BucketWorker>>>>,
}

impl WorkerRegistry {
    pub fn get(&self, bucket: &str) -> Option<Arc<BucketWorker>> {
        self.workers
            .lock()
            .expect("poisoned worker registry mutex")
            .get(bucket)
            .cloned()
    }

    /// Register `worker` unless the bucket already has one. Returns whether
    /// the insert happened, so exactly one caller spawns the worker's loop.
    pub fn insert_if_absent(&self, bucket: &str, worker: &Arc<BucketWorker>) -> bool {
        let mut workers = self
            .workers
            .lock()
            .expect("poisoned worker registry mutex");
        if workers.contains_key(bucket) {
            return false;
        }
        workers.insert(bucket.to_owned(), worker.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.workers
            .lock()
            .expect("poisoned worker registry mutex")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the dispatch loops share: the store, the HTTP client, the local
/// window, the error flags, the worker registry and the shutdown signal.
pub struct DispatchContext {
    pub store: SharedClient,
    pub http: reqwest::Client,
    pub local_window: Arc<LocalWindow>,
    pub webhook_errors: WebhookErrorState,
    pub registry: WorkerRegistry,
    pub settings: DispatchSettings,
    pub shutdown: CancellationToken,
}

impl DispatchContext {
    /// A worker that is not yet registered: used by the discovery paths
    /// before the provider has revealed which bucket the webhook lives in.
    pub fn new_worker(&self, bucket: &str) -> Arc<BucketWorker> {
        Arc::new(BucketWorker::new(
            self.store.clone(),
            self.http.clone(),
            self.local_window.clone(),
            self.webhook_errors.clone(),
            bucket,
            self.settings.clone(),
            self.shutdown.clone(),
        ))
    }

    /// The registered worker for `bucket`, spawning a fresh one when none
    /// exists yet.
    pub fn ensure_worker(&self, bucket: &str) -> Arc<BucketWorker> {
        if let Some(worker) = self.registry.get(bucket) {
            return worker;
        }
        let worker = self.new_worker(bucket);
        if self.registry.insert_if_absent(bucket, &worker) {
            tokio::spawn(worker.clone().process_queue());
            worker
        } else {
            self.registry
                .get(bucket)
                .expect("registered workers are never removed")
        }
    }

    /// Hand a discovery worker over to the registry under its freshly
    /// revealed bucket, keeping the rate limit state it built up. Dropped
    /// silently when the bucket already has a worker.
    pub fn adopt_worker(&self, bucket: &str, worker: Arc<BucketWorker>) {
        worker.set_bucket(bucket);
        if self.registry.insert_if_absent(bucket, &worker) {
            tokio::spawn(worker.process_queue());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use relay_common::mock::MockRedisClient;

    use super::*;

    pub(crate) fn test_context(store: &MockRedisClient) -> Arc<DispatchContext> {
        let shared: SharedClient = Arc::new(store.clone());
        let shutdown = CancellationToken::new();
        // Cancelled up front so spawned worker loops exit immediately.
        shutdown.cancel();
        Arc::new(DispatchContext {
            store: shared.clone(),
            http: reqwest::Client::new(),
            local_window: Arc::new(LocalWindow::new(45)),
            webhook_errors: WebhookErrorState::new(shared),
            registry: WorkerRegistry::default(),
            settings: DispatchSettings {
                max_queue_length: 150,
                max_reattempts: 5,
                rate_limit_count_window: Duration::from_secs(600),
            },
            shutdown,
        })
    }

    #[tokio::test]
    async fn ensure_worker_registers_one_worker_per_bucket() {
        let ctx = test_context(&MockRedisClient::new());

        let first = ctx.ensure_worker("b1");
        let second = ctx.ensure_worker("b1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn adopt_worker_keeps_the_existing_worker() {
        let ctx = test_context(&MockRedisClient::new());

        let existing = ctx.ensure_worker("b1");
        let fresh = ctx.new_worker("");
        ctx.adopt_worker("b1", fresh);

        assert!(Arc::ptr_eq(&ctx.registry.get("b1").unwrap(), &existing));
    }

    #[tokio::test]
    async fn adopt_worker_renames_and_registers() {
        let ctx = test_context(&MockRedisClient::new());

        let fresh = ctx.new_worker("");
        ctx.adopt_worker("b7", fresh.clone());

        assert_eq!(fresh.bucket(), "b7");
        assert!(ctx.registry.get("b7").is_some());
    }
}
