//! Idle pool of pre-initialized aggregator instances.
//!
//! `acquire` hands out a ready instance when one is idle and falls back to a cold build
//! otherwise. Either way a background task refills the namespace back to `depth`. An instance
//! is removed from the pool before it is returned, so no two sessions ever share one.

use crate::aggregator::{Aggregator, AggregatorFactory};
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Slack on top of the per-backend startup timeout for a whole cold build.
const COLD_BUILD_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle instances kept per namespace. `0` disables pooling.
    pub depth: usize,
    pub max_idle_age: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub startup_timeout: Duration,
}

struct PooledAggregator {
    aggregator: Aggregator,
    pooled_at: Instant,
}

#[derive(Debug, Default)]
struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    replenish_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePoolStatus {
    pub namespace: String,
    pub idle: usize,
    pub replenishing: bool,
    pub oldest_idle_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub depth: usize,
    pub max_idle_age_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub replenish_failures: u64,
    pub namespaces: Vec<NamespacePoolStatus>,
}

pub struct IdlePool {
    factory: Arc<AggregatorFactory>,
    config: PoolConfig,
    idle: Mutex<HashMap<String, VecDeque<PooledAggregator>>>,
    replenishing: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    stats: PoolStats,
}

impl IdlePool {
    pub fn new(factory: Arc<AggregatorFactory>, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            idle: Mutex::new(HashMap::new()),
            replenishing: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            stats: PoolStats::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<AggregatorFactory> {
        &self.factory
    }

    /// Get a ready aggregator for `namespace_id`.
    ///
    /// Stale idle entries met on the fast path are skipped and closed in the background. The cold
    /// path is bounded by the startup timeout. Both paths schedule a detached refill.
    pub async fn acquire(self: &Arc<Self>, namespace_id: &str) -> Result<Aggregator> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::BackendUnavailable(
                "gateway is shutting down".to_string(),
            ));
        }

        let (fresh, stale) = self.take_idle(namespace_id);
        self.close_detached(stale);

        if let Some(aggregator) = fresh {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            // Pushed while pooled; nobody was subscribed to these.
            let discarded = aggregator.discard_pending_notifications();
            tracing::debug!(
                namespace = %namespace_id,
                instance_id = aggregator.instance_id(),
                discarded,
                "pool hit"
            );
            self.schedule_replenish(namespace_id);
            return Ok(aggregator);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(namespace = %namespace_id, "pool miss; building aggregator");
        let result = self.build_bounded(namespace_id).await;
        self.schedule_replenish(namespace_id);
        result
    }

    /// Pop the first usable idle entry; everything stale in front of it is returned for closing.
    fn take_idle(&self, namespace_id: &str) -> (Option<Aggregator>, Vec<Aggregator>) {
        let mut stale = Vec::new();
        let mut idle = self.idle.lock();
        let Some(queue) = idle.get_mut(namespace_id) else {
            return (None, stale);
        };
        while let Some(entry) = queue.pop_front() {
            if self.is_stale(&entry) {
                stale.push(entry.aggregator);
                continue;
            }
            return (Some(entry.aggregator), stale);
        }
        (None, stale)
    }

    /// Close evicted instances off the caller's path; backend teardown may be slow.
    fn close_detached(&self, stale: Vec<Aggregator>) {
        if stale.is_empty() {
            return;
        }
        self.stats
            .evictions
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        tokio::spawn(async move {
            for aggregator in stale {
                aggregator.shutdown().await;
            }
        });
    }

    fn is_stale(&self, entry: &PooledAggregator) -> bool {
        entry.pooled_at.elapsed() >= self.config.max_idle_age
            || entry.aggregator.live_backends() == 0
    }

    async fn build_bounded(&self, namespace_id: &str) -> Result<Aggregator> {
        let bound = self.config.startup_timeout + COLD_BUILD_GRACE;
        match tokio::time::timeout(bound, self.factory.build(namespace_id)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::StartupTimeout(bound)),
        }
    }

    pub fn idle_count(&self, namespace_id: &str) -> usize {
        self.idle.lock().get(namespace_id).map_or(0, VecDeque::len)
    }

    /// Start a detached refill of `namespace_id` unless one is already running.
    pub fn schedule_replenish(self: &Arc<Self>, namespace_id: &str) {
        if self.config.depth == 0
            || self.shutdown.is_cancelled()
            || !self.factory.has_namespace(namespace_id)
        {
            return;
        }
        if !self.replenishing.lock().insert(namespace_id.to_string()) {
            return;
        }

        let pool = Arc::clone(self);
        let namespace_id = namespace_id.to_string();
        tokio::spawn(async move {
            loop {
                pool.replenish(&namespace_id).await;
                // An acquire may have drained the namespace after the last fill check but
                // before this task deregistered; re-check under the registration lock.
                let mut replenishing = pool.replenishing.lock();
                if pool.shutdown.is_cancelled() || pool.idle_count(&namespace_id) >= pool.config.depth {
                    replenishing.remove(&namespace_id);
                    return;
                }
            }
        });
    }

    async fn replenish(&self, namespace_id: &str) {
        let mut consecutive_failures: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() || self.idle_count(namespace_id) >= self.config.depth {
                return;
            }

            let built = tokio::select! {
                () = self.shutdown.cancelled() => return,
                r = self.build_bounded(namespace_id) => r,
            };

            match built {
                Ok(aggregator) => {
                    consecutive_failures = 0;
                    if let Some(rejected) = self.push_idle(namespace_id, aggregator) {
                        rejected.shutdown().await;
                        return;
                    }
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.stats.replenish_failures.fetch_add(1, Ordering::Relaxed);
                    let delay = compute_backoff_delay(
                        consecutive_failures,
                        self.config.backoff_min,
                        self.config.backoff_max,
                    );
                    tracing::warn!(
                        namespace = %namespace_id,
                        consecutive_failures,
                        retry_in = ?delay,
                        error = %e,
                        "pool replenish failed"
                    );
                    tokio::select! {
                        () = self.shutdown.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Add a freshly built instance. Hands it back when the pool is full or shutting down.
    fn push_idle(&self, namespace_id: &str, aggregator: Aggregator) -> Option<Aggregator> {
        let mut idle = self.idle.lock();
        if self.shutdown.is_cancelled() {
            return Some(aggregator);
        }
        let queue = idle.entry(namespace_id.to_string()).or_default();
        if queue.len() >= self.config.depth {
            return Some(aggregator);
        }
        tracing::debug!(
            namespace = %namespace_id,
            instance_id = aggregator.instance_id(),
            idle = queue.len() + 1,
            "pool replenished"
        );
        queue.push_back(PooledAggregator {
            aggregator,
            pooled_at: Instant::now(),
        });
        None
    }

    /// Fill each of `namespaces` to `depth` in the background.
    pub fn warm(self: &Arc<Self>, namespaces: &[String]) {
        for namespace_id in namespaces {
            self.schedule_replenish(namespace_id);
        }
    }

    /// Warm the pool after `delay`, so startup is not slowed by backend spawns.
    pub fn spawn_warmup(self: &Arc<Self>, delay: Duration, namespaces: Vec<String>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = pool.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    tracing::info!(
                        depth = pool.config.depth,
                        namespaces = namespaces.len(),
                        "Warming idle pool"
                    );
                    pool.warm(&namespaces);
                }
            }
        })
    }

    /// Close idle instances older than the maximum idle age (or with no live backend left).
    ///
    /// Returns how many were evicted; affected namespaces are refilled.
    pub async fn evict_stale(self: &Arc<Self>) -> usize {
        let mut evicted: Vec<(String, Aggregator)> = Vec::new();
        {
            let mut idle = self.idle.lock();
            for (namespace_id, queue) in idle.iter_mut() {
                let (stale, keep): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|entry| self.is_stale(entry));
                *queue = keep;
                evicted.extend(stale.into_iter().map(|e| (namespace_id.clone(), e.aggregator)));
            }
        }

        let count = evicted.len();
        let mut namespaces = HashSet::new();
        for (namespace_id, aggregator) in evicted {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                namespace = %namespace_id,
                instance_id = aggregator.instance_id(),
                "evicting stale pooled aggregator"
            );
            aggregator.shutdown().await;
            namespaces.insert(namespace_id);
        }
        for namespace_id in namespaces {
            self.schedule_replenish(&namespace_id);
        }
        count
    }

    pub fn spawn_eviction_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pool.shutdown.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let evicted = pool.evict_stale().await;
                if evicted > 0 {
                    tracing::info!(evicted, "Evicted stale pooled aggregators");
                }
            }
        })
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let replenishing = self.replenishing.lock().clone();
        let mut namespaces: Vec<NamespacePoolStatus> = {
            let idle = self.idle.lock();
            self.factory
                .namespace_ids()
                .into_iter()
                .map(|namespace| {
                    let queue = idle.get(&namespace);
                    NamespacePoolStatus {
                        idle: queue.map_or(0, VecDeque::len),
                        oldest_idle_secs: queue
                            .and_then(|q| q.front())
                            .map(|e| e.pooled_at.elapsed().as_secs()),
                        replenishing: replenishing.contains(&namespace),
                        namespace,
                    }
                })
                .collect()
        };
        namespaces.sort_by(|a, b| a.namespace.cmp(&b.namespace));

        PoolSnapshot {
            depth: self.config.depth,
            max_idle_age_secs: self.config.max_idle_age.as_secs(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            replenish_failures: self.stats.replenish_failures.load(Ordering::Relaxed),
            namespaces,
        }
    }

    /// Stop refills and close every idle instance.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<Aggregator> = self
            .idle
            .lock()
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|e| e.aggregator))
            .collect();
        let closed = drained.len();
        for aggregator in drained {
            aggregator.shutdown().await;
        }
        tracing::info!(closed, "Idle pool shut down");
    }
}

/// Exponential backoff: `min * 2^(failures-1)`, capped at `max`.
pub fn compute_backoff_delay(consecutive_failures: u32, min: Duration, max: Duration) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_millis(0);
    }
    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let exp = (consecutive_failures - 1).min(30);
    let candidate = min_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(candidate.min(max_ms))
}
