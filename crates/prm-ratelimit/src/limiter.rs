//! Multi-bucket limiter with a priority-queue dispatcher.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use prm_schemas::{Priority, RateLimitStrategy, ResourceStatus};

use crate::bucket::Bucket;

const DISPATCH_IDLE_SLEEP: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A parked priority acquisition. The sender side closing (receiver dropped
/// on timeout) is how cancellation is observed; the dispatcher purges closed
/// waiters without granting tokens.
struct Waiter {
    resource: String,
    count: f64,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct WaiterQueues {
    critical: VecDeque<Waiter>,
    high: VecDeque<Waiter>,
    normal: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
}

impl WaiterQueues {
    fn for_priority_mut(&mut self, p: Priority) -> &mut VecDeque<Waiter> {
        match p {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn depth(&self, p: Priority) -> usize {
        match p {
            Priority::Critical => self.critical.len(),
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }
}

/// Last-seen authoritative limits for one resource.
#[derive(Debug, Clone, Copy)]
struct RemoteLimit {
    limit: u32,
    remaining: u32,
    reset_at: DateTime<Utc>,
}

struct Inner {
    buffer_fraction: f64,
    buckets: HashMap<String, Mutex<Bucket>>,
    queues: Mutex<WaiterQueues>,
    remote: Mutex<HashMap<String, RemoteLimit>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Token-bucket limiter over a fixed set of resource classes.
///
/// The dispatcher task starts lazily on the first priority acquisition and
/// is stopped explicitly via [`TokenBucketLimiter::stop`].
pub struct TokenBucketLimiter {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucketLimiter {
    /// Build buckets from hourly limits; effective capacity is
    /// `limit × (1 − buffer_fraction)`, refilled at `effective / 3600` per
    /// second.
    pub fn new(hourly_limits: &[(&str, u32)], buffer_fraction: f64) -> Self {
        let mut buckets = HashMap::new();
        for (name, limit) in hourly_limits {
            let effective = (*limit as f64 * (1.0 - buffer_fraction)).floor();
            buckets.insert(
                name.to_string(),
                Mutex::new(Bucket::new(effective, effective / 3600.0)),
            );
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                buffer_fraction,
                buckets,
                queues: Mutex::new(WaiterQueues::default()),
                remote: Mutex::new(HashMap::new()),
                shutdown_rx,
            }),
            shutdown_tx,
            dispatcher: Mutex::new(None),
        }
    }

    /// Default GitHub-shaped limits: core 5000/h, search 30/h, graphql
    /// 5000/h, 10% buffer.
    pub fn github_defaults() -> Self {
        Self::new(&[("core", 5000), ("search", 30), ("graphql", 5000)], 0.1)
    }

    /// Spawn the dispatcher if it is not already running.
    pub async fn start(&self) {
        let mut guard = self.dispatcher.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(tokio::spawn(dispatch_loop(inner)));
        debug!("rate-limit dispatcher started");
    }

    /// Signal the dispatcher to stop and wait briefly for it to drain.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("rate-limit dispatcher did not stop in time; aborting");
            }
        }
    }
}

/// One pass over the queues: critical first, FIFO within a level. The head
/// of a level blocks that level (no overtaking inside a priority class), but
/// lower levels still get a chance so waiters for other resources proceed.
async fn dispatch_pass(inner: &Inner) -> bool {
    let mut progressed = false;
    let mut queues = inner.queues.lock().await;

    for priority in Priority::ALL {
        let queue = queues.for_priority_mut(priority);
        while let Some(front) = queue.front() {
            if front.tx.is_closed() {
                // Timed-out / cancelled waiter: slot is not held.
                queue.pop_front();
                progressed = true;
                continue;
            }
            match inner.buckets.get(&front.resource) {
                None => {
                    let waiter = queue.pop_front().expect("front checked");
                    let _ = waiter.tx.send(false);
                    progressed = true;
                }
                Some(bucket) => {
                    let granted = bucket.lock().await.try_acquire(front.count);
                    if !granted {
                        break;
                    }
                    let waiter = queue.pop_front().expect("front checked");
                    let count = waiter.count;
                    if waiter.tx.send(true).is_err() {
                        // Receiver vanished between the grant and delivery.
                        bucket.lock().await.give_back(count);
                    }
                    progressed = true;
                }
            }
        }
    }
    progressed
}

async fn dispatch_loop(inner: Arc<Inner>) {
    let mut shutdown_rx = inner.shutdown_rx.clone();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let progressed = dispatch_pass(&inner).await;
        if !progressed {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(DISPATCH_IDLE_SLEEP) => {}
            }
        }
    }
    info!("rate-limit dispatcher stopped");
}

#[async_trait]
impl RateLimitStrategy for TokenBucketLimiter {
    async fn acquire(&self, resource: &str, count: u32) -> bool {
        let Some(bucket) = self.inner.buckets.get(resource) else {
            warn!(resource, "unknown rate-limit resource");
            return false;
        };
        if count == 0 {
            return true;
        }
        bucket.lock().await.try_acquire(count as f64)
    }

    async fn acquire_with_priority(
        &self,
        resource: &str,
        priority: Priority,
        count: u32,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.inner.buckets.contains_key(resource) {
            warn!(resource, "unknown rate-limit resource");
            return false;
        }
        if self.acquire(resource, count).await {
            return true;
        }

        self.start().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut queues = self.inner.queues.lock().await;
            queues.for_priority_mut(priority).push_back(Waiter {
                resource: resource.to_string(),
                count: count as f64,
                tx,
            });
        }

        match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(Ok(granted)) => granted,
                Ok(Err(_)) => false,
                Err(_) => {
                    debug!(resource, priority = priority.as_str(), "priority acquisition timed out");
                    false
                }
            },
            None => rx.await.unwrap_or(false),
        }
    }

    async fn available(&self, resource: &str) -> u32 {
        match self.inner.buckets.get(resource) {
            Some(bucket) => bucket.lock().await.available() as u32,
            None => 0,
        }
    }

    async fn wait_for(&self, resource: &str, count: u32, timeout: Option<Duration>) -> bool {
        if !self.inner.buckets.contains_key(resource) {
            return false;
        }
        if count == 0 {
            return true;
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if self.acquire(resource, count).await {
                return true;
            }
            let wait = self
                .estimate_wait(resource, count)
                .await
                .min(Duration::from_secs(1))
                .max(Duration::from_millis(10));
            match deadline {
                None => tokio::time::sleep(wait).await,
                Some(d) => {
                    let now = tokio::time::Instant::now();
                    if now >= d {
                        return false;
                    }
                    tokio::time::sleep(wait.min(d - now)).await;
                    if tokio::time::Instant::now() >= d {
                        return self.acquire(resource, count).await;
                    }
                }
            }
        }
    }

    async fn update_limits(
        &self,
        resource: &str,
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    ) {
        self.inner.remote.lock().await.insert(
            resource.to_string(),
            RemoteLimit {
                limit,
                remaining,
                reset_at,
            },
        );

        if let Some(bucket) = self.inner.buckets.get(resource) {
            let effective = (limit as f64 * (1.0 - self.inner.buffer_fraction)).floor();
            let mut bucket = bucket.lock().await;
            if (bucket.capacity - effective).abs() > limit as f64 * 0.1 {
                info!(
                    resource,
                    old_capacity = bucket.capacity,
                    new_capacity = effective,
                    "adjusting bucket to remote limit"
                );
                bucket.resize(effective, effective / 3600.0);
            }
        }
        debug!(resource, limit, remaining, "remote rate limits recorded");
    }

    async fn status(&self) -> BTreeMap<String, ResourceStatus> {
        let remote = self.inner.remote.lock().await;
        let queues = self.inner.queues.lock().await;
        let mut out = BTreeMap::new();

        for (name, bucket) in &self.inner.buckets {
            let mut bucket = bucket.lock().await;
            bucket.refill();
            let mut queue_depths = BTreeMap::new();
            for p in Priority::ALL {
                queue_depths.insert(p.as_str().to_string(), queues.depth(p));
            }
            let info = remote.get(name);
            out.insert(
                name.clone(),
                ResourceStatus {
                    capacity: bucket.capacity,
                    current_tokens: bucket.tokens,
                    refill_rate: bucket.refill_rate,
                    utilization: bucket.utilization(),
                    queue_depths,
                    api_limit: info.map(|i| i.limit),
                    api_remaining: info.map(|i| i.remaining),
                    api_reset_at: info.map(|i| i.reset_at),
                },
            );
        }
        out
    }

    async fn estimate_wait(&self, resource: &str, count: u32) -> Duration {
        let Some(bucket) = self.inner.buckets.get(resource) else {
            return Duration::MAX;
        };
        let mut bucket = bucket.lock().await;
        bucket.refill();
        let missing = count as f64 - bucket.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if bucket.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(missing / bucket.refill_rate)
    }

    async fn optimal_batch_size(&self, resource: &str) -> usize {
        let available = self.available(resource).await as usize;
        let usable = ((available as f64) * 0.8).floor() as usize;
        let usable = usable.max(1);
        if resource == "search" {
            usable.min(10)
        } else {
            usable.min(50)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limiter() -> TokenBucketLimiter {
        // 3600/h → 1 token/s effective rate with no buffer.
        TokenBucketLimiter::new(&[("core", 3600), ("search", 30)], 0.0)
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_acquire_and_exhaustion() {
        let limiter = small_limiter();
        assert!(limiter.acquire("core", 100).await);
        assert_eq!(limiter.available("core").await, 3500);
        assert!(!limiter.acquire("core", 4000).await);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_count_always_succeeds_unknown_resource_fails() {
        let limiter = small_limiter();
        assert!(limiter.acquire("core", 0).await);
        assert!(!limiter.acquire("codesearch", 1).await);
        assert_eq!(limiter.available("codesearch").await, 0);
        assert!(!limiter.wait_for("codesearch", 1, Some(Duration::from_millis(10))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_fraction_shrinks_capacity() {
        let limiter = TokenBucketLimiter::new(&[("core", 5000)], 0.1);
        assert_eq!(limiter.available("core").await, 4500);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_succeeds_once_refill_covers_request() {
        let limiter = small_limiter();
        assert!(limiter.acquire("core", 3600).await);
        // 1 token/s refill: 5 tokens need 5 seconds, well inside the timeout.
        assert!(limiter.wait_for("core", 5, Some(Duration::from_secs(30))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_fails_when_refill_cannot_cover_within_timeout() {
        let limiter = small_limiter();
        assert!(limiter.acquire("core", 3600).await);
        assert!(!limiter.wait_for("core", 600, Some(Duration::from_secs(1))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn priority_acquisition_times_out_then_succeeds_with_longer_timeout() {
        let limiter = small_limiter();
        assert!(limiter.acquire("core", 3600).await);

        // Normal priority with a short timeout cannot be satisfied.
        assert!(
            !limiter
                .acquire_with_priority("core", Priority::Normal, 60, Some(Duration::from_secs(1)))
                .await
        );

        // Critical with a generous timeout is granted once the bucket refills.
        assert!(
            limiter
                .acquire_with_priority("core", Priority::Critical, 60, Some(Duration::from_secs(90)))
                .await
        );

        // The timed-out waiter must not linger in any queue.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = limiter.status().await;
        let depths = &status["core"].queue_depths;
        assert!(depths.values().all(|d| *d == 0), "queues not drained: {depths:?}");

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn critical_waiter_served_before_low() {
        let limiter = Arc::new(small_limiter());
        assert!(limiter.acquire("core", 3600).await);

        let low = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let granted = limiter
                    .acquire_with_priority("core", Priority::Low, 10, Some(Duration::from_secs(120)))
                    .await;
                (granted, tokio::time::Instant::now())
            })
        };
        // Give the low waiter time to enqueue first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let critical = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let granted = limiter
                    .acquire_with_priority(
                        "core",
                        Priority::Critical,
                        10,
                        Some(Duration::from_secs(120)),
                    )
                    .await;
                (granted, tokio::time::Instant::now())
            })
        };

        let (critical_res, low_res) = tokio::join!(critical, low);
        let (critical_granted, critical_at) = critical_res.unwrap();
        let (low_granted, low_at) = low_res.unwrap();
        assert!(critical_granted);
        assert!(low_granted);
        assert!(critical_at <= low_at, "critical should be granted first");

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_limits_resizes_and_clamps() {
        let limiter = TokenBucketLimiter::new(&[("core", 5000)], 0.1);
        limiter.update_limits("core", 1000, 900, Utc::now()).await;

        let status = limiter.status().await;
        let core = &status["core"];
        assert!((core.capacity - 900.0).abs() < 1e-6);
        assert!(core.current_tokens <= core.capacity);
        assert_eq!(core.api_limit, Some(1000));
        assert_eq!(core.api_remaining, Some(900));
    }

    #[tokio::test(start_paused = true)]
    async fn small_limit_drift_does_not_resize() {
        let limiter = TokenBucketLimiter::new(&[("core", 5000)], 0.1);
        // Effective for 5000 is 4500; a declared limit of 4900 puts the
        // effective value within the 10% dead band.
        limiter.update_limits("core", 4900, 4000, Utc::now()).await;
        let status = limiter.status().await;
        assert!((status["core"].capacity - 4500.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn estimate_wait_and_batch_size() {
        let limiter = small_limiter();
        assert_eq!(limiter.estimate_wait("core", 100).await, Duration::ZERO);

        assert!(limiter.acquire("core", 3600).await);
        let wait = limiter.estimate_wait("core", 10).await;
        assert!((wait.as_secs_f64() - 10.0).abs() < 0.5, "wait={wait:?}");

        assert_eq!(limiter.optimal_batch_size("search").await, 10);
        assert_eq!(limiter.optimal_batch_size("core").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_scales_with_availability() {
        let limiter = small_limiter();
        // Full core bucket: 3600×0.8 floors above the 50 cap.
        assert_eq!(limiter.optimal_batch_size("core").await, 50);
        assert!(limiter.acquire("core", 3560).await);
        // 40 left → floor(32) usable.
        assert_eq!(limiter.optimal_batch_size("core").await, 32);
    }
}
