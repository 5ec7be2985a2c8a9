//! Single token bucket with continuous refill.

use tokio::time::Instant;

/// Token reservoir for one resource class. Callers hold the bucket behind a
/// mutex; refill happens at every observation, not on a tick.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) capacity: f64,
    pub(crate) tokens: f64,
    /// Tokens added per second.
    pub(crate) refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    pub(crate) fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// `tokens ← min(capacity, tokens + elapsed × rate)`.
    pub(crate) fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub(crate) fn try_acquire(&mut self, count: f64) -> bool {
        self.refill();
        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    /// Return tokens granted to a waiter that disappeared before receiving
    /// them.
    pub(crate) fn give_back(&mut self, count: f64) {
        self.tokens = (self.tokens + count).min(self.capacity);
    }

    pub(crate) fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Resize after an authoritative remote update; current tokens are
    /// clamped to the new capacity.
    pub(crate) fn resize(&mut self, capacity: f64, refill_rate: f64) {
        self.refill();
        self.capacity = capacity;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.min(capacity);
    }

    pub(crate) fn utilization(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        (self.capacity - self.tokens) / self.capacity
    }
}
