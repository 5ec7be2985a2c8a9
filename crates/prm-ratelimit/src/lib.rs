//! prm-ratelimit
//!
//! Token-bucket rate limiting over named remote resource classes with
//! priority-queued waiters. One bucket per resource (`core`, `search`,
//! `graphql`), each refilled continuously; a single dispatcher task services
//! queued waiters in strict priority order, FIFO within a level.

mod bucket;
mod limiter;

pub use limiter::TokenBucketLimiter;
