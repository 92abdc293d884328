//! Work dispatch: the deduplicating queue and the limiters that pace retries.

pub mod rate_limiter;
pub mod workqueue;

pub use rate_limiter::{
    controller_rate_limiter, ExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    TokenBucketRateLimiter,
};
pub use workqueue::{EntryState, WorkQueue};
