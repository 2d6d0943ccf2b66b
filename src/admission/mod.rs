//! Client-side admission control for outbound requests.
//!
//! - `rate_limiter`: fixed-window request counting per key
//! - `queue`: bounded concurrency with FIFO admission
//! - `debounce`: trailing-edge collapsing of rapid calls per key
//! - `retry`: transparent retries with backoff for transient failures

pub mod debounce;
pub mod queue;
pub mod rate_limiter;
pub mod retry;

pub use debounce::Debouncer;
pub use queue::RequestQueue;
pub use rate_limiter::RateLimiter;
pub use retry::{with_retry, RetryConfig};
