//! Failure-containment primitives
//!
//! - [`CircuitBreaker`]: fail fast while an external dependency is down
//! - [`RateLimiter`]: block clients that keep failing authentication
//! - [`ConcurrencyGate`] and [`Debouncer`]: bound and coalesce ingestion work

pub mod circuit_breaker;
pub mod gate;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use gate::{AdmissionTicket, ConcurrencyGate, Debouncer};
pub use rate_limiter::{retry_after_secs, RateLimitConfig, RateLimiter};
