//! Rate limiting
//!
//! This module provides:
//! - [`RateLimiter`] - sliding-window budgets per key, multi-tier burst control
//! - [`CounterStore`] - pluggable event log with [`InMemoryCounterStore`] and
//!   [`PostgresCounterStore`] backends
//! - [`RateLimitScope`] - source/domain/worker/global keys and tier presets
//!
//! Backend errors never block work: every check fails open.

mod counter;
mod limiter;
mod postgres;

pub use counter::{CounterStats, CounterStore, CounterStoreError, InMemoryCounterStore};
pub use limiter::{
    domain_key, domain_of, source_key, CounterBackend, RateLimitScope, RateLimitTier,
    RateLimiter, RateLimiterConfig, RateLimiterStats, GLOBAL_KEY,
};
pub use postgres::PostgresCounterStore;
