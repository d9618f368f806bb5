//! # LP Feed SDK
//!
//! Resilient acquisition layer for a wallet-tracking dashboard. The SDK resolves two kinds
//! of unreliable external facts: the USD price of a token, and the liquidity positions
//! owned by a wallet. Both come from several rate-limited, sometimes-down providers; every
//! lookup here is bounded in latency and returns a best-effort answer instead of failing.
//!
//! ## Architecture
//!
//! ### Primitives
//! Per-service rate limiting ([`rate_limiter`]), bounded races against a timeout
//! ([`timeout`]), lazy-expiry TTL caches ([`ttl_cache`]) and one shared retry policy
//! ([`retry`]).
//!
//! ### RPC Layer
//! [`rpc_pool::RpcPool`] keeps an ordered list of RPC endpoints with health tracking and a
//! circuit breaker per endpoint, and runs caller-supplied reads with fallback and backoff.
//!
//! ### Prices
//! [`price_feeds::PriceAggregator`] walks a prioritized chain of [`price_sources`] behind
//! an item cache and a batch cache.
//!
//! ### Positions
//! [`position_cache::PositionCache`] serves live data, then a fresh snapshot, then static
//! known-good data, persisting results to a local file.

// Primitives
/// Per-service minimum-interval gate
pub mod rate_limiter;
/// Bounded race helpers
pub mod timeout;
/// Generic TTL cache
pub mod ttl_cache;
/// Retry with capped exponential backoff
pub mod retry;

// Infrastructure
/// RPC endpoint pool with circuit breakers and fallback
pub mod rpc_pool;
/// Metrics and observability
pub mod metrics;

// Prices
/// Thin HTTP price provider clients
pub mod price_sources;
/// Multi-source price aggregation
pub mod price_feeds;

// Positions
/// Three-tier wallet position cache
pub mod position_cache;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use position_cache::{PositionCache, PositionRecord, PositionSnapshot, Provenance};
pub use price_feeds::{PriceAggregator, PriceQuote, QuoteSource};
pub use rpc_pool::{RpcPool, RpcPoolError};
pub use settings::Settings;
