// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Milliseconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = ($label, $label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = ($label, $label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = ($label, $label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {{
        let _ = $unit;
    }};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {{
        let _ = $unit;
    }};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Registers descriptions for every metric emitted by the SDK.
/// Call once at startup, after installing an exporter.
pub fn describe_metrics() {
    describe_counter!(
        "feed_cache_hits_total",
        Unit::Count,
        "Cache hits, labeled by cache name (price_item, price_batch)."
    );
    describe_counter!(
        "feed_cache_miss_total",
        Unit::Count,
        "Cache misses, labeled by cache name."
    );
    describe_gauge!("feed_cache_size", "Current number of entries per cache.");
    describe_counter!(
        "price_source_calls_total",
        Unit::Count,
        "Price source calls, labeled by source and outcome (hit, miss, error, timeout)."
    );
    describe_histogram!(
        "price_source_latency_ms",
        Unit::Milliseconds,
        "Price source call latency in milliseconds."
    );
    describe_gauge!(
        "rpc_circuit_breaker_state",
        "Circuit breaker state per endpoint (0=closed, 1=open, 2=half-open)."
    );
    describe_counter!(
        "rpc_circuit_breaker_opened_total",
        Unit::Count,
        "Times an endpoint circuit breaker opened."
    );
    describe_counter!(
        "rpc_attempts_total",
        Unit::Count,
        "RPC attempts through execute_with_fallback, labeled by outcome."
    );
    describe_counter!(
        "position_tier_served_total",
        Unit::Count,
        "Position lookups by tier that produced the answer (live, cache, known, empty)."
    );
}

pub fn increment_cache_hit(cache_name: &str) {
    counter!("feed_cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("feed_cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn set_cache_size(cache_name: &str, size: f64) {
    gauge!("feed_cache_size", size, "cache" => cache_name.to_string());
}

pub fn record_price_source_call(source: &str, outcome: &str, latency: Duration) {
    counter!("price_source_calls_total", 1, "source" => source.to_string(), "outcome" => outcome.to_string());
    histogram!("price_source_latency_ms", latency.as_millis() as f64, "source" => source.to_string());
}

pub fn set_circuit_breaker_state(endpoint_url: &str, state: f64) {
    gauge!("rpc_circuit_breaker_state", state, "endpoint" => endpoint_url.to_string());
}

pub fn increment_circuit_breaker_opened(endpoint_url: &str) {
    counter!("rpc_circuit_breaker_opened_total", 1, "endpoint" => endpoint_url.to_string());
}

pub fn increment_rpc_attempt(outcome: &str) {
    counter!("rpc_attempts_total", 1, "outcome" => outcome.to_string());
}

pub fn increment_position_tier(tier: &str) {
    counter!("position_tier_served_total", 1, "tier" => tier.to_string());
}
