// src/price_feeds.rs

use anyhow::Result;
use futures::future::{join_all, BoxFuture, FutureExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;
use crate::price_sources::{BirdeyeSource, CoinGeckoSource, JupiterSource, PriceSource};
use crate::rate_limiter::ServiceRateLimiter;
use crate::settings::PriceFeeds;
use crate::timeout::{race_detached, with_timeout, RaceError};
use crate::ttl_cache::{CacheMetricsSnapshot, TtlCache};

/// Identifiers longer than this are treated as on-chain addresses in the batch path.
pub const ADDRESS_MIN_LEN: usize = 21;
/// Identifiers up to this length are treated as ticker symbols.
pub const SYMBOL_MAX_LEN: usize = 10;

pub fn is_address_like(identifier: &str) -> bool {
    identifier.len() >= ADDRESS_MIN_LEN
}

pub fn is_symbol_like(identifier: &str) -> bool {
    identifier.len() <= SYMBOL_MAX_LEN
}

fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Where a quote came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QuoteSource {
    /// Resolved live by the named source.
    Source(String),
    /// Served from the item cache.
    Cache,
    /// Static known-price table.
    Known,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub identifier: String,
    pub price: f64,
    pub source: QuoteSource,
}

/// One link of the provider chain.
#[derive(Clone)]
pub struct SourceSlot {
    pub source: Arc<dyn PriceSource>,
    pub timeout: Duration,
    /// Service name passed to the rate limiter before each call. `None` = unthrottled.
    pub rate_limit_key: Option<String>,
    /// Only consulted for ticker-like identifiers.
    pub symbols_only: bool,
}

impl SourceSlot {
    pub fn new(source: Arc<dyn PriceSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            rate_limit_key: None,
            symbols_only: false,
        }
    }

    pub fn rate_limited(mut self, service: impl Into<String>) -> Self {
        self.rate_limit_key = Some(service.into());
        self
    }

    pub fn symbols_only(mut self) -> Self {
        self.symbols_only = true;
        self
    }

    fn accepts(&self, identifier: &str) -> bool {
        !self.symbols_only || is_symbol_like(identifier)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceCacheStats {
    pub item: CacheMetricsSnapshot,
    pub batch: CacheMetricsSnapshot,
}

struct AggregatorInner {
    sources: Vec<SourceSlot>,
    limiter: Arc<ServiceRateLimiter>,
    /// `None` marks a cached failed lookup (stored with the short failure TTL).
    item_cache: TtlCache<String, Option<f64>>,
    batch_cache: TtlCache<String, HashMap<String, f64>>,
    failure_ttl: Duration,
    batch_timeout: Duration,
    known_prices: HashMap<String, f64>,
}

/// Multi-source USD price lookup with per-source rate limiting, bounded source calls and
/// tiered TTL caching.
///
/// ## Features
///
/// - **Priority Chain**: sources are tried in order; the first valid price wins
/// - **Item Cache**: resolved prices live for `item_ttl`, failed lookups for the shorter
///   `failure_ttl` so a dead source is not hammered on every request
/// - **Batch Path**: addresses go through the batch-capable source in one request, symbols
///   through the rate-limited source one by one, all under one overall deadline
/// - **Never Zero**: non-positive or non-finite prices are reported as unknown
///
/// Cheap to clone; clones share caches and the rate limiter.
#[derive(Clone)]
pub struct PriceAggregator {
    inner: Arc<AggregatorInner>,
}

impl PriceAggregator {
    pub fn new(sources: Vec<SourceSlot>, limiter: Arc<ServiceRateLimiter>, settings: &PriceFeeds) -> Self {
        let known_prices = settings
            .known_prices
            .iter()
            .map(|(k, v)| (normalize(k), *v))
            .collect();

        Self {
            inner: Arc::new(AggregatorInner {
                sources,
                limiter,
                item_cache: TtlCache::new("price_item", Duration::from_secs(settings.item_ttl_seconds)),
                batch_cache: TtlCache::new("price_batch", Duration::from_secs(settings.batch_ttl_seconds)),
                failure_ttl: Duration::from_secs(settings.failure_ttl_seconds),
                batch_timeout: Duration::from_millis(settings.batch_timeout_ms),
                known_prices,
            }),
        }
    }

    /// Default chain: Jupiter (unthrottled, batched), Birdeye (rate limited), CoinGecko
    /// (rate limited, symbols only).
    pub fn from_settings(settings: &PriceFeeds) -> Result<Self> {
        let primary = Duration::from_millis(settings.primary_timeout_ms);
        let secondary = Duration::from_millis(settings.secondary_timeout_ms);
        let tertiary = Duration::from_millis(settings.tertiary_timeout_ms);

        let sources = vec![
            SourceSlot::new(Arc::new(JupiterSource::new(settings.jupiter_url.clone(), primary)?), primary),
            SourceSlot::new(
                Arc::new(BirdeyeSource::new(
                    settings.birdeye_url.clone(),
                    settings.birdeye_api_key.clone(),
                    secondary,
                )?),
                secondary,
            )
            .rate_limited("birdeye"),
            SourceSlot::new(
                Arc::new(CoinGeckoSource::new(
                    settings.coingecko_url.clone(),
                    settings.coingecko_ids.clone(),
                    tertiary,
                )?),
                tertiary,
            )
            .rate_limited("coingecko")
            .symbols_only(),
        ];

        let limiter = Arc::new(ServiceRateLimiter::from_settings(settings));
        Ok(Self::new(sources, limiter, settings))
    }

    pub fn source_names(&self) -> Vec<String> {
        self.inner.sources.iter().map(|s| s.source.name().to_string()).collect()
    }

    /// Resolves one identifier, or `None` when every eligible source came back empty.
    pub async fn get_quote(&self, identifier: &str) -> Option<PriceQuote> {
        let identifier = identifier.trim();
        let key = normalize(identifier);
        if key.is_empty() {
            return None;
        }

        if let Some(cached) = self.inner.item_cache.get(&key) {
            debug!("price cache hit for {} ({:?})", key, cached);
            return cached.map(|price| PriceQuote {
                identifier: identifier.to_string(),
                price,
                source: QuoteSource::Cache,
            });
        }

        let resolved = self.inner.query_chain(identifier).await;
        self.inner.store_item(&key, resolved.as_ref().map(|(price, _)| *price));

        resolved.map(|(price, source)| PriceQuote {
            identifier: identifier.to_string(),
            price,
            source: QuoteSource::Source(source),
        })
    }

    pub async fn get_price(&self, identifier: &str) -> Option<f64> {
        self.get_quote(identifier).await.map(|q| q.price)
    }

    /// Live chain first, then the static known-price table.
    pub async fn get_price_or_known(&self, identifier: &str) -> Option<PriceQuote> {
        if let Some(quote) = self.get_quote(identifier).await {
            return Some(quote);
        }
        self.known_price(identifier).map(|price| PriceQuote {
            identifier: identifier.trim().to_string(),
            price,
            source: QuoteSource::Known,
        })
    }

    pub fn known_price(&self, identifier: &str) -> Option<f64> {
        self.inner.known_prices.get(&normalize(identifier)).copied()
    }

    /// Resolves many identifiers at once. Unresolved identifiers are omitted; the call
    /// returns within the configured batch timeout even if some fetches are still running.
    /// Those fetches finish in the background and still fill the item cache.
    pub async fn get_batch_prices(&self, identifiers: &[String]) -> HashMap<String, f64> {
        let mut result = HashMap::new();

        // Deduplicate on the normalized key; the first spelling wins.
        let mut requested: Vec<(String, String)> = Vec::new();
        for raw in identifiers {
            let original = raw.trim();
            let key = normalize(original);
            if key.is_empty() || requested.iter().any(|(k, _)| k == &key) {
                continue;
            }
            requested.push((key, original.to_string()));
        }

        let mut to_fetch: Vec<(String, String)> = Vec::new();
        for (key, original) in requested {
            match self.inner.item_cache.get(&key) {
                Some(Some(price)) => {
                    result.insert(original, price);
                }
                Some(None) => debug!("skipping {} (recent failed lookup)", key),
                None => to_fetch.push((key, original)),
            }
        }
        if to_fetch.is_empty() {
            return result;
        }

        let batch_key = batch_cache_key(to_fetch.iter().map(|(k, _)| k.as_str()));
        if let Some(cached) = self.inner.batch_cache.get(&batch_key) {
            debug!("batch cache hit for [{}]", batch_key);
            for (key, original) in &to_fetch {
                if let Some(price) = cached.get(key) {
                    result.insert(original.clone(), *price);
                }
            }
            return result;
        }

        let (long_ids, short_ids): (Vec<_>, Vec<_>) =
            to_fetch.iter().cloned().partition(|(_, original)| is_address_like(original));

        let started = Instant::now();
        let limit = self.inner.batch_timeout;
        let mut fetches: Vec<BoxFuture<'static, Result<Vec<FetchedPrice>, RaceError>>> = Vec::new();

        if !long_ids.is_empty() {
            let inner = Arc::clone(&self.inner);
            fetches.push(race_detached(async move { Ok(inner.fetch_long_ids(long_ids).await) }, limit).boxed());
        }
        for (key, original) in short_ids {
            let inner = Arc::clone(&self.inner);
            fetches.push(race_detached(
                async move {
                    let price = inner.fetch_short_id(&key, &original).await;
                    Ok(vec![(key, original, price)])
                },
                limit,
            )
            .boxed());
        }

        let expected = fetches.len();
        let mut timed_out = 0;
        let mut batch_prices = HashMap::new();
        for outcome in join_all(fetches).await {
            match outcome {
                Ok(found) => {
                    for (key, original, price) in found {
                        if let Some(price) = price {
                            batch_prices.insert(key, price);
                            result.insert(original, price);
                        }
                    }
                }
                Err(e) if e.is_timeout() => timed_out += 1,
                Err(e) => warn!("batch price fetch failed: {}", e),
            }
        }

        if timed_out > 0 {
            info!(
                "batch price lookup returned partial results after {:?}: {}/{} fetches still running",
                started.elapsed(),
                timed_out,
                expected
            );
        }
        if !batch_prices.is_empty() {
            self.inner.batch_cache.insert(batch_key, batch_prices);
        }
        result
    }

    pub fn cache_stats(&self) -> PriceCacheStats {
        PriceCacheStats {
            item: self.inner.item_cache.metrics(),
            batch: self.inner.batch_cache.metrics(),
        }
    }

    pub fn clear_caches(&self) {
        self.inner.item_cache.clear();
        self.inner.batch_cache.clear();
        info!("price caches cleared");
    }

    /// Drops expired entries from both caches. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.item_cache.purge_expired() + self.inner.batch_cache.purge_expired()
    }
}

/// (normalized key, identifier as requested, resolved price)
type FetchedPrice = (String, String, Option<f64>);

fn batch_cache_key<'a>(keys: impl Iterator<Item = &'a str>) -> String {
    let mut keys: Vec<&str> = keys.collect();
    keys.sort_unstable();
    keys.join(",")
}

fn outcome_label(result: &Result<Option<f64>, RaceError>) -> &'static str {
    match result {
        Ok(Some(_)) => "hit",
        Ok(None) => "miss",
        Err(e) if e.is_timeout() => "timeout",
        Err(_) => "error",
    }
}

impl AggregatorInner {
    fn store_item(&self, key: &str, price: Option<f64>) {
        match price {
            Some(p) => self.item_cache.insert(key.to_string(), Some(p)),
            None => self.item_cache.insert_with_ttl(key.to_string(), None, self.failure_ttl),
        }
    }

    /// Batch-path write, hits only. Failures are cached by `get_quote` once the whole
    /// chain came back empty.
    fn store_resolved(&self, key: &str, price: Option<f64>) {
        if let Some(p) = price {
            self.item_cache.insert(key.to_string(), Some(p));
        }
    }

    /// One bounded, rate-limited call to a single source.
    async fn query_slot(&self, slot: &SourceSlot, identifier: &str) -> Option<f64> {
        if let Some(service) = &slot.rate_limit_key {
            self.limiter.wait_for_slot(service).await;
        }

        let started = Instant::now();
        let result = with_timeout(slot.source.get_price(identifier), slot.timeout)
            .await
            .map(|price| price.filter(|p| p.is_finite() && *p > 0.0));
        metrics::record_price_source_call(slot.source.name(), outcome_label(&result), started.elapsed());

        match result {
            Ok(price) => price,
            Err(e) => {
                debug!("{} lookup for {} failed: {}", slot.source.name(), identifier, e);
                None
            }
        }
    }

    async fn query_chain(&self, identifier: &str) -> Option<(f64, String)> {
        for slot in self.sources.iter().filter(|s| s.accepts(identifier)) {
            if let Some(price) = self.query_slot(slot, identifier).await {
                return Some((price, slot.source.name().to_string()));
            }
        }
        debug!("no source resolved a price for {}", identifier);
        None
    }

    fn batch_slot(&self) -> Option<&SourceSlot> {
        self.sources.iter().find(|s| s.source.supports_batch())
    }

    /// The rate-limited source used for symbol lookups in the batch path.
    fn individual_slot(&self, identifier: &str) -> Option<&SourceSlot> {
        self.sources
            .iter()
            .find(|s| s.rate_limit_key.is_some() && s.accepts(identifier))
            .or_else(|| self.sources.iter().find(|s| !s.source.supports_batch() && s.accepts(identifier)))
            .or_else(|| self.sources.iter().find(|s| s.accepts(identifier)))
    }

    async fn fetch_long_ids(&self, ids: Vec<(String, String)>) -> Vec<FetchedPrice> {
        let Some(slot) = self.batch_slot() else {
            let mut found = Vec::with_capacity(ids.len());
            for (key, original) in ids {
                let price = self.fetch_short_id(&key, &original).await;
                found.push((key, original, price));
            }
            return found;
        };

        if let Some(service) = &slot.rate_limit_key {
            self.limiter.wait_for_slot(service).await;
        }
        let originals: Vec<String> = ids.iter().map(|(_, o)| o.clone()).collect();
        let started = Instant::now();
        let result = with_timeout(slot.source.get_prices(&originals), slot.timeout).await;

        let prices = match result {
            Ok(prices) => {
                metrics::record_price_source_call(slot.source.name(), "hit", started.elapsed());
                prices
            }
            Err(e) => {
                let outcome = if e.is_timeout() { "timeout" } else { "error" };
                metrics::record_price_source_call(slot.source.name(), outcome, started.elapsed());
                debug!("{} batch lookup for {} ids failed: {}", slot.source.name(), ids.len(), e);
                HashMap::new()
            }
        };

        ids.into_iter()
            .map(|(key, original)| {
                let price = prices
                    .get(&original)
                    .copied()
                    .filter(|p| p.is_finite() && *p > 0.0);
                self.store_resolved(&key, price);
                (key, original, price)
            })
            .collect()
    }

    async fn fetch_short_id(&self, key: &str, original: &str) -> Option<f64> {
        let price = match self.individual_slot(original) {
            Some(slot) => self.query_slot(slot, original).await,
            None => None,
        };
        self.store_resolved(key, price);
        price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockSource {
        name: &'static str,
        prices: HashMap<String, f64>,
        delays: HashMap<String, Duration>,
        batch: bool,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new(name: &'static str, prices: &[(&str, f64)]) -> Self {
            Self {
                name,
                prices: prices.iter().map(|(k, v)| (k.to_lowercase(), *v)).collect(),
                delays: HashMap::new(),
                batch: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn batched(mut self) -> Self {
            self.batch = true;
            self
        }

        fn delayed(mut self, id: &str, delay: Duration) -> Self {
            self.delays.insert(id.to_lowercase(), delay);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for MockSource {
        fn name(&self) -> &str {
            self.name
        }

        fn supports_batch(&self) -> bool {
            self.batch
        }

        async fn get_price(&self, identifier: &str) -> Result<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = identifier.to_lowercase();
            if let Some(delay) = self.delays.get(&key) {
                tokio::time::sleep(*delay).await;
            }
            Ok(self.prices.get(&key).copied())
        }

        async fn get_prices(&self, identifiers: &[String]) -> Result<HashMap<String, f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(identifiers
                .iter()
                .filter_map(|id| self.prices.get(&id.to_lowercase()).map(|p| (id.clone(), *p)))
                .collect())
        }
    }

    fn aggregator(slots: Vec<SourceSlot>) -> PriceAggregator {
        let settings = PriceFeeds::default();
        let limiter = Arc::new(ServiceRateLimiter::from_settings(&settings));
        PriceAggregator::new(slots, limiter, &settings)
    }

    const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

    #[tokio::test(start_paused = true)]
    async fn test_second_lookup_is_served_from_cache() {
        let primary = Arc::new(MockSource::new("primary", &[(SOL_MINT, 142.5)]));
        let agg = aggregator(vec![SourceSlot::new(primary.clone(), Duration::from_secs(3))]);

        let first = agg.get_quote(SOL_MINT).await.unwrap();
        assert_eq!(first.source, QuoteSource::Source("primary".to_string()));
        let second = agg.get_quote(SOL_MINT).await.unwrap();
        assert_eq!(second.source, QuoteSource::Cache);
        assert_eq!(second.price, 142.5);
        assert_eq!(primary.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        agg.get_price(SOL_MINT).await;
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_valid_source_wins_and_zero_is_unknown() {
        let primary = Arc::new(MockSource::new("primary", &[("sol", 0.0)]));
        let secondary = Arc::new(MockSource::new("secondary", &[("sol", 142.5)]));
        let tertiary = Arc::new(MockSource::new("tertiary", &[("sol", 140.0)]));
        let agg = aggregator(vec![
            SourceSlot::new(primary.clone(), Duration::from_secs(3)),
            SourceSlot::new(secondary.clone(), Duration::from_secs(2)).rate_limited("birdeye"),
            SourceSlot::new(tertiary.clone(), Duration::from_millis(1500)).symbols_only(),
        ]);

        let quote = agg.get_quote("sol").await.unwrap();
        assert_eq!(quote.price, 142.5);
        assert_eq!(quote.source, QuoteSource::Source("secondary".to_string()));
        assert_eq!(tertiary.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_is_bounded_and_next_source_used() {
        let primary = Arc::new(MockSource::new("primary", &[("sol", 1.0)]).delayed("sol", Duration::from_secs(60)));
        let secondary = Arc::new(MockSource::new("secondary", &[("sol", 142.5)]));
        let agg = aggregator(vec![
            SourceSlot::new(primary, Duration::from_secs(3)),
            SourceSlot::new(secondary, Duration::from_secs(2)),
        ]);

        let started = Instant::now();
        assert_eq!(agg.get_price("sol").await, Some(142.5));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_is_cached_briefly() {
        let primary = Arc::new(MockSource::new("primary", &[]));
        let agg = aggregator(vec![SourceSlot::new(primary.clone(), Duration::from_secs(3))]);

        assert_eq!(agg.get_price("nope").await, None);
        assert_eq!(agg.get_price("nope").await, None);
        assert_eq!(primary.calls(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(agg.get_price("nope").await, None);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_symbols_only_source_skips_addresses() {
        let tertiary = Arc::new(MockSource::new("tertiary", &[(SOL_MINT, 1.0)]));
        let agg = aggregator(vec![SourceSlot::new(tertiary.clone(), Duration::from_secs(1)).symbols_only()]);

        assert_eq!(agg.get_price(SOL_MINT).await, None);
        assert_eq!(tertiary.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_price_fallback() {
        let agg = aggregator(vec![SourceSlot::new(Arc::new(MockSource::new("primary", &[])), Duration::from_secs(1))]);

        let quote = agg.get_price_or_known("USDC").await.unwrap();
        assert_eq!(quote.price, 1.0);
        assert_eq!(quote.source, QuoteSource::Known);
        assert!(agg.get_price_or_known("wif").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_splits_addresses_and_symbols() {
        let primary = Arc::new(MockSource::new("primary", &[(SOL_MINT, 142.5), ("bonk", 9.0)]).batched());
        let secondary = Arc::new(MockSource::new("secondary", &[("bonk", 0.00002)]));
        let agg = aggregator(vec![
            SourceSlot::new(primary.clone(), Duration::from_secs(3)),
            SourceSlot::new(secondary.clone(), Duration::from_secs(2)).rate_limited("birdeye"),
        ]);

        let ids = vec![SOL_MINT.to_string(), "BONK".to_string(), "bonk".to_string()];
        let prices = agg.get_batch_prices(&ids).await;

        assert_eq!(prices.len(), 2);
        assert_eq!(prices[SOL_MINT], 142.5);
        assert_eq!(prices["BONK"], 0.00002);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);

        // Both now sit in the item cache.
        assert_eq!(agg.get_quote("bonk").await.unwrap().source, QuoteSource::Cache);
        let again = agg.get_batch_prices(&ids).await;
        assert_eq!(again.len(), 2);
        assert_eq!(primary.calls() + secondary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cache_serves_repeated_pair() {
        let primary = Arc::new(MockSource::new("primary", &[(SOL_MINT, 142.5)]).batched());
        let agg = aggregator(vec![SourceSlot::new(primary.clone(), Duration::from_secs(3))]);
        let ids = vec![SOL_MINT.to_string()];

        agg.get_batch_prices(&ids).await;
        agg.clear_caches();
        assert_eq!(agg.cache_stats().batch.cache_size, 0);

        agg.get_batch_prices(&ids).await;
        // With the item entry gone the batch cache still answers.
        tokio::time::advance(Duration::from_secs(10)).await;
        agg.inner.item_cache.clear();
        let prices = agg.get_batch_prices(&ids).await;
        assert_eq!(prices[SOL_MINT], 142.5);
        assert_eq!(primary.calls(), 2);
    }

    #[test]
    fn test_batch_cache_key_is_sorted() {
        assert_eq!(batch_cache_key(["sol", "bonk", "jup"].into_iter()), "bonk,jup,sol");
    }

    #[test]
    fn test_identifier_classification() {
        assert!(is_symbol_like("sol"));
        assert!(!is_symbol_like("mediumlengthid"));
        assert!(!is_address_like("mediumlengthid"));
        assert!(is_address_like(SOL_MINT));
    }

    #[test]
    fn test_default_chain_order() {
        let agg = PriceAggregator::from_settings(&PriceFeeds::default()).unwrap();
        assert_eq!(agg.source_names(), vec!["jupiter", "birdeye", "coingecko"]);
    }
}
