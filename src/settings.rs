use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreaker {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_window_seconds")]
    pub recovery_window_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_window_seconds() -> u64 {
    60
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_window_seconds: default_recovery_window_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Retry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    2000
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    #[serde(default = "default_http_urls")]
    pub http_urls: Vec<String>,
    /// Zero-argument JSON-RPC method used as the liveness probe.
    #[serde(default = "default_probe_method")]
    pub probe_method: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Per-endpoint request cap (requests/second). Zero disables the cap.
    #[serde(default = "default_max_qps_per_endpoint")]
    pub max_qps_per_endpoint: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
    #[serde(default)]
    pub retry: Retry,
}

fn default_http_urls() -> Vec<String> {
    vec![
        "https://api.mainnet-beta.solana.com".to_string(),
        "https://solana-rpc.publicnode.com".to_string(),
        "https://rpc.ankr.com/solana".to_string(),
    ]
}
fn default_probe_method() -> String {
    "getSlot".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_max_qps_per_endpoint() -> u32 {
    25
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            http_urls: default_http_urls(),
            probe_method: default_probe_method(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_qps_per_endpoint: default_max_qps_per_endpoint(),
            circuit_breaker: CircuitBreaker::default(),
            retry: Retry::default(),
        }
    }
}

impl Rpc {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker.recovery_window_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PriceFeeds {
    #[serde(default = "default_item_ttl_seconds")]
    pub item_ttl_seconds: u64,
    #[serde(default = "default_failure_ttl_seconds")]
    pub failure_ttl_seconds: u64,
    #[serde(default = "default_batch_ttl_seconds")]
    pub batch_ttl_seconds: u64,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,
    #[serde(default = "default_secondary_timeout_ms")]
    pub secondary_timeout_ms: u64,
    #[serde(default = "default_tertiary_timeout_ms")]
    pub tertiary_timeout_ms: u64,
    /// Minimum interval between calls, in milliseconds, keyed by service name.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, u64>,
    #[serde(default = "default_jupiter_url")]
    pub jupiter_url: String,
    #[serde(default = "default_birdeye_url")]
    pub birdeye_url: String,
    #[serde(default)]
    pub birdeye_api_key: Option<String>,
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,
    /// Ticker symbol (lower-case) -> CoinGecko coin id.
    #[serde(default = "default_coingecko_ids")]
    pub coingecko_ids: HashMap<String, String>,
    /// Static last-resort prices for well-known tokens.
    #[serde(default = "default_known_prices")]
    pub known_prices: HashMap<String, f64>,
}

fn default_item_ttl_seconds() -> u64 {
    30
}
fn default_failure_ttl_seconds() -> u64 {
    5
}
fn default_batch_ttl_seconds() -> u64 {
    15
}
fn default_batch_timeout_ms() -> u64 {
    3000
}
fn default_primary_timeout_ms() -> u64 {
    3000
}
fn default_secondary_timeout_ms() -> u64 {
    2000
}
fn default_tertiary_timeout_ms() -> u64 {
    1500
}
fn default_rate_limits() -> HashMap<String, u64> {
    HashMap::from([
        ("birdeye".to_string(), 200),
        ("coingecko".to_string(), 1200),
    ])
}
fn default_jupiter_url() -> String {
    "https://api.jup.ag/price/v2".to_string()
}
fn default_birdeye_url() -> String {
    "https://public-api.birdeye.so/defi/price".to_string()
}
fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3/simple/price".to_string()
}
fn default_coingecko_ids() -> HashMap<String, String> {
    [
        ("sol", "solana"),
        ("usdc", "usd-coin"),
        ("usdt", "tether"),
        ("eth", "ethereum"),
        ("btc", "bitcoin"),
        ("jup", "jupiter-exchange-solana"),
        ("ray", "raydium"),
        ("orca", "orca"),
        ("bonk", "bonk"),
        ("msol", "msol"),
    ]
    .into_iter()
    .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
    .collect()
}
fn default_known_prices() -> HashMap<String, f64> {
    HashMap::from([
        ("usdc".to_string(), 1.0),
        ("usdt".to_string(), 1.0),
        ("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_lowercase(), 1.0),
        ("Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB".to_lowercase(), 1.0),
    ])
}

impl Default for PriceFeeds {
    fn default() -> Self {
        Self {
            item_ttl_seconds: default_item_ttl_seconds(),
            failure_ttl_seconds: default_failure_ttl_seconds(),
            batch_ttl_seconds: default_batch_ttl_seconds(),
            batch_timeout_ms: default_batch_timeout_ms(),
            primary_timeout_ms: default_primary_timeout_ms(),
            secondary_timeout_ms: default_secondary_timeout_ms(),
            tertiary_timeout_ms: default_tertiary_timeout_ms(),
            rate_limits: default_rate_limits(),
            jupiter_url: default_jupiter_url(),
            birdeye_url: default_birdeye_url(),
            birdeye_api_key: None,
            coingecko_url: default_coingecko_url(),
            coingecko_ids: default_coingecko_ids(),
            known_prices: default_known_prices(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PositionCache {
    #[serde(default = "default_freshness_seconds")]
    pub freshness_seconds: u64,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_live_fetch_timeout_ms")]
    pub live_fetch_timeout_ms: u64,
    /// Optional JSON file with `{ wallet: [position, ...] }` known-good data.
    #[serde(default)]
    pub known_positions_path: Option<String>,
}

fn default_freshness_seconds() -> u64 {
    300 // 5 minutes
}
fn default_snapshot_path() -> String {
    "data/position_snapshots.json".to_string()
}
fn default_live_fetch_timeout_ms() -> u64 {
    10_000
}

impl Default for PositionCache {
    fn default() -> Self {
        Self {
            freshness_seconds: default_freshness_seconds(),
            snapshot_path: default_snapshot_path(),
            live_fetch_timeout_ms: default_live_fetch_timeout_ms(),
            known_positions_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub price_feeds: PriceFeeds,
    #[serde(default)]
    pub position_cache: PositionCache,
}

impl Settings {
    /// Loads `Config.toml` (optional) and applies environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw_http) = env::var("SDK_RPC_HTTP_URLS") {
            if let Some(list) = parse_string_list(&raw_http) {
                if !list.is_empty() {
                    self.rpc.http_urls = list;
                }
            }
        }

        // The primary endpoint always goes first; drop any duplicate further down.
        if let Ok(primary) = env::var("SDK_PRIMARY_RPC_URL") {
            let primary = primary.trim().to_string();
            if !primary.is_empty() {
                self.rpc.http_urls.retain(|url| url != &primary);
                self.rpc.http_urls.insert(0, primary);
            }
        }

        if let Ok(key) = env::var("SDK_BIRDEYE_API_KEY") {
            let trimmed = key.trim();
            if !trimmed.is_empty() {
                self.price_feeds.birdeye_api_key = Some(trimmed.to_string());
            }
        }

        if let Ok(path) = env::var("SDK_SNAPSHOT_PATH") {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                self.position_cache.snapshot_path = trimmed.to_string();
            }
        }
    }
}

/// Accepts either a JSON array (`["a","b"]`) or a comma-separated list.
fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
