// src/price_sources.rs

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A single upstream price provider.
///
/// `Ok(None)` means the provider answered but has no usable price for the identifier.
/// `Err` means the call itself failed (transport, HTTP status, unreadable body).
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn get_price(&self, identifier: &str) -> Result<Option<f64>>;

    /// Whether `get_prices` resolves many identifiers in one upstream request.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Batch lookup. Identifiers with no price are simply absent from the map.
    async fn get_prices(&self, identifiers: &[String]) -> Result<HashMap<String, f64>> {
        let mut prices = HashMap::new();
        for identifier in identifiers {
            if let Some(price) = self.get_price(identifier).await? {
                prices.insert(identifier.clone(), price);
            }
        }
        Ok(prices)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PriceSourceError {
    #[error("{source_name} request failed: {error}")]
    Http {
        source_name: &'static str,
        #[source]
        error: reqwest::Error,
    },
    #[error("{source_name} returned HTTP {status}")]
    Status { source_name: &'static str, status: u16 },
    #[error("{source_name} returned an unreadable body: {detail}")]
    Malformed { source_name: &'static str, detail: String },
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Accepts `1.23`, `"1.23"`, and rejects anything non-finite or non-positive.
fn price_from_value(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (price.is_finite() && price > 0.0).then_some(price)
}

async fn get_json(
    source_name: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<Value, PriceSourceError> {
    let response = request
        .send()
        .await
        .map_err(|error| PriceSourceError::Http { source_name, error })?;

    let status = response.status();
    if !status.is_success() {
        if status.as_u16() == 429 {
            warn!("{} rate limited (429)", source_name);
        }
        return Err(PriceSourceError::Status {
            source_name,
            status: status.as_u16(),
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| PriceSourceError::Malformed {
            source_name,
            detail: e.to_string(),
        })
}

/// Jupiter price API. Resolves any number of mint addresses in one request.
///
/// Response shape: `{"data": {"<mint>": {"id": "<mint>", "price": "142.51"}, "<unknown>": null}}`
pub struct JupiterSource {
    client: reqwest::Client,
    url: String,
}

impl JupiterSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }

    pub fn parse_response(body: &Value, requested: &[String]) -> HashMap<String, f64> {
        let mut prices = HashMap::new();
        let Some(data) = body.get("data").and_then(Value::as_object) else {
            debug!("jupiter: response without data object");
            return prices;
        };

        for identifier in requested {
            let entry = data.get(identifier).or_else(|| {
                data.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(identifier))
                    .map(|(_, v)| v)
            });
            if let Some(price) = entry.and_then(|e| e.get("price")).and_then(price_from_value) {
                prices.insert(identifier.clone(), price);
            }
        }
        prices
    }
}

#[async_trait]
impl PriceSource for JupiterSource {
    fn name(&self) -> &str {
        "jupiter"
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn get_price(&self, identifier: &str) -> Result<Option<f64>> {
        let prices = self.get_prices(&[identifier.to_string()]).await?;
        Ok(prices.get(identifier).copied())
    }

    async fn get_prices(&self, identifiers: &[String]) -> Result<HashMap<String, f64>> {
        if identifiers.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = identifiers.join(",");
        let body = get_json("jupiter", self.client.get(&self.url).query(&[("ids", ids.as_str())])).await?;
        Ok(Self::parse_response(&body, identifiers))
    }
}

/// Birdeye single-token price endpoint. Requires an API key for sustained use.
pub struct BirdeyeSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl BirdeyeSource {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            api_key,
        })
    }

    /// `{"success": true, "data": {"value": 142.51, "updateUnixTime": 1700000000}}`
    pub fn parse_response(body: &Value) -> Option<f64> {
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return None;
        }
        body.get("data")
            .and_then(|d| d.get("value"))
            .and_then(price_from_value)
    }
}

#[async_trait]
impl PriceSource for BirdeyeSource {
    fn name(&self) -> &str {
        "birdeye"
    }

    async fn get_price(&self, identifier: &str) -> Result<Option<f64>> {
        let mut request = self
            .client
            .get(&self.url)
            .query(&[("address", identifier)])
            .header("x-chain", "solana");
        if let Some(key) = &self.api_key {
            request = request.header("X-API-KEY", key);
        }
        let body = get_json("birdeye", request).await?;
        Ok(Self::parse_response(&body))
    }
}

/// CoinGecko `simple/price`. Works on ticker symbols mapped to coin ids.
pub struct CoinGeckoSource {
    client: reqwest::Client,
    url: String,
    ids: HashMap<String, String>,
}

impl CoinGeckoSource {
    pub fn new(url: impl Into<String>, ids: HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let ids = ids
            .into_iter()
            .map(|(symbol, id)| (symbol.to_lowercase(), id))
            .collect();
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            ids,
        })
    }

    /// Coin id for a symbol. Unmapped symbols are passed through lower-cased.
    pub fn coin_id(&self, symbol: &str) -> String {
        let symbol = symbol.to_lowercase();
        self.ids.get(&symbol).cloned().unwrap_or(symbol)
    }

    /// `{"solana": {"usd": 142.51}}`
    pub fn parse_response(body: &Value, coin_id: &str) -> Option<f64> {
        body.get(coin_id).and_then(|c| c.get("usd")).and_then(price_from_value)
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn get_price(&self, identifier: &str) -> Result<Option<f64>> {
        let coin_id = self.coin_id(identifier);
        let request = self
            .client
            .get(&self.url)
            .query(&[("ids", coin_id.as_str()), ("vs_currencies", "usd")]);
        let body = get_json("coingecko", request).await?;
        Ok(Self::parse_response(&body, &coin_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jupiter_parses_string_prices_and_skips_nulls() {
        let body = json!({
            "data": {
                "So11111111111111111111111111111111111111112": { "id": "So1", "price": "142.51" },
                "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN": { "price": 0.87 },
                "Unknown111111111111111111111111111111111111": null
            },
            "timeTaken": 0.002
        });
        let requested = vec![
            "So11111111111111111111111111111111111111112".to_string(),
            "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN".to_string(),
            "Unknown111111111111111111111111111111111111".to_string(),
        ];

        let prices = JupiterSource::parse_response(&body, &requested);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&requested[0]], 142.51);
        assert_eq!(prices[&requested[1]], 0.87);
    }

    #[test]
    fn test_jupiter_matches_keys_case_insensitively() {
        let body = json!({ "data": { "AbCdEfGhIjKlMnOpQrStUvWxYz": { "price": "2.5" } } });
        let requested = vec!["abcdefghijklmnopqrstuvwxyz".to_string()];
        let prices = JupiterSource::parse_response(&body, &requested);
        assert_eq!(prices.get("abcdefghijklmnopqrstuvwxyz"), Some(&2.5));
    }

    #[test]
    fn test_birdeye_parse() {
        assert_eq!(
            BirdeyeSource::parse_response(&json!({ "success": true, "data": { "value": 1.0001 } })),
            Some(1.0001)
        );
        assert_eq!(
            BirdeyeSource::parse_response(&json!({ "success": false, "message": "Unauthorized" })),
            None
        );
        assert_eq!(
            BirdeyeSource::parse_response(&json!({ "success": true, "data": { "value": 0 } })),
            None
        );
    }

    #[test]
    fn test_coingecko_symbol_mapping_and_parse() {
        let ids = HashMap::from([("SOL".to_string(), "solana".to_string())]);
        let source = CoinGeckoSource::new("http://localhost/simple/price", ids, Duration::from_secs(1)).unwrap();
        assert_eq!(source.coin_id("sol"), "solana");
        assert_eq!(source.coin_id("Bonk"), "bonk");

        let body = json!({ "solana": { "usd": 142.5 } });
        assert_eq!(CoinGeckoSource::parse_response(&body, "solana"), Some(142.5));
        assert_eq!(CoinGeckoSource::parse_response(&body, "bonk"), None);
    }

    #[test]
    fn test_price_validation() {
        assert_eq!(price_from_value(&json!("not a number")), None);
        assert_eq!(price_from_value(&json!(-3.0)), None);
        assert_eq!(price_from_value(&json!(" 4.25 ")), Some(4.25));
        assert_eq!(price_from_value(&json!({ "usd": 1 })), None);
    }
}
