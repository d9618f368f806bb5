// src/position_cache.rs
//! Wallet position lookup with a three-tier fallback:
//!
//! 1. live fetch (caller-supplied, usually a closure over [`crate::rpc_pool::RpcPool`]),
//!    used only when it returns at least one position;
//! 2. the last snapshot for the wallet, if it is younger than the freshness window;
//! 3. static known-good data for the wallet, re-stamped and tagged [`Provenance::Known`].
//!
//! Nothing found is an empty snapshot, never an error. Tier 1 and tier 3 results are
//! written through to a [`SnapshotStore`] so a restart keeps previously obtained data.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::settings;
use crate::timeout::with_timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub protocol: String,
    pub pool_address: String,
    pub token_a: String,
    pub token_b: String,
    pub amount_a: f64,
    pub amount_b: f64,
    /// Protocol-specific extras (tick range, fee tier, rewards, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Live,
    Cache,
    Known,
    Empty,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Live => "live",
            Provenance::Cache => "cache",
            Provenance::Known => "known",
            Provenance::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub wallet: String,
    pub positions: Vec<PositionRecord>,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
}

impl PositionSnapshot {
    pub fn new(wallet: impl Into<String>, positions: Vec<PositionRecord>, provenance: Provenance) -> Self {
        Self {
            wallet: wallet.into(),
            positions,
            timestamp: Utc::now(),
            provenance,
        }
    }

    pub fn empty(wallet: impl Into<String>) -> Self {
        Self::new(wallet, Vec::new(), Provenance::Empty)
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Timestamp lies ahead of the local clock (skew, or a hand-edited store).
    pub fn is_from_future(&self) -> bool {
        self.timestamp > Utc::now()
    }
}

/// Future returned by a live position fetch.
pub type LiveFetch<'a> = BoxFuture<'a, Result<Vec<PositionRecord>>>;

/// Durable home of the snapshot table.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, PositionSnapshot>>;

    async fn save(&self, snapshots: &HashMap<String, PositionSnapshot>) -> Result<()>;
}

/// Whole-table JSON file. Writes go to a sibling temp file and are renamed into place.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<HashMap<String, PositionSnapshot>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn save(&self, snapshots: &HashMap<String, PositionSnapshot>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let body = serde_json::to_vec_pretty(snapshots)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }
}

/// Keeps the table in memory only. Useful when persistence is not wanted.
#[derive(Default)]
pub struct MemoryStore {
    saved: tokio::sync::Mutex<HashMap<String, PositionSnapshot>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<HashMap<String, PositionSnapshot>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, snapshots: &HashMap<String, PositionSnapshot>) -> Result<()> {
        *self.saved.lock().await = snapshots.clone();
        Ok(())
    }
}

/// Previously verified positions, served when neither live data nor a fresh snapshot exist.
pub trait KnownPositions: Send + Sync {
    fn lookup(&self, wallet: &str) -> Option<Vec<PositionRecord>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticKnownPositions {
    by_wallet: HashMap<String, Vec<PositionRecord>>,
}

impl StaticKnownPositions {
    pub fn new(by_wallet: HashMap<String, Vec<PositionRecord>>) -> Self {
        Self { by_wallet }
    }

    /// Loads `{ "<wallet>": [ <position>, ... ] }`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let by_wallet = serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { by_wallet })
    }

    pub fn insert(&mut self, wallet: impl Into<String>, positions: Vec<PositionRecord>) {
        self.by_wallet.insert(wallet.into(), positions);
    }

    pub fn len(&self) -> usize {
        self.by_wallet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_wallet.is_empty()
    }
}

impl KnownPositions for StaticKnownPositions {
    fn lookup(&self, wallet: &str) -> Option<Vec<PositionRecord>> {
        self.by_wallet.get(wallet).filter(|p| !p.is_empty()).cloned()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionCacheStats {
    pub wallets: usize,
    pub positions: usize,
    pub live_snapshots: usize,
    pub known_snapshots: usize,
    pub oldest_age_seconds: Option<i64>,
}

pub struct PositionCache {
    snapshots: DashMap<String, PositionSnapshot>,
    store: Arc<dyn SnapshotStore>,
    known: Arc<dyn KnownPositions>,
    freshness: chrono::Duration,
    live_fetch_timeout: Duration,
}

impl PositionCache {
    /// Builds the cache and loads whatever the store holds. A store that cannot be read
    /// is logged and treated as empty.
    pub async fn new(
        cfg: &settings::PositionCache,
        store: Arc<dyn SnapshotStore>,
        known: Arc<dyn KnownPositions>,
    ) -> Self {
        let snapshots = DashMap::new();
        match store.load().await {
            Ok(loaded) => {
                if !loaded.is_empty() {
                    info!("Loaded {} position snapshots from store", loaded.len());
                }
                for (wallet, snapshot) in loaded {
                    snapshots.insert(wallet, snapshot);
                }
            }
            Err(e) => warn!("Could not load position snapshots, starting empty: {:#}", e),
        }

        Self {
            snapshots,
            store,
            known,
            freshness: chrono::Duration::seconds(cfg.freshness_seconds as i64),
            live_fetch_timeout: Duration::from_millis(cfg.live_fetch_timeout_ms),
        }
    }

    /// File-backed store at `snapshot_path`, known data from `known_positions_path` if set.
    pub async fn from_settings(cfg: &settings::PositionCache) -> Result<Self> {
        let known = match &cfg.known_positions_path {
            Some(path) => StaticKnownPositions::from_json_file(path)?,
            None => StaticKnownPositions::default(),
        };
        let store = Arc::new(JsonFileStore::new(&cfg.snapshot_path));
        Ok(Self::new(cfg, store, Arc::new(known)).await)
    }

    pub fn freshness(&self) -> chrono::Duration {
        self.freshness
    }

    /// A snapshot stamped in the future is never fresh.
    fn is_fresh(&self, snapshot: &PositionSnapshot) -> bool {
        !snapshot.is_from_future() && snapshot.age() < self.freshness
    }

    /// Best obtainable positions for `wallet`. See the module docs for the tier order.
    pub async fn get_positions(&self, wallet: &str, live_fetch: Option<LiveFetch<'_>>) -> PositionSnapshot {
        let wallet = wallet.trim();

        if let Some(fetch) = live_fetch {
            match with_timeout(fetch, self.live_fetch_timeout).await {
                Ok(positions) if !positions.is_empty() => {
                    debug!("{}: {} positions from live fetch", wallet, positions.len());
                    let snapshot = PositionSnapshot::new(wallet, positions, Provenance::Live);
                    self.store_and_persist(snapshot.clone()).await;
                    metrics::increment_position_tier(Provenance::Live.as_str());
                    return snapshot;
                }
                Ok(_) => debug!("{}: live fetch returned no positions", wallet),
                Err(e) => warn!("{}: live fetch failed, falling back: {}", wallet, e),
            }
        }

        if let Some(cached) = self.snapshots.get(wallet).map(|s| s.clone()) {
            if self.is_fresh(&cached) && !cached.is_empty() {
                debug!("{}: serving cached snapshot ({}s old)", wallet, cached.age().num_seconds());
                metrics::increment_position_tier(Provenance::Cache.as_str());
                return PositionSnapshot {
                    provenance: Provenance::Cache,
                    ..cached
                };
            }
        }

        if let Some(positions) = self.known.lookup(wallet) {
            info!("{}: serving {} known positions", wallet, positions.len());
            let snapshot = PositionSnapshot::new(wallet, positions, Provenance::Known);
            self.store_and_persist(snapshot.clone()).await;
            metrics::increment_position_tier(Provenance::Known.as_str());
            return snapshot;
        }

        debug!("{}: no positions from any tier", wallet);
        metrics::increment_position_tier(Provenance::Empty.as_str());
        PositionSnapshot::empty(wallet)
    }

    /// Stored snapshot for `wallet`, regardless of age.
    pub fn snapshot(&self, wallet: &str) -> Option<PositionSnapshot> {
        self.snapshots.get(wallet.trim()).map(|s| s.clone())
    }

    /// Manual insert, keeping the snapshot's own timestamp and provenance.
    pub async fn insert_snapshot(&self, snapshot: PositionSnapshot) {
        self.store_and_persist(snapshot).await;
    }

    /// Bulk variant of [`Self::insert_snapshot`] with a single store write.
    pub async fn insert_snapshots(&self, snapshots: impl IntoIterator<Item = PositionSnapshot>) -> usize {
        let mut count = 0;
        for snapshot in snapshots {
            self.snapshots.insert(snapshot.wallet.clone(), snapshot);
            count += 1;
        }
        if count > 0 {
            self.persist().await;
        }
        count
    }

    pub fn stats(&self) -> PositionCacheStats {
        let mut stats = PositionCacheStats {
            wallets: 0,
            positions: 0,
            live_snapshots: 0,
            known_snapshots: 0,
            oldest_age_seconds: None,
        };
        for entry in self.snapshots.iter() {
            let snapshot = entry.value();
            stats.wallets += 1;
            stats.positions += snapshot.positions.len();
            match snapshot.provenance {
                Provenance::Live => stats.live_snapshots += 1,
                Provenance::Known => stats.known_snapshots += 1,
                _ => {}
            }
            let age = snapshot.age().num_seconds();
            stats.oldest_age_seconds = Some(stats.oldest_age_seconds.map_or(age, |o| o.max(age)));
        }
        stats
    }

    /// Drops snapshots older than `max_age` and rewrites the store. Returns how many went.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let before = self.snapshots.len();
        self.snapshots
            .retain(|_, snapshot| !snapshot.is_from_future() && snapshot.age() < max_age);
        let removed = before.saturating_sub(self.snapshots.len());
        if removed > 0 {
            info!("Removed {} position snapshots older than {}h", removed, max_age.num_hours());
            self.persist().await;
        }
        removed
    }

    async fn store_and_persist(&self, snapshot: PositionSnapshot) {
        self.snapshots.insert(snapshot.wallet.clone(), snapshot);
        self.persist().await;
    }

    async fn persist(&self) {
        let table: HashMap<String, PositionSnapshot> = self
            .snapshots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if let Err(e) = self.store.save(&table).await {
            warn!("Failed to persist position snapshots: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn record(id: &str) -> PositionRecord {
        PositionRecord {
            id: id.to_string(),
            protocol: "orca-whirlpool".to_string(),
            pool_address: "HJPjoWUrhoZzkNfRpHuieeFk9WcZWjwy6PBjZ81ngndJ".to_string(),
            token_a: "SOL".to_string(),
            token_b: "USDC".to_string(),
            amount_a: 1.5,
            amount_b: 210.0,
            metadata: serde_json::json!({ "fee_tier_bps": 30 }),
        }
    }

    async fn cache_with(known: StaticKnownPositions) -> PositionCache {
        PositionCache::new(
            &settings::PositionCache::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(known),
        )
        .await
    }

    #[tokio::test]
    async fn test_live_result_wins_when_non_empty() {
        let cache = cache_with(StaticKnownPositions::default()).await;
        let snapshot = cache
            .get_positions(WALLET, Some(async { Ok(vec![record("p1")]) }.boxed()))
            .await;
        assert_eq!(snapshot.provenance, Provenance::Live);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(cache.snapshot(WALLET).unwrap().provenance, Provenance::Live);
    }

    #[tokio::test]
    async fn test_empty_live_result_does_not_override_fresh_cache() {
        let cache = cache_with(StaticKnownPositions::default()).await;
        cache
            .insert_snapshot(PositionSnapshot::new(WALLET, vec![record("p1"), record("p2")], Provenance::Live))
            .await;

        let snapshot = cache.get_positions(WALLET, Some(async { Ok(vec![]) }.boxed())).await;
        assert_eq!(snapshot.provenance, Provenance::Cache);
        assert_eq!(snapshot.positions.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_live_fetch_falls_back_to_cache() {
        let cache = cache_with(StaticKnownPositions::default()).await;
        cache
            .insert_snapshot(PositionSnapshot::new(WALLET, vec![record("p1")], Provenance::Live))
            .await;

        let snapshot = cache
            .get_positions(WALLET, Some(async { Err(anyhow::anyhow!("429 from RPC")) }.boxed()))
            .await;
        assert_eq!(snapshot.provenance, Provenance::Cache);
    }

    #[tokio::test]
    async fn test_stale_cache_falls_through_to_known() {
        let mut known = StaticKnownPositions::default();
        known.insert(WALLET, vec![record("verified")]);
        let cache = cache_with(known).await;

        let mut stale = PositionSnapshot::new(WALLET, vec![record("old")], Provenance::Live);
        stale.timestamp = Utc::now() - chrono::Duration::minutes(10);
        cache.insert_snapshot(stale).await;

        let snapshot = cache.get_positions(WALLET, None).await;
        assert_eq!(snapshot.provenance, Provenance::Known);
        assert_eq!(snapshot.positions[0].id, "verified");
        assert!(snapshot.age() < chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_unknown_wallet_gets_empty_snapshot() {
        let cache = cache_with(StaticKnownPositions::default()).await;
        let snapshot = cache.get_positions("nobody", None).await;
        assert_eq!(snapshot.provenance, Provenance::Empty);
        assert!(snapshot.is_empty());
        assert!(cache.snapshot("nobody").is_none());
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let cache = cache_with(StaticKnownPositions::default()).await;
        let mut old = PositionSnapshot::new("old-wallet", vec![record("a"), record("b")], Provenance::Known);
        old.timestamp = Utc::now() - chrono::Duration::hours(48);
        let fresh = PositionSnapshot::new(WALLET, vec![record("c")], Provenance::Live);
        assert_eq!(cache.insert_snapshots(vec![old, fresh]).await, 2);

        let stats = cache.stats();
        assert_eq!(stats.wallets, 2);
        assert_eq!(stats.positions, 3);
        assert_eq!(stats.known_snapshots, 1);
        assert!(stats.oldest_age_seconds.unwrap() >= 48 * 3600);

        assert_eq!(cache.cleanup_older_than(Duration::from_secs(24 * 3600)).await, 1);
        assert_eq!(cache.stats().wallets, 1);
        assert!(cache.snapshot("old-wallet").is_none());
    }

    #[tokio::test]
    async fn test_future_timestamp_is_stale_and_cleaned_up() {
        let mut known = StaticKnownPositions::default();
        known.insert(WALLET, vec![record("verified")]);
        let cache = cache_with(known).await;

        let mut skewed = PositionSnapshot::new("skewed-wallet", vec![record("s1")], Provenance::Live);
        skewed.timestamp = Utc::now() + chrono::Duration::days(3);
        let mut ahead = PositionSnapshot::new(WALLET, vec![record("ahead")], Provenance::Live);
        ahead.timestamp = Utc::now() + chrono::Duration::hours(1);
        cache.insert_snapshots(vec![skewed, ahead]).await;

        let snapshot = cache.get_positions(WALLET, None).await;
        assert_eq!(snapshot.provenance, Provenance::Known);
        assert_eq!(snapshot.positions[0].id, "verified");

        let other = cache.get_positions("skewed-wallet", None).await;
        assert_eq!(other.provenance, Provenance::Empty);

        assert_eq!(cache.cleanup_older_than(Duration::from_secs(24 * 3600)).await, 1);
        assert!(cache.snapshot("skewed-wallet").is_none());
        assert!(cache.snapshot(WALLET).is_some());
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshots.json");
        let cfg = settings::PositionCache::default();

        {
            let cache = PositionCache::new(
                &cfg,
                Arc::new(JsonFileStore::new(&path)),
                Arc::new(StaticKnownPositions::default()),
            )
            .await;
            cache
                .get_positions(WALLET, Some(async { Ok(vec![record("p1")]) }.boxed()))
                .await;
        }
        assert!(path.exists());

        let reloaded = PositionCache::new(
            &cfg,
            Arc::new(JsonFileStore::new(&path)),
            Arc::new(StaticKnownPositions::default()),
        )
        .await;
        let snapshot = reloaded.get_positions(WALLET, None).await;
        assert_eq!(snapshot.provenance, Provenance::Cache);
        assert_eq!(snapshot.positions, vec![record("p1")]);
    }

    #[tokio::test]
    async fn test_unwritable_store_still_returns_result() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("taken");
        std::fs::create_dir_all(path.join("child")).unwrap();

        let cache = PositionCache::new(
            &settings::PositionCache::default(),
            Arc::new(JsonFileStore::new(&path)),
            Arc::new(StaticKnownPositions::default()),
        )
        .await;
        let snapshot = cache
            .get_positions(WALLET, Some(async { Ok(vec![record("p1")]) }.boxed()))
            .await;
        assert_eq!(snapshot.provenance, Provenance::Live);
        assert!(cache.snapshot(WALLET).is_some());
    }
}
