// =============================================================================
// Signal-Source Fetcher — retry, disk fallback, request coalescing
// =============================================================================
//
// Feed degradation order, per feed:
//
//   live API  =>  on-disk cache (stale allowed, flagged)  =>  defaults
//
// A network problem is never surfaced to a trader; the worst case for the
// coin pool is the static default list, and for OI-top an empty list.
//
// Each feed is guarded by a tokio Mutex held across the whole fetch, so
// concurrent traders ticking at the same moment share a single in-flight
// request and its outcome.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{merge_pools, CoinInfo, MergedCoinPool, OIPosition, SignalSourceConfig};

/// Results fetched within this window are shared with concurrent callers
/// instead of issuing another request.
const COALESCE_WINDOW: Duration = Duration::from_secs(10);

const COIN_POOL_CACHE_FILE: &str = "latest.json";
const OI_TOP_CACHE_FILE: &str = "oi_top_latest.json";

// =============================================================================
// Wire envelopes (incoming)
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CoinPoolData {
    #[serde(default)]
    coins: Vec<CoinInfo>,
    #[serde(default)]
    #[allow(dead_code)]
    count: u32,
}

#[derive(Debug, Deserialize)]
struct OiTopData {
    #[serde(default)]
    positions: Vec<OIPosition>,
    #[serde(default)]
    #[allow(dead_code)]
    count: u32,
}

// =============================================================================
// Cache files (outgoing, on disk)
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CoinCacheFile {
    coins: Vec<CoinInfo>,
    fetched_at: DateTime<Utc>,
    source_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OiCacheFile {
    positions: Vec<OIPosition>,
    fetched_at: DateTime<Utc>,
    source_type: String,
}

// =============================================================================
// In-memory memo (coalescing)
// =============================================================================

struct FeedMemo<T> {
    fetched_at: Option<Instant>,
    items: Vec<T>,
}

impl<T: Clone> FeedMemo<T> {
    fn empty() -> Self {
        Self {
            fetched_at: None,
            items: Vec::new(),
        }
    }

    fn fresh(&self) -> Option<Vec<T>> {
        match self.fetched_at {
            Some(at) if at.elapsed() < COALESCE_WINDOW => Some(self.items.clone()),
            _ => None,
        }
    }

    fn store(&mut self, items: Vec<T>) {
        self.fetched_at = Some(Instant::now());
        self.items = items;
    }
}

// =============================================================================
// SignalSourceCache
// =============================================================================

/// Shared, fallback-aware fetcher for both candidate feeds.
pub struct SignalSourceCache {
    config: SignalSourceConfig,
    http: reqwest::Client,
    coin_pool: Mutex<FeedMemo<CoinInfo>>,
    oi_top: Mutex<FeedMemo<OIPosition>>,
}

impl SignalSourceCache {
    /// Create a cache with a default HTTP client honouring the configured
    /// request timeout.
    pub fn new(config: SignalSourceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build reqwest client for SignalSourceCache");
        Self::with_client(config, http)
    }

    /// Create a cache that re-uses an existing HTTP client.
    pub fn with_client(config: SignalSourceConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            coin_pool: Mutex::new(FeedMemo::empty()),
            oi_top: Mutex::new(FeedMemo::empty()),
        }
    }

    // -------------------------------------------------------------------------
    // Coin pool (AI500)
    // -------------------------------------------------------------------------

    /// Fetch the scored coin pool. Never fails: degrades to the disk cache,
    /// then to the configured default list.
    pub async fn get_coin_pool(&self) -> Vec<CoinInfo> {
        if self.config.use_default_coins || self.config.coin_pool_url.is_empty() {
            debug!("coin pool feed disabled — serving default coin list");
            return self.default_coin_list();
        }

        let mut memo = self.coin_pool.lock().await;
        if let Some(items) = memo.fresh() {
            debug!(count = items.len(), "coin pool served from coalescing memo");
            return items;
        }

        match self.fetch_coin_pool_with_retries().await {
            Ok(mut coins) => {
                for c in &mut coins {
                    c.available = true;
                }
                if let Err(e) = self.write_coin_cache(&coins) {
                    warn!(error = %e, "failed to persist coin pool cache");
                }
                memo.store(coins.clone());
                coins
            }
            Err(e) => {
                warn!(error = %e, "coin pool fetch exhausted retries — falling back to cache");
                match self.read_coin_cache() {
                    Ok(coins) => {
                        info!(count = coins.len(), "coin pool served from disk cache");
                        coins
                    }
                    Err(cache_err) => {
                        warn!(error = %cache_err, "coin pool cache unreadable — serving defaults");
                        self.default_coin_list()
                    }
                }
            }
        }
    }

    async fn fetch_coin_pool_with_retries(&self) -> Result<Vec<CoinInfo>> {
        let mut last_err = anyhow::anyhow!("no fetch attempts made");
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.try_fetch_coin_pool().await {
                Ok(coins) => {
                    debug!(attempt, count = coins.len(), "coin pool fetched");
                    return Ok(coins);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "coin pool fetch attempt failed");
                    last_err = e;
                    if attempt < self.config.max_retries.max(1) {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn try_fetch_coin_pool(&self) -> Result<Vec<CoinInfo>> {
        let resp = self
            .http
            .get(&self.config.coin_pool_url)
            .send()
            .await
            .context("GET coin pool request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("coin pool API returned {status}");
        }

        let envelope: Envelope<CoinPoolData> = resp
            .json()
            .await
            .context("failed to parse coin pool response")?;

        if !envelope.success {
            anyhow::bail!("coin pool API reported success=false");
        }
        let coins = envelope.data.map(|d| d.coins).unwrap_or_default();
        if coins.is_empty() {
            anyhow::bail!("coin pool API returned an empty coin list");
        }

        Ok(coins)
    }

    // -------------------------------------------------------------------------
    // OI-Top
    // -------------------------------------------------------------------------

    /// Fetch the open-interest movers. Never fails: degrades to the disk
    /// cache, then to an empty list.
    pub async fn get_oi_top(&self) -> Vec<OIPosition> {
        if self.config.use_default_coins || self.config.oi_top_url.is_empty() {
            debug!("OI-top feed disabled — serving empty list");
            return Vec::new();
        }

        let mut memo = self.oi_top.lock().await;
        if let Some(items) = memo.fresh() {
            debug!(count = items.len(), "OI-top served from coalescing memo");
            return items;
        }

        match self.fetch_oi_top_with_retries().await {
            Ok(positions) => {
                if let Err(e) = self.write_oi_cache(&positions) {
                    warn!(error = %e, "failed to persist OI-top cache");
                }
                memo.store(positions.clone());
                positions
            }
            Err(e) => {
                warn!(error = %e, "OI-top fetch exhausted retries — falling back to cache");
                match self.read_oi_cache() {
                    Ok(positions) => {
                        info!(count = positions.len(), "OI-top served from disk cache");
                        positions
                    }
                    Err(cache_err) => {
                        warn!(error = %cache_err, "OI-top cache unreadable — serving empty list");
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn fetch_oi_top_with_retries(&self) -> Result<Vec<OIPosition>> {
        let mut last_err = anyhow::anyhow!("no fetch attempts made");
        for attempt in 1..=self.config.max_retries.max(1) {
            match self.try_fetch_oi_top().await {
                Ok(positions) => {
                    debug!(attempt, count = positions.len(), "OI-top fetched");
                    return Ok(positions);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "OI-top fetch attempt failed");
                    last_err = e;
                    if attempt < self.config.max_retries.max(1) {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn try_fetch_oi_top(&self) -> Result<Vec<OIPosition>> {
        let resp = self
            .http
            .get(&self.config.oi_top_url)
            .send()
            .await
            .context("GET OI-top request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("OI-top API returned {status}");
        }

        let envelope: Envelope<OiTopData> = resp
            .json()
            .await
            .context("failed to parse OI-top response")?;

        if !envelope.success {
            anyhow::bail!("OI-top API reported success=false");
        }
        let positions = envelope.data.map(|d| d.positions).unwrap_or_default();
        if positions.is_empty() {
            anyhow::bail!("OI-top API returned an empty position list");
        }

        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Merged universe
    // -------------------------------------------------------------------------

    /// Fetch both feeds and merge them into one deduplicated universe with
    /// at most `ai500_limit` coin-pool symbols.
    pub async fn get_merged(&self, ai500_limit: usize) -> MergedCoinPool {
        let (coins, positions) = tokio::join!(self.get_coin_pool(), self.get_oi_top());
        merge_pools(coins, positions, ai500_limit)
    }

    // -------------------------------------------------------------------------
    // Disk cache
    // -------------------------------------------------------------------------

    fn cache_path(&self, file: &str) -> PathBuf {
        Path::new(&self.config.cache_dir).join(file)
    }

    fn write_coin_cache(&self, coins: &[CoinInfo]) -> Result<()> {
        let file = CoinCacheFile {
            coins: coins.to_vec(),
            fetched_at: Utc::now(),
            source_type: "api".to_string(),
        };
        self.write_cache_file(COIN_POOL_CACHE_FILE, &file)
    }

    fn write_oi_cache(&self, positions: &[OIPosition]) -> Result<()> {
        let file = OiCacheFile {
            positions: positions.to_vec(),
            fetched_at: Utc::now(),
            source_type: "api".to_string(),
        };
        self.write_cache_file(OI_TOP_CACHE_FILE, &file)
    }

    /// Atomic write (tmp + rename), owner-only permissions on unix.
    fn write_cache_file<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        std::fs::create_dir_all(&self.config.cache_dir).with_context(|| {
            format!("failed to create cache dir {}", self.config.cache_dir)
        })?;

        let path = self.cache_path(name);
        let tmp_path = path.with_extension("json.tmp");

        let content =
            serde_json::to_string_pretty(payload).context("failed to serialise cache file")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp cache to {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&tmp_path, perms);
        }

        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp cache to {}", path.display()))?;

        debug!(path = %path.display(), "signal cache file written");
        Ok(())
    }

    fn read_coin_cache(&self) -> Result<Vec<CoinInfo>> {
        let path = self.cache_path(COIN_POOL_CACHE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache from {}", path.display()))?;
        let file: CoinCacheFile =
            serde_json::from_str(&content).context("failed to parse coin cache file")?;

        self.flag_if_stale("coin pool", file.fetched_at);
        Ok(file.coins)
    }

    fn read_oi_cache(&self) -> Result<Vec<OIPosition>> {
        let path = self.cache_path(OI_TOP_CACHE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache from {}", path.display()))?;
        let file: OiCacheFile =
            serde_json::from_str(&content).context("failed to parse OI cache file")?;

        self.flag_if_stale("OI-top", file.fetched_at);
        Ok(file.positions)
    }

    fn flag_if_stale(&self, feed: &str, fetched_at: DateTime<Utc>) {
        let age = Utc::now().signed_duration_since(fetched_at);
        if age.num_seconds() > self.config.stale_after.as_secs() as i64 {
            warn!(
                feed,
                age_hours = age.num_hours(),
                "serving stale signal cache"
            );
        }
    }

    fn default_coin_list(&self) -> Vec<CoinInfo> {
        self.config
            .default_coins
            .iter()
            .map(|s| CoinInfo::from_symbol(s))
            .collect()
    }
}

impl std::fmt::Debug for SignalSourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSourceCache")
            .field("coin_pool_url", &self.config.coin_pool_url)
            .field("oi_top_url", &self.config.oi_top_url)
            .field("cache_dir", &self.config.cache_dir)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> SignalSourceConfig {
        SignalSourceConfig {
            coin_pool_url: String::new(),
            oi_top_url: String::new(),
            request_timeout: Duration::from_secs(1),
            cache_dir: dir.to_string_lossy().into_owned(),
            use_default_coins: false,
            default_coins: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
            stale_after: Duration::from_secs(24 * 3600),
        }
    }

    #[tokio::test]
    async fn empty_url_serves_default_coin_list() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SignalSourceCache::new(test_config(dir.path()));

        let coins = cache.get_coin_pool().await;
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[0].symbol, "BTCUSDT");
        assert!(coins.iter().all(|c| c.available));
        assert!(coins.iter().all(|c| c.score == 0.0));
    }

    #[tokio::test]
    async fn empty_url_serves_empty_oi_top() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SignalSourceCache::new(test_config(dir.path()));
        assert!(cache.get_oi_top().await.is_empty());
    }

    #[tokio::test]
    async fn use_default_coins_short_circuits_even_with_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.coin_pool_url = "http://127.0.0.1:1/coins".into();
        cfg.use_default_coins = true;
        let cache = SignalSourceCache::new(cfg);

        let coins = cache.get_coin_pool().await;
        assert_eq!(coins.len(), 2);
    }

    #[tokio::test]
    async fn outage_with_warm_cache_serves_cached_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        // Unreachable endpoint: connection refused on the discard port.
        cfg.coin_pool_url = "http://127.0.0.1:1/coins".into();
        let cache = SignalSourceCache::new(cfg);

        let warm = vec![
            CoinInfo::from_symbol("SOL"),
            CoinInfo::from_symbol("DOGE"),
        ];
        cache.write_coin_cache(&warm).unwrap();

        let coins = cache.get_coin_pool().await;
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[0].symbol, "SOLUSDT");
        assert_eq!(coins[1].symbol, "DOGEUSDT");
    }

    #[tokio::test]
    async fn outage_without_cache_serves_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.coin_pool_url = "http://127.0.0.1:1/coins".into();
        let cache = SignalSourceCache::new(cfg);

        let coins = cache.get_coin_pool().await;
        assert_eq!(coins.len(), 2);
        assert_eq!(coins[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn oi_outage_without_cache_serves_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.oi_top_url = "http://127.0.0.1:1/oi".into();
        let cache = SignalSourceCache::new(cfg);

        assert!(cache.get_oi_top().await.is_empty());
    }

    #[test]
    fn cache_file_roundtrip_preserves_payload() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SignalSourceCache::new(test_config(dir.path()));

        let coins = vec![CoinInfo {
            symbol: "BTCUSDT".into(),
            score: 9.5,
            start_price: 40_000.0,
            current_price: 41_000.0,
            max_price: 42_000.0,
            increase_pct: 2.5,
            available: true,
        }];
        cache.write_coin_cache(&coins).unwrap();

        let restored = cache.read_coin_cache().unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].symbol, "BTCUSDT");
        assert_eq!(restored[0].score, 9.5);
        assert_eq!(restored[0].max_price, 42_000.0);
    }

    #[cfg(unix)]
    #[test]
    fn cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cache = SignalSourceCache::new(test_config(dir.path()));
        cache
            .write_coin_cache(&[CoinInfo::from_symbol("BTC")])
            .unwrap();

        let meta = std::fs::metadata(dir.path().join(COIN_POOL_CACHE_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn merged_pool_from_disabled_feeds_uses_defaults_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SignalSourceCache::new(test_config(dir.path()));

        let merged = cache.get_merged(10).await;
        assert_eq!(merged.all_symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(merged.oi_top_positions.is_empty());
        for sym in &merged.all_symbols {
            assert_eq!(merged.symbol_sources[sym], vec!["ai500".to_string()]);
        }
    }
}
