// =============================================================================
// Signal Sources — remote candidate feeds merged into one symbol universe
// =============================================================================
//
// Two feeds drive the candidate universe:
//
//   AI500   => scored coin pool, ranked by model score
//   OI-Top  => open-interest movers on the derivatives market
//
// The fetcher lives in `fetch.rs`; this module owns the data model, symbol
// normalisation, and the merge of both feeds into a deduplicated universe
// with per-symbol provenance.
// =============================================================================

mod fetch;

pub use fetch::SignalSourceCache;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::settings::Settings;

/// Feed provenance labels recorded in [`MergedCoinPool::symbol_sources`].
pub const SOURCE_AI500: &str = "ai500";
pub const SOURCE_OI_TOP: &str = "oi_top";

// =============================================================================
// Feed records
// =============================================================================

/// One scored candidate from the AI500 coin-pool feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinInfo {
    pub symbol: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub start_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub max_price: f64,
    #[serde(default)]
    pub increase_pct: f64,
    #[serde(default)]
    pub available: bool,
}

impl CoinInfo {
    /// Wrap a bare symbol as a default-list entry.
    pub fn from_symbol(symbol: &str) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            score: 0.0,
            start_price: 0.0,
            current_price: 0.0,
            max_price: 0.0,
            increase_pct: 0.0,
            available: true,
        }
    }
}

/// One open-interest mover from the OI-Top feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OIPosition {
    pub symbol: String,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub open_interest: f64,
    #[serde(default)]
    pub oi_delta: f64,
    #[serde(default)]
    pub oi_delta_pct: f64,
    #[serde(default)]
    pub price_delta_pct: f64,
    #[serde(default)]
    pub net_long_short: f64,
}

/// The merged candidate universe handed to traders each cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergedCoinPool {
    pub ai500_coins: Vec<CoinInfo>,
    pub oi_top_positions: Vec<OIPosition>,
    /// Deduplicated union of both feeds' normalised symbols.
    pub all_symbols: Vec<String>,
    /// Which feed(s) contributed each symbol in `all_symbols`.
    pub symbol_sources: HashMap<String, Vec<String>>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Value configuration for the signal-source cache. Built once from
/// [`Settings`] and carried immutably by the fetcher.
#[derive(Debug, Clone)]
pub struct SignalSourceConfig {
    pub coin_pool_url: String,
    pub oi_top_url: String,
    pub request_timeout: Duration,
    pub cache_dir: String,
    pub use_default_coins: bool,
    pub default_coins: Vec<String>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// A disk-cached feed older than this is served with a staleness warning.
    pub stale_after: Duration,
}

impl SignalSourceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            coin_pool_url: settings.coin_pool_api_url.clone(),
            oi_top_url: settings.oi_top_api_url.clone(),
            request_timeout: Duration::from_secs(30),
            cache_dir: settings.cache_dir.clone(),
            use_default_coins: settings.use_default_coins,
            default_coins: settings.default_coins.clone(),
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            stale_after: Duration::from_secs(settings.signal_stale_after_hours * 3600),
        }
    }
}

impl Default for SignalSourceConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

// =============================================================================
// Symbol normalisation
// =============================================================================

/// Normalise a raw feed symbol: trim, uppercase, append `USDT` if absent.
/// Idempotent.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_uppercase();
    if !s.ends_with("USDT") {
        s.push_str("USDT");
    }
    s
}

// =============================================================================
// Merge
// =============================================================================

/// Merge the two feeds into one deduplicated universe.
///
/// Coin-pool entries are ordered by score descending (stable) and truncated
/// to `ai500_limit` before the union; OI-top symbols follow. Provenance is
/// preserved per symbol.
pub fn merge_pools(
    mut coins: Vec<CoinInfo>,
    positions: Vec<OIPosition>,
    ai500_limit: usize,
) -> MergedCoinPool {
    coins.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    coins.truncate(ai500_limit);

    let mut all_symbols: Vec<String> = Vec::new();
    let mut symbol_sources: HashMap<String, Vec<String>> = HashMap::new();

    for coin in &mut coins {
        coin.symbol = normalize_symbol(&coin.symbol);
        let entry = symbol_sources.entry(coin.symbol.clone()).or_default();
        if !entry.iter().any(|s| s == SOURCE_AI500) {
            entry.push(SOURCE_AI500.to_string());
        }
        if !all_symbols.contains(&coin.symbol) {
            all_symbols.push(coin.symbol.clone());
        }
    }

    let mut positions = positions;
    for pos in &mut positions {
        pos.symbol = normalize_symbol(&pos.symbol);
        let entry = symbol_sources.entry(pos.symbol.clone()).or_default();
        if !entry.iter().any(|s| s == SOURCE_OI_TOP) {
            entry.push(SOURCE_OI_TOP.to_string());
        }
        if !all_symbols.contains(&pos.symbol) {
            all_symbols.push(pos.symbol.clone());
        }
    }

    MergedCoinPool {
        ai500_coins: coins,
        oi_top_positions: positions,
        all_symbols,
        symbol_sources,
    }
}
