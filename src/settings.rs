// =============================================================================
// Fleet Settings — JSON-backed configuration with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian fleet.  Loaded once at startup
// and carried by value into component constructors; nothing reads it through
// a process-level global.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older settings file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_btc_eth_leverage() -> u32 {
    5
}

fn default_altcoin_leverage() -> u32 {
    5
}

fn default_coins() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_max_daily_loss() -> f64 {
    10.0
}

fn default_max_drawdown() -> f64 {
    20.0
}

fn default_stop_trading_minutes() -> u64 {
    60
}

fn default_api_server_port() -> u16 {
    8080
}

fn default_competition_cache_ttl_secs() -> u64 {
    30
}

fn default_signal_stale_after_hours() -> u64 {
    24
}

fn default_cache_dir() -> String {
    "coin_cache".to_string()
}

fn default_decision_log_dir() -> String {
    "decision_logs".to_string()
}

fn default_database_url() -> String {
    "sqlite://meridian.db".to_string()
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level settings for the Meridian fleet.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // --- Operational modes ---------------------------------------------------

    /// When true the process runs every persisted trader regardless of owner;
    /// otherwise only the default user's traders are loaded.
    #[serde(default)]
    pub admin_mode: bool,

    // --- Leverage policy -----------------------------------------------------

    /// Leverage cap for BTC and ETH.
    #[serde(default = "default_btc_eth_leverage")]
    pub btc_eth_leverage: u32,

    /// Leverage cap for every other symbol.
    #[serde(default = "default_altcoin_leverage")]
    pub altcoin_leverage: u32,

    // --- Candidate universe --------------------------------------------------

    /// Skip the remote coin-pool feeds and trade the static default list.
    #[serde(default)]
    pub use_default_coins: bool,

    /// Fallback symbol list when the feeds are disabled or unreachable.
    #[serde(default = "default_coins")]
    pub default_coins: Vec<String>,

    /// AI500 scored-coin feed endpoint. Empty disables the feed.
    #[serde(default)]
    pub coin_pool_api_url: String,

    /// Open-interest movers feed endpoint. Empty disables the feed.
    #[serde(default)]
    pub oi_top_api_url: String,

    /// Directory for the on-disk signal-source fallback cache.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// A cached feed older than this is still usable but flagged stale.
    #[serde(default = "default_signal_stale_after_hours")]
    pub signal_stale_after_hours: u64,

    // --- Risk tripwires ------------------------------------------------------

    /// Daily loss (percent of day-open equity) that halts a trader.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Drawdown from peak equity (percent) that halts a trader.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    /// How long a tripped trader stays halted.
    #[serde(default = "default_stop_trading_minutes")]
    pub stop_trading_minutes: u64,

    // --- Peripherals ---------------------------------------------------------

    /// Port reserved for the HTTP API component.
    #[serde(default = "default_api_server_port")]
    pub api_server_port: u16,

    /// Leaderboard snapshot lifetime.
    #[serde(default = "default_competition_cache_ttl_secs")]
    pub competition_cache_ttl_secs: u64,

    /// Directory holding per-trader decision logs.
    #[serde(default = "default_decision_log_dir")]
    pub decision_log_dir: String,

    /// SQLite connection string for the trader store.
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            admin_mode: false,
            btc_eth_leverage: default_btc_eth_leverage(),
            altcoin_leverage: default_altcoin_leverage(),
            use_default_coins: false,
            default_coins: default_coins(),
            coin_pool_api_url: String::new(),
            oi_top_api_url: String::new(),
            cache_dir: default_cache_dir(),
            signal_stale_after_hours: default_signal_stale_after_hours(),
            max_daily_loss: default_max_daily_loss(),
            max_drawdown: default_max_drawdown(),
            stop_trading_minutes: default_stop_trading_minutes(),
            api_server_port: default_api_server_port(),
            competition_cache_ttl_secs: default_competition_cache_ttl_secs(),
            decision_log_dir: default_decision_log_dir(),
            database_url: default_database_url(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        settings.validate()?;

        info!(
            path = %path.display(),
            admin_mode = settings.admin_mode,
            use_default_coins = settings.use_default_coins,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Apply environment overrides on top of whatever was loaded from disk.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("MERIDIAN_COIN_POOL_URL") {
            self.coin_pool_api_url = url;
        }
        if let Ok(url) = std::env::var("MERIDIAN_OI_TOP_URL") {
            self.oi_top_api_url = url;
        }
        if let Ok(url) = std::env::var("MERIDIAN_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(v) = std::env::var("MERIDIAN_ADMIN_MODE") {
            self.admin_mode = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(coins) = std::env::var("MERIDIAN_DEFAULT_COINS") {
            let parsed: Vec<String> = coins
                .split(',')
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.default_coins = parsed;
            }
        }
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_daily_loss <= 0.0 {
            anyhow::bail!("max_daily_loss must be positive, got {}", self.max_daily_loss);
        }
        if self.max_drawdown <= 0.0 {
            anyhow::bail!("max_drawdown must be positive, got {}", self.max_drawdown);
        }
        if self.btc_eth_leverage == 0 || self.altcoin_leverage == 0 {
            anyhow::bail!("leverage caps must be at least 1");
        }
        if self.default_coins.is_empty() {
            anyhow::bail!("default_coins must not be empty");
        }
        Ok(())
    }

    /// Persist the current settings to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_have_expected_values() {
        let s = Settings::default();
        assert!(!s.admin_mode);
        assert_eq!(s.btc_eth_leverage, 5);
        assert_eq!(s.altcoin_leverage, 5);
        assert_eq!(s.default_coins.len(), 5);
        assert_eq!(s.default_coins[0], "BTCUSDT");
        assert_eq!(s.competition_cache_ttl_secs, 30);
        assert_eq!(s.signal_stale_after_hours, 24);
        assert_eq!(s.stop_trading_minutes, 60);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let s: Settings = serde_json::from_str("{}").unwrap();
        assert!(!s.use_default_coins);
        assert_eq!(s.max_daily_loss, 10.0);
        assert_eq!(s.cache_dir, "coin_cache");
        assert_eq!(s.decision_log_dir, "decision_logs");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "admin_mode": true, "default_coins": ["ETHUSDT"] }"#;
        let s: Settings = serde_json::from_str(json).unwrap();
        assert!(s.admin_mode);
        assert_eq!(s.default_coins, vec!["ETHUSDT"]);
        assert_eq!(s.btc_eth_leverage, 5);
    }

    #[test]
    fn validation_rejects_zero_leverage() {
        let mut s = Settings::default();
        s.altcoin_leverage = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validation_rejects_non_positive_tripwires() {
        let mut s = Settings::default();
        s.max_daily_loss = 0.0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.max_drawdown = -1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let s = Settings::default();
        let json = serde_json::to_string(&s).unwrap();
        let s2: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(s.default_coins, s2.default_coins);
        assert_eq!(s.max_daily_loss, s2.max_daily_loss);
        assert_eq!(s.database_url, s2.database_url);
    }
}
