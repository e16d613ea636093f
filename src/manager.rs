// =============================================================================
// Trader Manager — fleet registry, per-user scoping, leaderboard cache
// =============================================================================
//
// Owns every live AutoTrader. Mutations go through the registry write lock;
// readers get snapshot copies so internal maps never leak. The competition
// cache sits behind its own lock so a slow refresh never blocks registry
// readers.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::ai::{build_provider, AiClient, AiModelConfig};
use crate::exchange::{build_exchange, AccountState, ExchangeConfig, Position};
use crate::notify::Notifier;
use crate::settings::Settings;
use crate::signal_source::SignalSourceCache;
use crate::store::{TraderStore, DEFAULT_USER};
use crate::trader::{AutoTrader, TraderConfig, TraderDeps, TripwireConfig};

/// Legacy ownership heuristic, used only for rows whose ids predate the
/// persisted user_id column: a trader belongs to a user when its id carries
/// the `<user>_` prefix, and UUID-style ids (no `@`) belong to the default
/// user.
pub fn is_user_trader(trader_id: &str, user_id: &str) -> bool {
    if trader_id.starts_with(&format!("{user_id}_")) {
        return true;
    }
    user_id == DEFAULT_USER && !trader_id.contains('@')
}

// =============================================================================
// Aggregate views
// =============================================================================

/// One leaderboard row.
#[derive(Debug, Clone, Serialize)]
pub struct CompetitionEntry {
    pub trader_id: String,
    pub display_name: String,
    pub model: String,
    pub exchange: String,
    pub total_pnl_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_equity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_count: Option<usize>,
    pub cycle_count: u64,
    pub is_running: bool,
}

/// Leaderboard snapshot, replaced atomically on refresh.
#[derive(Debug, Clone, Serialize)]
pub struct CompetitionSnapshot {
    pub entries: Vec<CompetitionEntry>,
    pub captured_at: DateTime<Utc>,
}

/// Best-effort per-trader summary for side-by-side comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonEntry {
    pub trader_id: String,
    pub display_name: String,
    pub model: String,
    pub exchange: String,
    pub account_state: AccountState,
    pub positions: Vec<Position>,
    pub cycle_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decision_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

/// Display labels captured when a trader is registered.
#[derive(Debug, Clone)]
struct TraderLabels {
    model: String,
    exchange: String,
}

struct CompetitionCache {
    snapshot: CompetitionSnapshot,
    captured_at: Instant,
}

// =============================================================================
// Manager
// =============================================================================

/// Construction-time configuration for the manager and its traders.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub decision_log_dir: PathBuf,
    pub tripwire: TripwireConfig,
    pub competition_cache_ttl: Duration,
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            decision_log_dir: PathBuf::from(&settings.decision_log_dir),
            tripwire: TripwireConfig::from_settings(settings),
            competition_cache_ttl: Duration::from_secs(settings.competition_cache_ttl_secs),
        }
    }
}

pub struct TraderManager {
    signal: Arc<SignalSourceCache>,
    config: ManagerConfig,
    notifier: Option<Arc<Notifier>>,
    traders: RwLock<HashMap<String, Arc<AutoTrader>>>,
    labels: RwLock<HashMap<String, TraderLabels>>,
    competition: Mutex<Option<CompetitionCache>>,
}

impl TraderManager {
    pub fn new(signal: Arc<SignalSourceCache>, config: ManagerConfig) -> Self {
        Self {
            signal,
            config,
            notifier: None,
            traders: RwLock::new(HashMap::new()),
            labels: RwLock::new(HashMap::new()),
            competition: Mutex::new(None),
        }
    }

    /// Attach the shared notification fan-out; traders registered afterwards
    /// report their cycles through it.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Materialise every persisted trader for `user_id` whose AI-model and
    /// exchange configs are both enabled. Disabled or dangling references
    /// skip the trader with a warning.
    pub async fn load_user_traders(
        &self,
        store: &Arc<TraderStore>,
        user_id: &str,
    ) -> Result<usize> {
        let configs = store.list_traders_for_user(user_id).await?;
        let mut loaded = 0usize;

        for config in configs {
            if self.traders.read().contains_key(&config.id) {
                warn!(trader_id = %config.id, "trader already registered — skipping");
                continue;
            }

            let ai_cfg = match store.get_ai_model(&config.ai_model_id).await? {
                Some(cfg) if cfg.enabled => cfg,
                Some(_) => {
                    warn!(trader_id = %config.id, model_id = %config.ai_model_id, "AI model disabled — skipping trader");
                    continue;
                }
                None => {
                    warn!(trader_id = %config.id, model_id = %config.ai_model_id, "AI model missing — skipping trader");
                    continue;
                }
            };
            let ex_cfg = match store.get_exchange_config(&config.exchange_config_id).await? {
                Some(cfg) if cfg.enabled => cfg,
                Some(_) => {
                    warn!(trader_id = %config.id, exchange_id = %config.exchange_config_id, "exchange config disabled — skipping trader");
                    continue;
                }
                None => {
                    warn!(trader_id = %config.id, exchange_id = %config.exchange_config_id, "exchange config missing — skipping trader");
                    continue;
                }
            };

            match self.add_from_db(Some(store.clone()), config, &ai_cfg, &ex_cfg) {
                Ok(trader) => {
                    loaded += 1;
                    info!(trader_id = %trader.id(), user_id, "trader loaded");
                }
                Err(e) => {
                    warn!(user_id, error = %e, "failed to register trader");
                }
            }
        }

        Ok(loaded)
    }

    /// Load every user's traders.
    pub async fn load_all(&self, store: &Arc<TraderStore>) -> Result<usize> {
        let mut total = 0usize;
        for user_id in store.list_user_ids().await? {
            total += self.load_user_traders(store, &user_id).await?;
        }
        info!(count = total, "fleet loaded");
        Ok(total)
    }

    /// Start every registered trader whose persisted running flag is set.
    /// A single bad trader never prevents the fleet from coming up.
    pub async fn start_running(&self) {
        let traders = self.get_all();
        let mut started = 0usize;
        for trader in traders {
            if trader.config().is_running {
                trader.start().await;
                started += 1;
            }
        }
        info!(started, "running traders started");
    }

    /// Construct and register a trader from persisted records. Fails when
    /// the id is taken, a reference is disabled, or the config is invalid.
    pub fn add_from_db(
        &self,
        store: Option<Arc<TraderStore>>,
        config: TraderConfig,
        ai_cfg: &AiModelConfig,
        ex_cfg: &ExchangeConfig,
    ) -> Result<Arc<AutoTrader>> {
        if !ai_cfg.enabled {
            anyhow::bail!("AI model '{}' is disabled", ai_cfg.id);
        }
        if !ex_cfg.enabled {
            anyhow::bail!("exchange config '{}' is disabled", ex_cfg.id);
        }
        {
            let traders = self.traders.read();
            if traders.contains_key(&config.id) {
                anyhow::bail!("trader '{}' already exists", config.id);
            }
        }

        let ai = Arc::new(AiClient::new(build_provider(ai_cfg)));
        let exchange = build_exchange(ex_cfg, config.initial_balance)?;

        let labels = TraderLabels {
            model: ai_cfg
                .model_name
                .clone()
                .unwrap_or_else(|| ai_cfg.provider.clone()),
            exchange: ex_cfg.exchange.clone(),
        };

        let trader = AutoTrader::new(
            config,
            TraderDeps {
                signal: self.signal.clone(),
                ai,
                exchange,
                store,
                notifier: self.notifier.clone(),
                decision_log_dir: self.config.decision_log_dir.clone(),
                tripwire: self.config.tripwire.clone(),
            },
        )?;

        let id = trader.id().to_string();
        {
            // Re-check under the write lock: a concurrent add may have won.
            let mut traders = self.traders.write();
            if traders.contains_key(&id) {
                anyhow::bail!("trader '{id}' already exists");
            }
            traders.insert(id.clone(), trader.clone());
        }
        self.labels.write().insert(id, labels);
        self.invalidate_competition_cache();

        Ok(trader)
    }

    // -------------------------------------------------------------------------
    // Readers (snapshot copies)
    // -------------------------------------------------------------------------

    pub fn get(&self, trader_id: &str) -> Option<Arc<AutoTrader>> {
        self.traders.read().get(trader_id).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<AutoTrader>> {
        self.traders.read().values().cloned().collect()
    }

    pub fn get_ids(&self) -> Vec<String> {
        self.traders.read().keys().cloned().collect()
    }

    /// Traders owned by `user_id`. The persisted user_id is authoritative;
    /// the id heuristic covers legacy rows only.
    pub fn get_user_traders(&self, user_id: &str) -> Vec<Arc<AutoTrader>> {
        self.traders
            .read()
            .values()
            .filter(|t| {
                if !t.user_id().is_empty() {
                    t.user_id() == user_id
                } else {
                    is_user_trader(t.id(), user_id)
                }
            })
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.traders.read().len()
    }

    // -------------------------------------------------------------------------
    // Removal & shutdown
    // -------------------------------------------------------------------------

    /// Stop a trader, deregister it, and invalidate derived caches.
    pub async fn remove(&self, trader_id: &str) -> Result<()> {
        let trader = {
            let mut traders = self.traders.write();
            traders.remove(trader_id)
        };
        let Some(trader) = trader else {
            anyhow::bail!("trader '{trader_id}' not found");
        };

        trader.stop().await;
        self.labels.write().remove(trader_id);
        self.invalidate_competition_cache();
        info!(trader_id, "trader removed");
        Ok(())
    }

    /// Stop every trader in parallel, bounded by `deadline`. After the
    /// deadline, shutdown proceeds regardless.
    pub async fn shutdown(&self, deadline: Duration) {
        let traders = self.get_all();
        let count = traders.len();
        let stop_all = join_all(traders.iter().map(|t| t.stop()));

        match tokio::time::timeout(deadline, stop_all).await {
            Ok(_) => info!(count, "all traders stopped"),
            Err(_) => warn!(
                count,
                deadline_secs = deadline.as_secs(),
                "shutdown deadline exceeded — proceeding"
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Aggregate views
    // -------------------------------------------------------------------------

    /// Leaderboard over all traders, cached for the configured TTL and
    /// swapped atomically on refresh.
    pub fn get_competition_data(&self) -> CompetitionSnapshot {
        {
            let cache = self.competition.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.captured_at.elapsed() < self.config.competition_cache_ttl {
                    return cached.snapshot.clone();
                }
            }
        }

        let snapshot = self.build_competition_snapshot();
        *self.competition.lock() = Some(CompetitionCache {
            snapshot: snapshot.clone(),
            captured_at: Instant::now(),
        });
        snapshot
    }

    fn build_competition_snapshot(&self) -> CompetitionSnapshot {
        let labels = self.labels.read().clone();
        let mut entries: Vec<CompetitionEntry> = self
            .get_all()
            .iter()
            .map(|trader| {
                let label = labels.get(trader.id());
                let account = trader.account_state();
                CompetitionEntry {
                    trader_id: trader.id().to_string(),
                    display_name: trader.name().to_string(),
                    model: label.map(|l| l.model.clone()).unwrap_or_default(),
                    exchange: label.map(|l| l.exchange.clone()).unwrap_or_default(),
                    total_pnl_pct: trader.total_pnl_pct().unwrap_or(0.0),
                    total_equity: account.as_ref().map(|a| a.total_equity),
                    position_count: account.as_ref().map(|a| a.position_count),
                    cycle_count: trader.cycle_count(),
                    is_running: trader.is_running(),
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.total_pnl_pct
                .partial_cmp(&a.total_pnl_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        CompetitionSnapshot {
            entries,
            captured_at: Utc::now(),
        }
    }

    /// Best-effort per-trader summaries. Traders with no account snapshot
    /// yet are omitted rather than failing the whole view.
    pub fn get_comparison_data(&self) -> Vec<ComparisonEntry> {
        let labels = self.labels.read().clone();
        self.get_all()
            .iter()
            .filter_map(|trader| {
                let account = trader.account_state()?;
                let label = labels.get(trader.id());
                let last_decision_at =
                    trader.decisions(1).first().map(|record| record.timestamp);
                Some(ComparisonEntry {
                    trader_id: trader.id().to_string(),
                    display_name: trader.name().to_string(),
                    model: label.map(|l| l.model.clone()).unwrap_or_default(),
                    exchange: label.map(|l| l.exchange.clone()).unwrap_or_default(),
                    account_state: account,
                    positions: trader.positions(),
                    cycle_count: trader.cycle_count(),
                    last_decision_at,
                    is_running: trader.is_running(),
                })
            })
            .collect()
    }

    fn invalidate_competition_cache(&self) {
        *self.competition.lock() = None;
    }
}

impl std::fmt::Debug for TraderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderManager")
            .field("traders", &self.count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_source::SignalSourceConfig;
    use crate::types::{MarginMode, OrderStrategy};

    fn manager(dir: &std::path::Path, ttl: Duration) -> TraderManager {
        let mut signal_cfg = SignalSourceConfig::default();
        signal_cfg.cache_dir = dir.join("signal").to_string_lossy().into_owned();
        TraderManager::new(
            Arc::new(SignalSourceCache::new(signal_cfg)),
            ManagerConfig {
                decision_log_dir: dir.join("decisions"),
                tripwire: TripwireConfig {
                    max_daily_loss_pct: 10.0,
                    max_drawdown_pct: 20.0,
                    halt_duration: Duration::from_secs(60),
                },
                competition_cache_ttl: ttl,
            },
        )
    }

    fn trader_config(id: &str, user_id: &str) -> TraderConfig {
        TraderConfig {
            id: id.to_string(),
            name: format!("trader {id}"),
            user_id: user_id.to_string(),
            ai_model_id: "m1".into(),
            exchange_config_id: "e1".into(),
            initial_balance: 1000.0,
            scan_interval: Duration::from_secs(3600),
            btc_eth_leverage: 5,
            altcoin_leverage: 10,
            margin_mode: MarginMode::Cross,
            custom_symbols: vec!["BTCUSDT".into()],
            ai500_limit: 10,
            custom_prompt: String::new(),
            override_base_prompt: false,
            order_strategy: OrderStrategy::Market,
            order_size_pct: 10.0,
            is_running: false,
        }
    }

    fn ai_cfg(enabled: bool) -> AiModelConfig {
        AiModelConfig {
            id: "m1".into(),
            user_id: "u1".into(),
            provider: "openai".into(),
            api_key: "sk-test".into(),
            // Nothing listens here; registry tests never run a cycle far.
            base_url: Some("http://127.0.0.1:1".into()),
            model_name: Some("test-model".into()),
            enabled,
        }
    }

    fn ex_cfg(enabled: bool) -> ExchangeConfig {
        ExchangeConfig {
            id: "e1".into(),
            user_id: "u1".into(),
            exchange: "paper".into(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            enabled,
        }
    }

    #[test]
    fn ownership_heuristic_for_legacy_ids() {
        assert!(is_user_trader("u1_alpha", "u1"));
        assert!(!is_user_trader("u2_alpha", "u1"));
        // UUID-style legacy ids belong to the default user.
        assert!(is_user_trader("9d2f6c1e-uuid", DEFAULT_USER));
        // Email-scoped ids do not.
        assert!(!is_user_trader("bob@example.com_t1", DEFAULT_USER));
        // But the default user's own prefixed traders match.
        assert!(is_user_trader("default_t1", DEFAULT_USER));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));

        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();
        let err = mgr
            .add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(mgr.count(), 1);
    }

    #[tokio::test]
    async fn disabled_references_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));

        assert!(mgr
            .add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(false), &ex_cfg(true))
            .is_err());
        assert!(mgr
            .add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(false))
            .is_err());
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn readers_return_defensive_copies() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        let mut all = mgr.get_all();
        all.clear();
        assert_eq!(mgr.count(), 1);

        let mut ids = mgr.get_ids();
        ids.push("phantom".into());
        assert_eq!(mgr.get_ids().len(), 1);
    }

    #[tokio::test]
    async fn user_scoping_uses_persisted_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();
        mgr.add_from_db(None, trader_config("u2_b", "u2"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        let u1 = mgr.get_user_traders("u1");
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].id(), "u1_a");
        assert!(mgr.get_user_traders("u3").is_empty());
    }

    #[tokio::test]
    async fn remove_stops_deregisters_and_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(300));
        let trader = mgr
            .add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();
        trader.start().await;

        // Warm the cache with the trader present.
        let before = mgr.get_competition_data();
        assert_eq!(before.entries.len(), 1);

        mgr.remove("u1_a").await.unwrap();
        assert!(!trader.is_running());
        assert!(mgr.get("u1_a").is_none());

        // Cache was invalidated: the next read recomputes without the trader.
        let after = mgr.get_competition_data();
        assert!(after.entries.is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_trader_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        assert!(mgr.remove("ghost").await.is_err());
    }

    #[tokio::test]
    async fn competition_cache_respects_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_millis(50));
        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        let first = mgr.get_competition_data();
        let second = mgr.get_competition_data();
        assert_eq!(first.captured_at, second.captured_at);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let third = mgr.get_competition_data();
        assert!(third.captured_at > first.captured_at);
    }

    #[tokio::test]
    async fn competition_entries_sorted_by_pnl_desc() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();
        mgr.add_from_db(None, trader_config("u1_b", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        let snapshot = mgr.get_competition_data();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.entries[0].total_pnl_pct >= snapshot.entries[1].total_pnl_pct);
        assert_eq!(snapshot.entries[0].model, "test-model");
        assert_eq!(snapshot.entries[0].exchange, "paper");
    }

    #[tokio::test]
    async fn comparison_omits_traders_without_account_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        mgr.add_from_db(None, trader_config("u1_a", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        // Never started: no cycle ran, so no account snapshot exists.
        assert!(mgr.get_comparison_data().is_empty());
    }

    #[tokio::test]
    async fn start_running_honours_persisted_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Duration::from_secs(30));
        let mut flagged = trader_config("u1_a", "u1");
        flagged.is_running = true;
        mgr.add_from_db(None, flagged, &ai_cfg(true), &ex_cfg(true)).unwrap();
        mgr.add_from_db(None, trader_config("u1_b", "u1"), &ai_cfg(true), &ex_cfg(true))
            .unwrap();

        mgr.start_running().await;
        assert!(mgr.get("u1_a").unwrap().is_running());
        assert!(!mgr.get("u1_b").unwrap().is_running());

        mgr.shutdown(Duration::from_secs(5)).await;
        assert!(!mgr.get("u1_a").unwrap().is_running());
    }
}
