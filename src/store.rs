// =============================================================================
// Trader Store — SQLite persistence for traders and their config references
// =============================================================================
//
// Three tables: traders, ai_models, exchange_configs. Rows deserialize into
// plain Row structs and convert into the runtime types; credentials are
// treated as opaque strings. Schema bootstrap is idempotent.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::ai::AiModelConfig;
use crate::exchange::ExchangeConfig;
use crate::manager::is_user_trader;
use crate::trader::TraderConfig;
use crate::types::{MarginMode, OrderStrategy};

/// Owner assigned to legacy rows that predate the user_id column.
pub const DEFAULT_USER: &str = "default";

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct TraderRow {
    id: String,
    user_id: String,
    name: String,
    ai_model_id: String,
    exchange_config_id: String,
    initial_balance: f64,
    scan_interval_minutes: i64,
    btc_eth_leverage: i64,
    altcoin_leverage: i64,
    margin_mode: String,
    custom_symbols: String,
    custom_prompt: String,
    override_base_prompt: i64,
    order_strategy: String,
    order_size_pct: f64,
    is_running: i64,
}

impl TraderRow {
    fn into_config(self) -> TraderConfig {
        let custom_symbols: Vec<String> =
            serde_json::from_str(&self.custom_symbols).unwrap_or_default();
        let margin_mode = match self.margin_mode.as_str() {
            "isolated" => MarginMode::Isolated,
            _ => MarginMode::Cross,
        };
        let order_strategy = match self.order_strategy.as_str() {
            "limit" => OrderStrategy::Limit,
            _ => OrderStrategy::Market,
        };
        let user_id = if self.user_id.is_empty() {
            // Legacy row: the id prefix heuristic decides ownership.
            DEFAULT_USER.to_string()
        } else {
            self.user_id
        };

        TraderConfig {
            id: self.id,
            name: self.name,
            user_id,
            ai_model_id: self.ai_model_id,
            exchange_config_id: self.exchange_config_id,
            initial_balance: self.initial_balance,
            scan_interval: Duration::from_secs(self.scan_interval_minutes.max(0) as u64 * 60),
            btc_eth_leverage: self.btc_eth_leverage.max(1) as u32,
            altcoin_leverage: self.altcoin_leverage.max(1) as u32,
            margin_mode,
            custom_symbols,
            ai500_limit: 10,
            custom_prompt: self.custom_prompt,
            override_base_prompt: self.override_base_prompt != 0,
            order_strategy,
            order_size_pct: self.order_size_pct,
            is_running: self.is_running != 0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AiModelRow {
    id: String,
    user_id: String,
    provider: String,
    api_key: String,
    base_url: Option<String>,
    model_name: Option<String>,
    enabled: i64,
}

impl From<AiModelRow> for AiModelConfig {
    fn from(row: AiModelRow) -> Self {
        AiModelConfig {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider,
            api_key: row.api_key,
            base_url: row.base_url,
            model_name: row.model_name,
            enabled: row.enabled != 0,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExchangeRow {
    id: String,
    user_id: String,
    exchange: String,
    api_key: String,
    api_secret: String,
    testnet: i64,
    enabled: i64,
}

impl From<ExchangeRow> for ExchangeConfig {
    fn from(row: ExchangeRow) -> Self {
        ExchangeConfig {
            id: row.id,
            user_id: row.user_id,
            exchange: row.exchange,
            api_key: row.api_key,
            api_secret: row.api_secret,
            testnet: row.testnet != 0,
            enabled: row.enabled != 0,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

pub struct TraderStore {
    pool: SqlitePool,
}

impl TraderStore {
    /// Open (creating if missing) the SQLite database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = url
            .parse::<SqliteConnectOptions>()
            .with_context(|| format!("invalid database url {url}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {url}"))?;

        info!(url, "trader store opened");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent schema bootstrap.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_models (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL,
                api_key TEXT NOT NULL,
                base_url TEXT,
                model_name TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create ai_models table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_configs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                exchange TEXT NOT NULL,
                api_key TEXT NOT NULL DEFAULT '',
                api_secret TEXT NOT NULL DEFAULT '',
                testnet INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create exchange_configs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                ai_model_id TEXT NOT NULL,
                exchange_config_id TEXT NOT NULL,
                initial_balance REAL NOT NULL,
                scan_interval_minutes INTEGER NOT NULL DEFAULT 60,
                btc_eth_leverage INTEGER NOT NULL DEFAULT 5,
                altcoin_leverage INTEGER NOT NULL DEFAULT 5,
                margin_mode TEXT NOT NULL DEFAULT 'cross',
                custom_symbols TEXT NOT NULL DEFAULT '[]',
                custom_prompt TEXT NOT NULL DEFAULT '',
                override_base_prompt INTEGER NOT NULL DEFAULT 0,
                order_strategy TEXT NOT NULL DEFAULT 'market',
                order_size_pct REAL NOT NULL DEFAULT 10.0,
                is_running INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create traders table")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users & traders
    // -------------------------------------------------------------------------

    /// Every distinct owner, with legacy (empty-user) rows surfaced under the
    /// default user.
    pub async fn list_user_ids(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT user_id FROM traders ORDER BY user_id")
                .fetch_all(&self.pool)
                .await
                .context("failed to list user ids")?;

        let mut users: Vec<String> = Vec::new();
        for (user,) in rows {
            if user.is_empty() {
                if !users.iter().any(|u| u == DEFAULT_USER) {
                    users.push(DEFAULT_USER.to_string());
                }
            } else if !users.iter().any(|u| u == &user) {
                users.push(user);
            }
        }
        Ok(users)
    }

    /// Persisted traders owned by `user_id`. The user_id column is
    /// authoritative; legacy rows with an empty column fall back to the id
    /// prefix heuristic.
    pub async fn list_traders_for_user(&self, user_id: &str) -> Result<Vec<TraderConfig>> {
        let rows: Vec<TraderRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, ai_model_id, exchange_config_id,
                   initial_balance, scan_interval_minutes, btc_eth_leverage,
                   altcoin_leverage, margin_mode, custom_symbols, custom_prompt,
                   override_base_prompt, order_strategy, order_size_pct, is_running
            FROM traders
            WHERE user_id = ?1 OR user_id = ''
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list traders")?;

        Ok(rows
            .into_iter()
            .filter(|row| !row.user_id.is_empty() || is_user_trader(&row.id, user_id))
            .map(TraderRow::into_config)
            .collect())
    }

    pub async fn set_running(&self, trader_id: &str, running: bool) -> Result<()> {
        let result = sqlx::query("UPDATE traders SET is_running = ?1 WHERE id = ?2")
            .bind(running as i64)
            .bind(trader_id)
            .execute(&self.pool)
            .await
            .context("failed to update running flag")?;

        if result.rows_affected() == 0 {
            warn!(trader_id, "running flag update matched no row");
        }
        Ok(())
    }

    pub async fn insert_trader(&self, config: &TraderConfig) -> Result<()> {
        let custom_symbols = serde_json::to_string(&config.custom_symbols)
            .context("failed to serialise custom symbols")?;
        sqlx::query(
            r#"
            INSERT INTO traders (
                id, user_id, name, ai_model_id, exchange_config_id,
                initial_balance, scan_interval_minutes, btc_eth_leverage,
                altcoin_leverage, margin_mode, custom_symbols, custom_prompt,
                override_base_prompt, order_strategy, order_size_pct, is_running
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.id)
        .bind(&config.user_id)
        .bind(&config.name)
        .bind(&config.ai_model_id)
        .bind(&config.exchange_config_id)
        .bind(config.initial_balance)
        .bind((config.scan_interval.as_secs() / 60) as i64)
        .bind(config.btc_eth_leverage as i64)
        .bind(config.altcoin_leverage as i64)
        .bind(config.margin_mode.to_string())
        .bind(custom_symbols)
        .bind(&config.custom_prompt)
        .bind(config.override_base_prompt as i64)
        .bind(config.order_strategy.to_string())
        .bind(config.order_size_pct)
        .bind(config.is_running as i64)
        .execute(&self.pool)
        .await
        .context("failed to insert trader")?;
        Ok(())
    }

    pub async fn remove_trader(&self, trader_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM traders WHERE id = ?1")
            .bind(trader_id)
            .execute(&self.pool)
            .await
            .context("failed to delete trader")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Config references
    // -------------------------------------------------------------------------

    pub async fn get_ai_model(&self, id: &str) -> Result<Option<AiModelConfig>> {
        let row: Option<AiModelRow> = sqlx::query_as(
            "SELECT id, user_id, provider, api_key, base_url, model_name, enabled \
             FROM ai_models WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch ai model")?;
        Ok(row.map(AiModelConfig::from))
    }

    pub async fn get_exchange_config(&self, id: &str) -> Result<Option<ExchangeConfig>> {
        let row: Option<ExchangeRow> = sqlx::query_as(
            "SELECT id, user_id, exchange, api_key, api_secret, testnet, enabled \
             FROM exchange_configs WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch exchange config")?;
        Ok(row.map(ExchangeConfig::from))
    }

    pub async fn insert_ai_model(&self, cfg: &AiModelConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO ai_models (id, user_id, provider, api_key, base_url, model_name, enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cfg.id)
        .bind(&cfg.user_id)
        .bind(&cfg.provider)
        .bind(&cfg.api_key)
        .bind(&cfg.base_url)
        .bind(&cfg.model_name)
        .bind(cfg.enabled as i64)
        .execute(&self.pool)
        .await
        .context("failed to insert ai model")?;
        Ok(())
    }

    pub async fn insert_exchange_config(&self, cfg: &ExchangeConfig) -> Result<()> {
        sqlx::query(
            "INSERT INTO exchange_configs (id, user_id, exchange, api_key, api_secret, testnet, enabled) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cfg.id)
        .bind(&cfg.user_id)
        .bind(&cfg.exchange)
        .bind(&cfg.api_key)
        .bind(&cfg.api_secret)
        .bind(cfg.testnet as i64)
        .bind(cfg.enabled as i64)
        .execute(&self.pool)
        .await
        .context("failed to insert exchange config")?;
        Ok(())
    }
}

impl std::fmt::Debug for TraderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderStore").finish_non_exhaustive()
    }
}
