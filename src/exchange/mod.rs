// =============================================================================
// Exchange Boundary — normalized account/position/order operations
// =============================================================================
//
// Traders speak to every venue through the [`Exchange`] trait; adapters
// normalize venue-specific wire formats into the types here and classify
// failures into [`ExchangeError`] so the executor can react uniformly.
// =============================================================================

mod binance;
mod paper;

pub use binance::BinanceFutures;
pub use paper::PaperExchange;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{MarginMode, OrderSide};

/// Binance error code for a position-side mismatch on order placement.
pub const POSITION_SIDE_MISMATCH_CODE: i64 = -4061;
/// Binance error code for insufficient margin.
pub const INSUFFICIENT_MARGIN_CODE: i64 = -2019;

// =============================================================================
// Error taxonomy
// =============================================================================

/// Classified exchange failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    /// Worth retrying on a later cycle: timeouts, 5xx, connection resets.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Will not succeed on retry: malformed request, unknown symbol.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The venue rejected the order for a market rule, with its own code.
    #[error("market rule violation (code {code}): {message}")]
    MarketRule { code: i64, message: String },
}

impl ExchangeError {
    pub fn is_position_side_mismatch(&self) -> bool {
        matches!(self, Self::MarketRule { code, .. } if *code == POSITION_SIDE_MISMATCH_CODE)
    }

    pub fn is_insufficient_margin(&self) -> bool {
        matches!(self, Self::MarketRule { code, .. } if *code == INSUFFICIENT_MARGIN_CODE)
    }
}

// =============================================================================
// Normalized types
// =============================================================================

/// Account snapshot taken before each decision cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Which side of the book a position sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// One open position, venue-normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// Everything the adapter needs to submit one order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub reduce_only: bool,
    /// None means a market order.
    pub price: Option<f64>,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// Fill or submission price; 0 when the venue did not report one.
    pub price: f64,
    pub status: String,
}

// =============================================================================
// The adapter trait
// =============================================================================

/// Normalized capability set every venue adapter exposes.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_account(&self) -> Result<AccountState, ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Current mark price, used to size market orders.
    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    /// Close a position with a reduce-only order. `quantity=None` closes the
    /// whole position.
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<f64>,
    ) -> Result<OrderResult, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode)
        -> Result<(), ExchangeError>;
}

// =============================================================================
// Persisted configuration + factory
// =============================================================================

/// Persisted exchange configuration referenced by a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub id: String,
    pub user_id: String,
    /// Venue identifier, e.g. "binance", "paper".
    pub exchange: String,
    /// Opaque credentials; never logged in full.
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    pub enabled: bool,
}

/// Build the adapter for a persisted exchange configuration.
///
/// `initial_balance` seeds the paper venue; real venues ignore it.
pub fn build_exchange(
    cfg: &ExchangeConfig,
    initial_balance: f64,
) -> anyhow::Result<Arc<dyn Exchange>> {
    match cfg.exchange.to_ascii_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceFutures::new(
            cfg.api_key.clone(),
            cfg.api_secret.clone(),
            cfg.testnet,
        ))),
        "paper" => Ok(Arc::new(PaperExchange::new(initial_balance))),
        other => anyhow::bail!("unsupported exchange '{other}'"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_side_mismatch_is_detected_by_code() {
        let err = ExchangeError::MarketRule {
            code: POSITION_SIDE_MISMATCH_CODE,
            message: "Order's position side does not match user's setting".into(),
        };
        assert!(err.is_position_side_mismatch());
        assert!(!err.is_insufficient_margin());

        let other = ExchangeError::MarketRule {
            code: -1111,
            message: "precision".into(),
        };
        assert!(!other.is_position_side_mismatch());
    }

    #[test]
    fn insufficient_margin_is_detected_by_code() {
        let err = ExchangeError::MarketRule {
            code: INSUFFICIENT_MARGIN_CODE,
            message: "Margin is insufficient".into(),
        };
        assert!(err.is_insufficient_margin());
    }

    #[test]
    fn factory_rejects_unknown_venue() {
        let cfg = ExchangeConfig {
            id: "e1".into(),
            user_id: "u1".into(),
            exchange: "nyse".into(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            enabled: true,
        };
        assert!(build_exchange(&cfg, 1000.0).is_err());
    }

    #[test]
    fn factory_builds_paper_venue() {
        let cfg = ExchangeConfig {
            id: "e1".into(),
            user_id: "u1".into(),
            exchange: "paper".into(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            enabled: true,
        };
        assert!(build_exchange(&cfg, 1000.0).is_ok());
    }
}
