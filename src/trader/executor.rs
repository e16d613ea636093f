// =============================================================================
// Action Executor — routes one planned action through the exchange adapter
// =============================================================================
//
// Actions are executed in plan order and isolated per symbol: a failed
// action is recorded with its error and the remaining actions still run.
// Leverage and margin mode are set before entry orders (both idempotent at
// the venue), entry size is a fixed fraction of available balance at the
// reference price.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::decision::{DecisionAction, PlannedAction};
use crate::exchange::{Exchange, ExchangeError, OrderRequest};
use crate::types::{ActionKind, MarginMode, OrderSide, OrderStrategy};

/// Operator hint appended to the execution log on a position-side mismatch.
const POSITION_SIDE_HINT: &str =
    "hint: order position side does not match the account's position mode — check hedge/one-way mode on the exchange";

/// Leverage caps: majors (BTC/ETH) vs everything else.
#[derive(Debug, Clone, Copy)]
pub struct LeveragePolicy {
    pub btc_eth: u32,
    pub altcoin: u32,
}

impl LeveragePolicy {
    fn cap_for(&self, symbol: &str) -> u32 {
        if symbol.starts_with("BTC") || symbol.starts_with("ETH") {
            self.btc_eth
        } else {
            self.altcoin
        }
    }

    /// Requested leverage clamped to the policy; 0 means "use the cap".
    pub fn effective(&self, symbol: &str, requested: u32) -> u32 {
        let cap = self.cap_for(symbol).max(1);
        if requested == 0 {
            cap
        } else {
            requested.min(cap)
        }
    }
}

/// Executes planned actions for one trader.
pub struct ActionExecutor {
    exchange: Arc<dyn Exchange>,
    leverage: LeveragePolicy,
    margin_mode: MarginMode,
    order_strategy: OrderStrategy,
    /// Entry notional as a percentage of available balance (pre-leverage).
    order_size_pct: f64,
}

impl ActionExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        leverage: LeveragePolicy,
        margin_mode: MarginMode,
        order_strategy: OrderStrategy,
        order_size_pct: f64,
    ) -> Self {
        Self {
            exchange,
            leverage,
            margin_mode,
            order_strategy,
            order_size_pct,
        }
    }

    /// Execute one action. Returns the completed record entry plus the
    /// execution-log lines it produced.
    pub async fn execute(&self, planned: &PlannedAction) -> (DecisionAction, Vec<String>) {
        match planned.action {
            ActionKind::Hold | ActionKind::Wait => {
                let line = format!("{} {} — no action", planned.symbol, planned.action);
                (Self::succeeded(planned, 0), vec![line])
            }
            ActionKind::OpenLong | ActionKind::OpenShort => self.execute_open(planned).await,
            ActionKind::Close => self.execute_close(planned).await,
        }
    }

    // -------------------------------------------------------------------------
    // Entries
    // -------------------------------------------------------------------------

    async fn execute_open(&self, planned: &PlannedAction) -> (DecisionAction, Vec<String>) {
        let mut log = Vec::new();
        let symbol = planned.symbol.as_str();
        let leverage = self.leverage.effective(symbol, planned.leverage);
        let side = match planned.action {
            ActionKind::OpenShort => OrderSide::Sell,
            _ => OrderSide::Buy,
        };

        // Both setters are idempotent at the venue; a failure here is logged
        // but the order itself decides the action's fate.
        if let Err(e) = self.exchange.set_leverage(symbol, leverage).await {
            warn!(symbol, leverage, error = %e, "failed to set leverage");
            log.push(format!("{symbol} set_leverage {leverage}x failed: {e}"));
        } else {
            log.push(format!("{symbol} leverage set to {leverage}x"));
        }
        if let Err(e) = self.exchange.set_margin_mode(symbol, self.margin_mode).await {
            warn!(symbol, mode = %self.margin_mode, error = %e, "failed to set margin mode");
            log.push(format!("{symbol} set_margin_mode {} failed: {e}", self.margin_mode));
        }

        let account = match self.exchange.get_account().await {
            Ok(a) => a,
            Err(e) => {
                log.push(format!("{symbol} account fetch failed: {e}"));
                return (Self::failed(planned, leverage, e.to_string()), log);
            }
        };

        let reference_price = if planned.price > 0.0 {
            planned.price
        } else {
            match self.exchange.get_mark_price(symbol).await {
                Ok(p) => p,
                Err(e) => {
                    log.push(format!("{symbol} mark price unavailable: {e}"));
                    return (Self::failed(planned, leverage, e.to_string()), log);
                }
            }
        };

        let quantity = self.size_entry(account.available_balance, leverage, reference_price);
        if quantity <= 0.0 {
            log.push(format!(
                "{symbol} entry skipped: available balance {:.2} too small",
                account.available_balance
            ));
            return (
                Self::failed(planned, leverage, "insufficient_margin".to_string()),
                log,
            );
        }

        let price = match self.order_strategy {
            OrderStrategy::Limit if planned.price > 0.0 => Some(planned.price),
            _ => None,
        };

        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            margin_mode: self.margin_mode,
            reduce_only: false,
            price,
        };

        match self.exchange.place_order(&request).await {
            Ok(result) => {
                info!(
                    symbol,
                    action = %planned.action,
                    quantity,
                    leverage,
                    order_id = %result.order_id,
                    "entry order placed"
                );
                log.push(format!(
                    "{symbol} {} qty={quantity} lev={leverage}x @{} => {} (order {})",
                    planned.action,
                    price.map_or("market".to_string(), |p| p.to_string()),
                    result.status,
                    result.order_id,
                ));
                (Self::succeeded(planned, leverage), log)
            }
            Err(e) => {
                let error = Self::map_order_error(&e);
                if e.is_position_side_mismatch() {
                    log.push(POSITION_SIDE_HINT.to_string());
                }
                warn!(symbol, action = %planned.action, error = %e, "entry order rejected");
                log.push(format!("{symbol} {} failed: {e}", planned.action));
                (Self::failed(planned, leverage, error), log)
            }
        }
    }

    /// Quantity = (available × size% × leverage) / price, floored to 4 dp.
    fn size_entry(&self, available: f64, leverage: u32, price: f64) -> f64 {
        if available <= 0.0 || price <= 0.0 {
            return 0.0;
        }
        let notional = available * (self.order_size_pct / 100.0) * leverage as f64;
        ((notional / price) * 1e4).floor() / 1e4
    }

    // -------------------------------------------------------------------------
    // Exits
    // -------------------------------------------------------------------------

    async fn execute_close(&self, planned: &PlannedAction) -> (DecisionAction, Vec<String>) {
        let mut log = Vec::new();
        let symbol = planned.symbol.as_str();

        let positions = match self.exchange.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                log.push(format!("{symbol} position fetch failed: {e}"));
                return (Self::failed(planned, 0, e.to_string()), log);
            }
        };

        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            // Nothing to close — the action degrades to a successful hold.
            log.push(format!("{symbol} close requested but no open position — treated as hold"));
            let mut action = Self::succeeded(planned, 0);
            action.action = ActionKind::Hold;
            return (action, log);
        };

        match self
            .exchange
            .close_position(symbol, position.side, None)
            .await
        {
            Ok(result) => {
                info!(
                    symbol,
                    side = %position.side,
                    quantity = result.quantity,
                    "position closed"
                );
                log.push(format!(
                    "{symbol} closed {} qty={} => {} (order {})",
                    position.side, result.quantity, result.status, result.order_id,
                ));
                (Self::succeeded(planned, 0), log)
            }
            Err(e) => {
                let error = Self::map_order_error(&e);
                if e.is_position_side_mismatch() {
                    log.push(POSITION_SIDE_HINT.to_string());
                }
                warn!(symbol, error = %e, "close order rejected");
                log.push(format!("{symbol} close failed: {e}"));
                (Self::failed(planned, 0, error), log)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn map_order_error(e: &ExchangeError) -> String {
        if e.is_insufficient_margin() {
            "insufficient_margin".to_string()
        } else if e.is_position_side_mismatch() {
            "position_side_mismatch".to_string()
        } else {
            e.to_string()
        }
    }

    fn succeeded(planned: &PlannedAction, leverage: u32) -> DecisionAction {
        DecisionAction {
            symbol: planned.symbol.clone(),
            action: planned.action,
            leverage,
            price: planned.price,
            success: true,
            error: String::new(),
        }
    }

    fn failed(planned: &PlannedAction, leverage: u32, error: String) -> DecisionAction {
        debug_assert!(!error.is_empty());
        DecisionAction {
            symbol: planned.symbol.clone(),
            action: planned.action,
            leverage,
            price: planned.price,
            success: false,
            error,
        }
    }
}
