// =============================================================================
// Paper Exchange — local fill simulation for demo mode and tests
// =============================================================================
//
// No request leaves the process: orders are filled synthetically at the last
// known mark price, margin accounting mirrors a cross-margin futures venue,
// and closing a position realizes PnL into the wallet balance.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    AccountState, Exchange, ExchangeError, OrderRequest, OrderResult, Position, PositionSide,
    INSUFFICIENT_MARGIN_CODE,
};
use crate::types::{MarginMode, OrderSide};

struct PaperPosition {
    side: PositionSide,
    quantity: f64,
    entry_price: f64,
    leverage: u32,
}

struct Inner {
    balance: f64,
    realized_pnl: f64,
    positions: HashMap<String, PaperPosition>,
    marks: HashMap<String, f64>,
    leverage: HashMap<String, u32>,
    margin_modes: HashMap<String, MarginMode>,
}

/// Simulated venue seeded with an initial balance.
pub struct PaperExchange {
    inner: RwLock<Inner>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                balance: initial_balance,
                realized_pnl: 0.0,
                positions: HashMap::new(),
                marks: HashMap::new(),
                leverage: HashMap::new(),
                margin_modes: HashMap::new(),
            }),
        }
    }

    /// Feed the simulation a mark price. Orders without an explicit price
    /// fill at the last mark.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.inner.write().marks.insert(symbol.to_string(), price);
    }

    fn direction(side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    fn unrealized(pos: &PaperPosition, mark: f64) -> f64 {
        (mark - pos.entry_price) * pos.quantity * Self::direction(pos.side)
    }

    fn used_margin(inner: &Inner) -> f64 {
        inner
            .positions
            .values()
            .map(|p| p.entry_price * p.quantity / p.leverage.max(1) as f64)
            .sum()
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_account(&self) -> Result<AccountState, ExchangeError> {
        let inner = self.inner.read();

        let unrealized: f64 = inner
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let mark = inner.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                Self::unrealized(pos, mark)
            })
            .sum();

        let used = Self::used_margin(&inner);
        let total_equity = inner.balance + unrealized;
        let margin_used_pct = if total_equity > 0.0 {
            (used / total_equity) * 100.0
        } else {
            0.0
        };

        Ok(AccountState {
            total_equity,
            available_balance: inner.balance - used,
            margin_used_pct,
            position_count: inner.positions.len(),
            realized_pnl: inner.realized_pnl,
            unrealized_pnl: unrealized,
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.inner
            .read()
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Permanent(format!("no mark price for {symbol}")))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let inner = self.inner.read();
        Ok(inner
            .positions
            .iter()
            .map(|(symbol, pos)| {
                let mark = inner.marks.get(symbol).copied().unwrap_or(pos.entry_price);
                Position {
                    symbol: symbol.clone(),
                    side: pos.side,
                    quantity: pos.quantity,
                    entry_price: pos.entry_price,
                    mark_price: mark,
                    unrealized_pnl: Self::unrealized(pos, mark),
                    leverage: pos.leverage,
                }
            })
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut inner = self.inner.write();

        let fill_price = match req.price {
            Some(p) => p,
            None => inner
                .marks
                .get(&req.symbol)
                .copied()
                .ok_or_else(|| {
                    ExchangeError::Permanent(format!("no mark price for {}", req.symbol))
                })?,
        };

        let side = match req.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        if req.reduce_only {
            // Reduce the opposite-direction exposure of this order.
            let target = match req.side {
                OrderSide::Sell => PositionSide::Long,
                OrderSide::Buy => PositionSide::Short,
            };
            let (pos_side, pos_quantity, pos_entry) = match inner.positions.get(&req.symbol) {
                Some(pos) if pos.side == target => (pos.side, pos.quantity, pos.entry_price),
                Some(_) => {
                    return Err(ExchangeError::Permanent(format!(
                        "reduce-only side mismatch on {}",
                        req.symbol
                    )));
                }
                None => {
                    return Err(ExchangeError::Permanent(format!(
                        "no position to reduce on {}",
                        req.symbol
                    )));
                }
            };

            let qty = req.quantity.min(pos_quantity);
            let pnl = (fill_price - pos_entry) * qty * Self::direction(pos_side);
            inner.balance += pnl;
            inner.realized_pnl += pnl;

            let remaining = pos_quantity - qty;
            if remaining > 0.0 {
                if let Some(pos) = inner.positions.get_mut(&req.symbol) {
                    pos.quantity = remaining;
                }
            } else {
                inner.positions.remove(&req.symbol);
            }

            info!(symbol = %req.symbol, qty, pnl, "paper reduce fill");
            return Ok(OrderResult {
                order_id: Uuid::new_v4().to_string(),
                symbol: req.symbol.clone(),
                side: req.side,
                quantity: qty,
                price: fill_price,
                status: "FILLED".to_string(),
            });
        }

        let leverage = req.leverage.max(1);
        let margin_needed = fill_price * req.quantity / leverage as f64;
        let available = inner.balance - Self::used_margin(&inner);
        if margin_needed > available {
            return Err(ExchangeError::MarketRule {
                code: INSUFFICIENT_MARGIN_CODE,
                message: "Margin is insufficient".to_string(),
            });
        }

        inner.margin_modes.insert(req.symbol.clone(), req.margin_mode);
        inner.leverage.insert(req.symbol.clone(), leverage);
        // A limit fill establishes a mark for symbols never fed a price.
        inner.marks.entry(req.symbol.clone()).or_insert(fill_price);

        let entry = inner.positions.entry(req.symbol.clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let pos = occupied.get_mut();
                if pos.side != side {
                    return Err(ExchangeError::Permanent(format!(
                        "opposing position already open on {}",
                        req.symbol
                    )));
                }
                // Weighted-average entry on additions.
                let total_qty = pos.quantity + req.quantity;
                pos.entry_price =
                    (pos.entry_price * pos.quantity + fill_price * req.quantity) / total_qty;
                pos.quantity = total_qty;
                pos.leverage = leverage;
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(PaperPosition {
                    side,
                    quantity: req.quantity,
                    entry_price: fill_price,
                    leverage,
                });
            }
        }

        info!(
            symbol = %req.symbol,
            side = %req.side,
            quantity = req.quantity,
            price = fill_price,
            "paper fill"
        );

        Ok(OrderResult {
            order_id: Uuid::new_v4().to_string(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            price: fill_price,
            status: "FILLED".to_string(),
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Option<f64>,
    ) -> Result<OrderResult, ExchangeError> {
        let (close_side, qty) = {
            let inner = self.inner.read();
            let pos = inner
                .positions
                .get(symbol)
                .filter(|p| p.side == side)
                .ok_or_else(|| {
                    ExchangeError::Permanent(format!("no open {side} position on {symbol}"))
                })?;
            let close_side = match side {
                PositionSide::Long => OrderSide::Sell,
                PositionSide::Short => OrderSide::Buy,
            };
            (close_side, quantity.unwrap_or(pos.quantity))
        };

        self.place_order(&OrderRequest {
            symbol: symbol.to_string(),
            side: close_side,
            quantity: qty,
            leverage: 1,
            margin_mode: MarginMode::Cross,
            reduce_only: true,
            price: None,
        })
        .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.inner
            .write()
            .leverage
            .insert(symbol.to_string(), leverage.max(1));
        debug!(symbol, leverage, "paper leverage set");
        Ok(())
    }

    async fn set_margin_mode(
        &self,
        symbol: &str,
        mode: MarginMode,
    ) -> Result<(), ExchangeError> {
        self.inner
            .write()
            .margin_modes
            .insert(symbol.to_string(), mode);
        debug!(symbol, %mode, "paper margin mode set");
        Ok(())
    }
}

impl std::fmt::Debug for PaperExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PaperExchange")
            .field("balance", &inner.balance)
            .field("positions", &inner.positions.len())
            .finish()
    }
}
