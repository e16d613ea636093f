// =============================================================================
// Prompt Builder — serialises cycle context into the model conversation
// =============================================================================

use std::fmt::Write as _;

use crate::exchange::{AccountState, Position};
use crate::signal_source::MergedCoinPool;

/// Base instructions shared by every trader. A trader's custom prompt either
/// replaces this entirely or is appended after it.
pub const BASE_SYSTEM_PROMPT: &str = "\
You are an autonomous futures trading agent. Each cycle you receive the \
account state, the open positions, and a list of candidate symbols. Decide \
what to do for the symbols you care about and answer with a JSON array of \
actions, nothing else after it.

Each action is an object:
  {\"symbol\": \"BTCUSDT\", \"action\": \"open_long|open_short|close|hold|wait\", \
\"leverage\": <integer, omit or 0 when not applicable>, \
\"price\": <limit price, omit or 0 for market>}

You may write your reasoning as plain text before the JSON array. Only the \
array is executed.";

/// The symbols a trader considers this cycle: either its configured list or
/// the merged signal-source universe.
#[derive(Debug, Clone)]
pub enum CandidateUniverse {
    /// Fixed symbol set configured on the trader.
    Custom(Vec<String>),
    /// Universe assembled by the signal-source cache.
    Merged(MergedCoinPool),
}

impl CandidateUniverse {
    pub fn symbols(&self) -> Vec<String> {
        match self {
            Self::Custom(symbols) => symbols.clone(),
            Self::Merged(pool) => pool.all_symbols.clone(),
        }
    }
}

/// Compose the system prompt from the base and the trader's custom prompt.
pub fn build_system_prompt(custom_prompt: &str, override_base: bool) -> String {
    let custom = custom_prompt.trim();
    if custom.is_empty() {
        return BASE_SYSTEM_PROMPT.to_string();
    }
    if override_base {
        custom.to_string()
    } else {
        format!("{BASE_SYSTEM_PROMPT}\n\n{custom}")
    }
}

/// Serialise the cycle context into the user prompt.
pub fn build_user_prompt(
    account: &AccountState,
    positions: &[Position],
    candidates: &CandidateUniverse,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "## Account");
    let _ = writeln!(
        out,
        "equity={:.2} available={:.2} margin_used={:.1}% positions={} unrealized_pnl={:.2}",
        account.total_equity,
        account.available_balance,
        account.margin_used_pct,
        account.position_count,
        account.unrealized_pnl,
    );

    let _ = writeln!(out, "\n## Open positions");
    if positions.is_empty() {
        let _ = writeln!(out, "(none)");
    } else {
        for p in positions {
            let _ = writeln!(
                out,
                "{} {} qty={} entry={:.4} mark={:.4} pnl={:.2} lev={}x",
                p.symbol, p.side, p.quantity, p.entry_price, p.mark_price, p.unrealized_pnl, p.leverage,
            );
        }
    }

    let _ = writeln!(out, "\n## Candidates");
    match candidates {
        CandidateUniverse::Custom(symbols) => {
            let _ = writeln!(out, "{}", symbols.join(", "));
        }
        CandidateUniverse::Merged(pool) => {
            for coin in &pool.ai500_coins {
                let _ = writeln!(
                    out,
                    "{} score={:.2} price={:.4} change={:.2}%",
                    coin.symbol, coin.score, coin.current_price, coin.increase_pct,
                );
            }
            for pos in &pool.oi_top_positions {
                let _ = writeln!(
                    out,
                    "{} oi_rank={} oi_change={:.2}% price_change={:.2}%",
                    pos.symbol, pos.rank, pos.oi_delta_pct, pos.price_delta_pct,
                );
            }
        }
    }

    let _ = writeln!(
        out,
        "\nRespond with your reasoning followed by the JSON action array."
    );
    out
}
