// =============================================================================
// Risk Tripwires — daily loss and drawdown guards with a timed halt
// =============================================================================
//
// Two conditions are evaluated against the pre-cycle account snapshot on
// every tick:
//
//   1. Daily Loss  — equity loss since day-open exceeds the threshold.
//   2. Drawdown    — equity fall from the session peak exceeds the threshold.
//
// Tripping halts the trader for a fixed window. The halt deadline is set at
// trip time; once it expires the trader resumes normal scheduling and both
// conditions are re-evaluated on the next tick, so a still-breached account
// trips again immediately. Daily statistics reset when the date rolls over.
// =============================================================================

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::exchange::AccountState;
use crate::settings::Settings;

/// Limits supplied at construction time.
#[derive(Debug, Clone)]
pub struct TripwireConfig {
    /// Daily loss threshold as a percentage of day-open equity.
    pub max_daily_loss_pct: f64,
    /// Drawdown threshold as a percentage of peak equity.
    pub max_drawdown_pct: f64,
    /// How long a tripped trader stays halted.
    pub halt_duration: Duration,
}

impl TripwireConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_daily_loss_pct: settings.max_daily_loss,
            max_drawdown_pct: settings.max_drawdown,
            halt_duration: Duration::from_secs(settings.stop_trading_minutes * 60),
        }
    }
}

/// Outcome of one tick's evaluation.
#[derive(Debug, Clone)]
pub enum TripCheck {
    /// Trading may proceed.
    Clear,
    /// A previously tripped halt window is still open.
    Halted { remaining: Duration },
    /// A condition was breached on this tick; the halt window starts now.
    Tripped { reason: String },
}

struct Inner {
    current_date: String,
    day_open_equity: f64,
    peak_equity: f64,
    halted_until: Option<Instant>,
}

/// Per-trader tripwire state.
pub struct Tripwire {
    config: TripwireConfig,
    state: RwLock<Inner>,
}

impl Tripwire {
    pub fn new(config: TripwireConfig) -> Self {
        Self {
            config,
            state: RwLock::new(Inner {
                current_date: String::new(),
                day_open_equity: 0.0,
                peak_equity: 0.0,
                halted_until: None,
            }),
        }
    }

    pub fn halt_duration(&self) -> Duration {
        self.config.halt_duration
    }

    /// Evaluate against the current account snapshot.
    pub fn check(&self, account: &AccountState) -> TripCheck {
        let mut s = self.state.write();
        let equity = account.total_equity;

        // Date rollover (or first tick) re-anchors daily statistics.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if s.current_date != today {
            if !s.current_date.is_empty() {
                info!(
                    old_date = %s.current_date,
                    new_date = %today,
                    "date rolled — resetting daily tripwire anchors"
                );
            }
            s.current_date = today;
            s.day_open_equity = equity;
            s.peak_equity = equity;
        }

        if let Some(until) = s.halted_until {
            let now = Instant::now();
            if now < until {
                return TripCheck::Halted {
                    remaining: until - now,
                };
            }
            s.halted_until = None;
            info!("tripwire halt window expired — resuming normal scheduling");
        }

        if equity > s.peak_equity {
            s.peak_equity = equity;
        }

        let daily_loss_pct = if s.day_open_equity > 0.0 {
            ((s.day_open_equity - equity) / s.day_open_equity) * 100.0
        } else {
            0.0
        };
        if daily_loss_pct >= self.config.max_daily_loss_pct {
            let reason = format!(
                "daily loss {:.2}% breached limit {:.2}%",
                daily_loss_pct, self.config.max_daily_loss_pct
            );
            warn!(reason = %reason, halt_minutes = self.config.halt_duration.as_secs() / 60, "tripwire tripped");
            s.halted_until = Some(Instant::now() + self.config.halt_duration);
            return TripCheck::Tripped { reason };
        }

        let drawdown_pct = if s.peak_equity > 0.0 {
            ((s.peak_equity - equity) / s.peak_equity) * 100.0
        } else {
            0.0
        };
        if drawdown_pct >= self.config.max_drawdown_pct {
            let reason = format!(
                "drawdown {:.2}% breached limit {:.2}%",
                drawdown_pct, self.config.max_drawdown_pct
            );
            warn!(reason = %reason, halt_minutes = self.config.halt_duration.as_secs() / 60, "tripwire tripped");
            s.halted_until = Some(Instant::now() + self.config.halt_duration);
            return TripCheck::Tripped { reason };
        }

        TripCheck::Clear
    }
}

impl std::fmt::Debug for Tripwire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tripwire")
            .field("max_daily_loss_pct", &self.config.max_daily_loss_pct)
            .field("max_drawdown_pct", &self.config.max_drawdown_pct)
            .field("halt_duration", &self.config.halt_duration)
            .finish()
    }
}
