use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Running,
    Paused,
    Halted,
}

/// Escalating safety level driven by daily loss as a fraction of
/// starting equity. Ordering matters: transitions may only move up
/// within a trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerLevel {
    None,
    Warning,
    Paused,
    Halted,
}

impl CircuitBreakerLevel {
    /// Pure mapping from loss ratio to the implied level. Gains never
    /// escalate the breaker.
    pub fn for_loss(daily_pl: f64, start_equity: f64, config: &BotConfig) -> Self {
        if daily_pl >= 0.0 || start_equity <= 0.0 {
            return CircuitBreakerLevel::None;
        }
        let loss_pct = daily_pl.abs() / start_equity * 100.0;
        if loss_pct >= config.cb_halt_pct {
            CircuitBreakerLevel::Halted
        } else if loss_pct >= config.cb_pause_pct {
            CircuitBreakerLevel::Paused
        } else if loss_pct >= config.cb_warning_pct {
            CircuitBreakerLevel::Warning
        } else {
            CircuitBreakerLevel::None
        }
    }
}

/// Singleton operational state, recreated daily at market open.
///
/// Single-writer discipline: only the orchestrator (tick passes, command
/// handlers) and `reset_daily` mutate this; the risk gateway reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotState {
    pub status: BotStatus,

    // Daily counters
    pub daily_pl: f64,
    pub daily_trades_count: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub daily_start_equity: f64,

    // Circuit breaker
    pub circuit_breaker: CircuitBreakerLevel,
    pub cb_triggered_at: Option<DateTime<Utc>>,
    pub cb_trigger_reason: Option<String>,

    // Open positions
    pub open_positions_count: u32,
    pub open_stock_positions: u32,
    pub open_option_positions: u32,

    // Health
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl BotState {
    pub fn new(start_equity: f64) -> Self {
        Self {
            status: BotStatus::Stopped,
            daily_pl: 0.0,
            daily_trades_count: 0,
            daily_wins: 0,
            daily_losses: 0,
            daily_start_equity: start_equity,
            circuit_breaker: CircuitBreakerLevel::None,
            cb_triggered_at: None,
            cb_trigger_reason: None,
            open_positions_count: 0,
            open_stock_positions: 0,
            open_option_positions: 0,
            last_error: None,
            last_error_at: None,
            consecutive_errors: 0,
        }
    }

    /// Recompute the breaker level implied by the current daily P&L and
    /// adopt it only if strictly higher than the stored level. Never
    /// downgrades mid-day. Returns the new level when an escalation fired.
    pub fn update_circuit_breaker(
        &mut self,
        config: &BotConfig,
        now: DateTime<Utc>,
    ) -> Option<CircuitBreakerLevel> {
        let implied =
            CircuitBreakerLevel::for_loss(self.daily_pl, self.daily_start_equity, config);
        if implied <= self.circuit_breaker {
            return None;
        }

        let loss_pct = if self.daily_start_equity > 0.0 {
            self.daily_pl.abs() / self.daily_start_equity * 100.0
        } else {
            0.0
        };
        let reason = format!(
            "daily loss ${:.2} ({:.2}% of ${:.2} starting equity)",
            self.daily_pl.abs(),
            loss_pct,
            self.daily_start_equity
        );
        tracing::warn!(
            "Circuit breaker escalated {:?} -> {:?}: {}",
            self.circuit_breaker,
            implied,
            reason
        );

        self.circuit_breaker = implied;
        self.cb_triggered_at = Some(now);
        self.cb_trigger_reason = Some(reason);
        Some(implied)
    }

    /// Daily reset at market open: the only path that lowers the circuit
    /// breaker. Zeroes all daily counters and clears error trackers.
    ///
    /// With `auto_resume_next_day = false`, a day that ended `Halted`
    /// carries the halt across the reset: the breaker clears (new loss
    /// basis) but the bot stays halted until a manual resume.
    pub fn reset_daily(&mut self, start_equity: f64, config: &BotConfig) {
        let was_halted = self.status == BotStatus::Halted
            || self.circuit_breaker == CircuitBreakerLevel::Halted;

        self.daily_pl = 0.0;
        self.daily_trades_count = 0;
        self.daily_wins = 0;
        self.daily_losses = 0;
        self.daily_start_equity = start_equity;
        self.circuit_breaker = CircuitBreakerLevel::None;
        self.cb_triggered_at = None;
        self.cb_trigger_reason = None;
        self.last_error = None;
        self.last_error_at = None;
        self.consecutive_errors = 0;

        if was_halted {
            if config.auto_resume_next_day {
                self.status = BotStatus::Running;
                tracing::info!("Daily reset: halt cleared, bot resumed");
            } else {
                self.status = BotStatus::Halted;
                tracing::warn!("Daily reset: halt carried over, manual resume required");
            }
        }

        tracing::info!(
            "Daily reset complete, starting equity ${:.2}",
            start_equity
        );
    }

    /// Book one closed trade into the daily counters. The caller guarantees
    /// exactly-once invocation per trade (closing is idempotent upstream).
    pub fn record_close(&mut self, realized_pl: f64, is_option: bool) {
        self.daily_pl += realized_pl;
        if realized_pl > 0.0 {
            self.daily_wins += 1;
        } else if realized_pl < 0.0 {
            self.daily_losses += 1;
        }
        self.open_positions_count = self.open_positions_count.saturating_sub(1);
        if is_option {
            self.open_option_positions = self.open_option_positions.saturating_sub(1);
        } else {
            self.open_stock_positions = self.open_stock_positions.saturating_sub(1);
        }
    }

    /// Register a newly opened position.
    pub fn record_open(&mut self, is_option: bool) {
        self.daily_trades_count += 1;
        self.open_positions_count += 1;
        if is_option {
            self.open_option_positions += 1;
        } else {
            self.open_stock_positions += 1;
        }
    }

    pub fn record_error(&mut self, msg: impl Into<String>, now: DateTime<Utc>) {
        self.last_error = Some(msg.into());
        self.last_error_at = Some(now);
        self.consecutive_errors += 1;
    }

    pub fn clear_errors(&mut self) {
        self.consecutive_errors = 0;
    }
}
