use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::{AssetKind, Direction, TradingSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    PendingEntry,
    PendingApproval,
    Open,
    PendingExit,
    Closed,
    Cancelled,
    Error,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::Cancelled | TradeStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    KillSwitch,
    CircuitBreaker,
    StopLoss,
    TakeProfit,
    TrailingStop,
    EodClose,
    ExpiryRoll,
    SignalInvalidated,
    Manual,
}

impl ExitReason {
    pub fn describe(&self) -> &'static str {
        match self {
            ExitReason::KillSwitch => "kill switch / manual close requested",
            ExitReason::CircuitBreaker => "circuit breaker halted, forced exit",
            ExitReason::StopLoss => "stop loss touched",
            ExitReason::TakeProfit => "take profit touched",
            ExitReason::TrailingStop => "trailing stop retraced from high-water mark",
            ExitReason::EodClose => "end-of-day close window",
            ExitReason::ExpiryRoll => "option expiry / roll alert threshold",
            ExitReason::SignalInvalidated => "originating signal invalidated",
            ExitReason::Manual => "manual exit",
        }
    }
}

/// A trade owned by the execution pipeline from creation until terminal.
///
/// Created on risk-approved sizing, mutated only by the entry-fill path and
/// the position monitor's exit path, never reopened once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: Direction,
    pub asset: AssetKind,
    pub strategy: String,

    // Entry
    pub entry_order_id: Option<String>,
    pub entry_price: f64,
    pub entry_filled_at: Option<DateTime<Utc>>,
    pub quantity: f64,
    pub notional: f64,
    pub is_notional_order: bool,

    // Exit targets
    pub take_profit_price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    /// Best favorable price since entry (highest for longs, lowest for
    /// shorts). Ratchets favorably only.
    pub high_water_mark: Option<f64>,

    // Exit
    pub exit_order_id: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_filled_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,

    // Results
    pub realized_pl: Option<f64>,
    pub realized_pl_pct: Option<f64>,
    pub fees: f64,

    pub status: TradeStatus,
    /// Set by the manual-close command; picked up by the monitor.
    pub close_requested: bool,
    pub created_at: DateTime<Utc>,
}

impl ExecutedTrade {
    pub fn from_signal(signal: &TradingSignal, status: TradeStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            asset: signal.asset.clone(),
            strategy: signal.strategy.clone(),
            entry_order_id: None,
            entry_price: signal.entry_price,
            entry_filled_at: None,
            quantity: 0.0,
            notional: 0.0,
            is_notional_order: false,
            take_profit_price: None,
            stop_loss_price: signal.stop_loss,
            trailing_stop_pct: None,
            high_water_mark: None,
            exit_order_id: None,
            exit_price: None,
            exit_filled_at: None,
            exit_reason: None,
            realized_pl: None,
            realized_pl_pct: None,
            fees: 0.0,
            status,
            close_requested: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_option(&self) -> bool {
        self.asset.is_option()
    }

    /// Cost basis in dollars: entry price * quantity, *100 for options.
    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.quantity * self.asset.multiplier()
    }

    /// Stamp the entry fill and open the trade.
    pub fn fill_entry(&mut self, fill_price: f64, filled_qty: f64, now: DateTime<Utc>) {
        self.entry_price = fill_price;
        self.quantity = filled_qty;
        self.entry_filled_at = Some(now);
        self.high_water_mark = Some(fill_price);
        self.status = TradeStatus::Open;
    }

    /// Book the exit fill: compute realized P&L and transition to `Closed`.
    ///
    /// Idempotent: calling this on an already-closed trade is a no-op, so
    /// P&L can never be booked twice.
    pub fn book_exit(&mut self, exit_price: f64, reason: ExitReason, now: DateTime<Utc>) {
        if self.status == TradeStatus::Closed {
            tracing::debug!("Trade {} already closed, ignoring duplicate exit", self.id);
            return;
        }

        let per_unit = match self.direction {
            Direction::Long => exit_price - self.entry_price,
            Direction::Short => self.entry_price - exit_price,
        };
        let pl = per_unit * self.quantity * self.asset.multiplier();
        let cost_basis = self.cost_basis();
        let pl_pct = if cost_basis > 0.0 {
            pl / cost_basis * 100.0
        } else {
            0.0
        };

        self.exit_price = Some(exit_price);
        self.exit_filled_at = Some(now);
        self.exit_reason = Some(reason);
        self.realized_pl = Some(pl);
        self.realized_pl_pct = Some(pl_pct);
        self.status = TradeStatus::Closed;

        tracing::info!(
            "Closed {} {} ({}): P/L ${:.2} ({:+.2}%)",
            self.symbol,
            self.id,
            reason.describe(),
            pl,
            pl_pct
        );
    }
}
