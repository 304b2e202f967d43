use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use bot_core::{
    AssetKind, BotConfig, BotState, CircuitBreakerLevel, Direction, ExecutedTrade, ExitReason,
    TradeStatus,
};
use broker_api::MarketClock;

/// A fired exit condition plus a human-readable detail line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub detail: String,
}

/// Result of one monitor pass over a single trade.
///
/// `high_water_mark` carries the ratcheted mark regardless of whether an
/// exit fired; the orchestrator persists it back onto the trade.
#[derive(Debug, Clone)]
pub struct ExitCheck {
    pub exit: Option<ExitSignal>,
    pub high_water_mark: Option<f64>,
}

impl ExitCheck {
    fn none(hwm: Option<f64>) -> Self {
        Self {
            exit: None,
            high_water_mark: hwm,
        }
    }
}

/// Per-tick inputs for exit evaluation.
pub struct MonitorContext<'a> {
    pub config: &'a BotConfig,
    pub state: &'a BotState,
    pub current_price: f64,
    pub clock: &'a MarketClock,
    pub now: DateTime<Utc>,
    /// Upstream collaborator flagged the originating thesis broken.
    pub signal_invalidated: bool,
}

/// Evaluates exit conditions for open trades in a fixed precedence order;
/// the first matching condition wins and only one exit fires per tick.
/// Pure over its inputs: submitting the exit order and booking P&L happen
/// in the orchestrator.
#[derive(Default)]
pub struct PositionMonitor;

impl PositionMonitor {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, trade: &ExecutedTrade, ctx: &MonitorContext) -> ExitCheck {
        // Closed or closing trades are never re-evaluated; this is what
        // makes closing idempotent at the pipeline level.
        if trade.status != TradeStatus::Open {
            return ExitCheck::none(trade.high_water_mark);
        }

        let price = ctx.current_price;
        let hwm = ratchet_high_water_mark(trade, price);

        // 1. Kill switch / manual close request
        if trade.close_requested {
            return exit(hwm, ExitReason::KillSwitch, "manual close requested".into());
        }

        // 2. Circuit-breaker forced exit
        if ctx.state.circuit_breaker == CircuitBreakerLevel::Halted {
            return exit(
                hwm,
                ExitReason::CircuitBreaker,
                "circuit breaker halted, closing position".into(),
            );
        }

        // 3. Stop loss
        let stop = effective_stop(trade, ctx.config);
        let stop_touched = match trade.direction {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        };
        if stop_touched {
            return exit(
                hwm,
                ExitReason::StopLoss,
                format!("price ${price:.2} through stop ${stop:.2}"),
            );
        }

        // 4. Take profit
        let target = effective_take_profit(trade, ctx.config);
        let target_touched = match trade.direction {
            Direction::Long => price >= target,
            Direction::Short => price <= target,
        };
        if target_touched {
            return exit(
                hwm,
                ExitReason::TakeProfit,
                format!("price ${price:.2} through target ${target:.2}"),
            );
        }

        // 5. Trailing stop from the high-water mark
        if let Some(mark) = hwm {
            let pct = trade
                .trailing_stop_pct
                .unwrap_or(ctx.config.trailing_stop_pct);
            if pct > 0.0 {
                let retraced = match trade.direction {
                    Direction::Long => price <= mark * (1.0 - pct / 100.0),
                    Direction::Short => price >= mark * (1.0 + pct / 100.0),
                };
                if retraced {
                    return exit(
                        hwm,
                        ExitReason::TrailingStop,
                        format!("price ${price:.2} retraced {pct:.1}% from mark ${mark:.2}"),
                    );
                }
            }
        }

        // 6. Time exits: EOD close window, option expiry/roll alert
        if ctx.config.close_positions_eod && ctx.clock.is_open {
            let to_close = ctx.clock.next_close - ctx.now;
            if to_close <= Duration::minutes(ctx.config.eod_close_minutes_before) {
                return exit(
                    hwm,
                    ExitReason::EodClose,
                    format!(
                        "{} minutes to session close",
                        to_close.num_minutes().max(0)
                    ),
                );
            }
        }
        if let AssetKind::Option { expiry, .. } = &trade.asset {
            let dte = (*expiry - ctx.now.date_naive()).num_days();
            if dte <= ctx.config.leaps_roll_alert_dte {
                return exit(
                    hwm,
                    ExitReason::ExpiryRoll,
                    format!("{dte} DTE at or below roll alert threshold"),
                );
            }
        }

        // 7. Signal invalidation
        if ctx.signal_invalidated {
            return exit(
                hwm,
                ExitReason::SignalInvalidated,
                "originating signal invalidated upstream".into(),
            );
        }

        ExitCheck::none(hwm)
    }
}

fn exit(hwm: Option<f64>, reason: ExitReason, detail: String) -> ExitCheck {
    tracing::info!("Exit condition fired ({:?}): {}", reason, detail);
    ExitCheck {
        exit: Some(ExitSignal { reason, detail }),
        high_water_mark: hwm,
    }
}

/// Highest favorable price since entry for longs, lowest for shorts.
/// Ratchets favorably only, never backward.
fn ratchet_high_water_mark(trade: &ExecutedTrade, price: f64) -> Option<f64> {
    let prev = trade.high_water_mark.unwrap_or(trade.entry_price);
    let next = match trade.direction {
        Direction::Long => prev.max(price),
        Direction::Short => prev.min(price),
    };
    Some(next)
}

fn effective_stop(trade: &ExecutedTrade, config: &BotConfig) -> f64 {
    trade.stop_loss_price.unwrap_or_else(|| match trade.direction {
        Direction::Long => trade.entry_price * (1.0 - config.stop_loss_pct / 100.0),
        Direction::Short => trade.entry_price * (1.0 + config.stop_loss_pct / 100.0),
    })
}

fn effective_take_profit(trade: &ExecutedTrade, config: &BotConfig) -> f64 {
    trade
        .take_profit_price
        .unwrap_or_else(|| match trade.direction {
            Direction::Long => trade.entry_price * (1.0 + config.take_profit_pct / 100.0),
            Direction::Short => trade.entry_price * (1.0 - config.take_profit_pct / 100.0),
        })
}
