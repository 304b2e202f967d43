use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// How signals are turned into orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Signals are logged and surfaced only; no trades are created.
    SignalOnly,
    /// Every signal becomes a pending trade awaiting explicit user approval.
    SemiAuto,
    /// Approved signals are sized and submitted without user interaction.
    FullAuto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Budget is the per-asset-type dollar cap.
    FixedDollar,
    /// Budget is a fixed percentage of account equity.
    PctPortfolio,
    /// Budget derived from dollar risk and stop distance.
    RiskBased,
}

/// Singleton, user-editable bot configuration.
///
/// Dollar caps are hard ceilings: sizing output must never exceed them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub execution_mode: ExecutionMode,

    // Per-trade dollar caps
    pub max_stock_position_usd: f64,
    pub max_option_position_usd: f64,

    // Position sizing
    pub sizing_mode: SizingMode,
    pub portfolio_alloc_pct: f64,
    pub risk_per_trade_pct: f64,

    // Daily limits
    pub max_daily_loss_usd: f64,
    pub max_trades_per_day: u32,
    pub max_concurrent_positions: u32,

    // Exit defaults
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub close_positions_eod: bool,
    pub eod_close_minutes_before: i64,
    pub leaps_roll_alert_dte: i64,

    // Signal filters
    pub min_confidence_to_execute: f64,
    pub require_ai_analysis: bool,
    /// Empty set = all strategies enabled.
    pub enabled_strategies: HashSet<String>,

    // Circuit breaker thresholds, as % of daily starting equity
    pub cb_warning_pct: f64,
    pub cb_pause_pct: f64,
    pub cb_halt_pct: f64,
    pub auto_resume_next_day: bool,

    // Option quality filters
    pub max_bid_ask_spread_pct: f64,
    pub min_option_open_interest: u64,
    pub min_option_delta: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::SemiAuto,
            max_stock_position_usd: 500.0,
            max_option_position_usd: 1_000.0,
            sizing_mode: SizingMode::FixedDollar,
            portfolio_alloc_pct: 5.0,
            risk_per_trade_pct: 1.0,
            max_daily_loss_usd: 1_000.0,
            max_trades_per_day: 10,
            max_concurrent_positions: 5,
            take_profit_pct: 10.0,
            stop_loss_pct: 5.0,
            trailing_stop_pct: 3.0,
            close_positions_eod: false,
            eod_close_minutes_before: 15,
            leaps_roll_alert_dte: 90,
            min_confidence_to_execute: 0.70,
            require_ai_analysis: false,
            enabled_strategies: HashSet::new(),
            cb_warning_pct: 3.0,
            cb_pause_pct: 5.0,
            cb_halt_pct: 10.0,
            auto_resume_next_day: true,
            max_bid_ask_spread_pct: 10.0,
            min_option_open_interest: 100,
            min_option_delta: 0.30,
        }
    }
}

impl BotConfig {
    /// Validate configuration at startup. Rejects inverted breaker
    /// thresholds, non-positive caps, and out-of-range percentages.
    pub fn validate(&self) -> Result<()> {
        if self.max_stock_position_usd <= 0.0 || self.max_option_position_usd <= 0.0 {
            bail!("per-trade dollar caps must be positive");
        }
        if self.max_daily_loss_usd <= 0.0 {
            bail!("max_daily_loss_usd must be positive");
        }
        if self.max_trades_per_day == 0 || self.max_concurrent_positions == 0 {
            bail!("max_trades_per_day and max_concurrent_positions must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.min_confidence_to_execute) {
            bail!(
                "min_confidence_to_execute must be between 0 and 1, got {}",
                self.min_confidence_to_execute
            );
        }
        if self.portfolio_alloc_pct <= 0.0 || self.portfolio_alloc_pct > 100.0 {
            bail!("portfolio_alloc_pct must be in (0, 100]");
        }
        if self.risk_per_trade_pct <= 0.0 || self.risk_per_trade_pct > 100.0 {
            bail!("risk_per_trade_pct must be in (0, 100]");
        }
        if self.stop_loss_pct <= 0.0 || self.take_profit_pct <= 0.0 || self.trailing_stop_pct <= 0.0
        {
            bail!("exit percentages must be positive");
        }
        if !(self.cb_warning_pct < self.cb_pause_pct && self.cb_pause_pct < self.cb_halt_pct) {
            bail!(
                "circuit breaker thresholds must be strictly increasing: warn {} / pause {} / halt {}",
                self.cb_warning_pct,
                self.cb_pause_pct,
                self.cb_halt_pct
            );
        }
        if self.cb_warning_pct <= 0.0 {
            bail!("cb_warning_pct must be positive");
        }
        if self.eod_close_minutes_before < 0 || self.leaps_roll_alert_dte < 0 {
            bail!("time-exit thresholds must be non-negative");
        }
        Ok(())
    }

    /// Per-trade dollar cap for the given asset type.
    pub fn position_cap_usd(&self, is_option: bool) -> f64 {
        if is_option {
            self.max_option_position_usd
        } else {
            self.max_stock_position_usd
        }
    }

    /// Whether a strategy id passes the enabled-strategy filter.
    pub fn strategy_enabled(&self, strategy: &str) -> bool {
        self.enabled_strategies.is_empty() || self.enabled_strategies.contains(strategy)
    }
}
