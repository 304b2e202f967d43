use std::env;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use bot_core::{BotConfig, ExecutionMode, SizingMode};

/// Runtime settings for the agent process, wrapping the shared [`BotConfig`]
/// the risk pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub bot: BotConfig,

    // Loop timing
    pub tick_interval_seconds: u64,       // 30
    pub external_call_timeout_secs: u64,  // 5

    // Error policy (deployment knob, not a core invariant)
    pub max_consecutive_errors: u32,      // 5

    // Backtest pool
    pub backtest_max_concurrent: usize,   // 3
    pub backtest_slot_timeout_secs: u64,  // 30

    // Paper account
    pub paper_starting_equity: f64,       // $100,000

    // Live-trading safety gate
    pub broker_base_url: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let bot = BotConfig {
            execution_mode: parse_execution_mode(
                &env::var("EXECUTION_MODE").unwrap_or_else(|_| "semi_auto".to_string()),
            )?,
            max_stock_position_usd: env_f64("MAX_STOCK_POSITION_USD", "500.0")?,
            max_option_position_usd: env_f64("MAX_OPTION_POSITION_USD", "1000.0")?,
            sizing_mode: parse_sizing_mode(
                &env::var("SIZING_MODE").unwrap_or_else(|_| "fixed_dollar".to_string()),
            )?,
            portfolio_alloc_pct: env_f64("PORTFOLIO_ALLOC_PCT", "5.0")?,
            risk_per_trade_pct: env_f64("RISK_PER_TRADE_PCT", "1.0")?,
            max_daily_loss_usd: env_f64("MAX_DAILY_LOSS_USD", "1000.0")?,
            max_trades_per_day: env_parse("MAX_TRADES_PER_DAY", "10")?,
            max_concurrent_positions: env_parse("MAX_CONCURRENT_POSITIONS", "5")?,
            take_profit_pct: env_f64("TAKE_PROFIT_PCT", "10.0")?,
            stop_loss_pct: env_f64("STOP_LOSS_PCT", "5.0")?,
            trailing_stop_pct: env_f64("TRAILING_STOP_PCT", "3.0")?,
            close_positions_eod: env_parse("CLOSE_POSITIONS_EOD", "false")?,
            eod_close_minutes_before: env_parse("EOD_CLOSE_MINUTES_BEFORE", "15")?,
            leaps_roll_alert_dte: env_parse("LEAPS_ROLL_ALERT_DTE", "90")?,
            min_confidence_to_execute: env_f64("MIN_CONFIDENCE", "0.70")?,
            require_ai_analysis: env_parse("REQUIRE_AI_ANALYSIS", "false")?,
            enabled_strategies: env::var("ENABLED_STRATEGIES")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            cb_warning_pct: env_f64("CB_WARNING_PCT", "3.0")?,
            cb_pause_pct: env_f64("CB_PAUSE_PCT", "5.0")?,
            cb_halt_pct: env_f64("CB_HALT_PCT", "10.0")?,
            auto_resume_next_day: env_parse("CB_AUTO_RESUME_NEXT_DAY", "true")?,
            max_bid_ask_spread_pct: env_f64("MAX_BID_ASK_SPREAD_PCT", "10.0")?,
            min_option_open_interest: env_parse("MIN_OPTION_OPEN_INTEREST", "100")?,
            min_option_delta: env_f64("MIN_OPTION_DELTA", "0.30")?,
        };
        bot.validate()?;

        Ok(Self {
            bot,
            tick_interval_seconds: env_parse("TICK_INTERVAL_SECONDS", "30")?,
            external_call_timeout_secs: env_parse("EXTERNAL_CALL_TIMEOUT_SECS", "5")?,
            max_consecutive_errors: env_parse("MAX_CONSECUTIVE_ERRORS", "5")?,
            backtest_max_concurrent: env_parse("BACKTEST_MAX_CONCURRENT", "3")?,
            backtest_slot_timeout_secs: env_parse("BACKTEST_SLOT_TIMEOUT_SECS", "30")?,
            paper_starting_equity: env_f64("PAPER_STARTING_EQUITY", "100000.0")?,
            broker_base_url: env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| "paper".to_string()),
        })
    }

    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }
}

fn env_f64(key: &str, default: &str) -> Result<f64> {
    env_parse(key, default)
}

fn env_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()?)
}

fn parse_execution_mode(value: &str) -> Result<ExecutionMode> {
    match value.to_ascii_lowercase().as_str() {
        "signal_only" => Ok(ExecutionMode::SignalOnly),
        "semi_auto" => Ok(ExecutionMode::SemiAuto),
        "full_auto" => Ok(ExecutionMode::FullAuto),
        other => Err(anyhow::anyhow!("unknown EXECUTION_MODE '{}'", other)),
    }
}

fn parse_sizing_mode(value: &str) -> Result<SizingMode> {
    match value.to_ascii_lowercase().as_str() {
        "fixed_dollar" => Ok(SizingMode::FixedDollar),
        "pct_portfolio" => Ok(SizingMode::PctPortfolio),
        "risk_based" => Ok(SizingMode::RiskBased),
        other => Err(anyhow::anyhow!("unknown SIZING_MODE '{}'", other)),
    }
}
