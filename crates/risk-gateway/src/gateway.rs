use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use bot_core::{BotConfig, BotState, BotStatus, CircuitBreakerLevel, TradingSignal};
use broker_api::{AccountSnapshot, MarketClock, OptionQuote};

/// Outcome of the entry gate. When rejected, `reasons` carries every
/// failing check so the operator sees the full picture, not just the first
/// tripwire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn summary(&self) -> String {
        if self.approved {
            "approved".to_string()
        } else {
            self.reasons.join("; ")
        }
    }
}

/// Everything the gate reads for one evaluation. The gateway itself never
/// mutates state; all mutation happens in the orchestrator after a decision.
pub struct GateInputs<'a> {
    pub signal: &'a TradingSignal,
    pub config: &'a BotConfig,
    pub state: &'a BotState,
    pub account: &'a AccountSnapshot,
    pub clock: &'a MarketClock,
    /// Result of the duplicate-position lookup for this symbol.
    pub symbol_already_held: bool,
    /// Required for option signals; quality filters reject without it.
    pub option_quote: Option<&'a OptionQuote>,
    /// Minimum validated AI confidence when `require_ai_analysis` is set.
    pub ai_threshold: f64,
    pub now: DateTime<Utc>,
}

/// Multi-check entry gate. Pure decision function over a snapshot of bot
/// state, configuration, and account data.
pub struct RiskGateway {
    /// Option snapshots older than this are considered stale.
    pub max_quote_age_secs: i64,
}

impl Default for RiskGateway {
    fn default() -> Self {
        Self {
            max_quote_age_secs: 60,
        }
    }
}

impl RiskGateway {
    pub fn new(max_quote_age_secs: i64) -> Self {
        Self { max_quote_age_secs }
    }

    pub fn evaluate(&self, inputs: &GateInputs) -> GateDecision {
        let GateInputs {
            signal,
            config,
            state,
            account,
            clock,
            symbol_already_held,
            option_quote,
            ai_threshold,
            now,
        } = inputs;
        let mut reasons = Vec::new();

        // 1. Bot must be running
        if state.status != BotStatus::Running {
            reasons.push(format!("bot status is {:?}, not running", state.status));
        }

        // 2. Market session
        if !clock.is_open {
            reasons.push("market session is closed".to_string());
        }

        // 3. Circuit breaker
        match state.circuit_breaker {
            CircuitBreakerLevel::Halted => {
                reasons.push("circuit breaker HALTED: all trading suspended".to_string());
            }
            CircuitBreakerLevel::Paused => {
                reasons.push("circuit breaker PAUSED: new entries rejected".to_string());
            }
            CircuitBreakerLevel::Warning | CircuitBreakerLevel::None => {}
        }

        // 4. Daily trade count
        if state.daily_trades_count >= config.max_trades_per_day {
            reasons.push(format!(
                "daily trade limit reached ({}/{})",
                state.daily_trades_count, config.max_trades_per_day
            ));
        }

        // 5. Daily loss cap (only losses count against it)
        if state.daily_pl < 0.0 && state.daily_pl.abs() >= config.max_daily_loss_usd {
            reasons.push(format!(
                "daily loss ${:.2} at or above cap ${:.2}",
                state.daily_pl.abs(),
                config.max_daily_loss_usd
            ));
        }

        // 6. Concurrent positions
        if state.open_positions_count >= config.max_concurrent_positions {
            reasons.push(format!(
                "max concurrent positions reached ({}/{})",
                state.open_positions_count, config.max_concurrent_positions
            ));
        }

        // 7. Duplicate position
        if *symbol_already_held {
            reasons.push(format!("already holding an open trade in {}", signal.symbol));
        }

        // 8. Confidence floor (missing confidence counts as zero)
        let confidence = signal.confidence.unwrap_or(0.0);
        if confidence < config.min_confidence_to_execute {
            reasons.push(format!(
                "confidence {:.2} below minimum {:.2}",
                confidence, config.min_confidence_to_execute
            ));
        }

        // 9. AI validation, when required
        if config.require_ai_analysis {
            match signal.ai_confidence {
                Some(ai) if ai >= *ai_threshold => {}
                Some(ai) => reasons.push(format!(
                    "AI confidence {:.2} below validator threshold {:.2}",
                    ai, ai_threshold
                )),
                None => reasons.push("AI analysis required but no validated confidence present".to_string()),
            }
        }

        // 10. Strategy filter
        if !config.strategy_enabled(&signal.strategy) {
            reasons.push(format!("strategy '{}' is not enabled", signal.strategy));
        }

        // 11. Buying power covers the minimum viable size
        let min_viable = match option_quote {
            Some(quote) if signal.asset.is_option() => quote.mid() * 100.0,
            _ => (signal.entry_price * 0.001).max(1.0),
        };
        // Compared as the exact wire amount; the viable-size floor is an
        // estimate and may carry float noise.
        let buying_power = account.buying_power_decimal();
        if buying_power < Decimal::from_f64_retain(min_viable).unwrap_or_default() {
            reasons.push(format!(
                "buying power ${} below minimum viable size ${:.2}",
                buying_power, min_viable
            ));
        }

        // 12-16. Option quality filters
        if signal.asset.is_option() {
            match option_quote {
                Some(quote) => self.check_option_quality(quote, config, *now, &mut reasons),
                None => reasons.push("option signal without an option snapshot".to_string()),
            }
        }

        let approved = reasons.is_empty();
        if approved {
            tracing::debug!("Gate approved {} {}", signal.strategy, signal.symbol);
        } else {
            tracing::info!(
                "Gate rejected {} {}: {}",
                signal.strategy,
                signal.symbol,
                reasons.join("; ")
            );
        }
        GateDecision { approved, reasons }
    }

    fn check_option_quality(
        &self,
        quote: &OptionQuote,
        config: &BotConfig,
        now: DateTime<Utc>,
        reasons: &mut Vec<String>,
    ) {
        let spread = quote.spread_pct();
        if spread > config.max_bid_ask_spread_pct {
            reasons.push(format!(
                "bid/ask spread {:.1}% above {:.1}% cap",
                spread, config.max_bid_ask_spread_pct
            ));
        }
        if quote.open_interest < config.min_option_open_interest {
            reasons.push(format!(
                "open interest {} below minimum {}",
                quote.open_interest, config.min_option_open_interest
            ));
        }
        if quote.delta.abs() < config.min_option_delta {
            reasons.push(format!(
                "|delta| {:.2} below minimum {:.2}",
                quote.delta.abs(),
                config.min_option_delta
            ));
        }
        match quote.expiry {
            Some(expiry) if expiry > now.date_naive() => {}
            Some(expiry) => reasons.push(format!("option expiry {} is not in the future", expiry)),
            None => reasons.push("option quote missing expiry".to_string()),
        }
        if quote.is_stale(now, self.max_quote_age_secs) {
            reasons.push(format!(
                "option quote older than {}s, liquidity stale",
                self.max_quote_age_secs
            ));
        }
    }
}
