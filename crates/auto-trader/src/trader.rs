use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use bot_core::{
    BotState, BotStatus, CircuitBreakerLevel, Direction, ExecutedTrade, ExecutionMode, ExitReason,
    TradeStatus, TradeStore, TradingSignal,
};
use broker_api::{
    BrokerClient, InvalidationCheck, MarketClock, OptionQuote, Order, OrderRequest, OrderSide,
    OrderStatus, QuoteFeed, SignalSource, TradeValidator, NEUTRAL_AI_CONFIDENCE,
};
use position_monitor::{MonitorContext, PositionMonitor};
use position_sizer::size_position;
use risk_gateway::{GateInputs, RiskGateway};

use crate::commands::{StateSnapshot, TraderCommand};
use crate::config::AgentConfig;

/// Validator threshold used when no validator is wired in but a signal
/// carries an AI confidence anyway.
const DEFAULT_AI_THRESHOLD: f64 = 0.60;

/// The execution orchestrator: owns bot state (single writer), routes new
/// signals by execution mode, and supervises open positions each tick.
pub struct AutoTrader {
    config: AgentConfig,
    state: Mutex<BotState>,
    store: Arc<dyn TradeStore>,
    broker: Arc<dyn BrokerClient>,
    quotes: Arc<dyn QuoteFeed>,
    signals: Arc<dyn SignalSource>,
    validator: Option<Arc<dyn TradeValidator>>,
    invalidation: Option<Arc<dyn InvalidationCheck>>,
    gateway: RiskGateway,
    monitor: PositionMonitor,
    /// Original signals for trades parked in `PendingApproval`, consumed
    /// when the user approves.
    pending_signals: Mutex<HashMap<Uuid, TradingSignal>>,
    last_reset_date: Mutex<Option<NaiveDate>>,
}

impl AutoTrader {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn TradeStore>,
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<dyn QuoteFeed>,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        let starting_equity = config.paper_starting_equity;
        Self {
            config,
            state: Mutex::new(BotState::new(starting_equity)),
            store,
            broker,
            quotes,
            signals,
            validator: None,
            invalidation: None,
            gateway: RiskGateway::default(),
            monitor: PositionMonitor::new(),
            pending_signals: Mutex::new(HashMap::new()),
            last_reset_date: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn TradeValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_invalidation_check(mut self, check: Arc<dyn InvalidationCheck>) -> Self {
        self.invalidation = Some(check);
        self
    }

    /// Mark the bot running and stamp today's starting equity.
    pub async fn start(&self) -> Result<()> {
        let account = self.bounded(self.broker.get_account()).await?;
        let mut state = self.state.lock().await;
        state.status = BotStatus::Running;
        state.daily_start_equity = account.equity_f64();
        tracing::info!(
            "Bot running, starting equity ${:.2}",
            state.daily_start_equity
        );
        Ok(())
    }

    pub async fn state_snapshot(&self) -> StateSnapshot {
        let state = self.state.lock().await.clone();
        let recent_trades = self.store.recent(50).unwrap_or_default();
        StateSnapshot {
            state,
            recent_trades,
        }
    }

    /// One full tick. The caller never overlaps ticks: the loop awaits this
    /// before the next interval fires, so both passes run without
    /// interleaved mutation.
    pub async fn tick(&self) -> Result<()> {
        let clock = self.bounded(self.broker.get_clock()).await?;

        self.maybe_daily_reset(&clock).await?;
        self.resolve_pending_orders().await;
        self.new_signal_pass(&clock).await;
        self.open_position_pass(&clock).await;
        self.apply_error_policy().await;
        Ok(())
    }

    /// Daily reset fires once per trading day when the session is open.
    async fn maybe_daily_reset(&self, clock: &MarketClock) -> Result<()> {
        if !clock.is_open {
            return Ok(());
        }
        let today = Utc::now().with_timezone(&chrono_tz::US::Eastern).date_naive();
        let mut last = self.last_reset_date.lock().await;
        if *last == Some(today) {
            return Ok(());
        }

        // First tick of the process: don't wipe state that was just built.
        if last.is_none() {
            *last = Some(today);
            return Ok(());
        }

        let account = self.bounded(self.broker.get_account()).await?;
        let mut state = self.state.lock().await;
        state.reset_daily(account.equity_f64(), &self.config.bot);
        *last = Some(today);
        Ok(())
    }

    // -----------------------------------------------------------------
    // New-signal pass
    // -----------------------------------------------------------------

    async fn new_signal_pass(&self, clock: &MarketClock) {
        {
            let state = self.state.lock().await;
            if state.circuit_breaker == CircuitBreakerLevel::Halted {
                tracing::warn!("Circuit breaker halted: skipping new-signal pass");
                return;
            }
        }

        let signals = match self.bounded(self.signals.drain_signals()).await {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("Failed to drain signal source: {}", e);
                self.record_error(format!("signal source: {e}")).await;
                return;
            }
        };
        if signals.is_empty() {
            return;
        }
        tracing::info!("Processing {} new signals", signals.len());

        for signal in signals {
            let result = match self.config.bot.execution_mode {
                ExecutionMode::SignalOnly => {
                    tracing::info!(
                        "Signal-only mode: {} {:?} {} @ ${:.2} (conf {:.2})",
                        signal.strategy,
                        signal.direction,
                        signal.symbol,
                        signal.entry_price,
                        signal.confidence.unwrap_or(0.0)
                    );
                    Ok(())
                }
                ExecutionMode::SemiAuto => self.park_for_approval(signal).await,
                ExecutionMode::FullAuto => self.execute_signal(signal, clock, None).await,
            };

            // One bad signal must not abort the pass for the others.
            if let Err(e) = result {
                tracing::error!("Signal processing failed: {}", e);
                self.record_error(e.to_string()).await;
            }
        }
    }

    /// Semi-auto: create a trade awaiting explicit user confirmation. No
    /// sizing or submission happens until approval.
    async fn park_for_approval(&self, signal: TradingSignal) -> Result<()> {
        let trade = ExecutedTrade::from_signal(&signal, TradeStatus::PendingApproval);
        let trade_id = trade.id;
        self.store.insert(trade)?;
        self.pending_signals.lock().await.insert(trade_id, signal);
        tracing::info!("Trade {} parked for user approval", trade_id);
        Ok(())
    }

    /// Gateway, sizer, submit. Creates a fresh `PendingEntry` trade in
    /// full-auto, or advances the parked `PendingApproval` record through
    /// the same pipeline after user approval; a parked trade the pipeline
    /// rejects ends `Cancelled`.
    async fn execute_signal(
        &self,
        mut signal: TradingSignal,
        clock: &MarketClock,
        parked: Option<ExecutedTrade>,
    ) -> Result<()> {
        // AI validation is a bounded call with a neutral fallback score.
        if self.config.bot.require_ai_analysis && signal.ai_confidence.is_none() {
            signal.ai_confidence = Some(self.validated_confidence(&signal).await);
        }

        let account = self.bounded(self.broker.get_account()).await?;
        let option_quote = self.fetch_option_quote(&signal).await;
        let symbol_already_held = self.store.holds_symbol(&signal.symbol)?;
        let ai_threshold = self
            .validator
            .as_ref()
            .map(|v| v.approval_threshold())
            .unwrap_or(DEFAULT_AI_THRESHOLD);

        let decision = {
            let state = self.state.lock().await;
            self.gateway.evaluate(&GateInputs {
                signal: &signal,
                config: &self.config.bot,
                state: &state,
                account: &account,
                clock,
                symbol_already_held,
                option_quote: option_quote.as_ref(),
                ai_threshold,
                now: Utc::now(),
            })
        };
        if !decision.approved {
            tracing::info!(
                "Rejected {} {}: {}",
                signal.strategy,
                signal.symbol,
                decision.summary()
            );
            return self.cancel_parked(parked);
        }

        let current_price = match self.bounded(self.quotes.get_current_price(&signal.symbol)).await
        {
            Ok(price) => price,
            Err(e) => {
                tracing::warn!(
                    "Quote lookup failed for {} ({}), using signal entry price",
                    signal.symbol,
                    e
                );
                signal.entry_price
            }
        };
        let premium = option_quote.as_ref().map(|q| q.mid());

        let sizing = size_position(
            &signal,
            &self.config.bot,
            account.equity_f64(),
            current_price,
            &signal.asset,
            premium,
        );
        if sizing.rejected {
            tracing::info!(
                "Sizing rejected {}: {}",
                signal.symbol,
                sizing.reject_reason.as_deref().unwrap_or("unknown")
            );
            return self.cancel_parked(parked);
        }
        if let Some(reason) = &sizing.cap_reason {
            tracing::debug!("Sizing capped for {}: {}", signal.symbol, reason);
        }

        let side = match signal.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let request = if sizing.is_notional_order {
            OrderRequest::notional(&signal.symbol, side, sizing.notional)
        } else {
            OrderRequest {
                symbol: signal.symbol.clone(),
                side,
                qty: Some(sizing.quantity),
                notional: None,
            }
        };

        let order = self.bounded(self.broker.submit_order(request)).await?;
        tracing::info!(
            "Submitted entry order {} for {} ({} {:.4}, ${:.2} notional)",
            order.id,
            signal.symbol,
            if sizing.is_notional_order { "notional" } else { "qty" },
            sizing.quantity,
            sizing.notional
        );

        // An approved trade keeps its id through the lifecycle:
        // pending_approval -> pending_entry -> open.
        let approved = parked.is_some();
        let mut trade = match parked {
            Some(mut existing) => {
                existing.status = TradeStatus::PendingEntry;
                existing
            }
            None => ExecutedTrade::from_signal(&signal, TradeStatus::PendingEntry),
        };
        trade.entry_order_id = Some(order.id.clone());
        trade.quantity = sizing.quantity;
        trade.notional = sizing.notional;
        trade.is_notional_order = sizing.is_notional_order;
        trade.take_profit_price = signal.targets.first().copied();
        trade.trailing_stop_pct = Some(self.config.bot.trailing_stop_pct);
        if approved {
            self.store.update(&trade)?;
        } else {
            self.store.insert(trade.clone())?;
        }

        // Paper-style brokers fill instantly; live fills resolve next tick.
        if order.status == OrderStatus::Filled {
            self.apply_entry_fill(&mut trade, &order).await?;
        }
        Ok(())
    }

    /// Terminal alternate for a parked trade that does not proceed.
    fn cancel_parked(&self, parked: Option<ExecutedTrade>) -> Result<()> {
        if let Some(mut trade) = parked {
            trade.status = TradeStatus::Cancelled;
            self.store.update(&trade)?;
            tracing::info!("Approved trade {} cancelled by the entry pipeline", trade.id);
        }
        Ok(())
    }

    async fn apply_entry_fill(&self, trade: &mut ExecutedTrade, order: &Order) -> Result<()> {
        let fill_price = order
            .filled_avg_price_f64()
            .unwrap_or(trade.entry_price);
        let filled_qty = order.filled_qty_f64().unwrap_or(trade.quantity);
        trade.fill_entry(fill_price, filled_qty, Utc::now());
        self.store.update(trade)?;

        let mut state = self.state.lock().await;
        state.record_open(trade.is_option());
        tracing::info!(
            "Entry filled: {} x{:.4} @ ${:.2} ({} open positions)",
            trade.symbol,
            filled_qty,
            fill_price,
            state.open_positions_count
        );
        Ok(())
    }

    /// AI confidence with timeout and neutral fallback.
    async fn validated_confidence(&self, signal: &TradingSignal) -> f64 {
        let Some(validator) = &self.validator else {
            return NEUTRAL_AI_CONFIDENCE;
        };
        match self.bounded(validator.validate(signal)).await {
            Ok(verdict) => {
                tracing::debug!(
                    "AI validated {} at {:.2}: {}",
                    signal.symbol,
                    verdict.confidence,
                    verdict.reasoning
                );
                verdict.confidence
            }
            Err(e) => {
                tracing::warn!(
                    "AI validator unavailable for {} ({}), using neutral confidence {:.2}",
                    signal.symbol,
                    e,
                    NEUTRAL_AI_CONFIDENCE
                );
                NEUTRAL_AI_CONFIDENCE
            }
        }
    }

    async fn fetch_option_quote(&self, signal: &TradingSignal) -> Option<OptionQuote> {
        if !signal.asset.is_option() {
            return None;
        }
        match self.bounded(self.quotes.get_option_quote(&signal.symbol)).await {
            Ok(quote) => Some(quote),
            Err(e) => {
                tracing::warn!("Option snapshot failed for {}: {}", signal.symbol, e);
                None
            }
        }
    }

    // -----------------------------------------------------------------
    // Open-position pass
    // -----------------------------------------------------------------

    async fn open_position_pass(&self, clock: &MarketClock) {
        let open = match self.store.open_trades() {
            Ok(open) => open,
            Err(e) => {
                tracing::error!("Trade store unavailable: {}", e);
                return;
            }
        };
        if open.is_empty() {
            return;
        }

        let mut tick_clean = true;
        for mut trade in open {
            // A failure on one trade must not abort the pass; the trade
            // stays open and gets re-evaluated next tick.
            if let Err(e) = self.manage_open_trade(&mut trade, clock).await {
                tracing::error!("Error managing {} ({}): {}", trade.symbol, trade.id, e);
                self.record_error(format!("{}: {e}", trade.symbol)).await;
                tick_clean = false;
            }
        }

        if tick_clean {
            self.state.lock().await.clear_errors();
        }
    }

    async fn manage_open_trade(
        &self,
        trade: &mut ExecutedTrade,
        clock: &MarketClock,
    ) -> Result<()> {
        let price = self
            .bounded(self.quotes.get_current_price(&trade.symbol))
            .await
            .map_err(|e| anyhow!("quote lookup failed: {e}"))?;

        let signal_invalidated = match &self.invalidation {
            Some(check) => self
                .bounded(check.is_invalidated(trade.signal_id, &trade.symbol))
                .await
                .unwrap_or(false),
            None => false,
        };

        let check = {
            let state = self.state.lock().await;
            self.monitor.check(
                trade,
                &MonitorContext {
                    config: &self.config.bot,
                    state: &state,
                    current_price: price,
                    clock,
                    now: Utc::now(),
                    signal_invalidated,
                },
            )
        };

        if check.high_water_mark != trade.high_water_mark {
            trade.high_water_mark = check.high_water_mark;
            self.store.update(trade)?;
        }

        let Some(exit) = check.exit else {
            return Ok(());
        };

        let side = match trade.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        let order = self
            .bounded(self.broker.submit_order(OrderRequest {
                symbol: trade.symbol.clone(),
                side,
                qty: Some(trade.quantity),
                notional: None,
            }))
            .await?;

        trade.exit_order_id = Some(order.id.clone());
        trade.exit_reason = Some(exit.reason);
        trade.status = TradeStatus::PendingExit;
        self.store.update(trade)?;
        tracing::info!(
            "Exit order {} submitted for {} ({})",
            order.id,
            trade.symbol,
            exit.detail
        );

        if order.status == OrderStatus::Filled {
            let fill_price = order.filled_avg_price_f64().unwrap_or(price);
            self.apply_exit_fill(trade, fill_price, exit.reason).await?;
        }
        Ok(())
    }

    /// Book a confirmed exit fill: P&L on the trade, daily counters, and a
    /// breaker recompute from the new daily P&L.
    async fn apply_exit_fill(
        &self,
        trade: &mut ExecutedTrade,
        fill_price: f64,
        reason: ExitReason,
    ) -> Result<()> {
        trade.book_exit(fill_price, reason, Utc::now());
        self.store.update(trade)?;

        let realized = trade.realized_pl.unwrap_or(0.0);
        let mut state = self.state.lock().await;
        state.record_close(realized, trade.is_option());
        state.update_circuit_breaker(&self.config.bot, Utc::now());
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pending-order resolution (fills arriving between ticks)
    // -----------------------------------------------------------------

    async fn resolve_pending_orders(&self) {
        let pending_entries = self
            .store
            .with_status(TradeStatus::PendingEntry)
            .unwrap_or_default();
        for mut trade in pending_entries {
            let Some(order_id) = trade.entry_order_id.clone() else {
                continue;
            };
            match self.bounded(self.broker.get_order(&order_id)).await {
                Ok(order) if order.status == OrderStatus::Filled => {
                    if let Err(e) = self.apply_entry_fill(&mut trade, &order).await {
                        tracing::error!("Failed to apply entry fill for {}: {}", trade.id, e);
                    }
                }
                Ok(order)
                    if matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected) =>
                {
                    trade.status = TradeStatus::Cancelled;
                    self.store.update(&trade).ok();
                    tracing::warn!("Entry order {} for {} was {:?}", order_id, trade.symbol, order.status);
                }
                Ok(_) => {} // still working
                Err(e) => tracing::warn!("Order status check failed for {}: {}", order_id, e),
            }
        }

        let pending_exits = self
            .store
            .with_status(TradeStatus::PendingExit)
            .unwrap_or_default();
        for mut trade in pending_exits {
            let Some(order_id) = trade.exit_order_id.clone() else {
                continue;
            };
            match self.bounded(self.broker.get_order(&order_id)).await {
                Ok(order) if order.status == OrderStatus::Filled => {
                    // A fill without an avg price must not book at the entry
                    // price (zero P&L). Fall back to the current quote, or
                    // retry the whole resolution next tick.
                    let fill_price = match order.filled_avg_price_f64() {
                        Some(price) => price,
                        None => match self
                            .bounded(self.quotes.get_current_price(&trade.symbol))
                            .await
                        {
                            Ok(price) => price,
                            Err(e) => {
                                tracing::warn!(
                                    "Exit fill for {} has no avg price and quote lookup failed ({}), retrying next tick",
                                    trade.symbol,
                                    e
                                );
                                continue;
                            }
                        },
                    };
                    let reason = trade.exit_reason.unwrap_or(ExitReason::Manual);
                    if let Err(e) = self.apply_exit_fill(&mut trade, fill_price, reason).await {
                        tracing::error!("Failed to book exit for {}: {}", trade.id, e);
                    }
                }
                Ok(order)
                    if matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected) =>
                {
                    // Exit order went nowhere: the trade is still open and
                    // must be re-evaluated next tick.
                    trade.status = TradeStatus::Open;
                    trade.exit_order_id = None;
                    trade.exit_reason = None;
                    self.store.update(&trade).ok();
                    tracing::warn!(
                        "Exit order {} for {} was {:?}, trade back to open",
                        order_id,
                        trade.symbol,
                        order.status
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Order status check failed for {}: {}", order_id, e),
            }
        }
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    pub async fn handle_command(&self, command: TraderCommand) {
        match command {
            TraderCommand::Pause => {
                let mut state = self.state.lock().await;
                state.status = BotStatus::Paused;
                tracing::info!("Bot paused by operator");
            }
            TraderCommand::Resume => {
                let mut state = self.state.lock().await;
                state.status = BotStatus::Running;
                state.clear_errors();
                tracing::info!("Bot resumed by operator");
            }
            TraderCommand::ManualClose { trade_id } => {
                match self.store.get(trade_id) {
                    Ok(Some(mut trade)) if trade.status == TradeStatus::Open => {
                        trade.close_requested = true;
                        if let Err(e) = self.store.update(&trade) {
                            tracing::error!("Manual close flag failed for {}: {}", trade_id, e);
                        } else {
                            tracing::info!("Manual close requested for {}", trade.symbol);
                        }
                    }
                    Ok(Some(trade)) => tracing::warn!(
                        "Manual close ignored: trade {} is {:?}",
                        trade_id,
                        trade.status
                    ),
                    Ok(None) => tracing::warn!("Manual close: unknown trade {}", trade_id),
                    Err(e) => tracing::error!("Manual close lookup failed: {}", e),
                }
            }
            TraderCommand::ApproveTrade { trade_id } => {
                if let Err(e) = self.approve_trade(trade_id).await {
                    tracing::error!("Approval of {} failed: {}", trade_id, e);
                    self.record_error(e.to_string()).await;
                }
            }
            TraderCommand::RejectTrade { trade_id } => {
                self.pending_signals.lock().await.remove(&trade_id);
                match self.store.get(trade_id) {
                    Ok(Some(mut trade)) if trade.status == TradeStatus::PendingApproval => {
                        trade.status = TradeStatus::Cancelled;
                        self.store.update(&trade).ok();
                        tracing::info!("Trade {} rejected by user", trade_id);
                    }
                    _ => tracing::warn!("Reject: no pending trade {}", trade_id),
                }
            }
            TraderCommand::ResetCircuitBreaker => {
                let mut state = self.state.lock().await;
                state.circuit_breaker = CircuitBreakerLevel::None;
                state.cb_triggered_at = None;
                state.cb_trigger_reason = None;
                tracing::warn!("Circuit breaker manually reset");
            }
            TraderCommand::ResetDaily { start_equity } => {
                let mut state = self.state.lock().await;
                state.reset_daily(start_equity, &self.config.bot);
            }
            TraderCommand::Snapshot { reply } => {
                let snapshot = self.state_snapshot().await;
                reply.send(snapshot).ok();
            }
        }
    }

    /// User approved a semi-auto trade: advance the parked record through
    /// the normal gate, sizing, and submission path under its original id.
    async fn approve_trade(&self, trade_id: Uuid) -> Result<()> {
        let signal = self
            .pending_signals
            .lock()
            .await
            .remove(&trade_id)
            .ok_or_else(|| anyhow!("no pending signal for trade {}", trade_id))?;

        let Some(parked) = self.store.get(trade_id)? else {
            return Err(anyhow!("unknown trade {}", trade_id));
        };
        if parked.status != TradeStatus::PendingApproval {
            return Err(anyhow!(
                "trade {} is {:?}, not pending approval",
                trade_id,
                parked.status
            ));
        }

        let result = match self.bounded(self.broker.get_clock()).await {
            Ok(clock) => self.execute_signal(signal.clone(), &clock, Some(parked)).await,
            Err(e) => Err(e),
        };
        // An upstream failure leaves the record pending approval; restore
        // the signal so the operator can retry the approval.
        if result.is_err() {
            self.pending_signals.lock().await.insert(trade_id, signal);
        }
        result
    }

    // -----------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------

    async fn record_error(&self, msg: String) {
        let mut state = self.state.lock().await;
        state.record_error(msg, Utc::now());
    }

    /// Operational policy: a sustained error streak pauses the bot and is
    /// surfaced in the read model.
    async fn apply_error_policy(&self) {
        let mut state = self.state.lock().await;
        if state.status == BotStatus::Running
            && state.consecutive_errors >= self.config.max_consecutive_errors
        {
            state.status = BotStatus::Paused;
            tracing::error!(
                "{} consecutive errors (last: {}), pausing bot",
                state.consecutive_errors,
                state.last_error.as_deref().unwrap_or("unknown")
            );
        }
    }

    /// Bounded call to an external collaborator.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.external_call_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "external call timed out after {:?}",
                self.config.external_call_timeout()
            )),
        }
    }
}
