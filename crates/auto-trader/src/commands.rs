use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use bot_core::{BotState, ExecutedTrade};

/// Command surface exposed to the UI/API layer. Commands are serialized
/// through the orchestrator's channel so every mutation goes through the
/// single writer.
pub enum TraderCommand {
    Pause,
    Resume,
    /// Flag a trade for closure; the monitor picks it up as a kill switch.
    ManualClose { trade_id: Uuid },
    /// Approve a semi-auto trade awaiting confirmation.
    ApproveTrade { trade_id: Uuid },
    RejectTrade { trade_id: Uuid },
    /// Manual circuit-breaker reset (operator intervention).
    ResetCircuitBreaker,
    /// Daily-limit reset, normally fired automatically at market open.
    ResetDaily { start_equity: f64 },
    Snapshot { reply: oneshot::Sender<StateSnapshot> },
}

/// Read model for dashboards: current bot state plus recent trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: BotState,
    pub recent_trades: Vec<ExecutedTrade>,
}
