use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use uuid::Uuid;

use crate::trade::{ExecutedTrade, TradeStatus};

/// Repository seam for executed trades. Persistence backends live outside
/// the core; the pipeline only needs lookups keyed by trade id and symbol.
pub trait TradeStore: Send + Sync {
    fn insert(&self, trade: ExecutedTrade) -> Result<()>;
    fn get(&self, id: Uuid) -> Result<Option<ExecutedTrade>>;
    fn update(&self, trade: &ExecutedTrade) -> Result<()>;
    /// All trades in the given lifecycle status.
    fn with_status(&self, status: TradeStatus) -> Result<Vec<ExecutedTrade>>;
    /// All trades currently in `Open` status.
    fn open_trades(&self) -> Result<Vec<ExecutedTrade>> {
        self.with_status(TradeStatus::Open)
    }
    /// Trades awaiting user approval (semi-auto mode).
    fn pending_approval(&self) -> Result<Vec<ExecutedTrade>> {
        self.with_status(TradeStatus::PendingApproval)
    }
    /// Whether any non-terminal trade already holds this symbol.
    fn holds_symbol(&self, symbol: &str) -> Result<bool>;
    /// Most recent trades, newest first, for the dashboard read model.
    fn recent(&self, limit: usize) -> Result<Vec<ExecutedTrade>>;
}

/// In-memory store used by tests and by the agent when no persistence
/// backend is wired in.
#[derive(Default)]
pub struct MemoryTradeStore {
    trades: Mutex<HashMap<Uuid, ExecutedTrade>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TradeStore for MemoryTradeStore {
    fn insert(&self, trade: ExecutedTrade) -> Result<()> {
        let mut trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        trades.insert(trade.id, trade);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<ExecutedTrade>> {
        let trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        Ok(trades.get(&id).cloned())
    }

    fn update(&self, trade: &ExecutedTrade) -> Result<()> {
        let mut trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        if !trades.contains_key(&trade.id) {
            return Err(anyhow!("unknown trade {}", trade.id));
        }
        trades.insert(trade.id, trade.clone());
        Ok(())
    }

    fn with_status(&self, status: TradeStatus) -> Result<Vec<ExecutedTrade>> {
        let trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        Ok(trades
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    fn holds_symbol(&self, symbol: &str) -> Result<bool> {
        let trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        Ok(trades
            .values()
            .any(|t| t.symbol == symbol && !t.status.is_terminal()))
    }

    fn recent(&self, limit: usize) -> Result<Vec<ExecutedTrade>> {
        let trades = self.trades.lock().map_err(|_| anyhow!("store poisoned"))?;
        let mut all: Vec<ExecutedTrade> = trades.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }
}
