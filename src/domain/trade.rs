use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Direction, PositionKey};

/// Why a position left the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Closed by an executed close action
    Decision,
    /// Disappeared from the exchange without a close action (manual, liquidation, stop)
    External,
}

/// Closed trade. Append-only.
///
/// `pnl_usd` is `None` when neither the ledger nor the exchange could attribute
/// a figure; such records are kept for accounting but excluded from statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub quantity: Decimal,
    pub leverage: u32,
    pub pnl_usd: Option<Decimal>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: DateTime<Utc>,
    /// Entry was seeded from an exchange snapshot, so `opened_at` is approximate
    #[serde(default)]
    pub recovered: bool,
    pub close_reason: CloseReason,
}

impl TradeRecord {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.instrument.clone(), self.direction)
    }

    pub fn is_win(&self) -> bool {
        matches!(self.pnl_usd, Some(p) if p > Decimal::ZERO)
    }

    pub fn is_loss(&self) -> bool {
        matches!(self.pnl_usd, Some(p) if p < Decimal::ZERO)
    }

    pub fn holding_secs(&self) -> Option<i64> {
        self.opened_at
            .map(|opened| (self.closed_at - opened).num_seconds().max(0))
    }
}
