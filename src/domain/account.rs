use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Position direction (hedge-mode side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            other => Err(format!("invalid direction '{}'", other)),
        }
    }
}

/// Ledger/snapshot key: one open position per (instrument, direction)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub instrument: String,
    pub direction: Direction,
}

impl PositionKey {
    pub fn new(instrument: impl Into<String>, direction: Direction) -> Self {
        Self {
            instrument: instrument.into(),
            direction,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instrument, self.direction)
    }
}

/// Where a snapshot was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Pushed by the user-data stream
    Stream,
    /// A previous on-demand fetch still inside its TTL
    Cache,
    /// Fetched on demand for this read
    Fetch,
}

impl std::fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotSource::Stream => write!(f, "stream"),
            SnapshotSource::Cache => write!(f, "cache"),
            SnapshotSource::Fetch => write!(f, "fetch"),
        }
    }
}

/// Point-in-time account balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub as_of: DateTime<Utc>,
    pub source: SnapshotSource,
}

impl AccountSnapshot {
    pub fn with_source(mut self, source: SnapshotSource) -> Self {
        self.source = source;
        self
    }

    /// Wallet balance plus unrealized PnL
    pub fn equity(&self) -> Decimal {
        self.total_balance + self.unrealized_pnl
    }
}

/// Point-in-time exchange position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub instrument: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.instrument.clone(), self.direction)
    }

    /// Notional at mark divided by leverage
    pub fn margin_used(&self) -> Decimal {
        let leverage = Decimal::from(self.leverage.max(1));
        self.quantity * self.mark_price / leverage
    }
}

/// Sort positions into the stable order every read returns.
pub fn sort_positions(positions: &mut [PositionSnapshot]) {
    positions.sort_by(|a, b| {
        a.instrument
            .cmp(&b.instrument)
            .then(a.direction.cmp(&b.direction))
    });
}

/// Account and positions as one unit, swapped atomically by stream updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub account: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
}

impl StreamSnapshot {
    pub fn new(account: AccountSnapshot, mut positions: Vec<PositionSnapshot>) -> Self {
        sort_positions(&mut positions);
        Self {
            account: account.with_source(SnapshotSource::Stream),
            positions,
        }
    }
}
