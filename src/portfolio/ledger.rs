//! Internal record of open positions, used for PnL attribution
//!
//! Independent of exchange snapshots: an entry is created by an executed
//! open and consumed by an executed close, which emits exactly one
//! `TradeRecord`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{CloseReason, Direction, PositionKey, PositionSnapshot, TradeRecord};
use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub instrument: String,
    pub direction: Direction,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub opened_at: DateTime<Utc>,
    /// Seeded from an exchange snapshot rather than an executed open
    #[serde(default)]
    pub recovered: bool,
}

impl LedgerEntry {
    pub fn new(
        instrument: impl Into<String>,
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
        leverage: u32,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            direction,
            quantity,
            entry_price,
            leverage,
            opened_at: Utc::now(),
            recovered: false,
        }
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.instrument.clone(), self.direction)
    }

    fn recovered_from(snapshot: &PositionSnapshot) -> Self {
        Self {
            instrument: snapshot.instrument.clone(),
            direction: snapshot.direction,
            quantity: snapshot.quantity,
            entry_price: snapshot.entry_price,
            leverage: snapshot.leverage.max(1),
            opened_at: Utc::now(),
            recovered: true,
        }
    }

    fn check(&self) -> Result<(), LedgerError> {
        let reason = if self.quantity <= Decimal::ZERO {
            Some("quantity must be positive")
        } else if self.leverage < 1 {
            Some("leverage must be at least 1")
        } else if self.entry_price <= Decimal::ZERO {
            Some("entry price must be positive")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(LedgerError::InvalidEntry {
                key: self.key(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Attributed PnL for closing `entry` at `exit_price`.
///
/// `(quantity * entry) * change% * leverage`, where change% is
/// `(exit - entry) / entry` for longs and its negation for shorts.
pub fn attributed_pnl(entry: &LedgerEntry, exit_price: Decimal) -> Result<Decimal, LedgerError> {
    if entry.entry_price.is_zero() {
        return Err(LedgerError::ZeroEntryPrice(entry.key()));
    }
    if exit_price <= Decimal::ZERO {
        return Err(LedgerError::BadExitPrice {
            key: entry.key(),
            exit: exit_price,
        });
    }
    let notional = entry.quantity * entry.entry_price;
    let change = (exit_price - entry.entry_price) / entry.entry_price * entry.direction.sign();
    Ok(notional * change * Decimal::from(entry.leverage))
}

/// How a position left the exchange, as far as we know it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseFill {
    pub exit_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    /// Exchange-reported figure, used only when the ledger has no entry
    pub realized_pnl: Option<Decimal>,
}

/// Outcome of comparing the ledger with exchange positions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Exchange positions the ledger did not know about, now seeded
    pub seeded: Vec<PositionKey>,
    /// Ledger entries with no exchange position behind them
    pub missing: Vec<PositionKey>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.seeded.is_empty() && self.missing.is_empty()
    }
}

/// Per-agent ledger; every mutation is serialized through one lock.
#[derive(Debug, Default)]
pub struct PositionLedger {
    entries: Mutex<BTreeMap<PositionKey, LedgerEntry>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Invalid entries are skipped.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            match entry.check() {
                Ok(()) => {
                    map.insert(entry.key(), entry);
                }
                Err(e) => warn!(error = %e, "skipping persisted ledger entry"),
            }
        }
        Self {
            entries: Mutex::new(map),
        }
    }

    pub async fn open(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        entry.check()?;
        let key = entry.key();
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(LedgerError::AlreadyOpen(key));
        }
        info!(position = %key, qty = %entry.quantity, price = %entry.entry_price, leverage = entry.leverage, "ledger open");
        entries.insert(key, entry);
        Ok(())
    }

    /// Remove the entry for `key` and emit its trade record.
    ///
    /// Without an entry the exchange figure in `fill` is used; failing that
    /// PnL is left unknown.
    pub async fn close(&self, key: &PositionKey, fill: CloseFill, reason: CloseReason) -> TradeRecord {
        let entry = self.entries.lock().await.remove(key);
        let closed_at = Utc::now();

        match entry {
            Some(entry) => {
                let pnl = match fill.exit_price.map(|exit| attributed_pnl(&entry, exit)) {
                    Some(Ok(pnl)) => Some(pnl),
                    Some(Err(e)) => {
                        warn!(position = %key, error = %e, "cannot attribute pnl from ledger");
                        fill.realized_pnl
                    }
                    None => {
                        warn!(position = %key, "close without exit price");
                        fill.realized_pnl
                    }
                };
                info!(position = %key, pnl = ?pnl, recovered = entry.recovered, "ledger close");

                TradeRecord {
                    id: Uuid::new_v4(),
                    instrument: entry.instrument,
                    direction: entry.direction,
                    entry_price: Some(entry.entry_price),
                    exit_price: fill.exit_price,
                    quantity: fill.quantity.unwrap_or(entry.quantity),
                    leverage: entry.leverage,
                    pnl_usd: pnl,
                    opened_at: Some(entry.opened_at),
                    closed_at,
                    recovered: entry.recovered,
                    close_reason: reason,
                }
            }
            None => {
                warn!(
                    position = %key,
                    exchange_pnl = ?fill.realized_pnl,
                    "ledger inconsistency: close without a ledger entry"
                );
                TradeRecord {
                    id: Uuid::new_v4(),
                    instrument: key.instrument.clone(),
                    direction: key.direction,
                    entry_price: None,
                    exit_price: fill.exit_price,
                    quantity: fill.quantity.unwrap_or(Decimal::ZERO),
                    leverage: 1,
                    pnl_usd: fill.realized_pnl,
                    opened_at: None,
                    closed_at,
                    recovered: false,
                    close_reason: reason,
                }
            }
        }
    }

    /// Seed entries for exchange positions the ledger does not hold.
    pub async fn seed_recovered(&self, positions: &[PositionSnapshot]) -> Vec<PositionKey> {
        let mut entries = self.entries.lock().await;
        let mut seeded = Vec::new();
        for position in positions {
            let key = position.key();
            if entries.contains_key(&key) {
                continue;
            }
            let entry = LedgerEntry::recovered_from(position);
            if let Err(e) = entry.check() {
                warn!(position = %key, error = %e, "cannot seed position");
                continue;
            }
            info!(position = %key, price = %entry.entry_price, "seeded recovered ledger entry");
            entries.insert(key.clone(), entry);
            seeded.push(key);
        }
        seeded
    }

    /// Seed unknown exchange positions and report entries the exchange no
    /// longer holds. Missing entries are left in place for the caller to close.
    pub async fn reconcile(&self, positions: &[PositionSnapshot]) -> ReconcileReport {
        let seeded = self.seed_recovered(positions).await;
        let entries = self.entries.lock().await;
        let missing = entries
            .keys()
            .filter(|key| !positions.iter().any(|p| p.key() == **key))
            .cloned()
            .collect();
        ReconcileReport { seeded, missing }
    }

    pub async fn contains(&self, key: &PositionKey) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn get(&self, key: &PositionKey) -> Option<LedgerEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
