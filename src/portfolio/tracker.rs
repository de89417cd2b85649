//! Append-only trade history and derived statistics
//!
//! Statistics are computed on demand over the most recent N records. Records
//! with unknown PnL stay in the history but are excluded from every metric.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::domain::TradeRecord;

/// Win/loss statistics over a set of trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub avg_win: Decimal,
    /// Mean absolute loss
    pub avg_loss: Decimal,
    /// avg_win / avg_loss; `None` when there are no losses
    pub pnl_ratio: Option<Decimal>,
    /// mean / population std-dev of PnL; `None` below 2 trades or at zero variance
    pub sharpe_like: Option<f64>,
    pub total_pnl: Decimal,
}

impl TradeStats {
    pub fn from_pnls(pnls: &[Decimal]) -> Self {
        let trades = pnls.len();
        if trades == 0 {
            return Self::default();
        }

        let winners: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losers: Vec<Decimal> = pnls
            .iter()
            .copied()
            .filter(|p| *p < Decimal::ZERO)
            .map(|p| p.abs())
            .collect();

        let avg_win = mean(&winners).unwrap_or(Decimal::ZERO);
        let avg_loss = mean(&losers).unwrap_or(Decimal::ZERO);
        let pnl_ratio = if avg_loss.is_zero() {
            None
        } else {
            Some(avg_win / avg_loss)
        };

        Self {
            trades,
            wins: winners.len(),
            losses: losers.len(),
            win_rate: winners.len() as f64 / trades as f64,
            avg_win,
            avg_loss,
            pnl_ratio,
            sharpe_like: sharpe_like(pnls),
            total_pnl: pnls.iter().copied().sum(),
        }
    }
}

fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some(sum / Decimal::from(values.len()))
}

fn sharpe_like(pnls: &[Decimal]) -> Option<f64> {
    if pnls.len() < 2 {
        return None;
    }
    let values: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev <= f64::EPSILON {
        None
    } else {
        Some(mean / std_dev)
    }
}

/// Aggregate feedback handed to the decision provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Records considered (known and unknown PnL)
    pub window: usize,
    /// Records skipped because their PnL could not be attributed
    pub unknown_pnl: usize,
    #[serde(flatten)]
    pub overall: TradeStats,
    pub per_instrument: BTreeMap<String, TradeStats>,
    /// Instrument with the highest total PnL in the window
    pub best_instrument: Option<String>,
    pub worst_instrument: Option<String>,
}

impl PerformanceSummary {
    pub fn from_records(records: &[TradeRecord]) -> Self {
        let known: Vec<(&str, Decimal)> = records
            .iter()
            .filter_map(|r| r.pnl_usd.map(|p| (r.instrument.as_str(), p)))
            .collect();

        let pnls: Vec<Decimal> = known.iter().map(|(_, p)| *p).collect();

        let mut grouped: BTreeMap<String, Vec<Decimal>> = BTreeMap::new();
        for (instrument, pnl) in &known {
            grouped.entry(instrument.to_string()).or_default().push(*pnl);
        }
        let per_instrument: BTreeMap<String, TradeStats> = grouped
            .into_iter()
            .map(|(instrument, pnls)| (instrument, TradeStats::from_pnls(&pnls)))
            .collect();

        let best_instrument = per_instrument
            .iter()
            .max_by(|a, b| a.1.total_pnl.cmp(&b.1.total_pnl))
            .map(|(k, _)| k.clone());
        let worst_instrument = per_instrument
            .iter()
            .min_by(|a, b| a.1.total_pnl.cmp(&b.1.total_pnl))
            .map(|(k, _)| k.clone());

        Self {
            window: records.len(),
            unknown_pnl: records.len() - known.len(),
            overall: TradeStats::from_pnls(&pnls),
            per_instrument,
            best_instrument,
            worst_instrument,
        }
    }

    pub fn total_trades(&self) -> usize {
        self.overall.trades
    }
}

/// Per-agent trade history
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    records: RwLock<Vec<TradeRecord>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<TradeRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn append(&self, record: TradeRecord) {
        self.records.write().await.push(record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<TradeRecord> {
        self.records.read().await.clone()
    }

    /// Most recent `n` records, oldest first
    pub async fn recent(&self, n: usize) -> Vec<TradeRecord> {
        let records = self.records.read().await;
        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }

    pub async fn summary(&self, window: usize) -> PerformanceSummary {
        let records = self.records.read().await;
        let start = records.len().saturating_sub(window);
        PerformanceSummary::from_records(&records[start..])
    }
}
