pub mod ledger;
pub mod tracker;

pub use ledger::{attributed_pnl, CloseFill, LedgerEntry, PositionLedger, ReconcileReport};
pub use tracker::{PerformanceSummary, PerformanceTracker, TradeStats};
