//! Collaborators of the decision cycle
//!
//! - `DecisionProvider`: turns a context into actions
//! - `MarketDataSource` / `CandidatePool`: what goes into the context
//! - `AuditSink`: receives the full artifact of every cycle

pub mod audit;
pub mod candidates;
pub mod http_provider;
pub mod market;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RiskConfig;
use crate::domain::{AccountSnapshot, Action, PositionSnapshot, TradeRecord};
use crate::error::Result;
use crate::portfolio::PerformanceSummary;

pub use audit::{AuditSink, CycleRecord, CycleStatus, JsonFileAuditSink, LogAuditSink};
pub use candidates::{normalize_instrument, CandidatePool, HttpCandidatePool, StaticCandidatePool};
pub use http_provider::HttpDecisionProvider;
pub use market::{MarketBundle, MarketDataSource, MarketSnapshot};

/// Risk limits the provider is asked to respect (and validation enforces)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_open_positions: usize,
    pub default_leverage_cap: u32,
    pub leverage_caps: HashMap<String, u32>,
    /// Open notional may reach this multiple of equity (plus 1%)
    pub default_notional_cap: Decimal,
    pub notional_caps: HashMap<String, Decimal>,
    pub require_protection: bool,
}

impl From<&RiskConfig> for RiskLimits {
    fn from(risk: &RiskConfig) -> Self {
        Self {
            max_open_positions: risk.max_open_positions,
            default_leverage_cap: risk.default_leverage_cap,
            leverage_caps: by_instrument(&risk.leverage_caps),
            default_notional_cap: risk.default_notional_cap,
            notional_caps: by_instrument(&risk.notional_caps),
            require_protection: risk.require_protection,
        }
    }
}

fn by_instrument<V: Copy>(caps: &HashMap<String, V>) -> HashMap<String, V> {
    caps.iter()
        .map(|(instrument, cap)| (normalize_instrument(instrument), *cap))
        .collect()
}

impl RiskLimits {
    pub fn leverage_cap(&self, instrument: &str) -> u32 {
        self.leverage_caps
            .get(&normalize_instrument(instrument))
            .copied()
            .unwrap_or(self.default_leverage_cap)
    }

    /// Largest notional an open may carry at the given equity, tolerance included.
    pub fn max_notional(&self, instrument: &str, equity: Decimal) -> Decimal {
        let multiple = self
            .notional_caps
            .get(&normalize_instrument(instrument))
            .copied()
            .unwrap_or(self.default_notional_cap);
        let cap = equity * multiple;
        cap + cap * Decimal::new(1, 2)
    }
}

/// Everything the provider sees for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub agent_id: String,
    pub cycle: u64,
    pub generated_at: DateTime<Utc>,
    pub account: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub market: MarketBundle,
    pub candidates: Vec<String>,
    pub performance: PerformanceSummary,
    pub recent_trades: Vec<TradeRecord>,
    pub limits: RiskLimits,
}

/// Provider reply: free-form reasoning plus ordered actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    #[serde(default)]
    pub reasoning: String,
    pub actions: Vec<Action>,
}

/// External decision maker (model, rules engine, human)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    /// Returns actions in the order the provider proposes them, or fails.
    /// A schema-invalid reply is an `InvalidDecision` error.
    async fn decide(&self, context: &DecisionContext) -> Result<DecisionOutput>;
}
