use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// 24h market view of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub instrument: String,
    pub last_price: Decimal,
    /// 24h price change in percent
    pub change_24h_pct: Decimal,
    pub quote_volume_24h: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Market data keyed by instrument
pub type MarketBundle = BTreeMap<String, MarketSnapshot>;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Snapshot for each requested instrument. Unknown instruments are
    /// omitted rather than failing the whole request.
    async fn market_snapshot(&self, instruments: &[String]) -> Result<MarketBundle>;
}
