//! Per-agent JSON state: closed trades and open ledger entries
//!
//! Layout: `<data_dir>/<agent_id>/trades.json` and `ledger.json`. Files are
//! replaced through a temp file + rename so a crash never leaves a torn file.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::TradeRecord;
use crate::error::{Result, TraderError};
use crate::portfolio::LedgerEntry;

const TRADES_FILE: &str = "trades.json";
const LEDGER_FILE: &str = "ledger.json";

#[derive(Debug, Clone)]
pub struct AgentStore {
    dir: PathBuf,
}

impl AgentStore {
    pub fn new(data_dir: impl AsRef<Path>, agent_id: &str) -> Self {
        Self {
            dir: data_dir.as_ref().join(agent_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        load_json(&self.dir.join(TRADES_FILE)).await
    }

    pub async fn save_trades(&self, trades: &[TradeRecord]) -> Result<()> {
        save_json(&self.dir.join(TRADES_FILE), &trades).await
    }

    pub async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        load_json(&self.dir.join(LEDGER_FILE)).await
    }

    pub async fn save_ledger(&self, entries: &[LedgerEntry]) -> Result<()> {
        save_json(&self.dir.join(LEDGER_FILE), &entries).await
    }
}

/// Missing file reads as empty
async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(TraderError::Io(e)),
    };
    serde_json::from_str(&body).map_err(TraderError::from)
}

async fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(TraderError::Internal("invalid state path".to_string()));
    };
    tokio::fs::create_dir_all(parent).await?;
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CloseReason, Direction};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(pnl: rust_decimal::Decimal) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            instrument: "BTCUSDT".into(),
            direction: Direction::Long,
            entry_price: Some(dec!(100)),
            exit_price: Some(dec!(105)),
            quantity: dec!(2),
            leverage: 10,
            pnl_usd: Some(pnl),
            opened_at: Some(Utc::now()),
            closed_at: Utc::now(),
            recovered: false,
            close_reason: CloseReason::Decision,
        }
    }

    #[tokio::test]
    async fn fresh_store_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path(), "alpha");
        assert!(store.load_trades().await.unwrap().is_empty());
        assert!(store.load_ledger().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saves_replace_previous_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path(), "alpha");

        store.save_trades(&[trade(dec!(100))]).await.unwrap();
        store
            .save_trades(&[trade(dec!(100)), trade(dec!(-5))])
            .await
            .unwrap();
        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].pnl_usd, Some(dec!(-5)));

        let entry = LedgerEntry::new("ETHUSDT", Direction::Short, dec!(1), dec!(3000), 3);
        store.save_ledger(&[entry.clone()]).await.unwrap();
        assert_eq!(store.load_ledger().await.unwrap(), vec![entry]);

        assert!(!store.dir().join("trades.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AgentStore::new(tmp.path(), "alpha");
        tokio::fs::create_dir_all(store.dir()).await.unwrap();
        tokio::fs::write(store.dir().join("trades.json"), b"[{").await.unwrap();
        assert!(matches!(store.load_trades().await, Err(TraderError::Json(_))));
    }
}
