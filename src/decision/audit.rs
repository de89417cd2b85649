//! Per-cycle audit artifacts
//!
//! Every cycle, including skipped and aborted ones, produces one
//! `CycleRecord`. `JsonFileAuditSink` keeps them as
//! `decision_<YYYYmmdd_HHMMSS>_cycle<N>.json` files per agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::domain::{Action, TradeRecord};
use crate::error::Result;

use super::{DecisionContext, DecisionOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// State was unavailable; nothing was decided
    Skipped,
    /// Provider failed or replied with an invalid schema; nothing executed
    Aborted,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Completed => write!(f, "completed"),
            CycleStatus::Skipped => write!(f, "skipped"),
            CycleStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Validation result for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
    /// hold / wait
    NoOp,
}

/// What the exchange did with an accepted action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub filled_quantity: Option<Decimal>,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_quantity: None,
            avg_price: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: Action,
    pub verdict: Verdict,
    #[serde(default)]
    pub execution: Option<ExecutionOutcome>,
}

/// Full artifact of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub agent_id: String,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub context: Option<DecisionContext>,
    #[serde(default)]
    pub output: Option<DecisionOutput>,
    #[serde(default)]
    pub outcomes: Vec<ActionOutcome>,
    /// Trades closed this cycle, by decision or reconciliation
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
}

impl CycleRecord {
    pub fn executed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.execution.as_ref().map(|e| e.success).unwrap_or(false))
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.verdict, Verdict::Rejected { .. }))
            .count()
    }

    pub fn file_name(&self) -> String {
        format!(
            "decision_{}_cycle{}.json",
            self.started_at.format("%Y%m%d_%H%M%S"),
            self.cycle
        )
    }
}

/// Receives every cycle artifact
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &CycleRecord) -> Result<()>;
}

/// Logs a one-line summary per cycle
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: &CycleRecord) -> Result<()> {
        info!(
            agent = %record.agent_id,
            cycle = record.cycle,
            status = %record.status,
            actions = record.outcomes.len(),
            executed = record.executed(),
            rejected = record.rejected(),
            trades = record.trades.len(),
            error = record.error.as_deref().unwrap_or(""),
            "cycle audit"
        );
        Ok(())
    }
}

/// Writes one pretty JSON file per cycle under `<root>/<agent_id>/`
#[derive(Debug, Clone)]
pub struct JsonFileAuditSink {
    dir: PathBuf,
}

impl JsonFileAuditSink {
    pub fn new(root: impl AsRef<Path>, agent_id: &str) -> Self {
        Self {
            dir: root.as_ref().join(agent_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("decision_") && n.ends_with(".json"))
                .unwrap_or(false);
            if is_record {
                files.push(path);
            }
        }
        files.sort_by_key(|p| sort_key(p));
        Ok(files)
    }

    /// Most recent `n` records, oldest first. Unreadable files are skipped.
    pub async fn latest(&self, n: usize) -> Result<Vec<CycleRecord>> {
        let files = self.record_files().await?;
        let start = files.len().saturating_sub(n);
        let mut records = Vec::new();
        for path in &files[start..] {
            let parsed = tokio::fs::read(path)
                .await
                .map_err(crate::error::TraderError::from)
                .and_then(|bytes| serde_json::from_slice::<CycleRecord>(&bytes).map_err(Into::into));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable audit record"),
            }
        }
        Ok(records)
    }

    /// Delete records last modified more than `days` ago. Returns the count.
    pub async fn prune_older_than(&self, days: u64) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days * 24 * 60 * 60))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for path in self.record_files().await? {
            let modified = tokio::fs::metadata(&path).await?.modified()?;
            if modified < cutoff {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(dir = %self.dir.display(), removed, "pruned audit records");
        }
        Ok(removed)
    }
}

/// (timestamp part, cycle number) parsed from a record file name
fn sort_key(path: &Path) -> (String, u64) {
    let name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match name.rsplit_once("_cycle") {
        Some((stamp, cycle)) => (stamp.to_string(), cycle.parse().unwrap_or(0)),
        None => (name.to_string(), 0),
    }
}

#[async_trait]
impl AuditSink for JsonFileAuditSink {
    async fn record(&self, record: &CycleRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(record.file_name());
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "audit record written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn record(cycle: u64, second: u32) -> CycleRecord {
        let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, second).unwrap();
        CycleRecord {
            agent_id: "alpha".into(),
            cycle,
            started_at,
            finished_at: started_at,
            status: CycleStatus::Completed,
            error: None,
            context: None,
            output: None,
            outcomes: vec![ActionOutcome {
                action: crate::domain::Action::open("BTCUSDT", Direction::Long, dec!(100), 3),
                verdict: Verdict::Rejected {
                    reason: "leverage".into(),
                },
                execution: None,
            }],
            trades: Vec::new(),
        }
    }

    #[test]
    fn file_name_format() {
        assert_eq!(
            record(7, 5).file_name(),
            "decision_20260301_120005_cycle7.json"
        );
    }

    #[tokio::test]
    async fn writes_and_reads_back_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonFileAuditSink::new(tmp.path(), "alpha");

        for (cycle, second) in [(9, 1), (10, 1), (11, 2)] {
            sink.record(&record(cycle, second)).await.unwrap();
        }
        tokio::fs::write(sink.dir().join("decision_00000000_000000_cycle1.json"), b"{")
            .await
            .unwrap();

        let latest = sink.latest(2).await.unwrap();
        let cycles: Vec<u64> = latest.iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![10, 11]);
        assert_eq!(latest[0].rejected(), 1);
        assert_eq!(latest[0].executed(), 0);
    }

    #[tokio::test]
    async fn missing_dir_reads_as_empty_and_prune_keeps_fresh_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonFileAuditSink::new(tmp.path(), "nobody");
        assert!(sink.latest(5).await.unwrap().is_empty());

        sink.record(&record(1, 0)).await.unwrap();
        assert_eq!(sink.prune_older_than(1).await.unwrap(), 0);
        assert_eq!(sink.latest(5).await.unwrap().len(), 1);
    }
}
