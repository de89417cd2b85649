use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, TraderError};

/// Used when neither configuration nor a pool endpoint names any instrument
pub const DEFAULT_INSTRUMENTS: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT",
];

/// Upper-case and append the USDT quote when missing
pub fn normalize_instrument(raw: &str) -> String {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.ends_with("USDT") {
        symbol
    } else {
        format!("{}USDT", symbol)
    }
}

fn dedup_normalized<I: IntoIterator<Item = S>, S: AsRef<str>>(items: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if item.as_ref().trim().is_empty() {
            continue;
        }
        let symbol = normalize_instrument(item.as_ref());
        if !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

/// Supplies the instrument universe for a cycle
#[async_trait]
pub trait CandidatePool: Send + Sync {
    async fn candidates(&self) -> Result<Vec<String>>;
}

/// Fixed list from configuration
#[derive(Debug, Clone)]
pub struct StaticCandidatePool {
    instruments: Vec<String>,
}

impl StaticCandidatePool {
    pub fn new<I: IntoIterator<Item = S>, S: AsRef<str>>(instruments: I) -> Self {
        let instruments = dedup_normalized(instruments);
        let instruments = if instruments.is_empty() {
            dedup_normalized(DEFAULT_INSTRUMENTS.iter())
        } else {
            instruments
        };
        Self { instruments }
    }
}

#[async_trait]
impl CandidatePool for StaticCandidatePool {
    async fn candidates(&self) -> Result<Vec<String>> {
        Ok(self.instruments.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PoolResponse {
    Symbols(Vec<String>),
    Wrapped {
        #[serde(default = "default_success")]
        success: bool,
        data: PoolData,
    },
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PoolData {
    coins: Vec<PoolCoin>,
}

#[derive(Debug, Deserialize)]
struct PoolCoin {
    pair: String,
    #[serde(default = "default_success")]
    is_available: bool,
}

fn parse_pool_response(body: &str) -> Result<Vec<String>> {
    let response: PoolResponse = serde_json::from_str(body)?;
    let symbols = match response {
        PoolResponse::Symbols(symbols) => dedup_normalized(symbols),
        PoolResponse::Wrapped { success, data } => {
            if !success {
                return Err(TraderError::DataUnavailable(
                    "candidate pool reported failure".to_string(),
                ));
            }
            dedup_normalized(data.coins.into_iter().filter(|c| c.is_available).map(|c| c.pair))
        }
    };
    if symbols.is_empty() {
        return Err(TraderError::DataUnavailable(
            "candidate pool returned no symbols".to_string(),
        ));
    }
    Ok(symbols)
}

/// Pool fetched from an HTTP endpoint.
///
/// Falls back to the last good list, then to the configured static list.
pub struct HttpCandidatePool {
    http: Client,
    url: String,
    fallback: StaticCandidatePool,
    last_good: RwLock<Option<Vec<String>>>,
}

impl HttpCandidatePool {
    pub fn new(url: impl Into<String>, fallback: StaticCandidatePool) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TraderError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
            fallback,
            last_good: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let response = self.http.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TraderError::TransientNetwork(format!(
                "candidate pool http {}",
                status
            )));
        }
        let body = response.text().await?;
        parse_pool_response(&body)
    }
}

#[async_trait]
impl CandidatePool for HttpCandidatePool {
    async fn candidates(&self) -> Result<Vec<String>> {
        match self.fetch().await {
            Ok(symbols) => {
                debug!(count = symbols.len(), "candidate pool fetched");
                *self.last_good.write().await = Some(symbols.clone());
                Ok(symbols)
            }
            Err(e) => {
                if let Some(cached) = self.last_good.read().await.clone() {
                    warn!(error = %e, "candidate pool fetch failed; using last good list");
                    return Ok(cached);
                }
                warn!(error = %e, "candidate pool fetch failed; using static list");
                self.fallback.candidates().await
            }
        }
    }
}
