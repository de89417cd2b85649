use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::{
    AccountSnapshot, CloseRequest, ExecutionReport, OpenRequest, OrderUpdate, PositionSnapshot,
    StreamSnapshot,
};
use crate::error::{Result, TraderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Binance,
    Paper,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Paper => "paper",
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" | "binance_futures" | "bn" => Ok(Self::Binance),
            "paper" | "sim" => Ok(Self::Paper),
            _ => Err("invalid exchange; expected binance|paper"),
        }
    }
}

pub fn parse_exchange_kind(raw: &str) -> Result<ExchangeKind> {
    ExchangeKind::from_str(raw).map_err(|e| TraderError::Config(e.to_string()))
}

/// Time-bounded credential scoping a push subscription to one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialLease {
    pub token: String,
    pub issued_at: Instant,
    pub validity: Duration,
    pub revoked: bool,
}

impl CredentialLease {
    pub fn new(token: impl Into<String>, validity: Duration) -> Self {
        Self {
            token: token.into(),
            issued_at: Instant::now(),
            validity,
            revoked: false,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.validity
    }

    /// Usable at `now`: not revoked and strictly before expiry.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        !self.revoked && now < self.expires_at()
    }

    /// When renewal is due, as a fraction of the validity window.
    pub fn renew_due_at(&self, fraction: f64) -> Instant {
        let fraction = fraction.clamp(0.0, 1.0);
        self.issued_at + self.validity.mul_f64(fraction)
    }

    /// Same token, validity restarted from `now`.
    pub fn refreshed(&self, now: Instant) -> Self {
        Self {
            token: self.token.clone(),
            issued_at: now,
            validity: self.validity,
            revoked: false,
        }
    }
}

/// Outcome of a successful renewal call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseRenewal {
    /// Venue confirmed the renewal; validity restarts at the returned lease
    Renewed(CredentialLease),
    /// Venue reports the lease is still fresh; treated as a renewal
    AlreadyFresh,
}

/// Event pushed by an account subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full account/position state; replaces the cached snapshot
    Account(StreamSnapshot),
    Order(OrderUpdate),
}

/// Live push subscription. Ends (yields `None`) when the transport closes.
pub struct EventSubscription {
    rx: mpsc::Receiver<Result<StreamEvent>>,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    /// Wrap a channel fed by a transport task owned by the subscription.
    pub fn new(rx: mpsc::Receiver<Result<StreamEvent>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Wrap a channel whose producer is managed elsewhere.
    pub fn from_channel(rx: mpsc::Receiver<Result<StreamEvent>>) -> Self {
        Self { rx, task: None }
    }

    pub async fn next(&mut self) -> Option<Result<StreamEvent>> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("owns_task", &self.task.is_some())
            .finish()
    }
}

/// Capability interface every venue implements.
///
/// The stream connector and decision loop depend only on this trait.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    async fn get_account(&self) -> Result<AccountSnapshot>;

    /// Open positions (non-zero quantity only)
    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>>;

    async fn open_position(&self, request: &OpenRequest) -> Result<ExecutionReport>;

    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutionReport>;

    async fn set_leverage(&self, instrument: &str, leverage: u32) -> Result<()>;

    /// Last traded / mark price, used to size opens
    async fn get_price(&self, instrument: &str) -> Result<rust_decimal::Decimal>;

    async fn acquire_lease(&self) -> Result<CredentialLease>;

    async fn renew_lease(&self, lease: &CredentialLease) -> Result<LeaseRenewal>;

    async fn revoke_lease(&self, lease: &CredentialLease) -> Result<()>;

    async fn subscribe(&self, lease: &CredentialLease) -> Result<EventSubscription>;
}
