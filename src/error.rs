use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Direction, PositionKey};

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum TraderError {
    // Network errors: retried with backoff, never fatal
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Exchange rejected request ({code}): {message}")]
    ExchangeRejected { code: i64, message: String },

    // Data availability errors
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    // Lease errors
    #[error("Lease expired")]
    LeaseExpired,

    #[error("Lease revoked")]
    LeaseRevoked,

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Decision provider returned an invalid response: {0}")]
    InvalidDecision(String),

    // Configuration errors: fatal only at startup
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // Registry errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already exists: {0}")]
    AgentExists(String),

    #[error("Agent {0} is running")]
    AgentRunning(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TraderError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            TraderError::TransientNetwork(_)
            | TraderError::WebSocket(_)
            | TraderError::Timeout { .. }
            | TraderError::LeaseExpired => true,
            TraderError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TraderError::ExchangeRejected { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }

    /// Errors that must stop an agent from starting.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, TraderError::Config(_) | TraderError::ConfigSource(_))
    }
}

/// Result type alias for TraderError
pub type Result<T> = std::result::Result<T, TraderError>;

/// Reasons a single action is rejected before execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{instrument} already has an open {direction} position")]
    DuplicateOpen {
        instrument: String,
        direction: Direction,
    },

    #[error("leverage {requested}x exceeds the {cap}x cap for {instrument}")]
    LeverageCap {
        instrument: String,
        requested: u32,
        cap: u32,
    },

    #[error("open positions would reach {resulting}, max is {max}")]
    MaxPositions { resulting: usize, max: usize },

    #[error("position value {requested} exceeds the {cap} cap for {instrument}")]
    NotionalCap {
        instrument: String,
        requested: Decimal,
        cap: Decimal,
    },

    #[error("malformed action for {instrument}: {reason}")]
    Malformed { instrument: String, reason: String },
}

impl From<ValidationError> for TraderError {
    fn from(err: ValidationError) -> Self {
        TraderError::Validation(err.to_string())
    }
}

/// Ledger inconsistencies that are logged but never fabricate PnL
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("ledger already holds {0}")]
    AlreadyOpen(PositionKey),

    #[error("invalid ledger entry for {key}: {reason}")]
    InvalidEntry { key: PositionKey, reason: String },

    #[error("entry price for {0} is zero")]
    ZeroEntryPrice(PositionKey),

    #[error("exit price {exit} is not positive for {key}")]
    BadExitPrice { key: PositionKey, exit: Decimal },
}

impl From<LedgerError> for TraderError {
    fn from(err: LedgerError) -> Self {
        TraderError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TraderError::TransientNetwork("reset".into()).is_transient());
        assert!(TraderError::Timeout {
            operation: "renew".into(),
            elapsed_ms: 10_000
        }
        .is_transient());
        assert!(TraderError::ExchangeRejected {
            code: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!TraderError::Validation("bad".into()).is_transient());
        assert!(!TraderError::Config("missing key".into()).is_transient());
    }

    #[test]
    fn validation_error_converts() {
        let err: TraderError = ValidationError::MaxPositions {
            resulting: 4,
            max: 3,
        }
        .into();
        assert!(matches!(err, TraderError::Validation(_)));
        assert!(err.to_string().contains("max is 3"));
    }
}
