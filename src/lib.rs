pub mod adapters;
pub mod agent;
pub mod config;
pub mod coordination;
pub mod decision;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod portfolio;
pub mod state;
pub mod stream;

pub use agent::{AgentRegistry, AgentSpec, AgentStatus, DecisionLoop, RegistrySettings};
pub use config::AppConfig;
pub use coordination::{ShutdownSignal, StopSignal};
pub use error::{Result, TraderError};
pub use exchange::{ExchangeClient, ExchangeKind};
pub use portfolio::{PerformanceTracker, PositionLedger};
pub use state::StateCache;
pub use stream::{ConnectorState, StreamConnector};
