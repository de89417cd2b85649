//! Persistence for crash recovery
//!
//! Trade history and ledger state survive restarts so closed-trade
//! accounting is never lost.

pub mod store;

pub use store::AgentStore;
