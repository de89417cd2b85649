//! Trading agents
//!
//! - `DecisionLoop`: one agent's periodic decide/validate/execute cycle
//! - `validation`: risk checks applied to a provider batch
//! - `AgentRegistry`: owns agents and their running tasks

pub mod decision_loop;
pub mod registry;
pub mod validation;

pub use decision_loop::{
    AgentState, Collaborators, CycleOutcome, CycleSummary, DecisionLoop, LoopSettings,
};
pub use registry::{AgentRegistry, AgentSpec, AgentStatus, RegistrySettings};
pub use validation::validate_batch;
