//! Coordination primitives for agent lifecycles
//!
//! - Stop flags shared between the registry and agent tasks
//! - OS signal handling for process shutdown

pub mod shutdown;

pub use shutdown::{wait_for_os_signal, ShutdownSignal, StopSignal};
