//! Account push stream: lease keeping, reconnects, event dispatch

pub mod backoff;
pub mod connector;
pub mod lease;

pub use backoff::Backoff;
pub use connector::{ConnectorHandle, ConnectorState, StreamConnector};
pub use lease::LeaseKeeper;
