pub mod factory;
mod traits;

pub use factory::{build_exchange_client, build_venue, build_venue_for, Venue};
pub use traits::{
    parse_exchange_kind, CredentialLease, EventSubscription, ExchangeClient, ExchangeKind,
    LeaseRenewal, StreamEvent,
};
