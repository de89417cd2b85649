use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::BackoffConfig;
use crate::exchange::{CredentialLease, LeaseRenewal};

use super::backoff::Backoff;

/// Renewal schedule for one subscription lease.
///
/// Renewal is due at `issued_at + validity * renew_fraction`. A failed
/// renewal is retried with backoff; the lease stays usable until it expires.
#[derive(Debug, Clone)]
pub struct LeaseKeeper {
    lease: CredentialLease,
    renew_fraction: f64,
    backoff: Backoff,
    next_renewal: Instant,
}

impl LeaseKeeper {
    pub fn new(lease: CredentialLease, renew_fraction: f64, backoff: &BackoffConfig) -> Self {
        let next_renewal = lease.renew_due_at(renew_fraction);
        Self {
            lease,
            renew_fraction,
            backoff: Backoff::new(backoff),
            next_renewal,
        }
    }

    pub fn lease(&self) -> &CredentialLease {
        &self.lease
    }

    pub fn into_lease(self) -> CredentialLease {
        self.lease
    }

    pub fn next_renewal(&self) -> Instant {
        self.next_renewal
    }

    pub fn expires_at(&self) -> Instant {
        self.lease.expires_at()
    }

    pub fn is_usable(&self, now: Instant) -> bool {
        self.lease.is_valid_at(now)
    }

    /// Record a successful renewal. `AlreadyFresh` restarts validity at `now`.
    pub fn apply(&mut self, renewal: LeaseRenewal, now: Instant) {
        self.lease = match renewal {
            LeaseRenewal::Renewed(lease) => lease,
            LeaseRenewal::AlreadyFresh => {
                debug!("lease reported already fresh");
                self.lease.refreshed(now)
            }
        };
        self.backoff.reset();
        self.next_renewal = self.lease.renew_due_at(self.renew_fraction);
    }

    /// Schedule a retry after a failed renewal and return the delay.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.next_renewal = now + delay;
        delay
    }

    pub fn failed_attempts(&self) -> u32 {
        self.backoff.attempt()
    }
}
