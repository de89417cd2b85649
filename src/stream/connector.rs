//! Push-subscription state machine for one agent's account stream
//!
//! Idle -> Leasing -> Connecting -> Subscribed -> Degraded -> Connecting ...
//! and finally Closing -> Closed once stopped. Nothing here is fatal: while
//! not subscribed the state cache serves from its fetch fallback.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::coordination::StopSignal;
use crate::domain::OrderUpdate;
use crate::error::{Result, TraderError};
use crate::exchange::{CredentialLease, EventSubscription, ExchangeClient, StreamEvent};
use crate::state::StateCache;

use super::backoff::Backoff;
use super::lease::LeaseKeeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Idle,
    Leasing,
    Connecting,
    Subscribed,
    Degraded,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Leasing => "leasing",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Subscribed => "subscribed",
            ConnectorState::Degraded => "degraded",
            ConnectorState::Closing => "closing",
            ConnectorState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Why a subscribed session ended
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    Disconnected(String),
    LeaseLost,
}

pub struct StreamConnector {
    agent_id: String,
    exchange: Arc<dyn ExchangeClient>,
    cache: Arc<StateCache>,
    config: StreamConfig,
    state_tx: watch::Sender<ConnectorState>,
    orders: mpsc::Sender<OrderUpdate>,
}

impl StreamConnector {
    pub fn new(
        agent_id: impl Into<String>,
        exchange: Arc<dyn ExchangeClient>,
        cache: Arc<StateCache>,
        config: StreamConfig,
        orders: mpsc::Sender<OrderUpdate>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectorState::Idle);
        Self {
            agent_id: agent_id.into(),
            exchange,
            cache,
            config,
            state_tx,
            orders,
        }
    }

    /// Channel for an order-event consumer, sized from configuration
    pub fn order_channel(config: &StreamConfig) -> (mpsc::Sender<OrderUpdate>, mpsc::Receiver<OrderUpdate>) {
        mpsc::channel(config.order_channel_capacity.max(1))
    }

    pub fn state(&self) -> ConnectorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(agent = %self.agent_id, from = %previous, to = %state, "stream state");
        }
    }

    /// Run until `stop` fires, then revoke the lease and close.
    pub async fn run(self, stop: StopSignal) {
        let mut keeper: Option<LeaseKeeper> = None;
        let mut reconnect = Backoff::new(&self.config.reconnect);

        info!(agent = %self.agent_id, "stream connector starting");

        loop {
            if stop.is_triggered() {
                break;
            }

            let usable = keeper
                .as_ref()
                .map(|k| k.is_usable(Instant::now()))
                .unwrap_or(false);

            if !usable {
                self.set_state(ConnectorState::Leasing);
                let acquired = tokio::select! {
                    result = self.exchange.acquire_lease() => result,
                    _ = stop.triggered() => break,
                };
                match acquired {
                    Ok(lease) => {
                        info!(agent = %self.agent_id, validity_secs = lease.validity.as_secs(), "lease acquired");
                        keeper = Some(LeaseKeeper::new(
                            lease,
                            self.config.renew_fraction,
                            &self.config.renewal,
                        ));
                    }
                    Err(e) => {
                        keeper = None;
                        if !self.degrade(&mut reconnect, &stop, "lease", &e).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let Some(active) = keeper.as_mut() else {
                continue;
            };

            self.set_state(ConnectorState::Connecting);
            let subscribed = tokio::select! {
                result = self.exchange.subscribe(active.lease()) => result,
                _ = stop.triggered() => break,
            };

            let subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(e) => {
                    if matches!(e, TraderError::LeaseExpired | TraderError::LeaseRevoked) {
                        keeper = None;
                    }
                    if !self.degrade(&mut reconnect, &stop, "subscribe", &e).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectorState::Subscribed);
            reconnect.reset();
            info!(agent = %self.agent_id, "stream subscribed");

            let end = self.session(subscription, active, &stop).await;
            self.cache.mark_stream_stale().await;

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Disconnected(reason) => {
                    let err = TraderError::TransientNetwork(reason);
                    if !self.degrade(&mut reconnect, &stop, "stream", &err).await {
                        break;
                    }
                }
                SessionEnd::LeaseLost => {
                    warn!(agent = %self.agent_id, "lease expired without renewal; re-leasing");
                    keeper = None;
                    self.set_state(ConnectorState::Degraded);
                }
            }
        }

        self.shutdown(keeper.map(LeaseKeeper::into_lease)).await;
    }

    /// Enter Degraded and wait out the backoff. Returns false if stopped.
    async fn degrade(
        &self,
        backoff: &mut Backoff,
        stop: &StopSignal,
        stage: &str,
        err: &TraderError,
    ) -> bool {
        self.set_state(ConnectorState::Degraded);
        self.cache.mark_stream_stale().await;
        let delay = backoff.next_delay();
        warn!(
            agent = %self.agent_id,
            stage,
            attempt = backoff.attempt(),
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "stream degraded"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop.triggered() => false,
        }
    }

    async fn session(
        &self,
        mut subscription: EventSubscription,
        keeper: &mut LeaseKeeper,
        stop: &StopSignal,
    ) -> SessionEnd {
        loop {
            let renew_at = keeper.next_renewal();
            let expires_at = keeper.expires_at();

            tokio::select! {
                biased;

                _ = stop.triggered() => return SessionEnd::Stopped,

                _ = sleep_until(expires_at) => return SessionEnd::LeaseLost,

                _ = sleep_until(renew_at) => {
                    if let Err(end) = self.renew(keeper).await {
                        return end;
                    }
                }

                event = subscription.next() => match event {
                    Some(Ok(StreamEvent::Account(snapshot))) => {
                        self.cache.update_from_stream(snapshot).await;
                    }
                    Some(Ok(StreamEvent::Order(update))) => self.forward_order(update),
                    Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                    None => return SessionEnd::Disconnected("stream closed".to_string()),
                },
            }
        }
    }

    async fn renew(&self, keeper: &mut LeaseKeeper) -> std::result::Result<(), SessionEnd> {
        let timeout = self.config.request_timeout();
        let result = match tokio::time::timeout(timeout, self.exchange.renew_lease(keeper.lease())).await {
            Ok(result) => result,
            Err(_) => Err(TraderError::Timeout {
                operation: "renew_lease".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        };

        let now = Instant::now();
        match result {
            Ok(renewal) => {
                keeper.apply(renewal, now);
                debug!(agent = %self.agent_id, "lease renewed");
                Ok(())
            }
            Err(TraderError::LeaseExpired) | Err(TraderError::LeaseRevoked) => {
                Err(SessionEnd::LeaseLost)
            }
            Err(e) => {
                let delay = keeper.record_failure(now);
                let remaining = keeper.expires_at().saturating_duration_since(now);
                warn!(
                    agent = %self.agent_id,
                    error = %e,
                    attempt = keeper.failed_attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    remaining_secs = remaining.as_secs(),
                    "lease renewal failed"
                );
                Ok(())
            }
        }
    }

    fn forward_order(&self, update: OrderUpdate) {
        match self.orders.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                warn!(
                    agent = %self.agent_id,
                    order_id = %update.order_id,
                    "order event channel full; dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(agent = %self.agent_id, "order event consumer gone");
            }
        }
    }

    async fn shutdown(&self, lease: Option<CredentialLease>) {
        self.set_state(ConnectorState::Closing);
        self.cache.mark_stream_stale().await;

        if let Some(lease) = lease.filter(|l| l.is_valid_at(Instant::now())) {
            if let Err(e) = self.revoke(&lease).await {
                error!(agent = %self.agent_id, error = %e, "lease revoke failed");
            } else {
                info!(agent = %self.agent_id, "lease revoked");
            }
        }

        self.set_state(ConnectorState::Closed);
        info!(agent = %self.agent_id, "stream connector closed");
    }

    async fn revoke(&self, lease: &CredentialLease) -> Result<()> {
        let timeout = self.config.request_timeout();
        tokio::time::timeout(timeout, self.exchange.revoke_lease(lease))
            .await
            .map_err(|_| TraderError::Timeout {
                operation: "revoke_lease".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
    }
}

/// Spawned connector plus its observable state
pub struct ConnectorHandle {
    pub state: watch::Receiver<ConnectorState>,
    pub task: tokio::task::JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn spawn(connector: StreamConnector, stop: StopSignal) -> Self {
        let state = connector.subscribe_state();
        let task = tokio::spawn(connector.run(stop));
        Self { state, task }
    }

    pub fn current(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Wait until the connector reaches `target` or `limit` elapses.
    pub async fn wait_for(&mut self, target: ConnectorState, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.state.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::PaperExchange;
    use crate::config::BackoffConfig;
    use crate::domain::{Direction, OpenRequest, SnapshotSource};
    use rust_decimal_macros::dec;

    fn stream_config() -> StreamConfig {
        let fast = BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        StreamConfig {
            renew_fraction: 0.5,
            reconnect: fast.clone(),
            renewal: fast,
            order_channel_capacity: 8,
            request_timeout_secs: 5,
        }
    }

    fn setup(
        validity: Duration,
    ) -> (
        Arc<PaperExchange>,
        Arc<StateCache>,
        ConnectorHandle,
        StopSignal,
        mpsc::Receiver<OrderUpdate>,
    ) {
        let paper = Arc::new(PaperExchange::with_lease_validity(dec!(1000), validity));
        let cache = Arc::new(StateCache::new(paper.clone(), Duration::from_secs(10)));
        let config = stream_config();
        let (tx, rx) = StreamConnector::order_channel(&config);
        let connector = StreamConnector::new("test", paper.clone(), cache.clone(), config, tx);
        let stop = StopSignal::new();
        let handle = ConnectorHandle::spawn(connector, stop.clone());
        (paper, cache, handle, stop, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_and_feeds_cache() {
        let (paper, cache, mut handle, stop, mut orders) = setup(Duration::from_secs(3600));
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let account = cache.get_account().await.unwrap();
        assert_eq!(account.source, SnapshotSource::Stream);

        paper.set_price("BTCUSDT", dec!(100));
        paper
            .open_position(&OpenRequest {
                instrument: "BTCUSDT".into(),
                direction: Direction::Long,
                quantity: dec!(1),
                leverage: 2,
                stop_loss: None,
                take_profit: None,
            })
            .await
            .unwrap();

        let update = orders.recv().await.unwrap();
        assert_eq!(update.instrument, "BTCUSDT");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get_positions().await.unwrap().len(), 1);
        assert_eq!(paper.position_fetches(), 0);

        stop.trigger();
        handle.task.await.unwrap();
        assert_eq!(*handle.state.borrow(), ConnectorState::Closed);
        assert_eq!(paper.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renews_by_half_validity() {
        let (paper, _cache, mut handle, stop, _orders) = setup(Duration::from_secs(60));
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(paper.renewals(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(paper.renewals(), 1);

        // Well past the original expiry, still on the first lease.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(paper.renewals() >= 4);
        assert_eq!(paper.lease_acquisitions(), 1);
        assert_eq!(handle.current(), ConnectorState::Subscribed);

        stop.trigger();
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_failure_keeps_connection_until_expiry() {
        let (paper, _cache, mut handle, stop, _orders) = setup(Duration::from_secs(60));
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);

        paper.fail_renewals(3);
        tokio::time::sleep(Duration::from_millis(30_050)).await;
        assert_eq!(handle.current(), ConnectorState::Subscribed);
        assert_eq!(paper.renewals(), 0);

        // Retries at +100ms, +200ms, +400ms: the fourth attempt succeeds.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(paper.renewals(), 1);
        assert_eq!(handle.current(), ConnectorState::Subscribed);
        assert_eq!(paper.lease_acquisitions(), 1);

        stop.trigger();
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn already_fresh_counts_as_renewal() {
        let (paper, _cache, mut handle, stop, _orders) = setup(Duration::from_secs(60));
        paper.set_renew_already_fresh(true);
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(handle.current(), ConnectorState::Subscribed);
        assert_eq!(paper.lease_acquisitions(), 1);

        stop.trigger();
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reuses_valid_lease_and_drops_stale_stream_data() {
        let (paper, cache, mut handle, stop, _orders) = setup(Duration::from_secs(3600));
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.has_stream_snapshot().await);

        paper.set_offline(true);
        paper.drop_streams();
        assert!(handle.wait_for(ConnectorState::Degraded, Duration::from_secs(1)).await);
        assert!(!cache.has_stream_snapshot().await);
        assert!(cache.get_account().await.is_err());

        paper.set_offline(false);
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            cache.get_account().await.unwrap().source,
            SnapshotSource::Stream
        );
        assert_eq!(paper.lease_acquisitions(), 1);

        stop.trigger();
        handle.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_failure_is_logged_not_retried() {
        let (paper, _cache, mut handle, stop, _orders) = setup(Duration::from_secs(3600));
        assert!(handle.wait_for(ConnectorState::Subscribed, Duration::from_secs(5)).await);

        paper.set_fail_revoke(true);
        stop.trigger();
        handle.task.await.unwrap();
        assert_eq!(paper.revocations(), 1);
        assert_eq!(*handle.state.borrow(), ConnectorState::Closed);
    }
}
