//! In-memory futures venue for dry runs and tests
//!
//! Fills every market order at the configured price, keeps hedge-mode
//! positions per (instrument, direction), and pushes account/order events to
//! subscribers the way a real user-data stream would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::domain::{
    AccountSnapshot, CloseRequest, Direction, ExecutionReport, OpenRequest, OrderSide,
    OrderUpdate, PositionKey, PositionSnapshot, SnapshotSource, StreamSnapshot,
};
use crate::decision::{MarketBundle, MarketDataSource, MarketSnapshot};
use crate::error::{Result, TraderError};
use crate::exchange::{
    CredentialLease, EventSubscription, ExchangeClient, ExchangeKind, LeaseRenewal, StreamEvent,
};

const MAX_LEVERAGE: u32 = 125;
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct PaperPosition {
    quantity: Decimal,
    entry_price: Decimal,
    leverage: u32,
    opened_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PaperBook {
    wallet: Decimal,
    positions: BTreeMap<PositionKey, PaperPosition>,
    prices: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
    leases: HashMap<String, Instant>,
    subscribers: Vec<mpsc::Sender<Result<StreamEvent>>>,
    next_order_id: u64,
    next_lease_id: u64,
    offline: bool,
    failing_renewals: u32,
    renew_already_fresh: bool,
    fail_revoke: bool,
    failing_orders: HashMap<String, String>,
    fetch_delay: Option<Duration>,
}

/// Simulated exchange. Cheap to share behind `Arc`.
#[derive(Debug)]
pub struct PaperExchange {
    book: Mutex<PaperBook>,
    lease_validity: Duration,
    account_fetches: AtomicUsize,
    position_fetches: AtomicUsize,
    lease_acquisitions: AtomicUsize,
    renewals: AtomicUsize,
    revocations: AtomicUsize,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self::with_lease_validity(balance, Duration::from_secs(60 * 60))
    }

    pub fn with_lease_validity(balance: Decimal, lease_validity: Duration) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                wallet: balance,
                ..PaperBook::default()
            }),
            lease_validity,
            account_fetches: AtomicUsize::new(0),
            position_fetches: AtomicUsize::new(0),
            lease_acquisitions: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            revocations: AtomicUsize::new(0),
        }
    }

    fn book(&self) -> MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the fill/mark price and push the revalued account.
    pub fn set_price(&self, instrument: &str, price: Decimal) {
        let mut book = self.book();
        book.prices.insert(instrument.to_string(), price);
        if book.positions.keys().any(|k| k.instrument == instrument) {
            let snapshot = book.snapshot();
            book.publish(StreamEvent::Account(snapshot));
        }
    }

    /// Simulate connectivity loss for REST and new subscriptions.
    pub fn set_offline(&self, offline: bool) {
        self.book().offline = offline;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.book().fetch_delay = Some(delay);
    }

    /// Next `count` renewals fail with a transient error.
    pub fn fail_renewals(&self, count: u32) {
        self.book().failing_renewals = count;
    }

    pub fn set_renew_already_fresh(&self, fresh: bool) {
        self.book().renew_already_fresh = fresh;
    }

    pub fn set_fail_revoke(&self, fail: bool) {
        self.book().fail_revoke = fail;
    }

    /// Orders for `instrument` are rejected with `message`.
    pub fn reject_orders_for(&self, instrument: &str, message: &str) {
        self.book()
            .failing_orders
            .insert(instrument.to_string(), message.to_string());
    }

    /// Close every live subscription as if the socket dropped.
    pub fn drop_streams(&self) {
        let dropped = std::mem::take(&mut self.book().subscribers).len();
        debug!(dropped, "paper streams dropped");
    }

    /// Open a position without going through an order (pre-existing exposure).
    pub fn seed_position(
        &self,
        instrument: &str,
        direction: Direction,
        quantity: Decimal,
        entry_price: Decimal,
        leverage: u32,
    ) {
        let mut book = self.book();
        book.prices
            .entry(instrument.to_string())
            .or_insert(entry_price);
        book.positions.insert(
            PositionKey::new(instrument, direction),
            PaperPosition {
                quantity,
                entry_price,
                leverage,
                opened_at: Utc::now(),
            },
        );
    }

    /// Close a position outside the agent (manual intervention, liquidation).
    pub fn external_close(&self, key: &PositionKey) -> Option<Decimal> {
        let mut book = self.book();
        let (report, update) = book.close(key, None).ok()?;
        book.publish(StreamEvent::Order(update));
        let snapshot = book.snapshot();
        book.publish(StreamEvent::Account(snapshot));
        report.realized_pnl
    }

    pub fn wallet_balance(&self) -> Decimal {
        self.book().wallet
    }

    pub fn leverage_for(&self, instrument: &str) -> Option<u32> {
        self.book().leverage.get(instrument).copied()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut book = self.book();
        book.subscribers.retain(|s| !s.is_closed());
        book.subscribers.len()
    }

    pub fn active_leases(&self) -> usize {
        self.book().leases.len()
    }

    pub fn account_fetches(&self) -> usize {
        self.account_fetches.load(Ordering::SeqCst)
    }

    pub fn position_fetches(&self) -> usize {
        self.position_fetches.load(Ordering::SeqCst)
    }

    pub fn lease_acquisitions(&self) -> usize {
        self.lease_acquisitions.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn revocations(&self) -> usize {
        self.revocations.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.book().offline {
            return Err(TraderError::TransientNetwork(
                "paper exchange offline".to_string(),
            ));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let delay = self.book().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl PaperBook {
    fn mark(&self, instrument: &str, fallback: Decimal) -> Decimal {
        self.prices.get(instrument).copied().unwrap_or(fallback)
    }

    fn position_snapshots(&self) -> Vec<PositionSnapshot> {
        self.positions
            .iter()
            .map(|(key, p)| {
                let mark = self.mark(&key.instrument, p.entry_price);
                PositionSnapshot {
                    instrument: key.instrument.clone(),
                    direction: key.direction,
                    quantity: p.quantity,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.entry_price) * p.quantity * key.direction.sign(),
                    leverage: p.leverage,
                    opened_at: p.opened_at,
                }
            })
            .collect()
    }

    fn account(&self) -> AccountSnapshot {
        let positions = self.position_snapshots();
        let unrealized: Decimal = positions.iter().map(|p| p.unrealized_pnl).sum();
        let margin: Decimal = positions.iter().map(|p| p.margin_used()).sum();
        AccountSnapshot {
            total_balance: self.wallet,
            available_balance: (self.wallet + unrealized - margin).max(Decimal::ZERO),
            unrealized_pnl: unrealized,
            as_of: Utc::now(),
            source: SnapshotSource::Fetch,
        }
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot::new(self.account(), self.position_snapshots())
    }

    fn publish(&mut self, event: StreamEvent) {
        self.subscribers
            .retain(|tx| tx.try_send(Ok(event.clone())).is_ok());
    }

    fn order_id(&mut self) -> String {
        self.next_order_id += 1;
        format!("paper-{}", self.next_order_id)
    }

    fn price(&self, instrument: &str) -> Result<Decimal> {
        self.prices
            .get(instrument)
            .copied()
            .ok_or_else(|| TraderError::ExchangeRejected {
                code: -1121,
                message: format!("no price for {}", instrument),
            })
    }

    fn close(
        &mut self,
        key: &PositionKey,
        quantity: Option<Decimal>,
    ) -> Result<(ExecutionReport, OrderUpdate)> {
        let price = self.price(&key.instrument)?;
        let position = self
            .positions
            .get_mut(key)
            .ok_or_else(|| TraderError::ExchangeRejected {
                code: -2022,
                message: format!("ReduceOnly order rejected: no {} position", key),
            })?;

        let qty = quantity.unwrap_or(position.quantity).min(position.quantity);
        let realized = (price - position.entry_price) * qty * key.direction.sign();
        position.quantity -= qty;
        if position.quantity <= Decimal::ZERO {
            self.positions.remove(key);
        }
        self.wallet += realized;

        let order_id = self.order_id();
        let update = OrderUpdate {
            order_id: order_id.clone(),
            instrument: key.instrument.clone(),
            side: OrderSide::closing(key.direction),
            direction: Some(key.direction),
            status: "FILLED".to_string(),
            quantity: qty,
            filled_quantity: qty,
            avg_price: Some(price),
            realized_pnl: Some(realized),
            event_time: Utc::now(),
        };
        let report = ExecutionReport {
            order_id,
            instrument: key.instrument.clone(),
            direction: key.direction,
            filled_quantity: qty,
            avg_price: Some(price),
            realized_pnl: Some(realized),
        };
        Ok((report, update))
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Paper
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        self.account_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_online()?;
        Ok(self.book().account())
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        self.position_fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_online()?;
        Ok(self.book().position_snapshots())
    }

    async fn open_position(&self, request: &OpenRequest) -> Result<ExecutionReport> {
        self.check_online()?;
        let mut book = self.book();
        if let Some(message) = book.failing_orders.get(&request.instrument) {
            return Err(TraderError::ExchangeRejected {
                code: -2019,
                message: message.clone(),
            });
        }
        if request.quantity <= Decimal::ZERO {
            return Err(TraderError::ExchangeRejected {
                code: -4003,
                message: "quantity less than or equal to zero".to_string(),
            });
        }

        let price = book.price(&request.instrument)?;
        let key = PositionKey::new(request.instrument.clone(), request.direction);
        let leverage = book
            .leverage
            .get(&request.instrument)
            .copied()
            .unwrap_or(request.leverage.max(1));

        let required_margin = request.quantity * price / Decimal::from(leverage);
        if required_margin > book.account().available_balance {
            return Err(TraderError::ExchangeRejected {
                code: -2019,
                message: "Margin is insufficient.".to_string(),
            });
        }

        let position = book.positions.entry(key.clone()).or_insert(PaperPosition {
            quantity: Decimal::ZERO,
            entry_price: price,
            leverage,
            opened_at: Utc::now(),
        });
        let total = position.quantity + request.quantity;
        position.entry_price =
            (position.entry_price * position.quantity + price * request.quantity) / total;
        position.quantity = total;
        position.leverage = leverage;

        let order_id = book.order_id();
        info!(order_id = %order_id, position = %key, qty = %request.quantity, price = %price, "paper open filled");

        let update = OrderUpdate {
            order_id: order_id.clone(),
            instrument: request.instrument.clone(),
            side: OrderSide::opening(request.direction),
            direction: Some(request.direction),
            status: "FILLED".to_string(),
            quantity: request.quantity,
            filled_quantity: request.quantity,
            avg_price: Some(price),
            realized_pnl: None,
            event_time: Utc::now(),
        };
        book.publish(StreamEvent::Order(update));
        let snapshot = book.snapshot();
        book.publish(StreamEvent::Account(snapshot));

        Ok(ExecutionReport {
            order_id,
            instrument: request.instrument.clone(),
            direction: request.direction,
            filled_quantity: request.quantity,
            avg_price: Some(price),
            realized_pnl: None,
        })
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutionReport> {
        self.check_online()?;
        let mut book = self.book();
        if let Some(message) = book.failing_orders.get(&request.instrument) {
            return Err(TraderError::ExchangeRejected {
                code: -2019,
                message: message.clone(),
            });
        }
        let key = PositionKey::new(request.instrument.clone(), request.direction);
        let (report, update) = book.close(&key, request.quantity)?;
        info!(order_id = %report.order_id, position = %key, pnl = ?report.realized_pnl, "paper close filled");

        book.publish(StreamEvent::Order(update));
        let snapshot = book.snapshot();
        book.publish(StreamEvent::Account(snapshot));
        Ok(report)
    }

    async fn set_leverage(&self, instrument: &str, leverage: u32) -> Result<()> {
        self.check_online()?;
        if leverage == 0 || leverage > MAX_LEVERAGE {
            return Err(TraderError::ExchangeRejected {
                code: -4028,
                message: format!("leverage {} is not valid", leverage),
            });
        }
        self.book().leverage.insert(instrument.to_string(), leverage);
        Ok(())
    }

    async fn get_price(&self, instrument: &str) -> Result<Decimal> {
        self.check_online()?;
        self.book().price(instrument)
    }

    async fn acquire_lease(&self) -> Result<CredentialLease> {
        self.check_online()?;
        self.lease_acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut book = self.book();
        book.next_lease_id += 1;
        let lease = CredentialLease::new(format!("paper-lease-{}", book.next_lease_id), self.lease_validity);
        book.leases.insert(lease.token.clone(), lease.issued_at);
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &CredentialLease) -> Result<LeaseRenewal> {
        let mut book = self.book();
        if book.failing_renewals > 0 {
            book.failing_renewals -= 1;
            return Err(TraderError::TransientNetwork(
                "paper renewal failure".to_string(),
            ));
        }
        if book.offline {
            return Err(TraderError::TransientNetwork(
                "paper exchange offline".to_string(),
            ));
        }
        let now = Instant::now();
        match book.leases.get(&lease.token).copied() {
            Some(issued_at) if now < issued_at + self.lease_validity => {
                book.leases.insert(lease.token.clone(), now);
            }
            Some(_) => {
                book.leases.remove(&lease.token);
                return Err(TraderError::LeaseExpired);
            }
            None => return Err(TraderError::LeaseExpired),
        }
        self.renewals.fetch_add(1, Ordering::SeqCst);

        if book.renew_already_fresh {
            Ok(LeaseRenewal::AlreadyFresh)
        } else {
            Ok(LeaseRenewal::Renewed(lease.refreshed(now)))
        }
    }

    async fn revoke_lease(&self, lease: &CredentialLease) -> Result<()> {
        self.revocations.fetch_add(1, Ordering::SeqCst);
        let mut book = self.book();
        if book.fail_revoke {
            return Err(TraderError::TransientNetwork(
                "paper revoke failure".to_string(),
            ));
        }
        book.leases.remove(&lease.token);
        book.subscribers.clear();
        Ok(())
    }

    async fn subscribe(&self, lease: &CredentialLease) -> Result<EventSubscription> {
        self.check_online()?;
        let mut book = self.book();
        let valid = book
            .leases
            .get(&lease.token)
            .map(|issued| Instant::now() < *issued + self.lease_validity)
            .unwrap_or(false);
        if !valid {
            return Err(TraderError::LeaseExpired);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        // Initial state so the subscriber starts from a full snapshot.
        let _ = tx.try_send(Ok(StreamEvent::Account(book.snapshot())));
        book.subscribers.push(tx);
        Ok(EventSubscription::from_channel(rx))
    }
}

#[async_trait]
impl MarketDataSource for PaperExchange {
    /// Last set price per instrument; no 24h history is simulated.
    async fn market_snapshot(&self, instruments: &[String]) -> Result<MarketBundle> {
        self.check_online()?;
        let book = self.book();
        let now = Utc::now();
        Ok(instruments
            .iter()
            .filter_map(|instrument| {
                book.prices.get(instrument).map(|price| {
                    (
                        instrument.clone(),
                        MarketSnapshot {
                            instrument: instrument.clone(),
                            last_price: *price,
                            change_24h_pct: Decimal::ZERO,
                            quote_volume_24h: Decimal::ZERO,
                            as_of: now,
                        },
                    )
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn open_then_close_realizes_price_move() {
        let paper = PaperExchange::new(dec!(1000));
        paper.set_price("BTCUSDT", dec!(100));
        paper.set_leverage("BTCUSDT", 5).await.unwrap();

        paper
            .open_position(&OpenRequest {
                instrument: "BTCUSDT".into(),
                direction: Direction::Short,
                quantity: dec!(2),
                leverage: 5,
                stop_loss: None,
                take_profit: None,
            })
            .await
            .unwrap();

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].leverage, 5);

        paper.set_price("BTCUSDT", dec!(90));
        let report = paper
            .close_position(&CloseRequest {
                instrument: "BTCUSDT".into(),
                direction: Direction::Short,
                quantity: None,
            })
            .await
            .unwrap();

        assert_eq!(report.realized_pnl, Some(dec!(20)));
        assert_eq!(paper.wallet_balance(), dec!(1020));
        assert!(paper.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_missing_position_is_rejected() {
        let paper = PaperExchange::new(dec!(1000));
        paper.set_price("ETHUSDT", dec!(3000));
        let err = paper
            .close_position(&CloseRequest {
                instrument: "ETHUSDT".into(),
                direction: Direction::Long,
                quantity: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TraderError::ExchangeRejected { code: -2022, .. }));
    }

    #[tokio::test]
    async fn subscription_gets_initial_snapshot_and_fills() {
        let paper = PaperExchange::new(dec!(1000));
        paper.set_price("SOLUSDT", dec!(150));
        let lease = paper.acquire_lease().await.unwrap();
        let mut sub = paper.subscribe(&lease).await.unwrap();

        assert!(matches!(sub.next().await, Some(Ok(StreamEvent::Account(_)))));

        paper
            .open_position(&OpenRequest {
                instrument: "SOLUSDT".into(),
                direction: Direction::Long,
                quantity: dec!(1),
                leverage: 2,
                stop_loss: None,
                take_profit: None,
            })
            .await
            .unwrap();

        assert!(matches!(sub.next().await, Some(Ok(StreamEvent::Order(_)))));
        match sub.next().await {
            Some(Ok(StreamEvent::Account(snapshot))) => assert_eq!(snapshot.positions.len(), 1),
            other => panic!("expected account event, got {:?}", other),
        }

        paper.revoke_lease(&lease).await.unwrap();
        assert!(sub.next().await.is_none());
        assert!(paper.subscribe(&lease).await.is_err());
    }

    #[tokio::test]
    async fn market_snapshot_skips_unpriced_instruments() {
        let paper = PaperExchange::new(dec!(1000));
        paper.set_price("BTCUSDT", dec!(65000));
        let bundle = paper
            .market_snapshot(&["BTCUSDT".to_string(), "DOGEUSDT".to_string()])
            .await
            .unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle["BTCUSDT"].last_price, dec!(65000));
    }
}
