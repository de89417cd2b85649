//! Binance futures user-data stream
//!
//! Binance pushes partial deltas (`ACCOUNT_UPDATE` only lists what changed).
//! The stream is seeded from REST at subscribe time and every delta is merged
//! into that view, so subscribers always receive a full `StreamSnapshot`.

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::domain::{
    AccountSnapshot, Direction, OrderSide, OrderUpdate, PositionKey, PositionSnapshot,
    StreamSnapshot,
};
use crate::error::{Result, TraderError};
use crate::exchange::{EventSubscription, StreamEvent};

use super::binance_futures::{direction_for, millis_to_utc};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often to send ping frames
const PING_INTERVAL_SECS: u64 = 30;

const EVENT_BUFFER: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "e")]
enum UserEvent {
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(rename = "E")]
        event_time: i64,
        #[serde(rename = "a")]
        data: AccountUpdateData,
    },
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTradeUpdate {
        #[serde(rename = "E")]
        event_time: i64,
        #[serde(rename = "o")]
        order: OrderData,
    },
    #[serde(rename = "ACCOUNT_CONFIG_UPDATE")]
    AccountConfigUpdate {
        #[serde(rename = "ac", default)]
        leverage: Option<LeverageConfig>,
    },
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AccountUpdateData {
    #[serde(rename = "B", default)]
    balances: Vec<BalanceData>,
    #[serde(rename = "P", default)]
    positions: Vec<PositionData>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    #[serde(rename = "a")]
    asset: String,
    #[serde(rename = "wb")]
    wallet_balance: Decimal,
    #[serde(rename = "cw")]
    cross_wallet_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct PositionData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    amount: Decimal,
    #[serde(rename = "ep")]
    entry_price: Decimal,
    #[serde(rename = "up")]
    unrealized_pnl: Decimal,
    #[serde(rename = "ps", default)]
    position_side: String,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "ps", default)]
    position_side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "z", default)]
    filled_quantity: Decimal,
    #[serde(rename = "ap", default)]
    avg_price: Decimal,
    #[serde(rename = "rp", default)]
    realized_pnl: Decimal,
    #[serde(rename = "i")]
    order_id: i64,
}

#[derive(Debug, Deserialize)]
struct LeverageConfig {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "l")]
    leverage: u32,
}

/// Full account view maintained from REST seed plus stream deltas
#[derive(Debug)]
struct UserDataState {
    account: AccountSnapshot,
    positions: BTreeMap<PositionKey, PositionSnapshot>,
    leverage: HashMap<String, u32>,
}

impl UserDataState {
    fn new(account: AccountSnapshot, positions: Vec<PositionSnapshot>) -> Self {
        let leverage = positions
            .iter()
            .map(|p| (p.instrument.clone(), p.leverage))
            .collect();
        Self {
            account,
            positions: positions.into_iter().map(|p| (p.key(), p)).collect(),
            leverage,
        }
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot::new(
            self.account.clone(),
            self.positions.values().cloned().collect(),
        )
    }

    /// Merge one parsed event. `None` means nothing for subscribers.
    fn apply(&mut self, event: UserEvent) -> Option<Result<StreamEvent>> {
        match event {
            UserEvent::AccountUpdate { event_time, data } => {
                self.merge_account(millis_to_utc(event_time), data);
                Some(Ok(StreamEvent::Account(self.snapshot())))
            }
            UserEvent::OrderTradeUpdate { event_time, order } => {
                Some(Ok(StreamEvent::Order(order_update(millis_to_utc(event_time), order))))
            }
            UserEvent::AccountConfigUpdate {
                leverage: Some(config),
            } => {
                self.leverage.insert(config.symbol.clone(), config.leverage);
                for position in self.positions.values_mut() {
                    if position.instrument == config.symbol {
                        position.leverage = config.leverage.max(1);
                    }
                }
                Some(Ok(StreamEvent::Account(self.snapshot())))
            }
            UserEvent::AccountConfigUpdate { leverage: None } | UserEvent::Other => None,
            UserEvent::ListenKeyExpired => Some(Err(TraderError::LeaseExpired)),
        }
    }

    fn merge_account(&mut self, event_time: DateTime<Utc>, data: AccountUpdateData) {
        for position in data.positions {
            self.merge_position(event_time, position);
        }
        if let Some(usdt) = data.balances.iter().find(|b| b.asset == "USDT") {
            self.account.total_balance = usdt.wallet_balance;
            self.account.available_balance = usdt.cross_wallet_balance;
        }
        self.account.unrealized_pnl = self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.account.as_of = event_time;
    }

    fn merge_position(&mut self, event_time: DateTime<Utc>, update: PositionData) {
        let hedge_side = match update.position_side.to_ascii_uppercase().as_str() {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            _ => None,
        };

        if update.amount.is_zero() {
            match hedge_side {
                Some(direction) => {
                    self.positions
                        .remove(&PositionKey::new(update.symbol.clone(), direction));
                }
                None => self.positions.retain(|k, _| k.instrument != update.symbol),
            }
            return;
        }

        let Some(direction) = direction_for(&update.position_side, update.amount) else {
            return;
        };
        if hedge_side.is_none() {
            // One-way mode: a flip replaces the opposite side.
            let opposite = match direction {
                Direction::Long => Direction::Short,
                Direction::Short => Direction::Long,
            };
            self.positions
                .remove(&PositionKey::new(update.symbol.clone(), opposite));
        }

        let key = PositionKey::new(update.symbol.clone(), direction);
        let previous = self.positions.get(&key);
        let quantity = update.amount.abs();
        let leverage = self
            .leverage
            .get(&update.symbol)
            .copied()
            .or_else(|| previous.map(|p| p.leverage))
            .unwrap_or(1);
        let opened_at = previous.map(|p| p.opened_at).unwrap_or(event_time);
        // ACCOUNT_UPDATE carries no mark; recover it from the unrealized PnL.
        let mark_price =
            update.entry_price + update.unrealized_pnl / (quantity * direction.sign());

        self.positions.insert(
            key,
            PositionSnapshot {
                instrument: update.symbol,
                direction,
                quantity,
                entry_price: update.entry_price,
                mark_price,
                unrealized_pnl: update.unrealized_pnl,
                leverage,
                opened_at,
            },
        );
    }
}

fn order_update(event_time: DateTime<Utc>, order: OrderData) -> OrderUpdate {
    let side = if order.side.eq_ignore_ascii_case("BUY") {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    };
    let direction = match order.position_side.to_ascii_uppercase().as_str() {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        _ => None,
    };
    let filled = order.filled_quantity > Decimal::ZERO;
    OrderUpdate {
        order_id: order.order_id.to_string(),
        instrument: order.symbol,
        side,
        direction,
        status: order.status,
        quantity: order.quantity,
        filled_quantity: order.filled_quantity,
        avg_price: Some(order.avg_price).filter(|p| *p > Decimal::ZERO),
        realized_pnl: Some(order.realized_pnl).filter(|_| filled),
        event_time,
    }
}

/// First 100 characters of a raw message, for logs
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

fn handle_text(state: &mut UserDataState, text: &str) -> Option<Result<StreamEvent>> {
    match serde_json::from_str::<UserEvent>(text) {
        Ok(event) => state.apply(event),
        Err(e) => {
            debug!(
                error = %e,
                "Unrecognized user stream message: {}",
                preview(text)
            );
            None
        }
    }
}

/// Connect `{ws_url}/{listen_key}` and stream merged events.
///
/// The first event is the seeded account snapshot. The subscription ends
/// when the socket closes, errors, or the listenKey expires.
pub async fn subscribe(
    ws_url: &str,
    listen_key: &str,
    account: AccountSnapshot,
    positions: Vec<PositionSnapshot>,
) -> Result<EventSubscription> {
    let url = format!("{}/{}", ws_url.trim_end_matches('/'), listen_key);

    let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| TraderError::Timeout {
            operation: "binance user stream connect".to_string(),
            elapsed_ms: CONNECT_TIMEOUT.as_millis() as u64,
        })??;

    info!("Connected to Binance user data stream");

    let state = UserDataState::new(account, positions);
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let _ = tx.try_send(Ok(StreamEvent::Account(state.snapshot())));
    let task = tokio::spawn(stream_events(ws_stream, state, tx));
    Ok(EventSubscription::new(rx, task))
}

async fn stream_events(
    ws_stream: WsStream,
    mut state: UserDataState,
    tx: mpsc::Sender<Result<StreamEvent>>,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(event) = handle_text(&mut state, &text) else {
                            continue;
                        };
                        let expired = event.is_err();
                        if tx.send(event).await.is_err() {
                            debug!("user stream subscriber dropped");
                            break;
                        }
                        if expired {
                            warn!("Binance listenKey expired");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Received close frame from Binance user stream");
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(TraderError::WebSocket(e))).await;
                        break;
                    }
                    None => {
                        info!("Binance user stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    error!("Failed to send ping: {}", e);
                    break;
                }
                debug!("Sent ping to Binance user stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SnapshotSource;
    use rust_decimal_macros::dec;

    fn seeded() -> UserDataState {
        let account = AccountSnapshot {
            total_balance: dec!(1000),
            available_balance: dec!(1000),
            unrealized_pnl: dec!(0),
            as_of: Utc::now(),
            source: SnapshotSource::Fetch,
        };
        let eth = PositionSnapshot {
            instrument: "ETHUSDT".into(),
            direction: Direction::Short,
            quantity: dec!(1),
            entry_price: dec!(3000),
            mark_price: dec!(3000),
            unrealized_pnl: dec!(0),
            leverage: 3,
            opened_at: Utc::now(),
        };
        UserDataState::new(account, vec![eth])
    }

    fn account_event(state: &mut UserDataState, text: &str) -> StreamSnapshot {
        match handle_text(state, text) {
            Some(Ok(StreamEvent::Account(snapshot))) => snapshot,
            other => panic!("expected account snapshot, got {:?}", other),
        }
    }

    #[test]
    fn account_update_merges_into_full_view() {
        let mut state = seeded();
        let snapshot = account_event(
            &mut state,
            r#"{"e":"ACCOUNT_UPDATE","E":1717000000000,"T":1717000000000,"a":{"m":"ORDER",
                "B":[{"a":"USDT","wb":"990.5","cw":"900.25","bc":"0"}],
                "P":[{"s":"BTCUSDT","pa":"0.010","ep":"65000","cr":"0","up":"10","mt":"cross","iw":"0","ps":"LONG"}]}}"#,
        );

        assert_eq!(snapshot.account.total_balance, dec!(990.5));
        assert_eq!(snapshot.account.available_balance, dec!(900.25));
        assert_eq!(snapshot.account.source, SnapshotSource::Stream);
        // ETH short from the seed is untouched by a BTC-only delta.
        assert_eq!(snapshot.positions.len(), 2);
        let btc = &snapshot.positions[0];
        assert_eq!(btc.instrument, "BTCUSDT");
        assert_eq!(btc.mark_price, dec!(66000));
        assert_eq!(snapshot.account.unrealized_pnl, dec!(10));
    }

    #[test]
    fn zero_amount_removes_position() {
        let mut state = seeded();
        let snapshot = account_event(
            &mut state,
            r#"{"e":"ACCOUNT_UPDATE","E":1717000000000,"a":{"B":[],
                "P":[{"s":"ETHUSDT","pa":"0","ep":"0","up":"0","ps":"SHORT"}]}}"#,
        );
        assert!(snapshot.positions.is_empty());
    }

    #[test]
    fn order_trade_update_becomes_order_event() {
        let mut state = seeded();
        let event = handle_text(
            &mut state,
            r#"{"e":"ORDER_TRADE_UPDATE","E":1717000000000,"T":1717000000000,"o":{
                "s":"ETHUSDT","c":"x","S":"BUY","o":"MARKET","f":"GTC","q":"1","p":"0","ap":"2950",
                "sp":"0","x":"TRADE","X":"FILLED","i":8886774,"l":"1","z":"1","L":"2950",
                "rp":"50","ps":"SHORT"}}"#,
        );
        match event {
            Some(Ok(StreamEvent::Order(update))) => {
                assert_eq!(update.order_id, "8886774");
                assert!(update.is_filled());
                assert!(update.is_reducing());
                assert_eq!(update.realized_pnl, Some(dec!(50)));
                assert_eq!(update.avg_price, Some(dec!(2950)));
            }
            other => panic!("expected order event, got {:?}", other),
        }
    }

    #[test]
    fn leverage_config_updates_positions() {
        let mut state = seeded();
        let snapshot = account_event(
            &mut state,
            r#"{"e":"ACCOUNT_CONFIG_UPDATE","E":1717000000000,"ac":{"s":"ETHUSDT","l":10}}"#,
        );
        assert_eq!(snapshot.positions[0].leverage, 10);
    }

    #[test]
    fn listen_key_expiry_and_unknown_events() {
        let mut state = seeded();
        assert!(matches!(
            handle_text(&mut state, r#"{"e":"listenKeyExpired","E":1717000000000}"#),
            Some(Err(TraderError::LeaseExpired))
        ));
        assert!(handle_text(&mut state, r#"{"e":"MARGIN_CALL","E":1}"#).is_none());
        assert!(handle_text(&mut state, "not json").is_none());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        // Byte 100 falls inside a multi-byte character.
        let text = format!("{}{}", "x".repeat(99), "价格".repeat(20));
        let shown = preview(&text);
        assert_eq!(shown.chars().count(), 100);
        assert!(shown.ends_with('价'));
        assert_eq!(preview("short"), "short");

        let mut state = seeded();
        assert!(handle_text(&mut state, &text).is_none());
    }
}
