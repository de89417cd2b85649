//! Binance USDⓈ-M futures REST adapter (hedge mode)
//!
//! Signed endpoints use HMAC-SHA256 over the query string. The user-data
//! stream credential is the listenKey, valid for 60 minutes after the last
//! keepalive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SecretString;
use crate::decision::{MarketBundle, MarketDataSource, MarketSnapshot};
use crate::domain::{
    AccountSnapshot, CloseRequest, Direction, ExecutionReport, OpenRequest, OrderSide,
    PositionSnapshot, SnapshotSource,
};
use crate::error::{Result, TraderError};
use crate::exchange::{CredentialLease, EventSubscription, ExchangeClient, ExchangeKind, LeaseRenewal};

use super::binance_user_stream;

type HmacSha256 = Hmac<Sha256>;

/// Binance error code for an unknown or expired listenKey
const LISTEN_KEY_MISSING: i64 = -1125;

#[derive(Debug, Clone)]
pub struct BinanceFuturesConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub recv_window_ms: u64,
    pub request_timeout: Duration,
    pub listen_key_validity: Duration,
}

impl Default for BinanceFuturesConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            recv_window_ms: 5000,
            request_timeout: Duration::from_secs(10),
            listen_key_validity: Duration::from_secs(60 * 60),
        }
    }
}

impl BinanceFuturesConfig {
    pub fn testnet() -> Self {
        Self {
            rest_url: "https://testnet.binancefuture.com".to_string(),
            ws_url: "wss://stream.binancefuture.com/ws".to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    None,
    ApiKey,
    Signed,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    total_wallet_balance: Decimal,
    available_balance: Decimal,
    total_unrealized_profit: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: Decimal,
    entry_price: Decimal,
    mark_price: Decimal,
    un_realized_profit: Decimal,
    leverage: Decimal,
    #[serde(default)]
    position_side: String,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    executed_qty: Decimal,
    #[serde(default)]
    avg_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct PriceTicker {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    last_price: Decimal,
    price_change_percent: Decimal,
    quote_volume: Decimal,
    #[serde(default)]
    close_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

impl SymbolInfo {
    fn lot_step(&self) -> Option<Decimal> {
        self.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some("LOT_SIZE"))
            .and_then(|f| f.get("stepSize"))
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .filter(|step| *step > Decimal::ZERO)
    }
}

/// Millisecond exchange timestamp, `now` when absent
pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    if ms <= 0 {
        return Utc::now();
    }
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// Hedge-mode side, or the sign of the amount in one-way mode
pub(crate) fn direction_for(position_side: &str, amount: Decimal) -> Option<Direction> {
    match position_side.to_ascii_uppercase().as_str() {
        "LONG" => Some(Direction::Long),
        "SHORT" => Some(Direction::Short),
        _ if amount > Decimal::ZERO => Some(Direction::Long),
        _ if amount < Decimal::ZERO => Some(Direction::Short),
        _ => None,
    }
}

/// Round down to a multiple of the lot step
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).floor() * step).normalize()
}

fn position_side(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "LONG",
        Direction::Short => "SHORT",
    }
}

fn api_error(status: StatusCode, body: &str) -> TraderError {
    if status.is_server_error() {
        return TraderError::TransientNetwork(format!("binance http {}: {}", status, body));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return TraderError::ExchangeRejected {
            code: 429,
            message: format!("rate limited: {}", body),
        };
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) if err.code == LISTEN_KEY_MISSING => TraderError::LeaseExpired,
        Ok(err) => TraderError::ExchangeRejected {
            code: err.code,
            message: err.msg,
        },
        Err(_) => TraderError::ExchangeRejected {
            code: i64::from(status.as_u16()),
            message: body.to_string(),
        },
    }
}

fn position_snapshots(risks: Vec<PositionRisk>) -> Vec<PositionSnapshot> {
    risks
        .into_iter()
        .filter(|p| !p.position_amt.is_zero())
        .filter_map(|p| {
            let direction = direction_for(&p.position_side, p.position_amt)?;
            Some(PositionSnapshot {
                instrument: p.symbol,
                direction,
                quantity: p.position_amt.abs(),
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                unrealized_pnl: p.un_realized_profit,
                leverage: p.leverage.to_u32().unwrap_or(1).max(1),
                opened_at: millis_to_utc(p.update_time),
            })
        })
        .collect()
}

/// REST client for one Binance futures account.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    http: Client,
    config: BinanceFuturesConfig,
    api_key: String,
    api_secret: SecretString,
    lot_steps: Arc<DashMap<String, Decimal>>,
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("rest_url", &self.config.rest_url)
            .field("ws_url", &self.config.ws_url)
            .finish()
    }
}

impl BinanceFuturesClient {
    pub fn new(config: BinanceFuturesConfig, api_key: String, api_secret: SecretString) -> Result<Self> {
        if api_key.trim().is_empty() || api_secret.is_empty() {
            return Err(TraderError::Config(
                "binance api key and secret are required".to_string(),
            ));
        }
        let http = Client::builder()
            .user_agent("autotrader/0.1")
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TraderError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            api_key,
            api_secret,
            lot_steps: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &BinanceFuturesConfig {
        &self.config
    }

    fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.expose().as_bytes())
            .map_err(|e| TraderError::Config(format!("invalid binance secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn query_string(&self, params: &[(&str, String)], auth: Auth) -> Result<String> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            serializer.append_pair(key, value);
        }
        if auth == Auth::Signed {
            serializer.append_pair("recvWindow", &self.config.recv_window_ms.to_string());
            serializer.append_pair("timestamp", &Utc::now().timestamp_millis().to_string());
        }
        let mut query = serializer.finish();
        if auth == Auth::Signed {
            let signature = self.sign(&query)?;
            query.push_str("&signature=");
            query.push_str(&signature);
        }
        Ok(query)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        auth: Auth,
    ) -> Result<T> {
        let query = self.query_string(params, auth)?;
        let url = if query.is_empty() {
            format!("{}{}", self.config.rest_url, path)
        } else {
            format!("{}{}?{}", self.config.rest_url, path, query)
        };

        let mut req = self.http.request(method.clone(), &url);
        if auth != Auth::None {
            req = req.header("X-MBX-APIKEY", &self.api_key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                TraderError::TransientNetwork(format!("binance {} {}: {}", method, path, e))
            } else {
                TraderError::Http(e)
            }
        })?;
        let status = resp.status();
        let text = resp.text().await?;
        debug!(%method, path, status = status.as_u16(), "binance response");

        if !status.is_success() {
            return Err(api_error(status, &text));
        }
        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        Ok(serde_json::from_str(body)?)
    }

    async fn position_risk(&self) -> Result<Vec<PositionRisk>> {
        self.request(Method::GET, "/fapi/v2/positionRisk", &[], Auth::Signed)
            .await
    }

    async fn lot_step(&self, instrument: &str) -> Result<Option<Decimal>> {
        if let Some(step) = self.lot_steps.get(instrument) {
            return Ok(Some(*step));
        }
        let info: ExchangeInfo = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", &[], Auth::None)
            .await?;
        for symbol in &info.symbols {
            if let Some(step) = symbol.lot_step() {
                self.lot_steps.insert(symbol.symbol.clone(), step);
            }
        }
        debug!(symbols = self.lot_steps.len(), "binance lot steps loaded");
        Ok(self.lot_steps.get(instrument).map(|s| *s))
    }

    async fn format_quantity(&self, instrument: &str, quantity: Decimal) -> Result<Decimal> {
        let rounded = match self.lot_step(instrument).await {
            Ok(Some(step)) => round_to_step(quantity, step),
            Ok(None) => quantity.round_dp(3),
            Err(e) => {
                warn!(instrument, error = %e, "exchangeInfo unavailable; rounding to 3dp");
                quantity.round_dp(3)
            }
        };
        if rounded <= Decimal::ZERO {
            return Err(TraderError::Validation(format!(
                "{} quantity {} rounds to zero",
                instrument, quantity
            )));
        }
        Ok(rounded)
    }

    async fn market_order(
        &self,
        instrument: &str,
        side: OrderSide,
        direction: Direction,
        quantity: Decimal,
    ) -> Result<OrderResponse> {
        let params = [
            ("symbol", instrument.to_string()),
            ("side", side.to_string()),
            ("positionSide", position_side(direction).to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        self.request(Method::POST, "/fapi/v1/order", &params, Auth::Signed)
            .await
    }

    /// Close-position trigger order (STOP_MARKET / TAKE_PROFIT_MARKET).
    async fn protective_order(
        &self,
        instrument: &str,
        direction: Direction,
        order_type: &str,
        trigger: Decimal,
    ) -> Result<()> {
        let params = [
            ("symbol", instrument.to_string()),
            ("side", OrderSide::closing(direction).to_string()),
            ("positionSide", position_side(direction).to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", trigger.normalize().to_string()),
            ("closePosition", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        let _: serde_json::Value = self
            .request(Method::POST, "/fapi/v1/order", &params, Auth::Signed)
            .await?;
        Ok(())
    }

    async fn cancel_open_orders(&self, instrument: &str) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                &[("symbol", instrument.to_string())],
                Auth::Signed,
            )
            .await?;
        Ok(())
    }

    fn report(
        response: OrderResponse,
        instrument: &str,
        direction: Direction,
        fallback_quantity: Decimal,
    ) -> ExecutionReport {
        let filled = if response.executed_qty > Decimal::ZERO {
            response.executed_qty
        } else {
            fallback_quantity
        };
        ExecutionReport {
            order_id: response.order_id.to_string(),
            instrument: instrument.to_string(),
            direction,
            filled_quantity: filled,
            avg_price: Some(response.avg_price).filter(|p| *p > Decimal::ZERO),
            realized_pnl: None,
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let account: AccountResponse = self
            .request(Method::GET, "/fapi/v2/account", &[], Auth::Signed)
            .await?;
        Ok(AccountSnapshot {
            total_balance: account.total_wallet_balance,
            available_balance: account.available_balance,
            unrealized_pnl: account.total_unrealized_profit,
            as_of: Utc::now(),
            source: SnapshotSource::Fetch,
        })
    }

    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        Ok(position_snapshots(self.position_risk().await?))
    }

    async fn open_position(&self, request: &OpenRequest) -> Result<ExecutionReport> {
        let quantity = self
            .format_quantity(&request.instrument, request.quantity)
            .await?;
        let response = self
            .market_order(
                &request.instrument,
                OrderSide::opening(request.direction),
                request.direction,
                quantity,
            )
            .await?;
        let report = Self::report(response, &request.instrument, request.direction, quantity);
        info!(
            instrument = %request.instrument,
            direction = %request.direction,
            quantity = %report.filled_quantity,
            leverage = request.leverage,
            order_id = %report.order_id,
            "binance position opened"
        );

        // The position exists at this point; protection failures are reported, not raised.
        if let Some(stop) = request.stop_loss {
            if let Err(e) = self
                .protective_order(&request.instrument, request.direction, "STOP_MARKET", stop)
                .await
            {
                warn!(instrument = %request.instrument, error = %e, "failed to place stop loss");
            }
        }
        if let Some(target) = request.take_profit {
            if let Err(e) = self
                .protective_order(
                    &request.instrument,
                    request.direction,
                    "TAKE_PROFIT_MARKET",
                    target,
                )
                .await
            {
                warn!(instrument = %request.instrument, error = %e, "failed to place take profit");
            }
        }

        Ok(report)
    }

    async fn close_position(&self, request: &CloseRequest) -> Result<ExecutionReport> {
        let positions = self.get_positions().await?;
        let held = positions
            .iter()
            .find(|p| p.instrument == request.instrument && p.direction == request.direction)
            .ok_or_else(|| TraderError::ExchangeRejected {
                code: -2022,
                message: format!(
                    "ReduceOnly order rejected: no {} {} position",
                    request.instrument, request.direction
                ),
            })?;

        let quantity = match request.quantity {
            Some(q) => self.format_quantity(&request.instrument, q.min(held.quantity)).await?,
            None => held.quantity,
        };
        let response = self
            .market_order(
                &request.instrument,
                OrderSide::closing(request.direction),
                request.direction,
                quantity,
            )
            .await?;
        let report = Self::report(response, &request.instrument, request.direction, quantity);
        info!(
            instrument = %request.instrument,
            direction = %request.direction,
            quantity = %report.filled_quantity,
            order_id = %report.order_id,
            "binance position closed"
        );

        let fully_closed = quantity >= held.quantity;
        let other_side_open = positions
            .iter()
            .any(|p| p.instrument == request.instrument && p.direction != request.direction);
        if fully_closed && !other_side_open {
            if let Err(e) = self.cancel_open_orders(&request.instrument).await {
                warn!(instrument = %request.instrument, error = %e, "failed to cancel protective orders");
            }
        }

        Ok(report)
    }

    async fn set_leverage(&self, instrument: &str, leverage: u32) -> Result<()> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                "/fapi/v1/leverage",
                &[
                    ("symbol", instrument.to_string()),
                    ("leverage", leverage.to_string()),
                ],
                Auth::Signed,
            )
            .await?;
        debug!(instrument, leverage, "binance leverage set");
        Ok(())
    }

    async fn get_price(&self, instrument: &str) -> Result<Decimal> {
        let ticker: PriceTicker = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/price",
                &[("symbol", instrument.to_string())],
                Auth::None,
            )
            .await?;
        Ok(ticker.price)
    }

    async fn acquire_lease(&self) -> Result<CredentialLease> {
        let response: ListenKeyResponse = self
            .request(Method::POST, "/fapi/v1/listenKey", &[], Auth::ApiKey)
            .await?;
        info!("binance listenKey acquired");
        Ok(CredentialLease::new(
            response.listen_key,
            self.config.listen_key_validity,
        ))
    }

    async fn renew_lease(&self, lease: &CredentialLease) -> Result<LeaseRenewal> {
        let response: serde_json::Value = self
            .request(Method::PUT, "/fapi/v1/listenKey", &[], Auth::ApiKey)
            .await?;
        // The keepalive returns the key it extended; a different one means ours is gone.
        match response.get("listenKey").and_then(|k| k.as_str()) {
            Some(key) if key != lease.token => Err(TraderError::LeaseExpired),
            _ => Ok(LeaseRenewal::Renewed(lease.refreshed(Instant::now()))),
        }
    }

    async fn revoke_lease(&self, _lease: &CredentialLease) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::DELETE, "/fapi/v1/listenKey", &[], Auth::ApiKey)
            .await?;
        info!("binance listenKey closed");
        Ok(())
    }

    async fn subscribe(&self, lease: &CredentialLease) -> Result<EventSubscription> {
        let account = self.get_account().await?;
        let positions = self.get_positions().await?;
        binance_user_stream::subscribe(&self.config.ws_url, &lease.token, account, positions)
            .await
    }
}

#[async_trait]
impl MarketDataSource for BinanceFuturesClient {
    async fn market_snapshot(&self, instruments: &[String]) -> Result<MarketBundle> {
        let tickers: Vec<Ticker24h> = self
            .request(Method::GET, "/fapi/v1/ticker/24hr", &[], Auth::None)
            .await?;
        Ok(tickers
            .into_iter()
            .filter(|t| instruments.contains(&t.symbol))
            .map(|t| {
                (
                    t.symbol.clone(),
                    MarketSnapshot {
                        instrument: t.symbol,
                        last_price: t.last_price,
                        change_24h_pct: t.price_change_percent,
                        quote_volume_24h: t.quote_volume,
                        as_of: millis_to_utc(t.close_time),
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> BinanceFuturesClient {
        BinanceFuturesClient::new(
            BinanceFuturesConfig::testnet(),
            "key".to_string(),
            SecretString::new("NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j"),
        )
        .unwrap()
    }

    #[test]
    fn signs_query_like_binance_docs() {
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client().sign(query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_appends_window_timestamp_and_signature() {
        let query = client()
            .query_string(&[("symbol", "BTCUSDT".to_string())], Auth::Signed)
            .unwrap();
        assert!(query.starts_with("symbol=BTCUSDT&recvWindow=5000&timestamp="));
        let (_, signature) = query.rsplit_once("&signature=").unwrap();
        assert_eq!(signature.len(), 64);

        let plain = client()
            .query_string(&[("symbol", "BTCUSDT".to_string())], Auth::ApiKey)
            .unwrap();
        assert_eq!(plain, "symbol=BTCUSDT");
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let err = BinanceFuturesClient::new(
            BinanceFuturesConfig::default(),
            String::new(),
            SecretString::new("secret"),
        )
        .unwrap_err();
        assert!(err.is_fatal_config());
    }

    #[test]
    fn maps_api_errors() {
        let rejected = api_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":-2019,"msg":"Margin is insufficient."}"#,
        );
        assert!(matches!(rejected, TraderError::ExchangeRejected { code: -2019, .. }));
        assert!(!rejected.is_transient());

        assert!(matches!(
            api_error(
                StatusCode::BAD_REQUEST,
                r#"{"code":-1125,"msg":"This listenKey does not exist."}"#
            ),
            TraderError::LeaseExpired
        ));
        assert!(api_error(StatusCode::BAD_GATEWAY, "upstream").is_transient());
        assert!(api_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn position_risk_keeps_open_hedge_positions() {
        let body = r#"[
            {"symbol":"BTCUSDT","positionAmt":"0.010","entryPrice":"65000.0","markPrice":"66000.0",
             "unRealizedProfit":"10.0","leverage":"5","positionSide":"LONG","updateTime":1717000000000},
            {"symbol":"BTCUSDT","positionAmt":"0.000","entryPrice":"0.0","markPrice":"66000.0",
             "unRealizedProfit":"0.0","leverage":"5","positionSide":"SHORT","updateTime":0},
            {"symbol":"ETHUSDT","positionAmt":"-0.5","entryPrice":"3000","markPrice":"2950",
             "unRealizedProfit":"25","leverage":"3","positionSide":"BOTH","updateTime":0}
        ]"#;
        let risks: Vec<PositionRisk> = serde_json::from_str(body).unwrap();
        let positions = position_snapshots(risks);

        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].direction, Direction::Long);
        assert_eq!(positions[0].quantity, dec!(0.010));
        assert_eq!(positions[0].leverage, 5);
        assert_eq!(positions[1].direction, Direction::Short);
        assert_eq!(positions[1].quantity, dec!(0.5));
    }

    #[test]
    fn rounds_down_to_lot_step() {
        assert_eq!(round_to_step(dec!(0.0157), dec!(0.001)), dec!(0.015));
        assert_eq!(round_to_step(dec!(12.9), dec!(1)), dec!(12));
        assert_eq!(round_to_step(dec!(0.0004), dec!(0.001)), dec!(0));
    }

    #[test]
    fn lot_step_reads_lot_size_filter() {
        let info: ExchangeInfo = serde_json::from_str(
            r#"{"symbols":[{"symbol":"BTCUSDT","filters":[
                {"filterType":"PRICE_FILTER","tickSize":"0.10"},
                {"filterType":"LOT_SIZE","stepSize":"0.001","minQty":"0.001"}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(info.symbols[0].lot_step(), Some(dec!(0.001)));
    }
}
