// =============================================================================
// Binance USDS-Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Reliability:
//   - Transport failures (reset, timeout, protocol break) retry up to 3
//     attempts with 1 s / 2 s backoff; the signature is recomputed per attempt
//     because the timestamp must be fresh.
//   - A -1003 response arms a ban-until floor shared by every clone of this
//     client; until it lapses all calls fail fast with `Banned` instead of
//     touching the wire.
//   - exchangeInfo (weight 40) is cached for 1 hour; concurrent callers share
//     the cached copy.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, error, instrument, warn};

use super::error::{parse_ban_until_ms, BinanceError};
use super::models::{
    parse_open_algo_orders, AlgoOrder, ExchangeInfo, IncomeRecord, Kline, OrderUpdate,
    PositionRisk, PremiumIndex, TickerPrice, UsdtBalance,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Retry budget for transport failures.
const MAX_ATTEMPTS: usize = 3;
/// Backoff schedule between attempts (seconds).
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// exchangeInfo cache TTL. Binance charges weight 40 per call.
const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(3600);

/// Conservative ban window applied when -1003 carries no release timestamp.
const FALLBACK_BAN_SECS: i64 = 60;

/// Binance USDS-futures REST client. Cheap to clone; clones share the
/// circuit-breaker floor, the exchangeInfo cache, and the position-mode flag.
#[derive(Clone)]
pub struct FuturesClient {
    secret: String,
    base_url: String,
    http: reqwest::Client,
    /// Epoch-ms floor below which every request short-circuits with `Banned`.
    ban_until_ms: Arc<AtomicI64>,
    exchange_info: Arc<RwLock<Option<(Instant, Arc<ExchangeInfo>)>>>,
    /// `Some(true)` = hedge mode, `Some(false)` = one-way. Queried once.
    hedge_mode: Arc<RwLock<Option<bool>>>,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in the query).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        debug!("FuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            http,
            ban_until_ms: Arc::new(AtomicI64::new(0)),
            exchange_info: Arc::new(RwLock::new(None)),
            hedge_mode: Arc::new(RwLock::new(None)),
        }
    }

    /// Override the base URL (testnet, mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Full signed query for a given millisecond timestamp. Split out from
    /// the live path so the shape is testable.
    fn signed_query_with_ts(&self, params: &str, ts: i64) -> String {
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn signed_query(&self, params: &str) -> String {
        self.signed_query_with_ts(params, Self::timestamp_ms())
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Seconds remaining on the ban floor, if armed.
    pub fn ban_remaining_secs(&self) -> Option<i64> {
        let until = self.ban_until_ms.load(Ordering::Relaxed);
        let now = Self::timestamp_ms();
        if until > now {
            Some((until - now + 999) / 1000)
        } else {
            None
        }
    }

    /// Arm the ban floor. Used internally on -1003; exposed for tests.
    pub fn arm_ban_until(&self, until_ms: i64) {
        self.ban_until_ms.store(until_ms, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Request core
    // -------------------------------------------------------------------------

    /// Issue one request with retry, signing, and circuit-breaker handling.
    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
    ) -> Result<serde_json::Value, BinanceError> {
        if let Some(remaining_secs) = self.ban_remaining_secs() {
            return Err(BinanceError::Banned { remaining_secs });
        }

        let mut last_transport: Option<String> = None;

        for attempt in 0..MAX_ATTEMPTS {
            // Re-sign each attempt: the timestamp must be fresh.
            let query = if signed {
                self.signed_query(params)
            } else {
                params.to_string()
            };
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };

            let resp = match self.http.request(method.clone(), &url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_transport = Some(e.to_string());
                    if attempt < MAX_ATTEMPTS - 1 {
                        let wait = RETRY_BACKOFF_SECS[attempt];
                        warn!(
                            path,
                            attempt = attempt + 1,
                            wait_secs = wait,
                            error = %e,
                            "transport error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status();
            let body: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(_) if status.is_success() => serde_json::Value::Null,
                Err(e) => {
                    return Err(BinanceError::Transport(format!(
                        "failed to read response body: {e}"
                    )))
                }
            };

            // Binance reports errors in the body even on 4xx responses.
            if let Some(code) = body.get("code").and_then(|c| c.as_i64()) {
                if code < 0 {
                    let msg = body
                        .get("msg")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error")
                        .to_string();
                    if code == -1003 {
                        let until_ms = parse_ban_until_ms(&msg)
                            .unwrap_or_else(|| Self::timestamp_ms() + FALLBACK_BAN_SECS * 1000);
                        self.arm_ban_until(until_ms);
                        error!(
                            release_ms = until_ms,
                            "Binance IP ban — halting all REST requests until release"
                        );
                    }
                    return Err(BinanceError::Api { code, msg });
                }
            }

            if !status.is_success() {
                return Err(BinanceError::Api {
                    code: status.as_u16() as i64,
                    msg: body.to_string(),
                });
            }

            return Ok(body);
        }

        Err(BinanceError::Transport(
            last_transport.unwrap_or_else(|| "max retries exceeded".into()),
        ))
    }

    // -------------------------------------------------------------------------
    // Market data (public)
    // -------------------------------------------------------------------------

    /// `GET /fapi/v1/exchangeInfo`, cached in-process for 1 hour.
    pub async fn exchange_info(&self) -> Result<Arc<ExchangeInfo>, BinanceError> {
        if let Some((fetched, info)) = self.exchange_info.read().as_ref() {
            if fetched.elapsed() < EXCHANGE_INFO_TTL {
                return Ok(info.clone());
            }
        }

        let body = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", "", false)
            .await?;
        let info: ExchangeInfo = serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("exchangeInfo parse failed: {e}")))?;
        let info = Arc::new(info);
        *self.exchange_info.write() = Some((Instant::now(), info.clone()));
        debug!(symbols = info.symbols.len(), "exchangeInfo cache refreshed");
        Ok(info)
    }

    /// `GET /fapi/v1/klines` — ordered OHLCV bars.
    #[instrument(skip(self), name = "binance::klines")]
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>, BinanceError> {
        let mut params = format!("symbol={symbol}&interval={interval}");
        if let Some(s) = start_ms {
            params.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_ms {
            params.push_str(&format!("&endTime={e}"));
        }
        if let Some(l) = limit {
            params.push_str(&format!("&limit={l}"));
        }

        let body = self
            .request(Method::GET, "/fapi/v1/klines", &params, false)
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| BinanceError::Transport("klines response is not an array".into()))?;
        raw.iter().map(Kline::from_array).collect()
    }

    /// `GET /fapi/v2/ticker/price` — latest trade price.
    pub async fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, BinanceError> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v2/ticker/price",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("ticker parse failed: {e}")))
    }

    /// `GET /fapi/v1/premiumIndex` — mark price, index price, funding.
    pub async fn premium_index(&self, symbol: &str) -> Result<PremiumIndex, BinanceError> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("premiumIndex parse failed: {e}")))
    }

    // -------------------------------------------------------------------------
    // Orders (signed)
    // -------------------------------------------------------------------------

    /// `POST /fapi/v1/order` — submit a new order.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, side = %order.side), name = "binance::place_order")]
    pub async fn place_order(&self, order: &NewOrder) -> Result<OrderUpdate, BinanceError> {
        let body = self
            .request(Method::POST, "/fapi/v1/order", &order.to_query(), true)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("order response parse failed: {e}")))
    }

    /// `GET /fapi/v1/order` — query an order's status.
    pub async fn query_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<OrderUpdate, BinanceError> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
            )
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("order response parse failed: {e}")))
    }

    /// `DELETE /fapi/v1/order` — cancel an active order.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<OrderUpdate, BinanceError> {
        let body = self
            .request(
                Method::DELETE,
                "/fapi/v1/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
            )
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("order response parse failed: {e}")))
    }

    /// `GET /fapi/v1/openOrders` — open regular orders, optionally per symbol.
    pub async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderUpdate>, BinanceError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .request(Method::GET, "/fapi/v1/openOrders", &params, true)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("openOrders parse failed: {e}")))
    }

    /// MARKET `reduceOnly` order that closes (part of) an existing position.
    pub async fn place_market_close(
        &self,
        symbol: &str,
        side: &str,
        position_side: &str,
        quantity: &str,
    ) -> Result<OrderUpdate, BinanceError> {
        let order = NewOrder {
            symbol: symbol.to_string(),
            side: side.to_string(),
            position_side: position_side.to_string(),
            order_type: "MARKET".to_string(),
            quantity: Some(quantity.to_string()),
            price: None,
            time_in_force: None,
            reduce_only: true,
            client_order_id: None,
        };
        self.place_order(&order).await
    }

    // -------------------------------------------------------------------------
    // Algo (conditional) orders
    // -------------------------------------------------------------------------

    /// `POST /fapi/v1/algoOrder` — place a conditional order
    /// (TAKE_PROFIT_MARKET / STOP_MARKET).
    #[instrument(skip(self, order), fields(symbol = %order.symbol, algo_type = %order.algo_type), name = "binance::place_algo_order")]
    pub async fn place_algo_order(&self, order: &NewAlgoOrder) -> Result<AlgoOrder, BinanceError> {
        let body = self
            .request(Method::POST, "/fapi/v1/algoOrder", &order.to_query(), true)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("algoOrder parse failed: {e}")))
    }

    /// `GET /fapi/v1/openAlgoOrders` — open conditional orders; the response
    /// nests them under an `orders` array.
    pub async fn open_algo_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<AlgoOrder>, BinanceError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .request(Method::GET, "/fapi/v1/openAlgoOrders", &params, true)
            .await?;
        parse_open_algo_orders(body)
    }

    /// `DELETE /fapi/v1/algoOrder` — cancel a conditional order.
    pub async fn cancel_algo_order(&self, symbol: &str, algo_id: u64) -> Result<(), BinanceError> {
        self.request(
            Method::DELETE,
            "/fapi/v1/algoOrder",
            &format!("symbol={symbol}&algoId={algo_id}"),
            true,
        )
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account (signed)
    // -------------------------------------------------------------------------

    /// `GET /fapi/v2/positionRisk` — current positions.
    pub async fn position_risk(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionRisk>, BinanceError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .request(Method::GET, "/fapi/v2/positionRisk", &params, true)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("positionRisk parse failed: {e}")))
    }

    /// `GET /fapi/v2/balance` — the USDT slice of the futures wallet.
    pub async fn account_balance(&self) -> Result<UsdtBalance, BinanceError> {
        let body = self
            .request(Method::GET, "/fapi/v2/balance", "", true)
            .await?;
        let rows = body
            .as_array()
            .ok_or_else(|| BinanceError::Transport("balance response is not an array".into()))?;
        for row in rows {
            if row.get("asset").and_then(|a| a.as_str()) == Some("USDT") {
                let get = |key: &str| -> Decimal {
                    row.get(key)
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(Decimal::ZERO)
                };
                return Ok(UsdtBalance {
                    total: get("balance"),
                    available: get("availableBalance"),
                    unrealized_pnl: get("crossUnPnl"),
                });
            }
        }
        warn!("USDT not found in balance response");
        Ok(UsdtBalance::default())
    }

    /// `GET /fapi/v2/account` — full account info (per-position margins).
    pub async fn account_info(&self) -> Result<serde_json::Value, BinanceError> {
        self.request(Method::GET, "/fapi/v2/account", "", true).await
    }

    /// `POST /fapi/v1/leverage`.
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BinanceError> {
        self.request(
            Method::POST,
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
            true,
        )
        .await?;
        Ok(())
    }

    /// `POST /fapi/v1/marginType` — "ISOLATED" or "CROSSED".
    pub async fn set_margin_type(
        &self,
        symbol: &str,
        margin_type: &str,
    ) -> Result<(), BinanceError> {
        self.request(
            Method::POST,
            "/fapi/v1/marginType",
            &format!("symbol={symbol}&marginType={margin_type}"),
            true,
        )
        .await?;
        Ok(())
    }

    /// `GET /fapi/v1/positionSide/dual` — `true` when the account runs hedge
    /// mode (separate LONG/SHORT books). Cached after the first query.
    pub async fn is_hedge_mode(&self) -> Result<bool, BinanceError> {
        if let Some(cached) = *self.hedge_mode.read() {
            return Ok(cached);
        }
        let body = self
            .request(Method::GET, "/fapi/v1/positionSide/dual", "", true)
            .await?;
        let dual = body
            .get("dualSidePosition")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        *self.hedge_mode.write() = Some(dual);
        debug!(hedge_mode = dual, "position mode cached");
        Ok(dual)
    }

    /// `GET /fapi/v1/income` — realized PnL, funding, commission history.
    pub async fn income_history(
        &self,
        income_type: Option<&str>,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<IncomeRecord>, BinanceError> {
        let mut params = format!("limit={limit}");
        if let Some(t) = income_type {
            params.push_str(&format!("&incomeType={t}"));
        }
        if let Some(s) = start_ms {
            params.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_ms {
            params.push_str(&format!("&endTime={e}"));
        }
        let body = self
            .request(Method::GET, "/fapi/v1/income", &params, true)
            .await?;
        serde_json::from_value(body)
            .map_err(|e| BinanceError::Transport(format!("income parse failed: {e}")))
    }

    /// Sum of today's (UTC) realized PnL records.
    pub async fn daily_realized_pnl(&self) -> Result<Decimal, BinanceError> {
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp_millis();
        let records = self
            .income_history(Some("REALIZED_PNL"), Some(start_of_day), None, 1000)
            .await?;
        Ok(records.iter().map(|r| r.income).sum())
    }

    /// `GET /fapi/v1/userTrades` — account fills with prices and realized PnL.
    pub async fn user_trades(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<serde_json::Value>, BinanceError> {
        let mut params = format!("symbol={symbol}&limit={limit}");
        if let Some(s) = start_ms {
            params.push_str(&format!("&startTime={s}"));
        }
        let body = self
            .request(Method::GET, "/fapi/v1/userTrades", &params, true)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // User-data stream listen key
    // -------------------------------------------------------------------------

    /// `POST /fapi/v1/listenKey` — open a user-data stream session.
    pub async fn create_listen_key(&self) -> Result<String, BinanceError> {
        let body = self
            .request(Method::POST, "/fapi/v1/listenKey", "", false)
            .await?;
        body.get("listenKey")
            .and_then(|k| k.as_str())
            .map(str::to_string)
            .ok_or_else(|| BinanceError::Transport("listenKey missing from response".into()))
    }

    /// `PUT /fapi/v1/listenKey` — extend the session (call every 30 min).
    pub async fn keepalive_listen_key(&self) -> Result<(), BinanceError> {
        self.request(Method::PUT, "/fapi/v1/listenKey", "", false)
            .await?;
        Ok(())
    }

    /// `DELETE /fapi/v1/listenKey` — close the session on shutdown.
    pub async fn close_listen_key(&self) -> Result<(), BinanceError> {
        self.request(Method::DELETE, "/fapi/v1/listenKey", "", false)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Order parameter builders
// ---------------------------------------------------------------------------

/// Parameters for `POST /fapi/v1/order`.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    /// "BUY" or "SELL".
    pub side: String,
    /// "LONG" / "SHORT" in hedge mode, "BOTH" in one-way mode.
    pub position_side: String,
    /// "LIMIT" or "MARKET".
    pub order_type: String,
    pub quantity: Option<String>,
    pub price: Option<String>,
    /// Required for LIMIT orders; the engine always uses "GTC".
    pub time_in_force: Option<&'static str>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl NewOrder {
    pub fn to_query(&self) -> String {
        let mut q = format!(
            "symbol={}&side={}&positionSide={}&type={}",
            self.symbol, self.side, self.position_side, self.order_type
        );
        if let Some(qty) = &self.quantity {
            q.push_str(&format!("&quantity={qty}"));
        }
        if let Some(p) = &self.price {
            q.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = self.time_in_force {
            q.push_str(&format!("&timeInForce={tif}"));
        }
        if self.reduce_only {
            q.push_str("&reduceOnly=true");
        }
        if let Some(id) = &self.client_order_id {
            q.push_str(&format!("&newClientOrderId={id}"));
        }
        q
    }
}

/// Parameters for `POST /fapi/v1/algoOrder`. Always reduce-only, price
/// protected, triggered against CONTRACT_PRICE — the bracket-order contract.
#[derive(Debug, Clone)]
pub struct NewAlgoOrder {
    pub symbol: String,
    /// "BUY" or "SELL" — the closing side.
    pub side: String,
    pub position_side: String,
    /// "TAKE_PROFIT_MARKET" or "STOP_MARKET".
    pub algo_type: String,
    pub trigger_price: String,
    pub quantity: String,
    pub client_algo_id: String,
}

impl NewAlgoOrder {
    pub fn to_query(&self) -> String {
        format!(
            "symbol={}&side={}&positionSide={}&type={}&algoType=CONDITIONAL&triggerPrice={}&quantity={}\
             &reduceOnly=true&priceProtect=true&workingType=CONTRACT_PRICE&clientAlgoId={}",
            self.symbol,
            self.side,
            self.position_side,
            self.algo_type,
            self.trigger_price,
            self.quantity,
            self.client_algo_id
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Signature vector from the Binance API documentation.
    #[test]
    fn hmac_signature_matches_reference_vector() {
        let client = FuturesClient::new(
            "vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
            "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
        );
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            client.sign(query),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_appends_timestamp_recv_window_and_signature() {
        let client = FuturesClient::new("key", "secret");
        let q = client.signed_query_with_ts("symbol=BTCUSDT", 1_700_000_000_000);
        assert!(q.starts_with("symbol=BTCUSDT&timestamp=1700000000000&recvWindow=5000&signature="));
        let sig = q.rsplit('=').next().unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn armed_ban_floor_short_circuits_every_call() {
        let client = FuturesClient::new("key", "secret");
        client.arm_ban_until(FuturesClient::timestamp_ms() + 30_000);

        let err = client.ticker_price("BTCUSDT").await.unwrap_err();
        match err {
            BinanceError::Banned { remaining_secs } => {
                assert!(remaining_secs > 0 && remaining_secs <= 30);
            }
            other => panic!("expected Banned, got {other:?}"),
        }
    }

    #[test]
    fn lapsed_ban_floor_clears() {
        let client = FuturesClient::new("key", "secret");
        client.arm_ban_until(FuturesClient::timestamp_ms() - 1);
        assert_eq!(client.ban_remaining_secs(), None);
    }

    #[test]
    fn limit_order_query_shape() {
        let order = NewOrder {
            symbol: "BTCUSDT".into(),
            side: "SELL".into(),
            position_side: "BOTH".into(),
            order_type: "LIMIT".into(),
            quantity: Some("0.01".into()),
            price: Some("50000".into()),
            time_in_force: Some("GTC"),
            reduce_only: false,
            client_order_id: Some("entry_0123abcd".into()),
        };
        assert_eq!(
            order.to_query(),
            "symbol=BTCUSDT&side=SELL&positionSide=BOTH&type=LIMIT&quantity=0.01&price=50000&timeInForce=GTC&newClientOrderId=entry_0123abcd"
        );
    }

    #[test]
    fn algo_order_query_carries_protection_flags() {
        let order = NewAlgoOrder {
            symbol: "BTCUSDT".into(),
            side: "BUY".into(),
            position_side: "BOTH".into(),
            algo_type: "TAKE_PROFIT_MARKET".into(),
            trigger_price: "33493.3".into(),
            quantity: "0.01".into(),
            client_algo_id: "tp_0123abcd".into(),
        };
        let q = order.to_query();
        assert!(q.contains("type=TAKE_PROFIT_MARKET"));
        assert!(q.contains("algoType=CONDITIONAL"));
        assert!(q.contains("reduceOnly=true"));
        assert!(q.contains("priceProtect=true"));
        assert!(q.contains("workingType=CONTRACT_PRICE"));
        assert!(q.contains("clientAlgoId=tp_0123abcd"));
    }
}
