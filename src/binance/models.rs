// =============================================================================
// Wire models for the Binance USDS-futures REST surface
// =============================================================================
//
// Binance serialises every price and quantity as a JSON string; all of those
// fields deserialise into `rust_decimal::Decimal` so order math never touches
// binary floats. Volumes only ever feed ratios, so they stay `f64`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::BinanceError;

// ---------------------------------------------------------------------------
// Klines
// ---------------------------------------------------------------------------

/// A single OHLCV bar from `GET /fapi/v1/klines`.
///
/// Binance returns klines as positional arrays:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] closeTime, [7] quoteVolume, [8] trades, [9] takerBuyBaseVolume,
///   [10] takerBuyQuoteVolume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
    pub taker_buy_base_volume: f64,
}

impl Kline {
    /// Parse one kline entry from the array-of-arrays response format.
    pub fn from_array(entry: &serde_json::Value) -> Result<Self, BinanceError> {
        let arr = entry
            .as_array()
            .ok_or_else(|| malformed("kline entry is not an array"))?;
        if arr.len() < 11 {
            return Err(malformed("kline entry has too few elements"));
        }

        Ok(Self {
            open_time: arr[0].as_i64().unwrap_or(0),
            close_time: arr[6].as_i64().unwrap_or(0),
            open: parse_decimal(&arr[1], "kline open")?,
            high: parse_decimal(&arr[2], "kline high")?,
            low: parse_decimal(&arr[3], "kline low")?,
            close: parse_decimal(&arr[4], "kline close")?,
            volume: parse_f64(&arr[5], "kline volume")?,
            taker_buy_base_volume: parse_f64(&arr[9], "kline takerBuyBaseVolume")?,
        })
    }

    /// Taker-sell base volume: everything that was not taker-buy.
    pub fn sell_volume(&self) -> f64 {
        (self.volume - self.taker_buy_base_volume).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Tickers / premium index
// ---------------------------------------------------------------------------

/// `GET /fapi/v2/ticker/price` for a single symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

/// `GET /fapi/v1/premiumIndex` — mark/index price and funding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    #[serde(default)]
    pub last_funding_rate: Decimal,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order state returned by `POST/GET/DELETE /fapi/v1/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub avg_price: Decimal,
    #[serde(default)]
    pub orig_qty: Decimal,
    #[serde(default)]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub side: String,
    #[serde(default, rename = "type")]
    pub order_type: String,
}

impl OrderUpdate {
    /// Fill price: average price when the exchange reports one, otherwise the
    /// limit price the order was placed at.
    pub fn fill_price(&self) -> Decimal {
        if self.avg_price > Decimal::ZERO {
            self.avg_price
        } else {
            self.price
        }
    }
}

/// A conditional order from `POST /fapi/v1/algoOrder` or the
/// `GET /fapi/v1/openAlgoOrders` listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrder {
    pub algo_id: u64,
    pub symbol: String,
    #[serde(default)]
    pub client_algo_id: String,
    #[serde(default, rename = "orderType", alias = "type")]
    pub order_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub trigger_price: Decimal,
    #[serde(default)]
    pub quantity: Decimal,
}

/// Unwrap the `{"orders": [...]}` envelope that `openAlgoOrders` responds
/// with (a bare array is tolerated for forward compatibility).
pub fn parse_open_algo_orders(body: serde_json::Value) -> Result<Vec<AlgoOrder>, BinanceError> {
    let raw = match body {
        serde_json::Value::Object(mut map) => map
            .remove("orders")
            .ok_or_else(|| malformed("openAlgoOrders response missing 'orders'"))?,
        other => other,
    };
    serde_json::from_value(raw)
        .map_err(|e| malformed(&format!("openAlgoOrders parse failed: {e}")))
}

// ---------------------------------------------------------------------------
// Positions / account
// ---------------------------------------------------------------------------

/// One row of `GET /fapi/v2/positionRisk`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub position_side: String,
    #[serde(default, rename = "unRealizedProfit")]
    pub unrealized_profit: Decimal,
}

impl PositionRisk {
    pub fn is_open(&self) -> bool {
        self.position_amt != Decimal::ZERO
    }
}

/// USDT slice of `GET /fapi/v2/balance`.
#[derive(Debug, Clone, Default)]
pub struct UsdtBalance {
    pub total: Decimal,
    pub available: Decimal,
    pub unrealized_pnl: Decimal,
}

/// One record of `GET /fapi/v1/income`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeRecord {
    #[serde(default)]
    pub symbol: String,
    pub income_type: String,
    pub income: Decimal,
    pub time: i64,
}

// ---------------------------------------------------------------------------
// Exchange info
// ---------------------------------------------------------------------------

/// Raw symbol entry from `GET /fapi/v1/exchangeInfo`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub quote_asset: String,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolFilter {
    pub filter_type: String,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub step_size: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

/// The per-symbol rounding rules the engine actually needs, distilled from
/// the PRICE_FILTER / LOT_SIZE filters.
#[derive(Debug, Clone)]
pub struct SymbolRules {
    pub tick_size: Option<Decimal>,
    pub step_size: Option<Decimal>,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl SymbolInfo {
    /// Distil the rounding rules out of the filter list.
    pub fn rules(&self) -> SymbolRules {
        let mut tick_size = None;
        let mut step_size = None;
        for f in &self.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => {
                    tick_size = f.tick_size.filter(|t| *t > Decimal::ZERO);
                }
                "LOT_SIZE" => {
                    step_size = f.step_size.filter(|s| *s > Decimal::ZERO);
                }
                _ => {}
            }
        }
        SymbolRules {
            tick_size,
            step_size,
            price_precision: self.price_precision,
            quantity_precision: self.quantity_precision,
        }
    }

    /// True for the contracts the scanner sweeps: USDT-quoted perpetuals
    /// that are currently trading.
    pub fn is_tradeable_usdt_perp(&self) -> bool {
        self.quote_asset == "USDT" && self.contract_type == "PERPETUAL" && self.status == "TRADING"
    }
}

// ---------------------------------------------------------------------------
// Parse helpers
// ---------------------------------------------------------------------------

fn malformed(what: &str) -> BinanceError {
    BinanceError::Transport(format!("malformed response: {what}"))
}

/// Parse a JSON value that may be either a string or a number into `Decimal`.
pub(crate) fn parse_decimal(val: &serde_json::Value, what: &str) -> Result<Decimal, BinanceError> {
    if let Some(s) = val.as_str() {
        s.parse()
            .map_err(|_| malformed(&format!("{what}: cannot parse '{s}'")))
    } else if let Some(n) = val.as_f64() {
        Decimal::try_from(n).map_err(|_| malformed(&format!("{what}: bad number {n}")))
    } else {
        Err(malformed(&format!("{what}: expected string or number")))
    }
}

pub(crate) fn parse_f64(val: &serde_json::Value, what: &str) -> Result<f64, BinanceError> {
    if let Some(s) = val.as_str() {
        s.parse()
            .map_err(|_| malformed(&format!("{what}: cannot parse '{s}'")))
    } else {
        val.as_f64()
            .ok_or_else(|| malformed(&format!("{what}: expected string or number")))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn kline_parses_from_array() {
        let raw = serde_json::json!([
            1700000000000_i64, "50000.1", "50100.0", "49900.0", "50050.5",
            "1234.5", 1700003599999_i64, "61725000.0", 4321, "400.5", "20045000.0", "0"
        ]);
        let k = Kline::from_array(&raw).unwrap();
        assert_eq!(k.open_time, 1_700_000_000_000);
        assert_eq!(k.close, dec!(50050.5));
        assert!((k.sell_volume() - 834.0).abs() < 1e-9);
    }

    #[test]
    fn short_kline_array_is_rejected() {
        let raw = serde_json::json!(["1", "2"]);
        assert!(Kline::from_array(&raw).is_err());
    }

    #[test]
    fn open_algo_orders_unwraps_orders_envelope() {
        let body = serde_json::json!({
            "orders": [{
                "algoId": 100,
                "symbol": "BTCUSDT",
                "clientAlgoId": "tp_0123abcd",
                "orderType": "TAKE_PROFIT_MARKET",
                "side": "BUY",
                "triggerPrice": "33493.3",
                "quantity": "0.01"
            }]
        });
        let orders = parse_open_algo_orders(body).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].algo_id, 100);
        assert_eq!(orders[0].client_algo_id, "tp_0123abcd");
        assert_eq!(orders[0].trigger_price, dec!(33493.3));
    }

    #[test]
    fn open_algo_orders_accepts_bare_array() {
        let body = serde_json::json!([{ "algoId": 7, "symbol": "ETHUSDT" }]);
        let orders = parse_open_algo_orders(body).unwrap();
        assert_eq!(orders[0].algo_id, 7);
    }

    #[test]
    fn position_risk_open_check() {
        let p: PositionRisk = serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "positionAmt": "-0.010",
            "entryPrice": "49990.0",
            "positionSide": "BOTH"
        }))
        .unwrap();
        assert!(p.is_open());
        assert_eq!(p.position_amt, dec!(-0.010));
    }

    #[test]
    fn symbol_rules_read_price_and_lot_filters() {
        let info: SymbolInfo = serde_json::from_value(serde_json::json!({
            "symbol": "BTCUSDT",
            "quoteAsset": "USDT",
            "contractType": "PERPETUAL",
            "status": "TRADING",
            "pricePrecision": 2,
            "quantityPrecision": 3,
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001" },
                { "filterType": "MIN_NOTIONAL" }
            ]
        }))
        .unwrap();
        let rules = info.rules();
        assert_eq!(rules.tick_size, Some(dec!(0.10)));
        assert_eq!(rules.step_size, Some(dec!(0.001)));
        assert!(info.is_tradeable_usdt_perp());
    }

    #[test]
    fn fill_price_prefers_avg_price() {
        let o: OrderUpdate = serde_json::from_value(serde_json::json!({
            "orderId": 42,
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "price": "50000",
            "avgPrice": "49990.0"
        }))
        .unwrap();
        assert_eq!(o.fill_price(), dec!(49990.0));
    }
}
