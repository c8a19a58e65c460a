// =============================================================================
// Order Executor — entry placement with a deferred TP/SL bracket
// =============================================================================
//
// Entries are LIMIT-only. The TP/SL algo orders are NOT placed here: placing
// them before the entry fills draws -2021 ("order would immediately trigger")
// from Binance. Instead the executor returns the bracket parameters and the
// position monitor places them once the fill is confirmed.
//
//   LONG:  entry=BUY,  close=SELL, TP above entry, SL below
//   SHORT: entry=SELL, close=BUY,  TP below entry, SL above

use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::binance::client::{NewAlgoOrder, NewOrder};
use crate::binance::models::SymbolRules;
use crate::binance::rounding::{round_down_to_precision, round_price_to_tick, round_qty_to_step};
use crate::binance::{AlgoOrder, BinanceError, FuturesClient, OrderUpdate};
use crate::types::{client_order_id, order_token, Side};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Bracket parameters computed at entry time and executed after the fill.
/// The percentages travel along so the trigger prices can be recomputed
/// from the actual fill price when it differs from the limit price.
#[derive(Debug, Clone)]
pub struct DeferredBracket {
    pub symbol: String,
    /// "BUY" or "SELL" — the side that closes the position.
    pub close_side: String,
    /// "LONG"/"SHORT" in hedge mode, "BOTH" in one-way mode.
    pub position_side: String,
    pub tp_price: Decimal,
    pub sl_price: Decimal,
    pub tp_pct: f64,
    pub sl_pct: f64,
    pub quantity: Decimal,
    /// 8-hex token shared by this position's client order ids.
    pub order_prefix: String,
}

/// A successfully submitted entry order plus its deferred bracket.
#[derive(Debug, Clone)]
pub struct EntryTicket {
    pub order: OrderUpdate,
    pub bracket: DeferredBracket,
}

/// One leg of the protective bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketSide {
    TakeProfit,
    StopLoss,
}

impl BracketSide {
    pub fn algo_type(&self) -> &'static str {
        match self {
            Self::TakeProfit => "TAKE_PROFIT_MARKET",
            Self::StopLoss => "STOP_MARKET",
        }
    }

    /// Client-id role prefix: "tp" or "sl".
    pub fn role(&self) -> &'static str {
        match self {
            Self::TakeProfit => "tp",
            Self::StopLoss => "sl",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TakeProfit => "take-profit",
            Self::StopLoss => "stop-loss",
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    client: FuturesClient,
    leverage: u32,
}

impl OrderExecutor {
    pub fn new(client: FuturesClient, leverage: u32) -> Self {
        Self { client, leverage }
    }

    /// Rounding rules for a symbol, via the client's cached exchangeInfo.
    pub async fn symbol_rules(&self, symbol: &str) -> Result<SymbolRules, BinanceError> {
        let info = self.client.exchange_info().await?;
        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.rules())
            .ok_or_else(|| BinanceError::Api {
                code: -1121,
                msg: format!("symbol {symbol} not found in exchangeInfo"),
            })
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Place the LIMIT entry and compute the deferred bracket.
    pub async fn open_position(
        &self,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        side: Side,
        tp_pct: f64,
        sl_pct: f64,
    ) -> Result<EntryTicket, BinanceError> {
        let rules = self.symbol_rules(symbol).await?;
        let hedge = self.client.is_hedge_mode().await?;
        let position_side = side.position_side(hedge).to_string();

        // Leverage must be set before the order; "already set" style domain
        // errors are benign.
        if let Err(e) = self.client.set_leverage(symbol, self.leverage).await {
            match e {
                BinanceError::Api { .. } => {
                    warn!(symbol, error = %e, "set_leverage rejected (ignored)")
                }
                other => return Err(other),
            }
        }

        let entry_price = round_price(price, &rules);
        let entry_qty = round_qty(quantity, &rules);
        let (tp_raw, sl_raw) = bracket_prices(entry_price, side, tp_pct, sl_pct);
        let tp_price = round_price(tp_raw, &rules);
        let sl_price = round_price(sl_raw, &rules);

        let order_prefix = order_token();

        info!(
            symbol,
            side = %side,
            price = %entry_price,
            qty = %entry_qty,
            tp = %tp_price,
            sl = %sl_price,
            position_side = %position_side,
            "entry plan (bracket deferred until fill)"
        );

        let order = self
            .client
            .place_order(&NewOrder {
                symbol: symbol.to_string(),
                side: side.entry_order_side().to_string(),
                position_side: position_side.clone(),
                order_type: "LIMIT".to_string(),
                quantity: Some(entry_qty.to_string()),
                price: Some(entry_price.to_string()),
                time_in_force: Some("GTC"),
                reduce_only: false,
                client_order_id: Some(client_order_id("entry", &order_prefix)),
            })
            .await?;

        info!(
            symbol,
            order_id = order.order_id,
            status = %order.status,
            "entry order submitted"
        );

        Ok(EntryTicket {
            order,
            bracket: DeferredBracket {
                symbol: symbol.to_string(),
                close_side: side.close_order_side().to_string(),
                position_side,
                tp_price,
                sl_price,
                tp_pct,
                sl_pct,
                quantity: entry_qty,
                order_prefix,
            },
        })
    }

    // -------------------------------------------------------------------------
    // Bracket
    // -------------------------------------------------------------------------

    /// Place one leg of the bracket, client id `tp_<prefix>` / `sl_<prefix>`.
    /// Each leg is placed independently so a failure on one never rolls back
    /// the other.
    pub async fn place_bracket_side(
        &self,
        bracket: &DeferredBracket,
        leg: BracketSide,
    ) -> Result<AlgoOrder, BinanceError> {
        let trigger_price = match leg {
            BracketSide::TakeProfit => bracket.tp_price,
            BracketSide::StopLoss => bracket.sl_price,
        };
        let order = self
            .client
            .place_algo_order(&NewAlgoOrder {
                symbol: bracket.symbol.clone(),
                side: bracket.close_side.clone(),
                position_side: bracket.position_side.clone(),
                algo_type: leg.algo_type().to_string(),
                trigger_price: trigger_price.to_string(),
                quantity: bracket.quantity.to_string(),
                client_algo_id: client_order_id(leg.role(), &bracket.order_prefix),
            })
            .await?;
        info!(
            symbol = %bracket.symbol,
            algo_id = order.algo_id,
            trigger = %trigger_price,
            leg = leg.label(),
            "bracket leg placed"
        );
        Ok(order)
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Unrounded TP/SL target prices for a position at `entry`.
pub fn bracket_prices(entry: Decimal, side: Side, tp_pct: f64, sl_pct: f64) -> (Decimal, Decimal) {
    let tp = Decimal::try_from(tp_pct).unwrap_or_default() / Decimal::from(100);
    let sl = Decimal::try_from(sl_pct).unwrap_or_default() / Decimal::from(100);
    match side {
        Side::Long => (entry * (Decimal::ONE + tp), entry * (Decimal::ONE - sl)),
        Side::Short => (entry * (Decimal::ONE - tp), entry * (Decimal::ONE + sl)),
    }
}

/// Tick rounding with a precision fallback for symbols without PRICE_FILTER.
pub fn round_price(price: Decimal, rules: &SymbolRules) -> Decimal {
    match rules.tick_size {
        Some(tick) => round_price_to_tick(price, tick),
        None => round_down_to_precision(price, rules.price_precision),
    }
}

/// Step rounding with a precision fallback for symbols without LOT_SIZE.
pub fn round_qty(qty: Decimal, rules: &SymbolRules) -> Decimal {
    match rules.step_size {
        Some(step) => round_qty_to_step(qty, step),
        None => round_down_to_precision(qty, rules.quantity_precision),
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
    fn short_bracket_puts_tp_below_and_sl_above() {
        let (tp, sl) = bracket_prices(dec!(50000), Side::Short, 33.0, 18.0);
        assert_eq!(tp, dec!(33500.00));
        assert_eq!(sl, dec!(59000.00));
    }

    #[test]
    fn long_bracket_puts_tp_above_and_sl_below() {
        let (tp, sl) = bracket_prices(dec!(100), Side::Long, 33.0, 18.0);
        assert_eq!(tp, dec!(133.00));
        assert_eq!(sl, dec!(82.00));
    }

    #[test]
    fn rounding_prefers_tick_over_precision() {
        let rules = SymbolRules {
            tick_size: Some(dec!(0.1)),
            step_size: Some(dec!(0.001)),
            price_precision: 4,
            quantity_precision: 4,
        };
        assert_eq!(round_price(dec!(33493.37), &rules), dec!(33493.3));
        assert_eq!(round_qty(dec!(0.0199), &rules), dec!(0.019));
    }

    #[test]
    fn rounding_falls_back_to_precision() {
        let rules = SymbolRules {
            tick_size: None,
            step_size: None,
            price_precision: 2,
            quantity_precision: 1,
        };
        assert_eq!(round_price(dec!(1.23456), &rules), dec!(1.23));
        assert_eq!(round_qty(dec!(5.67), &rules), dec!(5.6));
    }

    #[test]
    fn bracket_side_wire_vocabulary() {
        assert_eq!(BracketSide::TakeProfit.algo_type(), "TAKE_PROFIT_MARKET");
        assert_eq!(BracketSide::StopLoss.algo_type(), "STOP_MARKET");
        assert_eq!(BracketSide::TakeProfit.role(), "tp");
        assert_eq!(BracketSide::StopLoss.role(), "sl");
    }
}
