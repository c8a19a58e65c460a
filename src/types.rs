// =============================================================================
// Shared domain types
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Position side
// ---------------------------------------------------------------------------

/// Direction of a position. The engine's default strategy only ever shorts,
/// but every price/side computation is written for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens the position.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side that closes (reduces) the position.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    /// "LONG" / "SHORT" — the hedge-mode positionSide value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// positionSide parameter for the account's mode: the side itself in
    /// hedge mode, "BOTH" in one-way mode.
    pub fn position_side(&self, hedge_mode: bool) -> &'static str {
        if hedge_mode {
            self.as_str()
        } else {
            "BOTH"
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Coin strength (dynamic take-profit classifier)
// ---------------------------------------------------------------------------

/// Classification produced by the 2 h / 12 h strength checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Unknown,
    Strong,
    Medium,
    Weak,
}

impl Strength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Strong => "strong",
            Self::Medium => "medium",
            Self::Weak => "weak",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "strong" => Self::Strong,
            "medium" => Self::Medium,
            "weak" => Self::Weak,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Surge signal
// ---------------------------------------------------------------------------

/// A sell-volume surge detected by the scanner. Immutable once emitted;
/// deduplicated per (symbol, UTC day).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurgeSignal {
    pub symbol: String,
    /// Open time of the hourly bar that triggered the signal.
    pub signal_time: DateTime<Utc>,
    /// hourly_sell_vol / yesterday's average hourly sell volume.
    pub surge_ratio: f64,
    /// Close of the triggering bar — the entry reference price.
    pub price: Decimal,
    pub yesterday_avg_sell_vol: f64,
    pub hourly_sell_vol: f64,
}

impl SurgeSignal {
    /// `SYMBOL:YYYY-MM-DD` — shared by the scanner dedup set and the
    /// stop-loss cooldown set.
    pub fn dedup_key(&self) -> String {
        day_key(&self.symbol, self.signal_time)
    }
}

/// Build the daily dedup/cooldown key for a symbol at a given instant.
pub fn day_key(symbol: &str, at: DateTime<Utc>) -> String {
    format!("{symbol}:{}", at.format("%Y-%m-%d"))
}

// ---------------------------------------------------------------------------
// Client order identifiers
// ---------------------------------------------------------------------------

/// Fresh 8-hex token, unique per order/position.
pub fn order_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// `<role>_<8-hex>` — role is one of "entry", "tp", "sl". This string is the
/// only reliable classifier when recovering orders after a restart.
pub fn client_order_id(role: &str, token: &str) -> String {
    format!("{role}_{token}")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn side_order_mapping() {
        assert_eq!(Side::Short.entry_order_side(), "SELL");
        assert_eq!(Side::Short.close_order_side(), "BUY");
        assert_eq!(Side::Long.entry_order_side(), "BUY");
        assert_eq!(Side::Long.close_order_side(), "SELL");
    }

    #[test]
    fn position_side_depends_on_account_mode() {
        assert_eq!(Side::Short.position_side(true), "SHORT");
        assert_eq!(Side::Short.position_side(false), "BOTH");
    }

    #[test]
    fn day_key_is_symbol_and_utc_date() {
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        assert_eq!(day_key("BTCUSDT", at), "BTCUSDT:2024-01-15");
    }

    #[test]
    fn order_token_is_eight_hex_chars() {
        let token = order_token();
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(order_token(), token);
    }

    #[test]
    fn client_id_shape() {
        assert_eq!(client_order_id("tp", "0123abcd"), "tp_0123abcd");
    }

    #[test]
    fn strength_round_trips_through_str() {
        for s in [Strength::Unknown, Strength::Strong, Strength::Medium, Strength::Weak] {
            assert_eq!(Strength::from_str_lossy(s.as_str()), s);
        }
        assert_eq!(Strength::from_str_lossy("garbage"), Strength::Unknown);
    }
}
