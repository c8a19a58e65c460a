// =============================================================================
// Tick / step rounding — every outbound price and quantity passes through here
// =============================================================================
//
// Binance rejects orders whose price is not an exact multiple of the symbol's
// tickSize (-4014) or whose serialised form carries more decimals than the
// filter allows (-1111). Both helpers round DOWN to the nearest increment and
// quantise the result to the increment's own decimal exponent, so the string
// sent on the wire can never exceed exchange precision.

use rust_decimal::Decimal;

/// Round `price` down to the nearest multiple of `tick`.
///
/// Returns the input unchanged when `tick` is zero or negative (no filter
/// published for the symbol).
pub fn round_price_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    round_down_to_increment(price, tick)
}

/// Round `qty` down to the nearest multiple of `step` (LOT_SIZE stepSize).
pub fn round_qty_to_step(qty: Decimal, step: Decimal) -> Decimal {
    round_down_to_increment(qty, step)
}

/// Round `value` down to `dp` decimal places. Fallback used when a symbol
/// publishes no tick/step filter and only a precision integer is known.
pub fn round_down_to_precision(value: Decimal, dp: u32) -> Decimal {
    value.trunc_with_scale(dp).normalize()
}

fn round_down_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return value;
    }
    let steps = (value / increment).floor();
    let mut result = steps * increment;
    // Quantise to the increment's normalised exponent: a tick of 0.0100 must
    // yield at most 2 decimals on the wire.
    let scale = increment.normalize().scale();
    result.rescale(scale);
    result.normalize()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_rounds_down_to_tick_multiple() {
        assert_eq!(round_price_to_tick(dec!(33493.37), dec!(0.1)), dec!(33493.3));
        assert_eq!(round_price_to_tick(dec!(58988.29), dec!(0.1)), dec!(58988.2));
        assert_eq!(round_price_to_tick(dec!(0.123456), dec!(0.0001)), dec!(0.1234));
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        assert_eq!(round_price_to_tick(dec!(50000.0), dec!(0.1)), dec!(50000));
    }

    #[test]
    fn result_is_always_a_tick_multiple() {
        let tick = dec!(0.001);
        let rounded = round_price_to_tick(dec!(7.7777777), tick);
        assert_eq!(rounded, dec!(7.777));
        assert_eq!((rounded / tick) - (rounded / tick).floor(), dec!(0));
    }

    #[test]
    fn trailing_zeros_are_stripped() {
        // tick published as 0.0100 — two significant decimals
        let rounded = round_price_to_tick(dec!(12.3456), dec!(0.0100));
        assert_eq!(rounded.to_string(), "12.34");
    }

    #[test]
    fn integer_tick_yields_integer_price() {
        assert_eq!(round_price_to_tick(dec!(1234.56), dec!(1)), dec!(1234));
    }

    #[test]
    fn qty_rounds_down_to_step() {
        assert_eq!(round_qty_to_step(dec!(0.019), dec!(0.01)), dec!(0.01));
        assert_eq!(round_qty_to_step(dec!(153.7), dec!(1)), dec!(153));
    }

    #[test]
    fn zero_increment_passes_value_through() {
        assert_eq!(round_price_to_tick(dec!(42.42), dec!(0)), dec!(42.42));
    }

    #[test]
    fn precision_fallback_truncates() {
        assert_eq!(round_down_to_precision(dec!(1.23456), 2), dec!(1.23));
        assert_eq!(round_down_to_precision(dec!(9.999), 0), dec!(9));
    }
}
