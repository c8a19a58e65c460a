// =============================================================================
// Pre-entry risk filter pipeline
// =============================================================================
//
// A chain of optional checks over the last 24 h of hourly klines plus the
// live premium index. Runs after the infrastructure guards, before sizing.
// Fail-fast on the first rejection; every filter is individually fail-open —
// a broken data fetch must never block a trade decision, only log.
//
// Each check returns a verdict plus a diagnostics map that ends up in the
// signal_events log for post-mortems.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::binance::{FuturesClient, Kline};

// ---------------------------------------------------------------------------
// Results & configuration
// ---------------------------------------------------------------------------

/// Verdict from one filter (or the whole pipeline).
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub should_trade: bool,
    pub reason: String,
    pub metrics: Map<String, Value>,
}

impl FilterResult {
    fn pass(metrics: Map<String, Value>) -> Self {
        Self {
            should_trade: true,
            reason: String::new(),
            metrics,
        }
    }

    fn reject(reason: String, metrics: Map<String, Value>) -> Self {
        Self {
            should_trade: false,
            reason,
            metrics,
        }
    }
}

/// Per-filter switches and thresholds. Only the entry-gain filter is active
/// by default; the rest are opt-in tuning knobs.
#[derive(Debug, Clone)]
pub struct RiskFilterConfig {
    pub enable_premium_24h: bool,
    /// Reject when the price dropped more than this over 24 h (percent).
    pub premium_24h_drop_threshold: f64,

    pub enable_entry_gain: bool,
    /// Reject when price ran up more than this since the signal (percent).
    pub entry_gain_max_pct: f64,
    /// Reject when price already fell below this since the signal (percent).
    pub entry_gain_min_pct: f64,

    pub enable_cvd_new_low: bool,
    pub cvd_lookback_hours: i64,

    pub enable_premium_realtime: bool,
    /// Reject when (mark - index) / index falls below this.
    pub premium_min_threshold: f64,

    pub enable_buy_acceleration: bool,
    pub buy_accel_danger_ranges: Vec<(f64, f64)>,

    pub enable_consecutive_buy_ratio: bool,
    pub consecutive_buy_ratio_hours: usize,
    pub consecutive_buy_ratio_threshold: f64,

    pub enable_buy_sell_ratio: bool,
    pub buy_sell_ratio_danger_ranges: Vec<(f64, f64)>,

    pub enable_intraday_buy_ratio: bool,
    pub intraday_buy_ratio_danger_ranges: Vec<(f64, f64)>,
}

impl Default for RiskFilterConfig {
    fn default() -> Self {
        Self {
            enable_premium_24h: false,
            premium_24h_drop_threshold: -40.0,
            enable_entry_gain: true,
            entry_gain_max_pct: 9.04,
            entry_gain_min_pct: -3.0,
            enable_cvd_new_low: false,
            cvd_lookback_hours: 24,
            enable_premium_realtime: false,
            premium_min_threshold: -0.003,
            enable_buy_acceleration: false,
            buy_accel_danger_ranges: vec![
                (-0.05, -0.042),
                (0.118, 0.12),
                (0.0117, 0.03),
                (0.2, 0.99),
            ],
            enable_consecutive_buy_ratio: false,
            consecutive_buy_ratio_hours: 3,
            consecutive_buy_ratio_threshold: 2.5,
            enable_buy_sell_ratio: false,
            buy_sell_ratio_danger_ranges: vec![(0.94, 1.12)],
            enable_intraday_buy_ratio: false,
            intraday_buy_ratio_danger_ranges: vec![(2.78, 3.71), (25.0, 29.0)],
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct RiskFilters {
    config: RiskFilterConfig,
}

impl RiskFilters {
    pub fn new(config: RiskFilterConfig) -> Self {
        Self { config }
    }

    /// Run all enabled filters sequentially, fail-fast on the first
    /// rejection. Metrics from every filter that ran are merged.
    pub async fn check_all(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
        entry_price: Decimal,
        signal_price: Decimal,
    ) -> FilterResult {
        let mut metrics = Map::new();
        let cfg = &self.config;

        if cfg.enable_premium_24h {
            let r = self.check_premium_24h(client, symbol, now).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        if cfg.enable_entry_gain {
            if let Some(gain_pct) = entry_gain_pct(entry_price, signal_price) {
                metrics.insert("entry_gain_pct".into(), json!(gain_pct));
                if gain_pct > cfg.entry_gain_max_pct {
                    return FilterResult::reject(
                        format!(
                            "price already up {gain_pct:.2}% since signal (max: {}%)",
                            cfg.entry_gain_max_pct
                        ),
                        metrics,
                    );
                }
            }
        }

        if cfg.enable_cvd_new_low {
            let r = self.check_cvd_new_low(client, symbol, now).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        if cfg.enable_premium_realtime {
            let r = self.check_premium_realtime(client, symbol).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        if cfg.enable_buy_acceleration {
            let r = self.check_buy_acceleration(client, symbol, now).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        if cfg.enable_consecutive_buy_ratio {
            let r = self.check_consecutive_buy_ratio(client, symbol, now).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        if cfg.enable_buy_sell_ratio {
            let r = self.check_buy_sell_ratio(client, symbol, now).await;
            metrics.extend(r.metrics.clone());
            if !r.should_trade {
                return FilterResult::reject(r.reason, metrics);
            }
        }

        // Entry-gain lower band: the knife already fell too far to chase.
        if cfg.enable_entry_gain {
            if let Some(gain_pct) = entry_gain_pct(entry_price, signal_price) {
                if gain_pct < cfg.entry_gain_min_pct {
                    metrics.insert("entry_gain_pct".into(), json!(gain_pct));
                    return FilterResult::reject(
                        format!(
                            "price dropped {gain_pct:.2}% since signal (min: {}%)",
                            cfg.entry_gain_min_pct
                        ),
                        metrics,
                    );
                }
            }
        }

        FilterResult::pass(metrics)
    }

    // -------------------------------------------------------------------------
    // Individual filters (each fail-open)
    // -------------------------------------------------------------------------

    async fn hourly_klines(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
        hours: i64,
    ) -> Result<Vec<Kline>, crate::binance::BinanceError> {
        let end_ms = now.timestamp_millis();
        let start_ms = end_ms - hours * 3_600_000;
        client
            .klines(symbol, "1h", Some(start_ms), Some(end_ms), Some(hours as u32 + 1))
            .await
    }

    async fn check_premium_24h(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> FilterResult {
        let klines = match self.hourly_klines(client, symbol, now, 25).await {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol, error = %e, "premium 24h check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let Some(change_pct) = change_24h_pct(&klines) else {
            return FilterResult::pass(Map::new());
        };
        let mut metrics = Map::new();
        metrics.insert("premium_24h_change".into(), json!(change_pct));

        if change_pct < self.config.premium_24h_drop_threshold {
            return FilterResult::reject(
                format!(
                    "price dropped {change_pct:.2}% in 24h (threshold: {}%)",
                    self.config.premium_24h_drop_threshold
                ),
                metrics,
            );
        }
        FilterResult::pass(metrics)
    }

    async fn check_cvd_new_low(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> FilterResult {
        let klines = match self
            .hourly_klines(client, symbol, now, self.config.cvd_lookback_hours)
            .await
        {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol, error = %e, "CVD check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let Some((current, min)) = cvd_current_and_min(&klines) else {
            return FilterResult::pass(Map::new());
        };
        let is_new_low = current <= min;
        let mut metrics = Map::new();
        metrics.insert("cvd_current".into(), json!(current));
        metrics.insert("cvd_min".into(), json!(min));
        metrics.insert("cvd_is_new_low".into(), json!(is_new_low));

        if is_new_low {
            return FilterResult::reject(
                format!("CVD at new low ({current:.0}, min: {min:.0}) — panic selling exhaustion"),
                metrics,
            );
        }
        FilterResult::pass(metrics)
    }

    async fn check_premium_realtime(&self, client: &FuturesClient, symbol: &str) -> FilterResult {
        let index = match client.premium_index(symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol, error = %e, "premium realtime check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let mark = index.mark_price.to_f64().unwrap_or(0.0);
        let idx = index.index_price.to_f64().unwrap_or(0.0);
        if idx <= 0.0 {
            return FilterResult::pass(Map::new());
        }
        let premium = (mark - idx) / idx;
        let mut metrics = Map::new();
        metrics.insert("premium_realtime".into(), json!(premium));

        if premium < self.config.premium_min_threshold {
            return FilterResult::reject(
                format!(
                    "premium {:.3}% < {:.1}% — negative basis too large",
                    premium * 100.0,
                    self.config.premium_min_threshold * 100.0
                ),
                metrics,
            );
        }
        FilterResult::pass(metrics)
    }

    async fn check_buy_acceleration(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> FilterResult {
        let klines = match self.hourly_klines(client, symbol, now, 24).await {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol, error = %e, "buy acceleration check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let Some(accel) = buy_acceleration(&klines) else {
            return FilterResult::pass(Map::new());
        };
        let mut metrics = Map::new();
        metrics.insert("buy_acceleration".into(), json!(accel));

        for &(lo, hi) in &self.config.buy_accel_danger_ranges {
            if (lo..=hi).contains(&accel) {
                return FilterResult::reject(
                    format!("buy acceleration {accel:.4} in danger range [{lo}, {hi}]"),
                    metrics,
                );
            }
        }
        FilterResult::pass(metrics)
    }

    async fn check_consecutive_buy_ratio(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> FilterResult {
        let klines = match self.hourly_klines(client, symbol, now, 12).await {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol, error = %e, "consecutive buy check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let required = self.config.consecutive_buy_ratio_hours;
        if klines.len() < required + 1 {
            return FilterResult::pass(Map::new());
        }
        let max_run =
            max_consecutive_buy_surge(&klines, self.config.consecutive_buy_ratio_threshold);
        let mut metrics = Map::new();
        metrics.insert("max_consecutive_buy".into(), json!(max_run));

        if max_run >= required {
            return FilterResult::reject(
                format!(
                    "consecutive {max_run}h buy surge > {}x — sustained breakout risk",
                    self.config.consecutive_buy_ratio_threshold
                ),
                metrics,
            );
        }
        FilterResult::pass(metrics)
    }

    async fn check_buy_sell_ratio(
        &self,
        client: &FuturesClient,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> FilterResult {
        let klines = match self.hourly_klines(client, symbol, now, 12).await {
            Ok(k) => k,
            Err(e) => {
                warn!(symbol, error = %e, "buy/sell ratio check failed (fail-open)");
                return FilterResult::pass(Map::new());
            }
        };

        let Some((max_buy_ratio, max_sell_ratio)) = max_hourly_ratios(&klines) else {
            return FilterResult::pass(Map::new());
        };
        let bs_ratio = if max_sell_ratio > 0.0 {
            max_buy_ratio / max_sell_ratio
        } else {
            0.0
        };
        let mut metrics = Map::new();
        metrics.insert("buy_sell_ratio".into(), json!(bs_ratio));
        metrics.insert("max_buy_ratio".into(), json!(max_buy_ratio));
        metrics.insert("max_sell_ratio".into(), json!(max_sell_ratio));

        for &(lo, hi) in &self.config.buy_sell_ratio_danger_ranges {
            if (lo..=hi).contains(&bs_ratio) {
                return FilterResult::reject(
                    format!("buy/sell ratio {bs_ratio:.3} in danger range [{lo}, {hi}] — ambiguous direction"),
                    metrics,
                );
            }
        }

        if self.config.enable_intraday_buy_ratio {
            for &(lo, hi) in &self.config.intraday_buy_ratio_danger_ranges {
                if (lo..=hi).contains(&max_buy_ratio) {
                    return FilterResult::reject(
                        format!("intraday buy ratio {max_buy_ratio:.2}x in danger range [{lo}, {hi}]"),
                        metrics,
                    );
                }
            }
        }

        FilterResult::pass(metrics)
    }
}

// ---------------------------------------------------------------------------
// Pure computations
// ---------------------------------------------------------------------------

/// Percent change from the signal price to the live entry price.
pub fn entry_gain_pct(entry_price: Decimal, signal_price: Decimal) -> Option<f64> {
    if signal_price <= Decimal::ZERO {
        return None;
    }
    let gain = (entry_price - signal_price) / signal_price * Decimal::from(100);
    gain.to_f64()
}

/// Close-to-close percent change over the kline window.
pub fn change_24h_pct(klines: &[Kline]) -> Option<f64> {
    if klines.len() < 2 {
        return None;
    }
    let first = klines.first()?.close.to_f64()?;
    let last = klines.last()?.close.to_f64()?;
    if first.abs() < 1e-10 {
        return None;
    }
    Some((last - first) / first * 100.0)
}

/// Cumulative volume delta over the window: (final value, running minimum).
pub fn cvd_current_and_min(klines: &[Kline]) -> Option<(f64, f64)> {
    if klines.len() < 2 {
        return None;
    }
    let mut cumulative = 0.0;
    let mut min = f64::INFINITY;
    for k in klines {
        let buy = k.taker_buy_base_volume;
        let sell = k.volume - buy;
        cumulative += buy - sell;
        min = min.min(cumulative);
    }
    Some((cumulative, min))
}

/// Mean buy/sell ratio over the last 6 bars minus the mean over the prior
/// bars — positive when buying is accelerating into the signal.
pub fn buy_acceleration(klines: &[Kline]) -> Option<f64> {
    if klines.len() < 12 {
        return None;
    }
    let ratios: Vec<f64> = klines
        .iter()
        .map(|k| {
            let buy = k.taker_buy_base_volume;
            let sell = k.volume - buy;
            buy / (sell + 1e-10)
        })
        .collect();

    let split = ratios.len() - 6;
    let last_6 = &ratios[split..];
    let first_part = &ratios[..split];
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
    Some(mean(last_6) - mean(first_part))
}

/// Longest run of hours where buy volume grew more than `threshold`× over
/// the previous hour.
pub fn max_consecutive_buy_surge(klines: &[Kline], threshold: f64) -> usize {
    let buy_vols: Vec<f64> = klines.iter().map(|k| k.taker_buy_base_volume).collect();
    let mut max_run = 0usize;
    let mut run = 0usize;
    for i in 1..buy_vols.len() {
        if buy_vols[i - 1] > 0.0 && buy_vols[i] / buy_vols[i - 1] > threshold {
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 0;
        }
    }
    max_run
}

/// Max hour-over-hour growth of buy volume and of sell volume.
pub fn max_hourly_ratios(klines: &[Kline]) -> Option<(f64, f64)> {
    if klines.len() < 2 {
        return None;
    }
    let mut max_buy = 0.0f64;
    let mut max_sell = 0.0f64;
    for pair in klines.windows(2) {
        let prev_buy = pair[0].taker_buy_base_volume;
        let prev_sell = pair[0].volume - prev_buy;
        let curr_buy = pair[1].taker_buy_base_volume;
        let curr_sell = pair[1].volume - curr_buy;
        if prev_buy > 0.0 {
            max_buy = max_buy.max(curr_buy / prev_buy);
        }
        if prev_sell > 0.0 {
            max_sell = max_sell.max(curr_sell / prev_sell);
        }
    }
    Some((max_buy, max_sell))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(close: f64, volume: f64, buy: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 0,
            open: Decimal::try_from(close).unwrap(),
            high: Decimal::try_from(close).unwrap(),
            low: Decimal::try_from(close).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume,
            taker_buy_base_volume: buy,
        }
    }

    #[test]
    fn entry_gain_is_percent_change_from_signal() {
        let gain = entry_gain_pct(dec!(110), dec!(100)).unwrap();
        assert!((gain - 10.0).abs() < 1e-9);
        assert_eq!(entry_gain_pct(dec!(110), dec!(0)), None);
    }

    #[test]
    fn cvd_new_low_detection() {
        // net selling every hour: CVD keeps making new lows
        let falling = vec![bar(1.0, 10.0, 2.0); 5];
        let (current, min) = cvd_current_and_min(&falling).unwrap();
        assert!(current <= min);

        // heavy buying at the end lifts CVD off its low
        let mut recovering = vec![bar(1.0, 10.0, 2.0); 4];
        recovering.push(bar(1.0, 10.0, 9.0));
        let (current, min) = cvd_current_and_min(&recovering).unwrap();
        assert!(current > min);
    }

    #[test]
    fn buy_acceleration_positive_when_buying_picks_up() {
        let mut klines = vec![bar(1.0, 10.0, 2.0); 18]; // ratio 0.25
        klines.extend(vec![bar(1.0, 10.0, 8.0); 6]); // ratio 4.0
        let accel = buy_acceleration(&klines).unwrap();
        assert!(accel > 3.0);
    }

    #[test]
    fn buy_acceleration_needs_enough_bars() {
        let klines = vec![bar(1.0, 10.0, 5.0); 6];
        assert_eq!(buy_acceleration(&klines), None);
    }

    #[test]
    fn consecutive_buy_surge_counts_runs() {
        let klines = vec![
            bar(1.0, 100.0, 10.0),
            bar(1.0, 100.0, 30.0), // 3x
            bar(1.0, 100.0, 90.0), // 3x
            bar(1.0, 100.0, 20.0), // run broken
            bar(1.0, 100.0, 70.0), // 3.5x
        ];
        assert_eq!(max_consecutive_buy_surge(&klines, 2.5), 2);
        assert_eq!(max_consecutive_buy_surge(&klines, 10.0), 0);
    }

    #[test]
    fn max_hourly_ratios_track_both_sides() {
        let klines = vec![bar(1.0, 100.0, 40.0), bar(1.0, 100.0, 80.0)];
        // buy: 80/40 = 2.0, sell: 20/60 = 0.333…
        let (max_buy, max_sell) = max_hourly_ratios(&klines).unwrap();
        assert!((max_buy - 2.0).abs() < 1e-9);
        assert!((max_sell - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn change_24h_uses_first_and_last_close() {
        let klines = vec![bar(100.0, 1.0, 0.5), bar(90.0, 1.0, 0.5), bar(50.0, 1.0, 0.5)];
        let change = change_24h_pct(&klines).unwrap();
        assert!((change - -50.0).abs() < 1e-9);
    }
}
