// =============================================================================
// Strategy interface + the default surge-short policy
// =============================================================================
//
// The engine delegates three decisions to a strategy:
//   1. create_scanner()      — how signals are found
//   2. filter_entry()        — whether a signal becomes an entry, and with
//                              which side / TP% / SL%
//   3. evaluate_position()   — per poll cycle: hold, force-close, or adjust
//                              the take-profit
//
// Infrastructure (order placement, tracking, the user stream, persistence)
// stays in the engine; a strategy never places orders itself.

pub mod risk_filters;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binance::{FuturesClient, Kline};
use crate::config::BotConfig;
use crate::monitor::TrackedPosition;
use crate::scanner::{SignalSource, SurgeScanner};
use crate::types::{Side, Strength, SurgeSignal};

use risk_filters::{RiskFilterConfig, RiskFilters};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Result of a strategy's entry filter.
#[derive(Debug, Clone)]
pub struct EntryDecision {
    pub accept: bool,
    pub reject_reason: String,
    /// Diagnostics recorded alongside the signal event.
    pub metrics: Map<String, Value>,
    pub side: Side,
    pub tp_pct: f64,
    pub sl_pct: f64,
}

/// Action to take on a monitored position, one per poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionAction {
    Hold,
    Close { reason: String },
    AdjustTp {
        new_tp_pct: f64,
        new_strength: Option<Strength>,
    },
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Build the signal producer. The default is the hourly surge scanner;
    /// any implementation emitting [`SurgeSignal`]s will do.
    fn create_scanner(
        &self,
        config: Arc<BotConfig>,
        tx: mpsc::Sender<SurgeSignal>,
        client: FuturesClient,
    ) -> Arc<dyn SignalSource>;

    /// Decide whether to enter on this signal. Runs after the infrastructure
    /// guards (duplicate symbol, max positions, daily loss). Must be
    /// fail-open on internal errors.
    async fn filter_entry(
        &self,
        client: &FuturesClient,
        signal: &SurgeSignal,
        entry_price: Decimal,
        signal_price: Decimal,
        now: DateTime<Utc>,
        config: &BotConfig,
    ) -> EntryDecision;

    /// Evaluate an open position. Called once per poll cycle while the entry
    /// is filled.
    async fn evaluate_position(
        &self,
        client: &FuturesClient,
        pos: &mut TrackedPosition,
        config: &BotConfig,
        now: DateTime<Utc>,
    ) -> PositionAction;
}

// ---------------------------------------------------------------------------
// SurgeShortStrategy — the default policy
// ---------------------------------------------------------------------------

/// Shorts sell-volume surges, with a dynamic TP ladder driven by coin
/// strength at the 2 h and 12 h checkpoints.
pub struct SurgeShortStrategy {
    filters: RiskFilters,
}

/// Both the signal hour and the entry hour must exceed this multiple of
/// yesterday's average sell volume for the consecutive-surge protection.
const CONSECUTIVE_SURGE_THRESHOLD: f64 = 10.0;

impl SurgeShortStrategy {
    pub fn new() -> Self {
        Self {
            filters: RiskFilters::new(RiskFilterConfig::default()),
        }
    }

    pub fn with_filter_config(config: RiskFilterConfig) -> Self {
        Self {
            filters: RiskFilters::new(config),
        }
    }

    /// Fraction of 5 m bars between `start` and `end` whose close dropped
    /// more than `threshold` below entry. `None` when the window is missing.
    async fn drop_ratio_5m(
        client: &FuturesClient,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        entry_price: Decimal,
        threshold: f64,
    ) -> Option<f64> {
        let klines = client
            .klines(
                symbol,
                "5m",
                Some(start.timestamp_millis()),
                Some(end.timestamp_millis()),
                Some(1500),
            )
            .await
            .map_err(|e| debug!(symbol, error = %e, "5m drop-ratio fetch failed"))
            .ok()?;
        drop_ratio(&klines, entry_price, threshold)
    }

    /// Was the position opened during two consecutive surge hours? Re-runs
    /// the sell-surge check for the signal hour (fill − 1 h) and the entry
    /// hour against yesterday's hourly average.
    async fn check_consecutive_surge(
        client: &FuturesClient,
        symbol: &str,
        entry_fill_time: DateTime<Utc>,
    ) -> bool {
        let signal_time = entry_fill_time - ChronoDuration::hours(1);

        // Yesterday relative to the signal hour.
        let y_start = (signal_time - ChronoDuration::days(1))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp_millis();
        let y_end = y_start + 86_400_000;

        let daily = match client
            .klines(symbol, "1d", Some(y_start), Some(y_end), Some(1))
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, error = %e, "consecutive-surge daily fetch failed");
                return false;
            }
        };
        let Some(avg_hourly_sell) = daily.first().map(|b| b.sell_volume() / 24.0) else {
            return false;
        };
        if avg_hourly_sell <= 0.0 {
            return false;
        }

        let hourly = match client
            .klines(
                symbol,
                "1h",
                Some(signal_time.timestamp_millis()),
                Some(entry_fill_time.timestamp_millis()),
                Some(2),
            )
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(symbol, error = %e, "consecutive-surge hourly fetch failed");
                return false;
            }
        };
        if hourly.len() < 2 {
            return false;
        }

        let confirmed = hourly[hourly.len() - 2..]
            .iter()
            .all(|bar| bar.sell_volume() / avg_hourly_sell >= CONSECUTIVE_SURGE_THRESHOLD);
        if confirmed {
            info!(symbol, "consecutive two-hour sell surge confirmed");
        }
        confirmed
    }
}

impl Default for SurgeShortStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for SurgeShortStrategy {
    fn create_scanner(
        &self,
        config: Arc<BotConfig>,
        tx: mpsc::Sender<SurgeSignal>,
        client: FuturesClient,
    ) -> Arc<dyn SignalSource> {
        Arc::new(SurgeScanner::new(config, tx, client))
    }

    async fn filter_entry(
        &self,
        client: &FuturesClient,
        signal: &SurgeSignal,
        entry_price: Decimal,
        signal_price: Decimal,
        now: DateTime<Utc>,
        config: &BotConfig,
    ) -> EntryDecision {
        let mut metrics = Map::new();

        if config.enable_risk_filters {
            let result = self
                .filters
                .check_all(client, &signal.symbol, now, entry_price, signal_price)
                .await;
            metrics = result.metrics;
            if !result.should_trade {
                return EntryDecision {
                    accept: false,
                    reject_reason: result.reason,
                    metrics,
                    side: Side::Short,
                    tp_pct: config.strong_tp_pct,
                    sl_pct: config.stop_loss_pct,
                };
            }
        }

        EntryDecision {
            accept: true,
            reject_reason: String::new(),
            metrics,
            side: Side::Short,
            tp_pct: config.strong_tp_pct,
            sl_pct: config.stop_loss_pct,
        }
    }

    async fn evaluate_position(
        &self,
        client: &FuturesClient,
        pos: &mut TrackedPosition,
        config: &BotConfig,
        now: DateTime<Utc>,
    ) -> PositionAction {
        let (Some(fill_time), Some(entry_price)) = (pos.entry_fill_time, pos.entry_price) else {
            return PositionAction::Hold;
        };

        let hold_hours = (now - fill_time).num_seconds() as f64 / 3600.0;

        if hold_hours >= config.max_hold_hours {
            return PositionAction::Close {
                reason: "max_hold_time".to_string(),
            };
        }

        // ── 2 h checkpoint (runs once) ───────────────────────────────────
        if !pos.evaluated_2h && hold_hours >= 2.0 {
            pos.evaluated_2h = true;
            let drop = Self::drop_ratio_5m(
                client,
                &pos.symbol,
                fill_time,
                fill_time + ChronoDuration::hours(2),
                entry_price,
                config.strength_eval_2h_growth,
            )
            .await;

            let (new_strength, new_tp) =
                classify_2h(drop, config.strength_eval_2h_ratio, config);
            let old_tp = pos.current_tp_pct;
            info!(
                symbol = %pos.symbol,
                strength = %new_strength,
                old_tp,
                new_tp,
                drop_ratio = ?drop,
                "2h strength evaluation"
            );
            if (new_tp - old_tp).abs() > f64::EPSILON {
                return PositionAction::AdjustTp {
                    new_tp_pct: new_tp,
                    new_strength: Some(new_strength),
                };
            }
            pos.strength = new_strength;
        }

        // ── 12 h checkpoint (runs once) ──────────────────────────────────
        if !pos.evaluated_12h && hold_hours >= 12.0 {
            pos.evaluated_12h = true;
            let drop = Self::drop_ratio_5m(
                client,
                &pos.symbol,
                fill_time,
                fill_time + ChronoDuration::hours(12),
                entry_price,
                config.strength_eval_12h_growth,
            )
            .await;

            let old_tp = pos.current_tp_pct;
            let (new_strength, new_tp) = if drop
                .map(|d| d >= config.strength_eval_12h_ratio)
                .unwrap_or(false)
            {
                (Strength::Strong, config.strong_tp_pct)
            } else if Self::check_consecutive_surge(client, &pos.symbol, fill_time).await {
                // Consecutive-surge protection: don't downgrade to weak.
                if pos.strength == Strength::Strong {
                    (Strength::Strong, config.strong_tp_pct)
                } else {
                    (Strength::Medium, config.medium_tp_pct)
                }
            } else {
                (Strength::Weak, config.weak_tp_pct)
            };

            info!(
                symbol = %pos.symbol,
                strength = %new_strength,
                old_tp,
                new_tp,
                drop_ratio = ?drop,
                "12h strength evaluation"
            );
            if (new_tp - old_tp).abs() > f64::EPSILON {
                return PositionAction::AdjustTp {
                    new_tp_pct: new_tp,
                    new_strength: Some(new_strength),
                };
            }
            pos.strength = new_strength;
        }

        PositionAction::Hold
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Fraction of bars whose close dropped more than `threshold` below entry.
/// `None` for windows too small to judge.
pub fn drop_ratio(klines: &[Kline], entry_price: Decimal, threshold: f64) -> Option<f64> {
    if klines.len() < 2 {
        return None;
    }
    let ep = entry_price.to_f64()?;
    if ep <= 0.0 {
        return None;
    }
    let drops = klines
        .iter()
        .filter(|k| {
            k.close
                .to_f64()
                .map(|close| (close - ep) / ep < -threshold)
                .unwrap_or(false)
        })
        .count();
    Some(drops as f64 / klines.len() as f64)
}

/// 2 h verdict: enough dropped bars ⇒ strong, otherwise (including a
/// missing window) medium.
pub fn classify_2h(
    drop: Option<f64>,
    ratio_threshold: f64,
    config: &BotConfig,
) -> (Strength, f64) {
    if drop.map(|d| d >= ratio_threshold).unwrap_or(false) {
        (Strength::Strong, config.strong_tp_pct)
    } else {
        (Strength::Medium, config.medium_tp_pct)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar_with_close(close: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 0,
            open: Decimal::try_from(close).unwrap(),
            high: Decimal::try_from(close).unwrap(),
            low: Decimal::try_from(close).unwrap(),
            close: Decimal::try_from(close).unwrap(),
            volume: 1.0,
            taker_buy_base_volume: 0.5,
        }
    }

    #[test]
    fn drop_ratio_counts_bars_below_threshold() {
        // entry 100, threshold 5.5%: closes below 94.5 count as drops
        let klines = vec![
            bar_with_close(99.0),
            bar_with_close(94.0),
            bar_with_close(93.0),
            bar_with_close(96.0),
        ];
        let ratio = drop_ratio(&klines, dec!(100), 0.055).unwrap();
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn drop_ratio_empty_window_is_missing() {
        assert_eq!(drop_ratio(&[], dec!(100), 0.055), None);
        assert_eq!(drop_ratio(&[bar_with_close(99.0)], dec!(100), 0.055), None);
    }

    #[test]
    fn classify_2h_strong_at_or_above_ratio() {
        let cfg = BotConfig::default();
        assert_eq!(
            classify_2h(Some(0.60), 0.60, &cfg),
            (Strength::Strong, cfg.strong_tp_pct)
        );
        assert_eq!(
            classify_2h(Some(0.75), 0.60, &cfg),
            (Strength::Strong, cfg.strong_tp_pct)
        );
    }

    #[test]
    fn classify_2h_medium_below_ratio_or_missing() {
        let cfg = BotConfig::default();
        assert_eq!(
            classify_2h(Some(0.59), 0.60, &cfg),
            (Strength::Medium, cfg.medium_tp_pct)
        );
        // empty 5m window → fallback
        assert_eq!(
            classify_2h(None, 0.60, &cfg),
            (Strength::Medium, cfg.medium_tp_pct)
        );
    }
}
