// =============================================================================
// Surge Scanner — hourly sweep for sell-volume surges
// =============================================================================
//
// Detection rule, per symbol:
//   avg_hourly_sell = (yesterday_1d.volume - yesterday_1d.taker_buy) / 24
//   hourly_sell     = last_closed_1h.volume - last_closed_1h.taker_buy
//   emit when threshold <= hourly_sell / avg_hourly_sell <= max_multiple
//
// Scans fire at each UTC hour boundary plus a 5 s grace so the hourly kline
// is finalised — never on arbitrary wall-clock ticks, including the first
// scan after startup. Yesterday's averages, the tradeable-symbol list, and
// the per-day dedup set all reset together when the UTC date rolls.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::binance::FuturesClient;
use crate::config::BotConfig;
use crate::types::{day_key, SurgeSignal};

/// Spacing between kline requests inside a scan, to stay far below the
/// request-weight budget (kline weight 5, budget 2400/min).
const REQUEST_SPACING_MS: u64 = 50;

/// Grace after the hour boundary for kline finalisation.
const BOUNDARY_GRACE_SECS: u32 = 5;

// ---------------------------------------------------------------------------
// SignalSource — what a strategy's scanner must provide
// ---------------------------------------------------------------------------

/// A producer of [`SurgeSignal`]s. Strategies may substitute any
/// implementation; the engine only needs the run loop and the stop-loss
/// cooldown hook.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Long-lived scan loop; returns only on channel closure.
    async fn run_forever(self: Arc<Self>);

    /// Block a symbol from re-entering for the rest of the UTC day
    /// (invoked by the monitor whenever a stop-loss triggers).
    fn block_symbol_today(&self, symbol: &str);
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Result of a single scan cycle.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub symbols_scanned: usize,
    pub signals: Vec<SurgeSignal>,
    pub errors: usize,
}

/// Day-scoped caches. All fields reset together at UTC midnight.
#[derive(Default)]
struct DayState {
    /// Dedup keys (`SYMBOL:YYYY-MM-DD`) already enqueued today.
    seen: HashSet<String>,
    /// Same key shape, populated on stop-loss exits.
    sl_cooldown: HashSet<String>,
    /// symbol → yesterday's average hourly sell volume (cached even when
    /// non-positive to avoid re-fetching).
    daily_avg: HashMap<String, f64>,
    /// Tradeable USDT perpetuals, refreshed once per day.
    symbols: Option<Arc<Vec<String>>>,
    date: Option<NaiveDate>,
}

pub struct SurgeScanner {
    client: FuturesClient,
    config: Arc<BotConfig>,
    tx: mpsc::Sender<SurgeSignal>,
    day: Mutex<DayState>,
}

impl SurgeScanner {
    pub fn new(
        config: Arc<BotConfig>,
        tx: mpsc::Sender<SurgeSignal>,
        client: FuturesClient,
    ) -> Self {
        Self {
            client,
            config,
            tx,
            day: Mutex::new(DayState::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Scan cycle
    // -------------------------------------------------------------------------

    /// Scan every tradeable symbol for the most recently closed hour.
    pub async fn scan_current_hour(&self) -> anyhow::Result<ScanOutcome> {
        let now = Utc::now();
        self.roll_day_if_needed(now);

        let symbols = self.tradeable_symbols().await?;
        let errors = AtomicUsize::new(0);
        let signals: Mutex<Vec<SurgeSignal>> = Mutex::new(Vec::new());

        let semaphore = Arc::new(Semaphore::new(self.config.scanner_concurrency.max(1)));

        let scans = symbols.iter().map(|symbol| {
            let semaphore = semaphore.clone();
            let errors = &errors;
            let signals = &signals;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                match self.scan_symbol(symbol, now).await {
                    Ok(Some(signal)) => signals.lock().push(signal),
                    Ok(None) => {}
                    Err(e) => {
                        debug!(symbol = %symbol, error = %e, "symbol scan failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(REQUEST_SPACING_MS)).await;
            }
        });
        futures_util::future::join_all(scans).await;

        Ok(ScanOutcome {
            symbols_scanned: symbols.len(),
            signals: signals.into_inner(),
            errors: errors.into_inner(),
        })
    }

    /// Scan one symbol; `Ok(None)` when the hour is unremarkable.
    async fn scan_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SurgeSignal>> {
        let Some(avg_hourly_sell) = self.yesterday_avg_sell(symbol, now).await? else {
            return Ok(None);
        };

        let (prev_hour_ms, hour_ms) = last_closed_hour_bounds(now);
        let bars = self
            .client
            .klines(symbol, "1h", Some(prev_hour_ms), Some(hour_ms), Some(1))
            .await?;
        let Some(bar) = bars.first() else {
            return Ok(None);
        };

        let hourly_sell = bar.sell_volume();
        let Some(ratio) = surge_ratio_in_window(
            hourly_sell,
            avg_hourly_sell,
            self.config.surge_threshold,
            self.config.surge_max_multiple,
        ) else {
            return Ok(None);
        };

        Ok(Some(SurgeSignal {
            symbol: symbol.to_string(),
            signal_time: DateTime::from_timestamp_millis(bar.open_time).unwrap_or(now),
            surge_ratio: ratio,
            price: bar.close,
            yesterday_avg_sell_vol: avg_hourly_sell,
            hourly_sell_vol: hourly_sell,
        }))
    }

    /// Yesterday's average hourly sell volume, cached for the UTC day.
    async fn yesterday_avg_sell(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<f64>> {
        if let Some(&cached) = self.day.lock().daily_avg.get(symbol) {
            return Ok(if cached > 0.0 { Some(cached) } else { None });
        }

        let y_start = (now - ChronoDuration::days(1))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .timestamp_millis();
        let y_end = y_start + 86_400_000;

        let bars = self
            .client
            .klines(symbol, "1d", Some(y_start), Some(y_end), Some(1))
            .await?;
        let avg = match bars.first() {
            Some(bar) => bar.sell_volume() / 24.0,
            None => return Ok(None),
        };

        self.day.lock().daily_avg.insert(symbol.to_string(), avg);
        Ok(if avg > 0.0 { Some(avg) } else { None })
    }

    // -------------------------------------------------------------------------
    // Day-scoped state
    // -------------------------------------------------------------------------

    /// Reset all day-scoped caches when the UTC date changes.
    fn roll_day_if_needed(&self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let mut day = self.day.lock();
        if day.date != Some(today) {
            if day.date.is_some() {
                info!(
                    date = %today,
                    dedup_entries = day.seen.len(),
                    cached_averages = day.daily_avg.len(),
                    "UTC date rolled — clearing scanner caches"
                );
            }
            day.seen.clear();
            day.sl_cooldown.clear();
            day.daily_avg.clear();
            day.symbols = None;
            day.date = Some(today);
        }
    }

    /// Mark a dedup key as enqueued; `false` when it was already present
    /// (duplicate signal or cooled-down symbol).
    fn try_mark_seen(&self, key: &str) -> bool {
        self.day.lock().seen.insert(key.to_string())
    }

    async fn tradeable_symbols(&self) -> anyhow::Result<Arc<Vec<String>>> {
        if let Some(symbols) = self.day.lock().symbols.clone() {
            return Ok(symbols);
        }
        let info = self.client.exchange_info().await?;
        let symbols: Arc<Vec<String>> = Arc::new(
            info.symbols
                .iter()
                .filter(|s| s.is_tradeable_usdt_perp())
                .map(|s| s.symbol.clone())
                .collect(),
        );
        info!(count = symbols.len(), "tradeable USDT perpetuals refreshed");
        self.day.lock().symbols = Some(symbols.clone());
        Ok(symbols)
    }

    #[cfg(test)]
    fn is_blocked_today(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let key = day_key(symbol, now);
        let day = self.day.lock();
        day.seen.contains(&key) || day.sl_cooldown.contains(&key)
    }
}

#[async_trait]
impl SignalSource for SurgeScanner {
    /// Main loop: sleep to each UTC hour boundary (+5 s), scan, enqueue the
    /// deduplicated signals.
    async fn run_forever(self: Arc<Self>) {
        info!(
            threshold = self.config.surge_threshold,
            "surge scanner started"
        );

        loop {
            let wait = duration_until_next_boundary(Utc::now());
            debug!(wait_secs = wait.as_secs(), "sleeping until next hour boundary");
            tokio::time::sleep(wait).await;

            let outcome = match self.scan_current_hour().await {
                Ok(o) => o,
                Err(e) => {
                    error!(error = %e, "scan cycle failed");
                    continue;
                }
            };

            let mut enqueued = 0usize;
            for signal in outcome.signals {
                if !self.try_mark_seen(&signal.dedup_key()) {
                    continue;
                }
                if self.tx.send(signal).await.is_err() {
                    warn!("signal channel closed — scanner stopping");
                    return;
                }
                enqueued += 1;
            }

            info!(
                new_signals = enqueued,
                symbols = outcome.symbols_scanned,
                errors = outcome.errors,
                "scan complete"
            );
        }
    }

    fn block_symbol_today(&self, symbol: &str) {
        let key = day_key(symbol, Utc::now());
        let mut day = self.day.lock();
        day.sl_cooldown.insert(key.clone());
        day.seen.insert(key);
        info!(symbol, "stop-loss cooldown — no re-entry until next UTC day");
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// The surge acceptance window. Returns the ratio when the hour qualifies.
/// Both boundaries are inclusive; a non-positive average or hourly volume
/// never qualifies (division guard).
pub fn surge_ratio_in_window(
    hourly_sell: f64,
    avg_hourly_sell: f64,
    threshold: f64,
    max_multiple: f64,
) -> Option<f64> {
    if avg_hourly_sell <= 0.0 || hourly_sell <= 0.0 {
        return None;
    }
    let ratio = hourly_sell / avg_hourly_sell;
    (threshold..=max_multiple).contains(&ratio).then_some(ratio)
}

/// Millisecond bounds [open, close) of the most recently closed 1 h bar.
pub fn last_closed_hour_bounds(now: DateTime<Utc>) -> (i64, i64) {
    let hour_start = now
        .date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("hour truncation is valid")
        .and_utc();
    let prev_hour_start = hour_start - ChronoDuration::hours(1);
    (
        prev_hour_start.timestamp_millis(),
        hour_start.timestamp_millis(),
    )
}

/// Time to sleep so we wake at the next UTC hour boundary + grace.
pub fn duration_until_next_boundary(now: DateTime<Utc>) -> std::time::Duration {
    let next = (now + ChronoDuration::hours(1))
        .date_naive()
        .and_hms_opt((now.hour() + 1) % 24, 0, BOUNDARY_GRACE_SECS)
        .expect("boundary is valid")
        .and_utc();
    (next - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(1))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ratio_inside_window_is_emitted() {
        assert_eq!(surge_ratio_in_window(120.0, 10.0, 10.0, 14008.0), Some(12.0));
    }

    #[test]
    fn boundaries_are_inclusive() {
        // exactly threshold
        assert_eq!(surge_ratio_in_window(100.0, 10.0, 10.0, 14008.0), Some(10.0));
        // exactly max multiple
        assert_eq!(surge_ratio_in_window(140080.0, 10.0, 10.0, 14008.0), Some(14008.0));
    }

    #[test]
    fn above_max_multiple_is_skipped() {
        assert_eq!(surge_ratio_in_window(200_000.0, 10.0, 10.0, 14008.0), None);
    }

    #[test]
    fn below_threshold_is_skipped() {
        assert_eq!(surge_ratio_in_window(50.0, 10.0, 10.0, 14008.0), None);
    }

    #[test]
    fn zero_average_never_emits() {
        assert_eq!(surge_ratio_in_window(100.0, 0.0, 10.0, 14008.0), None);
        assert_eq!(surge_ratio_in_window(0.0, 10.0, 10.0, 14008.0), None);
    }

    #[test]
    fn hour_bounds_cover_the_previous_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 6).unwrap();
        let (start, end) = last_closed_hour_bounds(now);
        assert_eq!(
            start,
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap().timestamp_millis()
        );
        assert_eq!(
            end,
            Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap().timestamp_millis()
        );
    }

    #[test]
    fn boundary_wait_lands_on_next_hour_plus_grace() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        let wait = duration_until_next_boundary(now);
        assert_eq!(wait.as_secs(), 30 * 60 + 5);
    }

    fn test_scanner() -> SurgeScanner {
        let (tx, _rx) = mpsc::channel(16);
        SurgeScanner::new(
            Arc::new(BotConfig::default()),
            tx,
            FuturesClient::new("k", "s"),
        )
    }

    #[test]
    fn dedup_allows_one_signal_per_day() {
        let scanner = test_scanner();
        assert!(scanner.try_mark_seen("BTCUSDT:2024-01-15"));
        assert!(!scanner.try_mark_seen("BTCUSDT:2024-01-15"));
        assert!(scanner.try_mark_seen("BTCUSDT:2024-01-16"));
    }

    #[test]
    fn sl_cooldown_blocks_same_day_reentry() {
        let scanner = test_scanner();
        let now = Utc::now();
        scanner.block_symbol_today("BTCUSDT");
        assert!(scanner.is_blocked_today("BTCUSDT", now));
        // the dedup set gained the key too, so a fresh signal is dropped
        assert!(!scanner.try_mark_seen(&day_key("BTCUSDT", now)));
    }

    #[test]
    fn day_roll_clears_dedup_and_cooldown() {
        let scanner = test_scanner();
        let day1 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        scanner.roll_day_if_needed(day1);
        scanner.block_symbol_today("BTCUSDT");
        scanner.try_mark_seen("ETHUSDT:2024-01-15");

        let day2 = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 5).unwrap();
        scanner.roll_day_if_needed(day2);
        assert!(!scanner.is_blocked_today("BTCUSDT", day2));
        assert!(scanner.try_mark_seen("ETHUSDT:2024-01-16"));
    }
}
