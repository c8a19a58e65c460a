// =============================================================================
// Entry Pipeline — pending pool, guards, sizing, order placement
// =============================================================================
//
// One strictly serial consumer of the signal channel. Signals are not acted
// on individually: the first arrival drains everything queued into a batch,
// the batch rests in the pending pool for a configured delay so concurrent
// detections can accumulate, then entries execute strongest-ratio-first,
// one at a time, so each guard check observes the previous order's effect.
//
// Guard order is load-bearing:
//   auto-trade gate → position/duplicate guard → reference price →
//   strategy entry filter → daily-loss check → sizing → placement
// Every rejection is recorded as a signal event with its reason.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::binance::FuturesClient;
use crate::config::{BotConfig, MarginMode};
use crate::monitor::PositionMonitor;
use crate::notify::Notifier;
use crate::store::{SignalEvent, TradeStore};
use crate::strategy::Strategy;
use crate::executor::OrderExecutor;
use crate::types::SurgeSignal;

/// Pause after a successful placement so the exchange reflects the new
/// position before the next signal's guard check.
const INTER_ORDER_SPACING_SECS: u64 = 2;

pub struct EntryPipeline {
    client: FuturesClient,
    executor: Arc<OrderExecutor>,
    monitor: Arc<PositionMonitor>,
    store: TradeStore,
    notifier: Arc<dyn Notifier>,
    strategy: Arc<dyn Strategy>,
    config: Arc<BotConfig>,
    /// Master gate, flippable at runtime by the control surfaces.
    auto_trade: Arc<AtomicBool>,
}

impl EntryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: FuturesClient,
        executor: Arc<OrderExecutor>,
        monitor: Arc<PositionMonitor>,
        store: TradeStore,
        notifier: Arc<dyn Notifier>,
        strategy: Arc<dyn Strategy>,
        config: Arc<BotConfig>,
    ) -> Self {
        let auto_trade = Arc::new(AtomicBool::new(config.auto_trade));
        Self {
            client,
            executor,
            monitor,
            store,
            notifier,
            strategy,
            config,
            auto_trade,
        }
    }

    /// Shared handle to the auto-trade switch (exposed to control surfaces).
    pub fn auto_trade_switch(&self) -> Arc<AtomicBool> {
        self.auto_trade.clone()
    }

    // -------------------------------------------------------------------------
    // Consumer loop
    // -------------------------------------------------------------------------

    /// Consume the signal channel until it closes.
    pub async fn run_forever(self: Arc<Self>, mut rx: mpsc::Receiver<SurgeSignal>) {
        info!(
            pool_delay_secs = self.config.pending_pool_delay_secs,
            "entry pipeline started"
        );

        while let Some(first) = rx.recv().await {
            // Drain everything already queued into one batch.
            let mut pending = vec![first];
            while let Ok(signal) = rx.try_recv() {
                pending.push(signal);
            }

            info!(
                count = pending.len(),
                delay_secs = self.config.pending_pool_delay_secs,
                "signals pooled — waiting before entries"
            );
            for signal in &pending {
                info!(
                    symbol = %signal.symbol,
                    surge = %format!("{:.1}x", signal.surge_ratio),
                    price = %signal.price,
                    "pending signal"
                );
            }

            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.pending_pool_delay_secs,
            ))
            .await;

            sort_batch(&mut pending);

            // Symbols whose entry order went out in this batch but may not be
            // visible on the exchange yet.
            let mut live_pending: HashSet<String> = HashSet::new();
            let last = pending.len().saturating_sub(1);
            for (i, signal) in pending.into_iter().enumerate() {
                let placed = self.execute_entry(&signal, &live_pending).await;
                if placed {
                    live_pending.insert(signal.symbol.clone());
                    if i < last {
                        tokio::time::sleep(std::time::Duration::from_secs(
                            INTER_ORDER_SPACING_SECS,
                        ))
                        .await;
                    }
                }
            }
        }
        warn!("signal channel closed — entry pipeline stopping");
    }

    // -------------------------------------------------------------------------
    // Single-signal execution
    // -------------------------------------------------------------------------

    /// Run the guard sequence and, if everything passes, place the entry.
    /// Returns true when an order was submitted.
    async fn execute_entry(&self, signal: &SurgeSignal, live_pending: &HashSet<String>) -> bool {
        let symbol = signal.symbol.as_str();
        let now = Utc::now();

        // ── 1. Auto-trade gate ───────────────────────────────────────────
        if !self.auto_trade.load(Ordering::Relaxed) {
            info!(symbol, surge = signal.surge_ratio, "auto-trade off — skipping");
            self.save_event(SignalEvent::rejected(
                now.to_rfc3339(),
                symbol,
                signal.surge_ratio,
                signal.price.to_string(),
                "auto_trade_disabled",
            ))
            .await;
            return false;
        }

        // ── 2. Exchange positions ∪ in-flight entries ────────────────────
        let open_symbols: HashSet<String> = match self.client.position_risk(None).await {
            Ok(rows) => rows
                .into_iter()
                .filter(|p| p.is_open())
                .map(|p| p.symbol)
                .collect(),
            Err(e) => {
                // Fail-closed: without the position list the cap cannot be
                // enforced.
                warn!(symbol, error = %e, "position check failed — skipping entry");
                return false;
            }
        };
        let combined_count = open_symbols.union(live_pending).count();

        if open_symbols.contains(symbol) || live_pending.contains(symbol) {
            info!(symbol, "already in position (exchange or pending) — skipping");
            self.save_event(SignalEvent::rejected(
                now.to_rfc3339(),
                symbol,
                signal.surge_ratio,
                signal.price.to_string(),
                "already in position",
            ))
            .await;
            return false;
        }
        if combined_count >= self.config.max_positions {
            let reason = format!(
                "max positions reached ({} exchange + {} pending >= {})",
                open_symbols.len(),
                live_pending.len(),
                self.config.max_positions
            );
            info!(symbol, %reason, "skipping");
            self.save_event(SignalEvent::rejected(
                now.to_rfc3339(),
                symbol,
                signal.surge_ratio,
                signal.price.to_string(),
                reason,
            ))
            .await;
            return false;
        }

        // ── 3. Reference price ───────────────────────────────────────────
        let entry_price = match self.client.ticker_price(symbol).await {
            Ok(t) if t.price > Decimal::ZERO => t.price,
            Ok(t) => {
                warn!(symbol, price = %t.price, "ticker returned non-positive price");
                self.save_event(SignalEvent::rejected(
                    now.to_rfc3339(),
                    symbol,
                    signal.surge_ratio,
                    signal.price.to_string(),
                    "price fetch failed: non-positive price",
                ))
                .await;
                return false;
            }
            Err(e) => {
                warn!(symbol, error = %e, "price fetch failed");
                self.save_event(SignalEvent::rejected(
                    now.to_rfc3339(),
                    symbol,
                    signal.surge_ratio,
                    signal.price.to_string(),
                    format!("price fetch failed: {e}"),
                ))
                .await;
                return false;
            }
        };

        // ── 4. Strategy entry filter (fail-open internally) ──────────────
        let decision = self
            .strategy
            .filter_entry(
                &self.client,
                signal,
                entry_price,
                signal.price,
                now,
                &self.config,
            )
            .await;
        if !decision.accept {
            info!(symbol, reason = %decision.reject_reason, "filtered");
            let mut event = SignalEvent::rejected(
                now.to_rfc3339(),
                symbol,
                signal.surge_ratio,
                entry_price.to_string(),
                decision.reject_reason.clone(),
            );
            event.risk_metrics_json =
                serde_json::to_string(&decision.metrics).unwrap_or_else(|_| "{}".to_string());
            self.save_event(event).await;
            return false;
        }

        // ── 5. Daily loss limit ──────────────────────────────────────────
        if self.config.daily_loss_limit_usdt > Decimal::ZERO {
            match self.client.daily_realized_pnl().await {
                Ok(pnl) => {
                    info!(symbol, daily_pnl = %pnl, "daily realized PnL");
                    if pnl <= -self.config.daily_loss_limit_usdt {
                        let reason = format!(
                            "daily loss limit ({pnl} <= -{})",
                            self.config.daily_loss_limit_usdt
                        );
                        warn!(symbol, %reason, "no new entries today");
                        self.save_event(SignalEvent::rejected(
                            now.to_rfc3339(),
                            symbol,
                            signal.surge_ratio,
                            entry_price.to_string(),
                            reason,
                        ))
                        .await;
                        self.notifier
                            .daily_loss_limit(
                                &pnl.to_string(),
                                &self.config.daily_loss_limit_usdt.to_string(),
                            )
                            .await;
                        return false;
                    }
                }
                Err(e) => warn!(symbol, error = %e, "daily PnL check failed (fail-open)"),
            }
        }

        // ── 6. Sizing ────────────────────────────────────────────────────
        let margin = match self.config.margin_mode {
            MarginMode::Percent => match self.client.account_balance().await {
                Ok(balance) => {
                    let m = percent_margin(balance.available, self.config.margin_pct);
                    info!(symbol, margin = %m, pct = self.config.margin_pct, "percent margin");
                    m
                }
                Err(e) => {
                    warn!(symbol, error = %e, "balance fetch failed — using fixed margin");
                    self.config.live_fixed_margin_usdt
                }
            },
            MarginMode::Fixed => self.config.live_fixed_margin_usdt,
        };
        let quantity = margin * Decimal::from(self.config.leverage) / entry_price;

        // ── 7. Place the entry ───────────────────────────────────────────
        match self
            .executor
            .open_position(
                symbol,
                entry_price,
                quantity,
                decision.side,
                decision.tp_pct,
                decision.sl_pct,
            )
            .await
        {
            Ok(ticket) => {
                self.save_event(SignalEvent::accepted(
                    now.to_rfc3339(),
                    symbol,
                    signal.surge_ratio,
                    entry_price.to_string(),
                ))
                .await;
                info!(
                    symbol,
                    side = %decision.side,
                    price = %entry_price,
                    qty = %ticket.bracket.quantity,
                    order_id = ticket.order.order_id,
                    "LIVE ENTRY placed"
                );
                self.monitor.track(
                    symbol,
                    ticket.order.order_id,
                    decision.side,
                    ticket.bracket.quantity,
                    ticket.bracket.clone(),
                );
                self.notifier
                    .entry_placed(
                        symbol,
                        decision.side.as_str(),
                        &entry_price.to_string(),
                        &ticket.bracket.quantity.to_string(),
                        ticket.order.order_id,
                    )
                    .await;
                true
            }
            Err(e) => {
                error!(symbol, error = %e, "entry placement failed");
                false
            }
        }
    }

    async fn save_event(&self, event: SignalEvent) {
        if let Err(e) = self.store.save_signal_event(&event).await {
            warn!(symbol = %event.symbol, error = %e, "signal event write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Strongest surge first; the guard sequence then sees entries in that order.
pub fn sort_batch(batch: &mut [SurgeSignal]) {
    batch.sort_by(|a, b| {
        b.surge_ratio
            .partial_cmp(&a.surge_ratio)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Percent-of-balance margin with a 1 USDT floor.
pub fn percent_margin(available: Decimal, pct: f64) -> Decimal {
    let pct = Decimal::try_from(pct).unwrap_or_default();
    let margin = available * pct / Decimal::from(100);
    margin.max(Decimal::ONE)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn signal(symbol: &str, ratio: f64) -> SurgeSignal {
        SurgeSignal {
            symbol: symbol.to_string(),
            signal_time: Utc::now(),
            surge_ratio: ratio,
            price: dec!(1),
            yesterday_avg_sell_vol: 1.0,
            hourly_sell_vol: ratio,
        }
    }

    #[test]
    fn batch_sorts_strongest_first() {
        let mut batch = vec![signal("A", 10.5), signal("B", 55.0), signal("C", 12.0)];
        sort_batch(&mut batch);
        let order: Vec<&str> = batch.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn percent_margin_takes_share_of_balance() {
        assert_eq!(percent_margin(dec!(1000), 2.0), dec!(20));
    }

    #[test]
    fn percent_margin_floors_at_one_usdt() {
        assert_eq!(percent_margin(dec!(10), 2.0), dec!(1));
        assert_eq!(percent_margin(dec!(0), 2.0), dec!(1));
    }

    #[test]
    fn sizing_follows_margin_times_leverage_over_price() {
        let margin = dec!(5);
        let quantity = margin * Decimal::from(3u32) / dec!(50000);
        assert_eq!(quantity, dec!(0.0003));
    }
}
