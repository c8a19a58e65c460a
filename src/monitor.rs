// =============================================================================
// Position Monitor — deferred brackets, drift reconciliation, recovery
// =============================================================================
//
// Owns the symbol → TrackedPosition map. Two writers exist: the poll loop
// (correctness) and the user-data stream dispatch (latency). Each position
// sits behind its own async mutex so the two paths never mutate the same
// symbol concurrently; the triggered/filled flags make every transition
// idempotent, so a REST observation and a stream event for the same fill
// are harmless duplicates.
//
// Per position life-cycle:
//   tracked (entry pending) → entry_filled → armed (bracket live) → closed
// with detours for manual bracket cancellation (re-place), dynamic TP
// replacement, strategy force-close, and crash recovery.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::binance::models::SymbolRules;
use crate::binance::{AlgoOrder, BinanceError, FuturesClient};
use crate::config::BotConfig;
use crate::executor::{
    bracket_prices, round_price, round_qty, BracketSide, DeferredBracket, OrderExecutor,
};
use crate::notify::Notifier;
use crate::store::{LiveTrade, PositionState, TradeStore};
use crate::strategy::{PositionAction, Strategy};
use crate::types::{order_token, Side, Strength};

/// Full rules-map refresh interval (the client's own exchangeInfo cache is
/// shorter-lived; this bounds how often the monitor rebuilds its map).
const RULES_TTL_SECS: u64 = 4 * 3600;

/// Orphan cleanup runs on cycles 1, 11, 21, …
const ORPHAN_CLEANUP_EVERY: u64 = 10;

/// Stop re-placing a bracket side after this many consecutive failures.
const MAX_REPLACE_ATTEMPTS: u32 = 10;

/// Hook the scanner registers so stop-loss exits block same-day re-entry.
pub type SlCooldownHook = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// TrackedPosition
// ---------------------------------------------------------------------------

/// Mutable state for one live position.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub symbol: String,
    /// Zero when unknown (recovered after a restart).
    pub entry_order_id: u64,
    pub side: Side,
    pub quantity: Decimal,
    /// Bracket parameters computed at entry time; rebuilt on recovery.
    pub bracket: Option<DeferredBracket>,

    // Fill state
    pub entry_filled: bool,
    pub entry_price: Option<Decimal>,
    pub entry_fill_time: Option<DateTime<Utc>>,

    // Bracket state
    pub tp_sl_placed: bool,
    pub tp_algo_id: Option<u64>,
    pub sl_algo_id: Option<u64>,
    pub tp_triggered: bool,
    pub sl_triggered: bool,

    // Dynamic TP state
    pub current_tp_pct: f64,
    pub evaluated_2h: bool,
    pub evaluated_12h: bool,
    pub strength: Strength,

    // Bounded re-place retries
    pub tp_fail_count: u32,
    pub sl_fail_count: u32,

    pub created_at: DateTime<Utc>,
    pub closed: bool,
}

impl TrackedPosition {
    pub fn new(
        symbol: String,
        entry_order_id: u64,
        side: Side,
        quantity: Decimal,
        bracket: Option<DeferredBracket>,
        initial_tp_pct: f64,
    ) -> Self {
        Self {
            symbol,
            entry_order_id,
            side,
            quantity,
            bracket,
            entry_filled: false,
            entry_price: None,
            entry_fill_time: None,
            tp_sl_placed: false,
            tp_algo_id: None,
            sl_algo_id: None,
            tp_triggered: false,
            sl_triggered: false,
            current_tp_pct: initial_tp_pct,
            evaluated_2h: false,
            evaluated_12h: false,
            strength: Strength::Unknown,
            tp_fail_count: 0,
            sl_fail_count: 0,
            created_at: Utc::now(),
            closed: false,
        }
    }

    fn state_checkpoint(&self) -> PositionState {
        PositionState {
            current_tp_pct: self.current_tp_pct,
            strength: self.strength,
            evaluated_2h: self.evaluated_2h,
            evaluated_12h: self.evaluated_12h,
        }
    }
}

// ---------------------------------------------------------------------------
// Order classification (shared by poll loop and stream dispatch)
// ---------------------------------------------------------------------------

/// What a FILLED order on a tracked symbol means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillKind {
    TakeProfit,
    StopLoss,
    Other,
}

/// Classify a filled close order by its original order type, falling back to
/// the client-id prefix — the prefix is the only reliable classifier for
/// orders recovered across restarts.
pub fn classify_close_fill(orig_order_type: &str, client_id: &str) -> FillKind {
    let client_id = client_id.to_ascii_lowercase();
    if orig_order_type.contains("TAKE_PROFIT") || client_id.starts_with("tp_") {
        FillKind::TakeProfit
    } else if matches!(orig_order_type, "STOP_MARKET" | "STOP") || client_id.starts_with("sl_") {
        FillKind::StopLoss
    } else {
        FillKind::Other
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct PositionMonitor {
    client: FuturesClient,
    executor: Arc<OrderExecutor>,
    config: Arc<BotConfig>,
    store: TradeStore,
    notifier: Arc<dyn Notifier>,
    strategy: Option<Arc<dyn Strategy>>,
    positions: RwLock<HashMap<String, Arc<Mutex<TrackedPosition>>>>,
    poll_count: AtomicU64,
    rules: RwLock<Option<(Instant, HashMap<String, SymbolRules>)>>,
    sl_cooldown: RwLock<Option<SlCooldownHook>>,
}

impl PositionMonitor {
    pub fn new(
        client: FuturesClient,
        executor: Arc<OrderExecutor>,
        config: Arc<BotConfig>,
        store: TradeStore,
        notifier: Arc<dyn Notifier>,
        strategy: Option<Arc<dyn Strategy>>,
    ) -> Self {
        Self {
            client,
            executor,
            config,
            store,
            notifier,
            strategy,
            positions: RwLock::new(HashMap::new()),
            poll_count: AtomicU64::new(0),
            rules: RwLock::new(None),
            sl_cooldown: RwLock::new(None),
        }
    }

    /// Register the scanner's stop-loss cooldown hook.
    pub fn set_sl_cooldown_hook(&self, hook: SlCooldownHook) {
        *self.sl_cooldown.write() = Some(hook);
    }

    fn fire_sl_cooldown(&self, symbol: &str) {
        if let Some(hook) = self.sl_cooldown.read().as_ref() {
            hook(symbol);
        }
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Start tracking a freshly placed entry (bracket deferred until fill).
    pub fn track(
        &self,
        symbol: &str,
        entry_order_id: u64,
        side: Side,
        quantity: Decimal,
        bracket: DeferredBracket,
    ) {
        let initial_tp_pct = bracket.tp_pct;
        let pos = TrackedPosition::new(
            symbol.to_string(),
            entry_order_id,
            side,
            quantity,
            Some(bracket),
            initial_tp_pct,
        );
        let mut positions = self.positions.write();
        if positions.contains_key(symbol) {
            warn!(symbol, "track() called for an already-tracked symbol — replacing");
        }
        positions.insert(symbol.to_string(), Arc::new(Mutex::new(pos)));
        info!(
            symbol,
            entry_order_id,
            side = %side,
            "tracking new position (bracket deferred until entry fills)"
        );
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn tracked_symbols(&self) -> HashSet<String> {
        self.positions.read().keys().cloned().collect()
    }

    fn position(&self, symbol: &str) -> Option<Arc<Mutex<TrackedPosition>>> {
        self.positions.read().get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Poll loop
    // -------------------------------------------------------------------------

    /// Main monitoring loop; one iteration per `monitor_interval_seconds`.
    pub async fn run_forever(self: Arc<Self>) {
        info!(
            interval_secs = self.config.monitor_interval_seconds,
            "position monitor started"
        );
        loop {
            if let Err(e) = self.check_all().await {
                error!(error = %e, "monitor cycle failed");
            }
            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.monitor_interval_seconds,
            ))
            .await;
        }
    }

    /// One poll cycle over a snapshot of tracked positions.
    pub async fn check_all(&self) -> anyhow::Result<()> {
        let cycle = self.poll_count.fetch_add(1, Ordering::Relaxed) + 1;

        let snapshot: Vec<(String, Arc<Mutex<TrackedPosition>>)> = self
            .positions
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut closed_symbols = Vec::new();
        for (symbol, slot) in snapshot {
            let mut pos = slot.lock().await;
            if !pos.closed {
                if let Err(e) = self.check_position(&mut pos).await {
                    warn!(symbol = %symbol, error = %e, "position check failed");
                }
            }
            if pos.closed {
                closed_symbols.push(symbol);
            }
        }

        if !closed_symbols.is_empty() {
            let mut positions = self.positions.write();
            for symbol in &closed_symbols {
                positions.remove(symbol);
            }
            debug!(removed = closed_symbols.len(), "closed positions dropped");
        }

        if cycle % ORPHAN_CLEANUP_EVERY == 1 {
            if let Err(e) = self.cancel_orphans().await {
                warn!(error = %e, "orphan cleanup failed");
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Per-position check
    // -------------------------------------------------------------------------

    async fn check_position(&self, pos: &mut TrackedPosition) -> anyhow::Result<()> {
        let now = Utc::now();

        // ── 1. Entry fill ────────────────────────────────────────────────
        if !pos.entry_filled {
            match self.client.query_order(&pos.symbol, pos.entry_order_id).await {
                Ok(order) => match order.status.as_str() {
                    "FILLED" => {
                        pos.entry_filled = true;
                        pos.entry_price = Some(order.fill_price());
                        pos.entry_fill_time = Some(now);
                        info!(
                            symbol = %pos.symbol,
                            side = %pos.side,
                            price = %order.fill_price(),
                            "entry filled"
                        );
                        self.notifier
                            .entry_filled(&pos.symbol, pos.side.as_str(), &order.fill_price().to_string())
                            .await;
                        let mut trade = self.live_trade(pos, "entry");
                        trade.order_id = pos.entry_order_id.to_string();
                        self.record_trade(trade).await;
                        self.place_deferred_bracket(pos).await;
                    }
                    "CANCELED" | "EXPIRED" | "REJECTED" => {
                        warn!(
                            symbol = %pos.symbol,
                            status = %order.status,
                            "entry order dead — dropping position"
                        );
                        pos.closed = true;
                        return Ok(());
                    }
                    _ => {}
                },
                Err(e) => debug!(symbol = %pos.symbol, error = %e, "entry query failed"),
            }
        }
        if !pos.entry_filled {
            return Ok(());
        }

        // ── 2. Bracket retry ─────────────────────────────────────────────
        if !pos.tp_sl_placed {
            warn!(symbol = %pos.symbol, "bracket not yet placed — retrying");
            self.place_deferred_bracket(pos).await;
            if !pos.tp_sl_placed {
                return Ok(());
            }
        }

        // ── 3. Strategy tick ─────────────────────────────────────────────
        if let Some(strategy) = self.strategy.clone() {
            let action = strategy
                .evaluate_position(&self.client, pos, &self.config, now)
                .await;
            match action {
                PositionAction::Hold => {}
                PositionAction::Close { reason } => {
                    warn!(symbol = %pos.symbol, reason = %reason, "strategy close");
                    if reason == "max_hold_time" {
                        self.notifier
                            .timeout_close(&pos.symbol, self.config.max_hold_hours)
                            .await;
                    } else {
                        self.notifier
                            .send(&format!("strategy close: {} — {reason}", pos.symbol))
                            .await;
                    }
                    let event = if reason == "max_hold_time" {
                        "timeout".to_string()
                    } else {
                        reason
                    };
                    self.record_trade(self.live_trade(pos, &event)).await;
                    self.force_close(pos).await;
                    return Ok(());
                }
                PositionAction::AdjustTp {
                    new_tp_pct,
                    new_strength,
                } => {
                    pos.current_tp_pct = new_tp_pct;
                    if let Some(strength) = new_strength {
                        pos.strength = strength;
                    }
                    self.replace_tp(pos).await;
                    return Ok(());
                }
            }
        }

        // ── 4. Drift reconciliation ──────────────────────────────────────
        match self.client.open_algo_orders(Some(&pos.symbol)).await {
            Ok(open) => {
                let open_ids: HashSet<u64> = open.iter().map(|o| o.algo_id).collect();
                self.reconcile_bracket_leg(pos, BracketSide::TakeProfit, &open_ids)
                    .await;
                if !pos.closed {
                    self.reconcile_bracket_leg(pos, BracketSide::StopLoss, &open_ids)
                        .await;
                }
            }
            Err(e) => debug!(symbol = %pos.symbol, error = %e, "algo order check failed"),
        }

        // ── 5. Null-id fallback (e.g. a prior replace failed) ────────────
        if !pos.closed && pos.tp_sl_placed {
            if pos.tp_algo_id.is_none() && !pos.tp_triggered {
                warn!(symbol = %pos.symbol, "take-profit id lost — re-placing");
                self.re_place_bracket_leg(pos, BracketSide::TakeProfit).await;
            }
            if pos.sl_algo_id.is_none() && !pos.sl_triggered {
                warn!(symbol = %pos.symbol, "stop-loss id lost — re-placing");
                self.re_place_bracket_leg(pos, BracketSide::StopLoss).await;
            }
        }

        // ── 6. Legacy max-hold (only without an injected strategy) ───────
        if self.strategy.is_none() && !pos.closed {
            let hold_hours = (now - pos.created_at).num_seconds() as f64 / 3600.0;
            if hold_hours >= self.config.max_hold_hours {
                warn!(
                    symbol = %pos.symbol,
                    hold_hours,
                    "max hold exceeded — market close"
                );
                self.notifier
                    .timeout_close(&pos.symbol, self.config.max_hold_hours)
                    .await;
                self.record_trade(self.live_trade(pos, "timeout")).await;
                self.force_close(pos).await;
            }
        }

        Ok(())
    }

    /// A bracket leg vanished from the open set: a real trigger closes the
    /// position; a manual cancellation gets the leg re-placed.
    async fn reconcile_bracket_leg(
        &self,
        pos: &mut TrackedPosition,
        leg: BracketSide,
        open_ids: &HashSet<u64>,
    ) {
        let (algo_id, triggered) = match leg {
            BracketSide::TakeProfit => (pos.tp_algo_id, pos.tp_triggered),
            BracketSide::StopLoss => (pos.sl_algo_id, pos.sl_triggered),
        };
        let Some(algo_id) = algo_id else { return };
        if open_ids.contains(&algo_id) || triggered {
            return;
        }

        let exchange_amt = self.exchange_position_amt(&pos.symbol).await;
        if exchange_amt == Decimal::ZERO {
            // Real trigger: the conditional fired and flattened the position.
            self.mark_leg_triggered(pos, leg, None, None).await;
        } else {
            warn!(
                symbol = %pos.symbol,
                algo_id,
                leg = leg.label(),
                "bracket leg cancelled manually — re-placing"
            );
            self.re_place_bracket_leg(pos, leg).await;
        }
    }

    /// Idempotent trigger transition shared by the poll loop and the stream
    /// dispatch. Cancels the sibling leg, records the event, notifies, and
    /// (for stop-losses) arms the scanner cooldown.
    async fn mark_leg_triggered(
        &self,
        pos: &mut TrackedPosition,
        leg: BracketSide,
        exit_price: Option<String>,
        realized_pnl: Option<String>,
    ) {
        match leg {
            BracketSide::TakeProfit => {
                if pos.tp_triggered {
                    return;
                }
                pos.tp_triggered = true;
            }
            BracketSide::StopLoss => {
                if pos.sl_triggered {
                    return;
                }
                pos.sl_triggered = true;
            }
        }
        pos.closed = true;

        let price = exit_price.clone().unwrap_or_else(|| {
            // REST path has no fill price; estimate from the TP target.
            match (leg, pos.entry_price) {
                (BracketSide::TakeProfit, Some(entry)) => {
                    let (tp, _) = bracket_prices(
                        entry,
                        pos.side,
                        pos.current_tp_pct,
                        self.config.stop_loss_pct,
                    );
                    tp.round_dp(6).to_string()
                }
                _ => String::new(),
            }
        });
        let pnl = realized_pnl.unwrap_or_default();

        info!(
            symbol = %pos.symbol,
            leg = leg.label(),
            exit_price = %price,
            pnl = %pnl,
            "bracket leg triggered — position closed"
        );

        let (event, sibling_id) = match leg {
            BracketSide::TakeProfit => {
                self.notifier
                    .tp_triggered(&pos.symbol, pos.side.as_str(), &price, &pnl)
                    .await;
                ("tp", pos.sl_algo_id)
            }
            BracketSide::StopLoss => {
                self.notifier
                    .sl_triggered(&pos.symbol, pos.side.as_str(), &price, &pnl)
                    .await;
                self.fire_sl_cooldown(&pos.symbol);
                ("sl", pos.tp_algo_id)
            }
        };

        let mut trade = self.live_trade(pos, event);
        trade.exit_price = price;
        trade.pnl_usdt = pnl;
        trade.algo_id = match leg {
            BracketSide::TakeProfit => pos.tp_algo_id.map(|i| i.to_string()).unwrap_or_default(),
            BracketSide::StopLoss => pos.sl_algo_id.map(|i| i.to_string()).unwrap_or_default(),
        };
        self.record_trade(trade).await;

        if let Some(id) = sibling_id {
            match self.client.cancel_algo_order(&pos.symbol, id).await {
                Ok(()) => info!(symbol = %pos.symbol, algo_id = id, "sibling bracket leg cancelled"),
                Err(e) => warn!(symbol = %pos.symbol, algo_id = id, error = %e, "sibling cancel failed"),
            }
        }

        if let Err(e) = self.store.delete_position_state(&pos.symbol).await {
            debug!(symbol = %pos.symbol, error = %e, "checkpoint delete failed");
        }
    }

    // -------------------------------------------------------------------------
    // Bracket placement / replacement
    // -------------------------------------------------------------------------

    /// Place the missing bracket legs. `tp_sl_placed` is only set once BOTH
    /// legs are live; partial success keeps the placed leg and retries the
    /// other next tick.
    ///
    /// Trigger prices are recomputed from the actual fill price — a LIMIT
    /// entry can fill better than its limit, and the bracket must anchor to
    /// the real entry.
    async fn place_deferred_bracket(&self, pos: &mut TrackedPosition) {
        let Some(mut bracket) = pos.bracket.clone() else {
            warn!(symbol = %pos.symbol, "no bracket parameters — cannot place");
            return;
        };

        if let Some(fill_price) = pos.entry_price {
            match self.rules_for(&pos.symbol).await {
                Ok(rules) => {
                    let (tp, sl) = bracket_triggers_at_fill(&bracket, pos.side, fill_price, &rules);
                    bracket.tp_price = tp;
                    bracket.sl_price = sl;
                }
                Err(e) => warn!(
                    symbol = %pos.symbol,
                    error = %e,
                    "rules unavailable — using reference-price bracket"
                ),
            }
        }

        if pos.tp_algo_id.is_none() {
            match self
                .executor
                .place_bracket_side(&bracket, BracketSide::TakeProfit)
                .await
            {
                Ok(order) => pos.tp_algo_id = Some(order.algo_id),
                Err(e) => warn!(symbol = %pos.symbol, error = %e, "take-profit placement failed"),
            }
        }
        if pos.sl_algo_id.is_none() {
            match self
                .executor
                .place_bracket_side(&bracket, BracketSide::StopLoss)
                .await
            {
                Ok(order) => pos.sl_algo_id = Some(order.algo_id),
                Err(e) => warn!(symbol = %pos.symbol, error = %e, "stop-loss placement failed"),
            }
        }

        pos.tp_sl_placed = pos.tp_algo_id.is_some() && pos.sl_algo_id.is_some();
        if pos.tp_sl_placed {
            info!(
                symbol = %pos.symbol,
                tp = ?pos.tp_algo_id,
                sl = ?pos.sl_algo_id,
                "bracket armed"
            );
            self.notifier
                .bracket_placed(
                    &pos.symbol,
                    &bracket.tp_price.to_string(),
                    &bracket.sl_price.to_string(),
                )
                .await;
        }
    }

    /// Swap the TP order for one at the current `current_tp_pct`.
    ///
    /// Cancel → clear id (so the poll loop cannot misread the gap as a
    /// trigger) → place fresh → persist the checkpoint. On placement failure
    /// fall back to a TP at the configured strong percentage; if even that
    /// fails the position is unguarded on the profit side and the operator
    /// is paged.
    async fn replace_tp(&self, pos: &mut TrackedPosition) {
        let (Some(entry_price), Some(old_id)) = (pos.entry_price, pos.tp_algo_id) else {
            return;
        };

        if let Err(e) = self.client.cancel_algo_order(&pos.symbol, old_id).await {
            warn!(symbol = %pos.symbol, algo_id = old_id, error = %e, "old take-profit cancel failed — keeping it");
            return;
        }
        pos.tp_algo_id = None;

        match self
            .place_tp_at(pos, entry_price, pos.current_tp_pct)
            .await
        {
            Ok(algo_id) => {
                pos.tp_algo_id = Some(algo_id);
                info!(
                    symbol = %pos.symbol,
                    tp_pct = pos.current_tp_pct,
                    strength = %pos.strength,
                    algo_id,
                    "take-profit replaced"
                );
                self.notifier
                    .send(&format!(
                        "dynamic TP: {} {} → {}%",
                        pos.symbol, pos.strength, pos.current_tp_pct
                    ))
                    .await;
                if let Err(e) = self
                    .store
                    .save_position_state(&pos.symbol, &pos.state_checkpoint())
                    .await
                {
                    warn!(symbol = %pos.symbol, error = %e, "checkpoint write failed");
                }
            }
            Err(e) => {
                error!(symbol = %pos.symbol, error = %e, "new take-profit failed — restoring safety net");
                self.restore_tp(pos, entry_price).await;
            }
        }
    }

    /// Safety net after a failed replacement: re-arm at the configured
    /// strong percentage rather than leave the upside unguarded.
    async fn restore_tp(&self, pos: &mut TrackedPosition, entry_price: Decimal) {
        let fallback_pct = self.config.strong_tp_pct;
        match self.place_tp_at(pos, entry_price, fallback_pct).await {
            Ok(algo_id) => {
                pos.tp_algo_id = Some(algo_id);
                pos.current_tp_pct = fallback_pct;
                info!(symbol = %pos.symbol, tp_pct = fallback_pct, algo_id, "take-profit restored");
            }
            Err(e) => {
                error!(symbol = %pos.symbol, error = %e, "take-profit restore failed — position unguarded");
                self.notifier
                    .send_critical(&format!(
                        "{} take-profit replacement AND restore failed — set a TP manually now",
                        pos.symbol
                    ))
                    .await;
            }
        }
    }

    /// Place a TAKE_PROFIT_MARKET at `entry × (1 ∓ pct/100)` with a fresh
    /// client id; returns the new algo id.
    async fn place_tp_at(
        &self,
        pos: &TrackedPosition,
        entry_price: Decimal,
        tp_pct: f64,
    ) -> Result<u64, BinanceError> {
        let rules = self.rules_for(&pos.symbol).await?;
        let (tp_raw, _) = bracket_prices(entry_price, pos.side, tp_pct, self.config.stop_loss_pct);
        let tp_price = round_price(tp_raw, &rules);
        let quantity = round_qty(pos.quantity, &rules);
        let hedge = self.client.is_hedge_mode().await?;

        let bracket = DeferredBracket {
            symbol: pos.symbol.clone(),
            close_side: pos.side.close_order_side().to_string(),
            position_side: pos.side.position_side(hedge).to_string(),
            tp_price,
            sl_price: Decimal::ZERO,
            tp_pct,
            sl_pct: self.config.stop_loss_pct,
            quantity,
            order_prefix: order_token(),
        };
        let order = self
            .executor
            .place_bracket_side(&bracket, BracketSide::TakeProfit)
            .await?;
        Ok(order.algo_id)
    }

    /// Re-place one bracket leg after it went missing while the position is
    /// still open. Bounded: after MAX_REPLACE_ATTEMPTS consecutive failures
    /// the leg is abandoned and the operator paged exactly once.
    async fn re_place_bracket_leg(&self, pos: &mut TrackedPosition, leg: BracketSide) {
        let Some(entry_price) = pos.entry_price else {
            return;
        };

        let fail_count = match leg {
            BracketSide::TakeProfit => pos.tp_fail_count,
            BracketSide::StopLoss => pos.sl_fail_count,
        };
        if fail_count >= MAX_REPLACE_ATTEMPTS {
            if fail_count == MAX_REPLACE_ATTEMPTS {
                error!(
                    symbol = %pos.symbol,
                    leg = leg.label(),
                    fail_count,
                    "re-place abandoned after repeated failures — manual intervention required"
                );
                self.notifier
                    .send_critical(&format!(
                        "{} {} re-place failed {} times — set it manually now",
                        pos.symbol,
                        leg.label(),
                        fail_count
                    ))
                    .await;
                // Step past the limit so this pages only once.
                match leg {
                    BracketSide::TakeProfit => pos.tp_fail_count += 1,
                    BracketSide::StopLoss => pos.sl_fail_count += 1,
                }
            }
            return;
        }

        let pct = match leg {
            BracketSide::TakeProfit => pos.current_tp_pct,
            BracketSide::StopLoss => self.config.stop_loss_pct,
        };

        let result = async {
            let rules = self.rules_for(&pos.symbol).await?;
            let (tp_raw, sl_raw) =
                bracket_prices(entry_price, pos.side, pct, self.config.stop_loss_pct);
            let trigger_raw = match leg {
                BracketSide::TakeProfit => tp_raw,
                BracketSide::StopLoss => sl_raw,
            };
            let trigger = round_price(trigger_raw, &rules);
            let quantity = round_qty(pos.quantity, &rules);
            let hedge = self.client.is_hedge_mode().await?;

            let bracket = DeferredBracket {
                symbol: pos.symbol.clone(),
                close_side: pos.side.close_order_side().to_string(),
                position_side: pos.side.position_side(hedge).to_string(),
                tp_price: trigger,
                sl_price: trigger,
                tp_pct: pct,
                sl_pct: self.config.stop_loss_pct,
                quantity,
                order_prefix: order_token(),
            };
            self.executor.place_bracket_side(&bracket, leg).await
        }
        .await;

        match result {
            Ok(order) => {
                match leg {
                    BracketSide::TakeProfit => {
                        pos.tp_algo_id = Some(order.algo_id);
                        pos.tp_fail_count = 0;
                    }
                    BracketSide::StopLoss => {
                        pos.sl_algo_id = Some(order.algo_id);
                        pos.sl_fail_count = 0;
                    }
                }
                info!(
                    symbol = %pos.symbol,
                    leg = leg.label(),
                    algo_id = order.algo_id,
                    "bracket leg re-placed"
                );
                self.notifier
                    .send(&format!(
                        "{} {} was cancelled manually — re-placed automatically",
                        pos.symbol,
                        leg.label()
                    ))
                    .await;
            }
            Err(e) => {
                let count = match leg {
                    BracketSide::TakeProfit => {
                        pos.tp_fail_count += 1;
                        pos.tp_fail_count
                    }
                    BracketSide::StopLoss => {
                        pos.sl_fail_count += 1;
                        pos.sl_fail_count
                    }
                };
                error!(
                    symbol = %pos.symbol,
                    leg = leg.label(),
                    attempt = count,
                    error = %e,
                    "bracket leg re-place failed — position unprotected on this side"
                );
                self.notifier
                    .send_critical(&format!(
                        "{} {} re-place failed (attempt {count}) — check the position",
                        pos.symbol,
                        leg.label()
                    ))
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Force close
    // -------------------------------------------------------------------------

    /// Market-close the position and best-effort cancel both bracket legs.
    /// Idempotent: a second call on an already-flat position is rejected
    /// cleanly by the exchange and the cancels are no-ops.
    pub async fn force_close(&self, pos: &mut TrackedPosition) {
        let close_side = pos.side.close_order_side();
        let quantity = match self.rules_for(&pos.symbol).await {
            Ok(rules) => round_qty(pos.quantity, &rules).to_string(),
            Err(_) => pos.quantity.to_string(),
        };

        match self.client.is_hedge_mode().await {
            Ok(hedge) => {
                let position_side = pos.side.position_side(hedge);
                match self
                    .client
                    .place_market_close(&pos.symbol, close_side, position_side, &quantity)
                    .await
                {
                    Ok(_) => info!(symbol = %pos.symbol, "market close submitted"),
                    Err(e) => error!(symbol = %pos.symbol, error = %e, "market close failed"),
                }
            }
            Err(e) => error!(symbol = %pos.symbol, error = %e, "position mode unavailable — close skipped"),
        }

        for algo_id in [pos.tp_algo_id, pos.sl_algo_id].into_iter().flatten() {
            let _ = self.client.cancel_algo_order(&pos.symbol, algo_id).await;
        }

        pos.closed = true;
        if let Err(e) = self.store.delete_position_state(&pos.symbol).await {
            debug!(symbol = %pos.symbol, error = %e, "checkpoint delete failed");
        }
    }

    // -------------------------------------------------------------------------
    // Orphan cleanup
    // -------------------------------------------------------------------------

    /// Cancel algo orders whose symbol has neither a tracked position nor a
    /// non-zero exchange position — leftovers of a prior run or of a manual
    /// close that did not cascade.
    pub async fn cancel_orphans(&self) -> Result<(), BinanceError> {
        let algo_orders = self.client.open_algo_orders(None).await?;
        if algo_orders.is_empty() {
            return Ok(());
        }

        let open_symbols: HashSet<String> = self
            .client
            .position_risk(None)
            .await?
            .into_iter()
            .filter(|p| p.is_open())
            .map(|p| p.symbol)
            .collect();
        let tracked = self.tracked_symbols();

        let mut cancelled = 0usize;
        for order in orphan_algo_orders(&algo_orders, &open_symbols, &tracked) {
            match self.client.cancel_algo_order(&order.symbol, order.algo_id).await {
                Ok(()) => {
                    cancelled += 1;
                    warn!(
                        symbol = %order.symbol,
                        algo_id = order.algo_id,
                        order_type = %order.order_type,
                        trigger = %order.trigger_price,
                        "orphan algo order cancelled"
                    );
                    self.notifier
                        .send(&format!(
                            "orphan order removed: {} {} trigger={} (algo {})",
                            order.symbol, order.order_type, order.trigger_price, order.algo_id
                        ))
                        .await;
                }
                Err(e) => warn!(
                    symbol = %order.symbol,
                    algo_id = order.algo_id,
                    error = %e,
                    "orphan cancel failed"
                ),
            }
        }

        if cancelled > 0 {
            info!(cancelled, "orphan cleanup complete");
        } else {
            debug!("no orphan algo orders");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Rebuild the tracked map from exchange state after a restart, restore
    /// dynamic-TP checkpoints, re-arm missing brackets, then run one orphan
    /// cleanup pass. Idempotent: already-tracked symbols are skipped.
    pub async fn recover_positions(&self) {
        let all_positions = match self.client.position_risk(None).await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "recovery aborted — cannot fetch positions");
                return;
            }
        };

        let mut recovered = 0usize;
        for risk in all_positions.into_iter().filter(|p| p.is_open()) {
            let symbol = risk.symbol.clone();
            if self.is_tracked(&symbol) {
                continue;
            }

            let side = if risk.position_amt > Decimal::ZERO {
                Side::Long
            } else {
                Side::Short
            };
            let quantity = risk.position_amt.abs();

            // Match live algo orders back to their roles via client-id prefix.
            let (mut tp_algo_id, mut sl_algo_id) = (None, None);
            match self.client.open_algo_orders(Some(&symbol)).await {
                Ok(orders) => {
                    for order in orders {
                        if order.client_algo_id.starts_with("tp_") {
                            tp_algo_id = Some(order.algo_id);
                        } else if order.client_algo_id.starts_with("sl_") {
                            sl_algo_id = Some(order.algo_id);
                        }
                    }
                }
                Err(e) => debug!(symbol = %symbol, error = %e, "algo fetch failed during recovery"),
            }

            let mut pos = TrackedPosition::new(
                symbol.clone(),
                0,
                side,
                quantity,
                None,
                self.config.strong_tp_pct,
            );
            pos.entry_filled = true;
            pos.entry_price = Some(risk.entry_price);
            pos.entry_fill_time = Some(Utc::now());
            pos.tp_algo_id = tp_algo_id;
            pos.sl_algo_id = sl_algo_id;
            pos.tp_sl_placed = tp_algo_id.is_some() && sl_algo_id.is_some();

            // Restore the dynamic-TP checkpoint so the strong default does
            // not clobber an adjusted percentage.
            match self.store.position_state(&symbol).await {
                Ok(Some(state)) => {
                    pos.current_tp_pct = state.current_tp_pct;
                    pos.strength = state.strength;
                    pos.evaluated_2h = state.evaluated_2h;
                    pos.evaluated_12h = state.evaluated_12h;
                    info!(
                        symbol = %symbol,
                        tp_pct = state.current_tp_pct,
                        strength = %state.strength,
                        "dynamic-TP state restored"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "checkpoint read failed"),
            }

            info!(
                symbol = %symbol,
                side = %side,
                qty = %quantity,
                entry = %risk.entry_price,
                tp = ?pos.tp_algo_id,
                sl = ?pos.sl_algo_id,
                "position recovered"
            );

            // Crash landed between fill and bracket placement: re-arm now
            // with the restored TP% and the configured SL%.
            if !pos.tp_sl_placed && risk.entry_price > Decimal::ZERO {
                match self.build_bracket(&pos, risk.entry_price).await {
                    Ok(bracket) => {
                        pos.bracket = Some(bracket.clone());
                        self.place_deferred_bracket(&mut pos).await;
                        self.notifier
                            .send(&format!(
                                "recovery: re-armed bracket for {symbol} tp={} sl={}",
                                bracket.tp_price, bracket.sl_price
                            ))
                            .await;
                    }
                    Err(e) => error!(symbol = %symbol, error = %e, "recovery bracket build failed"),
                }
            }

            self.positions
                .write()
                .insert(symbol, Arc::new(Mutex::new(pos)));
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "positions recovered from exchange state");
            self.notifier
                .send(&format!("restart recovery: {recovered} position(s) re-tracked"))
                .await;
        } else {
            info!("no positions to recover");
        }

        if let Err(e) = self.cancel_orphans().await {
            warn!(error = %e, "startup orphan cleanup failed");
        }
    }

    /// Bracket parameters for a recovered position.
    async fn build_bracket(
        &self,
        pos: &TrackedPosition,
        entry_price: Decimal,
    ) -> Result<DeferredBracket, BinanceError> {
        let rules = self.rules_for(&pos.symbol).await?;
        let (tp_raw, sl_raw) = bracket_prices(
            entry_price,
            pos.side,
            pos.current_tp_pct,
            self.config.stop_loss_pct,
        );
        let hedge = self.client.is_hedge_mode().await?;
        Ok(DeferredBracket {
            symbol: pos.symbol.clone(),
            close_side: pos.side.close_order_side().to_string(),
            position_side: pos.side.position_side(hedge).to_string(),
            tp_price: round_price(tp_raw, &rules),
            sl_price: round_price(sl_raw, &rules),
            tp_pct: pos.current_tp_pct,
            sl_pct: self.config.stop_loss_pct,
            quantity: round_qty(pos.quantity, &rules),
            order_prefix: order_token(),
        })
    }

    // -------------------------------------------------------------------------
    // Stream dispatch
    // -------------------------------------------------------------------------

    /// Handle `ORDER_TRADE_UPDATE`. Fast path for entry fills and bracket
    /// triggers; everything it does is also reachable through the poll loop.
    pub async fn handle_order_update(&self, event: &serde_json::Value) {
        let order = &event["o"];
        let symbol = order["s"].as_str().unwrap_or_default();
        let Some(slot) = self.position(symbol) else {
            return;
        };
        let mut pos = slot.lock().await;

        let exec_type = order["x"].as_str().unwrap_or_default();
        let status = order["X"].as_str().unwrap_or_default();
        let order_id = order["i"].as_u64().unwrap_or(0);
        let orig_type = order["ot"].as_str().unwrap_or_default();
        let client_id = order["c"].as_str().unwrap_or_default();
        let avg_price = order["ap"].as_str().unwrap_or("0");
        let realized_pnl = order["rp"].as_str().unwrap_or("0");

        if status == "FILLED" && !pos.entry_filled && order_id == pos.entry_order_id {
            pos.entry_filled = true;
            pos.entry_price = avg_price.parse::<Decimal>().ok().filter(|p| *p > Decimal::ZERO);
            pos.entry_fill_time = Some(Utc::now());
            info!(symbol, price = avg_price, "entry filled (stream)");
            self.notifier
                .entry_filled(symbol, pos.side.as_str(), avg_price)
                .await;
            let mut trade = self.live_trade(&pos, "entry");
            trade.entry_price = avg_price.to_string();
            trade.order_id = order_id.to_string();
            self.record_trade(trade).await;
            if !pos.tp_sl_placed {
                self.place_deferred_bracket(&mut pos).await;
            }
            return;
        }

        if status == "FILLED" && pos.entry_filled {
            match classify_close_fill(orig_type, client_id) {
                FillKind::TakeProfit => {
                    self.mark_leg_triggered(
                        &mut pos,
                        BracketSide::TakeProfit,
                        Some(avg_price.to_string()),
                        Some(realized_pnl.to_string()),
                    )
                    .await;
                }
                FillKind::StopLoss => {
                    self.mark_leg_triggered(
                        &mut pos,
                        BracketSide::StopLoss,
                        Some(avg_price.to_string()),
                        Some(realized_pnl.to_string()),
                    )
                    .await;
                }
                FillKind::Other => {}
            }
            return;
        }

        if matches!(exec_type, "EXPIRED" | "CANCELED")
            && !pos.entry_filled
            && order_id == pos.entry_order_id
        {
            // The poll loop re-queries and decides; log only.
            warn!(symbol, order_id, exec_type, "entry order expired/cancelled (stream)");
        }
    }

    /// Handle `ACCOUNT_UPDATE` — a redundancy layer behind the order events:
    /// flat position ⇒ close; otherwise adopt a corrected entry price.
    pub async fn handle_account_update(&self, event: &serde_json::Value) {
        let Some(rows) = event["a"]["P"].as_array() else {
            return;
        };
        for row in rows {
            let symbol = row["s"].as_str().unwrap_or_default();
            let Some(slot) = self.position(symbol) else {
                continue;
            };
            let mut pos = slot.lock().await;

            let amount: Decimal = row["pa"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);

            if amount == Decimal::ZERO {
                if pos.entry_filled && !pos.closed {
                    info!(symbol, "position flat on exchange (stream) — closing");
                    pos.closed = true;
                }
            } else if let Some(entry) = row["ep"].as_str().and_then(|s| s.parse::<Decimal>().ok()) {
                if entry > Decimal::ZERO && Some(entry) != pos.entry_price {
                    debug!(symbol, old = ?pos.entry_price, new = %entry, "entry price updated (stream)");
                    pos.entry_price = Some(entry);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// |position amount| on the exchange. Fails safe: on a query error the
    /// position is assumed to still exist so a vanished bracket is never
    /// misread as a trigger.
    async fn exchange_position_amt(&self, symbol: &str) -> Decimal {
        match self.client.position_risk(Some(symbol)).await {
            Ok(rows) => rows
                .iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.position_amt.abs())
                .unwrap_or(Decimal::ZERO),
            Err(e) => {
                warn!(symbol, error = %e, "position query failed — assuming still open");
                Decimal::ONE
            }
        }
    }

    /// Per-symbol rounding rules with a long-lived full-map cache; falls
    /// back to a stale entry when the refresh fails.
    async fn rules_for(&self, symbol: &str) -> Result<SymbolRules, BinanceError> {
        if let Some((fetched, map)) = self.rules.read().as_ref() {
            if fetched.elapsed().as_secs() < RULES_TTL_SECS {
                if let Some(rules) = map.get(symbol) {
                    return Ok(rules.clone());
                }
            }
        }

        match self.client.exchange_info().await {
            Ok(info) => {
                let map: HashMap<String, SymbolRules> = info
                    .symbols
                    .iter()
                    .map(|s| (s.symbol.clone(), s.rules()))
                    .collect();
                let rules = map.get(symbol).cloned();
                *self.rules.write() = Some((Instant::now(), map));
                rules.ok_or_else(|| BinanceError::Api {
                    code: -1121,
                    msg: format!("symbol {symbol} not found in exchangeInfo"),
                })
            }
            Err(e) => {
                // Stale cache beats no cache.
                if let Some((_, map)) = self.rules.read().as_ref() {
                    if let Some(rules) = map.get(symbol) {
                        warn!(symbol, error = %e, "rules refresh failed — using stale cache");
                        return Ok(rules.clone());
                    }
                }
                Err(e)
            }
        }
    }

    fn live_trade(&self, pos: &TrackedPosition, event: &str) -> LiveTrade {
        LiveTrade {
            symbol: pos.symbol.clone(),
            side: pos.side.as_str().to_string(),
            event: event.to_string(),
            entry_price: pos
                .entry_price
                .map(|p| p.to_string())
                .unwrap_or_default(),
            quantity: pos.quantity.to_string(),
            leverage: self.config.leverage as i64,
            ..Default::default()
        }
    }

    async fn record_trade(&self, trade: LiveTrade) {
        if let Err(e) = self.store.save_live_trade(&trade).await {
            warn!(symbol = %trade.symbol, event = %trade.event, error = %e, "trade record failed");
        }
    }
}

/// Recompute a deferred bracket's trigger prices against the actual fill
/// price, rounded to the symbol's tick.
pub fn bracket_triggers_at_fill(
    bracket: &DeferredBracket,
    side: Side,
    fill_price: Decimal,
    rules: &SymbolRules,
) -> (Decimal, Decimal) {
    let (tp_raw, sl_raw) = bracket_prices(fill_price, side, bracket.tp_pct, bracket.sl_pct);
    (round_price(tp_raw, rules), round_price(sl_raw, rules))
}

/// Algo orders with neither a tracked position nor an open exchange
/// position. Pure so the selection logic is testable.
pub fn orphan_algo_orders<'a>(
    algo_orders: &'a [AlgoOrder],
    open_symbols: &HashSet<String>,
    tracked_symbols: &HashSet<String>,
) -> Vec<&'a AlgoOrder> {
    algo_orders
        .iter()
        .filter(|o| !open_symbols.contains(&o.symbol) && !tracked_symbols.contains(&o.symbol))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn close_fill_classified_by_original_type() {
        assert_eq!(
            classify_close_fill("TAKE_PROFIT_MARKET", ""),
            FillKind::TakeProfit
        );
        assert_eq!(classify_close_fill("TAKE_PROFIT", ""), FillKind::TakeProfit);
        assert_eq!(classify_close_fill("STOP_MARKET", ""), FillKind::StopLoss);
        assert_eq!(classify_close_fill("STOP", ""), FillKind::StopLoss);
        assert_eq!(classify_close_fill("LIMIT", ""), FillKind::Other);
    }

    #[test]
    fn close_fill_falls_back_to_client_id_prefix() {
        assert_eq!(classify_close_fill("", "tp_0123abcd"), FillKind::TakeProfit);
        assert_eq!(classify_close_fill("", "SL_0123ABCD"), FillKind::StopLoss);
        assert_eq!(classify_close_fill("", "entry_0123abcd"), FillKind::Other);
    }

    #[test]
    fn new_position_starts_unfilled_and_unarmed() {
        let pos = TrackedPosition::new(
            "BTCUSDT".into(),
            42,
            Side::Short,
            dec!(0.01),
            None,
            33.0,
        );
        assert!(!pos.entry_filled);
        assert!(!pos.tp_sl_placed);
        assert!(!pos.closed);
        assert_eq!(pos.strength, Strength::Unknown);
        assert!((pos.current_tp_pct - 33.0).abs() < f64::EPSILON);
    }

    fn algo(symbol: &str, id: u64) -> AlgoOrder {
        serde_json::from_value(serde_json::json!({
            "algoId": id,
            "symbol": symbol,
            "clientAlgoId": "tp_0123abcd",
            "orderType": "TAKE_PROFIT_MARKET",
            "triggerPrice": "1.0",
        }))
        .unwrap()
    }

    #[test]
    fn orphan_selection_spares_tracked_and_open_symbols() {
        let orders = vec![algo("SOLUSDT", 1), algo("BTCUSDT", 2), algo("ETHUSDT", 3)];
        let open: HashSet<String> = ["BTCUSDT".to_string()].into();
        let tracked: HashSet<String> = ["ETHUSDT".to_string()].into();

        let orphans = orphan_algo_orders(&orders, &open, &tracked);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].symbol, "SOLUSDT");
    }

    #[test]
    fn bracket_triggers_recomputed_from_fill_price() {
        // SELL LIMIT 50000 filled at 49990: TP 33% below, SL 18% above,
        // tick 0.1.
        let bracket = DeferredBracket {
            symbol: "BTCUSDT".into(),
            close_side: "BUY".into(),
            position_side: "BOTH".into(),
            tp_price: dec!(33500),
            sl_price: dec!(59000),
            tp_pct: 33.0,
            sl_pct: 18.0,
            quantity: dec!(0.01),
            order_prefix: "0123abcd".into(),
        };
        let rules = SymbolRules {
            tick_size: Some(dec!(0.1)),
            step_size: Some(dec!(0.001)),
            price_precision: 2,
            quantity_precision: 3,
        };
        let (tp, sl) = bracket_triggers_at_fill(&bracket, Side::Short, dec!(49990), &rules);
        assert_eq!(tp, dec!(33493.3));
        assert_eq!(sl, dec!(58988.2));
    }

    #[test]
    fn checkpoint_reflects_dynamic_tp_state() {
        let mut pos =
            TrackedPosition::new("BTCUSDT".into(), 1, Side::Short, dec!(0.01), None, 33.0);
        pos.current_tp_pct = 21.0;
        pos.strength = Strength::Medium;
        pos.evaluated_2h = true;

        let cp = pos.state_checkpoint();
        assert!((cp.current_tp_pct - 21.0).abs() < f64::EPSILON);
        assert_eq!(cp.strength, Strength::Medium);
        assert!(cp.evaluated_2h);
        assert!(!cp.evaluated_12h);
    }
}
