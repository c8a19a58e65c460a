// =============================================================================
// Operator notifications
// =============================================================================
//
// The engine only depends on this trait; concrete chat/email transports
// (Telegram bot, SMTP mirror) live outside the core and plug in at startup.
// Delivery failures must never disturb a trading loop, so `send` is
// infallible from the caller's point of view — implementations swallow and
// log their own transport errors.

use async_trait::async_trait;
use tracing::{info, warn};

/// Outbound operator alerts. Typed helpers all funnel into `send`.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message.
    async fn send(&self, text: &str);

    /// Critical alerts additionally go to the secondary (email) channel when
    /// the implementation has one; the default just re-sends.
    async fn send_critical(&self, text: &str) {
        self.send(text).await;
    }

    async fn entry_placed(&self, symbol: &str, side: &str, price: &str, qty: &str, order_id: u64) {
        self.send(&format!(
            "entry placed: {symbol} {side} @ {price} qty={qty} (order {order_id})"
        ))
        .await;
    }

    async fn entry_filled(&self, symbol: &str, side: &str, price: &str) {
        self.send(&format!("entry filled: {symbol} {side} @ {price}"))
            .await;
    }

    async fn bracket_placed(&self, symbol: &str, tp_price: &str, sl_price: &str) {
        self.send(&format!(
            "bracket placed: {symbol} tp={tp_price} sl={sl_price}"
        ))
        .await;
    }

    async fn tp_triggered(&self, symbol: &str, side: &str, price: &str, pnl: &str) {
        self.send(&format!(
            "take-profit hit: {symbol} {side} @ {price} pnl={pnl}"
        ))
        .await;
    }

    async fn sl_triggered(&self, symbol: &str, side: &str, price: &str, pnl: &str) {
        self.send(&format!(
            "stop-loss hit: {symbol} {side} @ {price} pnl={pnl}"
        ))
        .await;
    }

    async fn timeout_close(&self, symbol: &str, max_hold_hours: f64) {
        self.send(&format!(
            "max hold reached ({max_hold_hours}h): {symbol} closed at market"
        ))
        .await;
    }

    async fn daily_loss_limit(&self, pnl: &str, limit: &str) {
        self.send(&format!(
            "daily loss limit hit: {pnl} USDT <= -{limit} USDT — no new entries today"
        ))
        .await;
    }

    async fn daily_summary(
        &self,
        total_balance: &str,
        daily_pnl: &str,
        unrealized: &str,
        open_positions: usize,
        trades_today: usize,
    ) {
        self.send(&format!(
            "summary: balance={total_balance} daily_pnl={daily_pnl} unrealized={unrealized} \
             open={open_positions} trades_today={trades_today}"
        ))
        .await;
    }
}

/// Default sink: alerts land in the structured log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) {
        info!(alert = %text, "operator notification");
    }

    async fn send_critical(&self, text: &str) {
        warn!(alert = %text, "CRITICAL operator notification");
    }
}
