// =============================================================================
// Riptide — surge-short live trading engine for Binance USDS futures
// =============================================================================
//
// Composition root: builds the shared exchange client, persistence, strategy,
// and monitor, recovers any positions left on the exchange from a previous
// run, then spawns the long-lived task set:
//
//   scanner          — hourly surge sweep → signal channel
//   entry pipeline   — serial signal consumer, guards + sizing + placement
//   position monitor — poll-based reconciliation (correctness)
//   user stream      — push fills/triggers (latency)
//   pnl summary      — periodic operator report
//   memory watchdog  — hard exit on runaway RSS (supervisor restarts us)
//
// Trading is gated: with auto_trade=false (the default) every signal is
// logged and rejected, so a fresh deployment cannot trade until the operator
// opts in via the config file.
// =============================================================================

mod binance;
mod config;
mod entry;
mod executor;
mod monitor;
mod notify;
mod scanner;
mod store;
mod strategy;
mod stream;
mod types;

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::FuturesClient;
use crate::config::BotConfig;
use crate::entry::EntryPipeline;
use crate::executor::OrderExecutor;
use crate::monitor::PositionMonitor;
use crate::notify::{LogNotifier, Notifier};
use crate::store::TradeStore;
use crate::strategy::{Strategy, SurgeShortStrategy};
use crate::stream::UserStream;

const CONFIG_PATH: &str = "config.json";

/// Signal channel capacity — a full channel back-pressures the scanner,
/// which is harmless (signals dedup per day anyway).
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Memory watchdog thresholds (resident set, megabytes).
const MEMORY_WARN_MB: f64 = 500.0;
const MEMORY_KILL_MB: f64 = 800.0;
const MEMORY_CHECK_SECS: u64 = 300;

/// Operator PnL summary cadence.
const PNL_REPORT_SECS: u64 = 4 * 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Riptide — Surge Short Engine Starting           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(BotConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        BotConfig::default()
    }));

    info!(
        leverage = config.leverage,
        max_positions = config.max_positions,
        tp_ladder = %format!(
            "{}/{}/{}%",
            config.strong_tp_pct, config.medium_tp_pct, config.weak_tp_pct
        ),
        sl_pct = config.stop_loss_pct,
        surge_threshold = config.surge_threshold,
        monitor_interval = config.monitor_interval_seconds,
        "engine configuration"
    );
    if !config.auto_trade {
        warn!("auto-trade is DISABLED — signals will be logged and rejected until auto_trade=true");
    }

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set — authenticated calls will fail");
    }
    let client = FuturesClient::new(api_key, api_secret);

    // ── 3. Persistence, notifier, strategy ───────────────────────────────
    let store = TradeStore::open(&config.db_path).await?;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let strategy: Arc<dyn Strategy> = Arc::new(SurgeShortStrategy::new());

    // ── 4. Core components ───────────────────────────────────────────────
    let (signal_tx, signal_rx) = tokio::sync::mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let scanner = strategy.create_scanner(config.clone(), signal_tx, client.clone());

    let executor = Arc::new(OrderExecutor::new(client.clone(), config.leverage));
    let monitor = Arc::new(PositionMonitor::new(
        client.clone(),
        executor.clone(),
        config.clone(),
        store.clone(),
        notifier.clone(),
        Some(strategy.clone()),
    ));

    // Stop-loss exits feed the scanner's same-day cooldown.
    {
        let scanner = scanner.clone();
        monitor.set_sl_cooldown_hook(Arc::new(move |symbol| {
            scanner.block_symbol_today(symbol);
        }));
    }

    let pipeline = Arc::new(EntryPipeline::new(
        client.clone(),
        executor.clone(),
        monitor.clone(),
        store.clone(),
        notifier.clone(),
        strategy.clone(),
        config.clone(),
    ));

    let user_stream = Arc::new(UserStream::new(client.clone(), monitor.clone()));

    // ── 5. Recover exchange state from a previous run ────────────────────
    monitor.recover_positions().await;

    print_account_banner(&client, &store).await;

    // ── 6. Spawn the task set ────────────────────────────────────────────
    tokio::spawn(scanner.run_forever());
    tokio::spawn(pipeline.run_forever(signal_rx));
    tokio::spawn(monitor.clone().run_forever());
    tokio::spawn(user_stream.clone().run_forever());

    {
        let client = client.clone();
        let store = store.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            pnl_summary_loop(client, store, notifier).await;
        });
    }
    {
        let notifier = notifier.clone();
        tokio::spawn(async move {
            memory_watchdog(notifier).await;
        });
    }

    info!("all subsystems running — Ctrl+C to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    user_stream.shutdown().await;
    store.close().await;

    info!("riptide shut down complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

async fn print_account_banner(client: &FuturesClient, store: &TradeStore) {
    match client.account_balance().await {
        Ok(balance) => info!(
            total = %balance.total,
            available = %balance.available,
            unrealized = %balance.unrealized_pnl,
            "account balance (USDT)"
        ),
        Err(e) => warn!(error = %e, "account balance unavailable"),
    }
    match client.position_risk(None).await {
        Ok(rows) => {
            let open = rows.iter().filter(|p| p.is_open()).count();
            info!(open_positions = open, "exchange positions");
        }
        Err(e) => warn!(error = %e, "positions unavailable"),
    }
    if let Ok(trades) = store.live_trades(i64::MAX, None).await {
        info!(recorded_trades = trades.len(), "trade log");
    }
}

// ---------------------------------------------------------------------------
// Periodic PnL summary
// ---------------------------------------------------------------------------

async fn pnl_summary_loop(client: FuturesClient, store: TradeStore, notifier: Arc<dyn Notifier>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(PNL_REPORT_SECS)).await;

        let balance = match client.account_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "pnl summary: balance fetch failed");
                continue;
            }
        };
        let daily_pnl = client
            .daily_realized_pnl()
            .await
            .unwrap_or(Decimal::ZERO);
        let open_positions = client
            .position_risk(None)
            .await
            .map(|rows| rows.iter().filter(|p| p.is_open()).count())
            .unwrap_or(0);
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let trades_today = store
            .live_trades(i64::MAX, Some(&today))
            .await
            .map(|t| t.len())
            .unwrap_or(0);

        notifier
            .daily_summary(
                &balance.total.to_string(),
                &daily_pnl.to_string(),
                &balance.unrealized_pnl.to_string(),
                open_positions,
                trades_today,
            )
            .await;
        info!("pnl summary sent");
    }
}

// ---------------------------------------------------------------------------
// Memory watchdog
// ---------------------------------------------------------------------------

/// Resident set size in megabytes, from /proc/self/status (Linux).
fn rss_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024.0)
}

/// Warn once past MEMORY_WARN_MB; exit the process past MEMORY_KILL_MB so
/// the external supervisor restarts us with a clean heap.
async fn memory_watchdog(notifier: Arc<dyn Notifier>) {
    let mut warned = false;
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(MEMORY_CHECK_SECS)).await;
        let Some(rss) = rss_mb() else {
            continue;
        };

        if rss >= MEMORY_KILL_MB {
            let msg = format!("memory over limit: {rss:.0} MB >= {MEMORY_KILL_MB} MB — exiting for restart");
            error!("{msg}");
            notifier.send_critical(&msg).await;
            std::process::exit(1);
        } else if rss >= MEMORY_WARN_MB && !warned {
            let msg = format!("memory high: {rss:.0} MB (threshold {MEMORY_WARN_MB} MB)");
            warn!("{msg}");
            notifier.send(&msg).await;
            warned = true;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_reads_from_proc_on_linux() {
        let rss = rss_mb().expect("VmRSS readable on Linux");
        assert!(rss > 0.0);
        assert!(rss < MEMORY_KILL_MB);
    }
}
