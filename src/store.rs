// =============================================================================
// SQLite persistence — signal log, trade log, position-state checkpoint
// =============================================================================
//
// Three tables, schema kept stable for tooling that reads the same file:
//   signal_events  — append-only log of every signal + filter verdict
//   live_trades    — append-only log of every position lifecycle event
//   position_state — one upserted row per open position (dynamic-TP state),
//                    deleted when the position closes
//
// The pool is capped at a single connection, which serialises all writes.
// Prices and quantities are stored as TEXT so decimal precision survives.
// =============================================================================

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::Strength;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A signal detection event plus the entry pipeline's verdict on it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalEvent {
    pub timestamp: String,
    pub symbol: String,
    pub surge_ratio: f64,
    pub price: String,
    pub accepted: bool,
    pub reject_reason: String,
    pub risk_metrics_json: String,
}

impl SignalEvent {
    /// Rejected signal with a reason and no metrics.
    pub fn rejected(timestamp: String, symbol: &str, surge_ratio: f64, price: String, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            surge_ratio,
            price,
            accepted: false,
            reject_reason: reason.into(),
            risk_metrics_json: "{}".to_string(),
        }
    }

    /// Accepted signal.
    pub fn accepted(timestamp: String, symbol: &str, surge_ratio: f64, price: String) -> Self {
        Self {
            timestamp,
            symbol: symbol.to_string(),
            surge_ratio,
            price,
            accepted: true,
            reject_reason: String::new(),
            risk_metrics_json: "{}".to_string(),
        }
    }
}

/// One lifecycle event of a live position (entry, tp, sl, timeout, …).
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct LiveTrade {
    pub symbol: String,
    pub side: String,
    pub event: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub margin_usdt: String,
    pub leverage: i64,
    pub pnl_usdt: String,
    pub pnl_pct: String,
    pub order_id: String,
    pub algo_id: String,
    pub timestamp: String,
}

/// Dynamic-TP state checkpoint restored on crash recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionState {
    pub current_tp_pct: f64,
    pub strength: Strength,
    pub evaluated_2h: bool,
    pub evaluated_12h: bool,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS signal_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        symbol TEXT NOT NULL,
        surge_ratio REAL NOT NULL,
        price TEXT NOT NULL,
        accepted INTEGER NOT NULL,
        reject_reason TEXT NOT NULL DEFAULT '',
        risk_metrics_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS live_trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL DEFAULT (datetime('now')),
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        event TEXT NOT NULL,
        entry_price TEXT NOT NULL DEFAULT '',
        exit_price TEXT NOT NULL DEFAULT '',
        quantity TEXT NOT NULL DEFAULT '',
        margin_usdt TEXT NOT NULL DEFAULT '',
        leverage INTEGER NOT NULL DEFAULT 3,
        pnl_usdt TEXT NOT NULL DEFAULT '',
        pnl_pct TEXT NOT NULL DEFAULT '',
        order_id TEXT NOT NULL DEFAULT '',
        algo_id TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS position_state (
        symbol TEXT PRIMARY KEY,
        current_tp_pct REAL NOT NULL,
        strength TEXT NOT NULL DEFAULT 'unknown',
        evaluated_2h INTEGER NOT NULL DEFAULT 0,
        evaluated_12h INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )
    "#,
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed persistence for the live engine.
#[derive(Clone)]
pub struct TradeStore {
    pool: SqlitePool,
}

impl TradeStore {
    /// Open (or create) the database at `db_path` and run the schema.
    pub async fn open(db_path: &str) -> Result<Self, sqlx::Error> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    sqlx::Error::Configuration(Box::new(e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let store = Self::connect_with(options).await?;
        info!(db_path, "trade store opened");
        Ok(store)
    }

    /// In-memory store (tests).
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        Self::connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        // One connection = one writer: every statement is serialised.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -------------------------------------------------------------------------
    // Signal events
    // -------------------------------------------------------------------------

    pub async fn save_signal_event(&self, event: &SignalEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO signal_events
                (timestamp, symbol, surge_ratio, price, accepted, reject_reason, risk_metrics_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&event.timestamp)
        .bind(&event.symbol)
        .bind(event.surge_ratio)
        .bind(&event.price)
        .bind(event.accepted)
        .bind(&event.reject_reason)
        .bind(&event.risk_metrics_json)
        .execute(&self.pool)
        .await?;
        debug!(symbol = %event.symbol, accepted = event.accepted, "signal event saved");
        Ok(())
    }

    pub async fn signal_events(&self, limit: i64) -> Result<Vec<SignalEvent>, sqlx::Error> {
        sqlx::query_as::<_, SignalEvent>(
            "SELECT timestamp, symbol, surge_ratio, price, accepted, reject_reason, risk_metrics_json \
             FROM signal_events ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    // -------------------------------------------------------------------------
    // Live trades
    // -------------------------------------------------------------------------

    pub async fn save_live_trade(&self, trade: &LiveTrade) -> Result<(), sqlx::Error> {
        let timestamp = if trade.timestamp.is_empty() {
            chrono::Utc::now().to_rfc3339()
        } else {
            trade.timestamp.clone()
        };
        sqlx::query(
            r#"
            INSERT INTO live_trades
                (timestamp, symbol, side, event, entry_price, exit_price, quantity,
                 margin_usdt, leverage, pnl_usdt, pnl_pct, order_id, algo_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&timestamp)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(&trade.event)
        .bind(&trade.entry_price)
        .bind(&trade.exit_price)
        .bind(&trade.quantity)
        .bind(&trade.margin_usdt)
        .bind(trade.leverage)
        .bind(&trade.pnl_usdt)
        .bind(&trade.pnl_pct)
        .bind(&trade.order_id)
        .bind(&trade.algo_id)
        .execute(&self.pool)
        .await?;
        debug!(symbol = %trade.symbol, event = %trade.event, "live trade saved");
        Ok(())
    }

    /// Most recent trades first. `since_date` ("YYYY-MM-DD") filters in SQL.
    pub async fn live_trades(
        &self,
        limit: i64,
        since_date: Option<&str>,
    ) -> Result<Vec<LiveTrade>, sqlx::Error> {
        const COLS: &str = "symbol, side, event, entry_price, exit_price, quantity, \
                            margin_usdt, leverage, pnl_usdt, pnl_pct, order_id, algo_id, timestamp";
        match since_date {
            Some(date) => {
                sqlx::query_as::<_, LiveTrade>(&format!(
                    "SELECT {COLS} FROM live_trades WHERE timestamp >= ?1 ORDER BY id DESC LIMIT ?2"
                ))
                .bind(date)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, LiveTrade>(&format!(
                    "SELECT {COLS} FROM live_trades ORDER BY id DESC LIMIT ?1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Position state (crash recovery for the dynamic TP)
    // -------------------------------------------------------------------------

    /// Upsert the dynamic-TP state so it survives process restarts.
    pub async fn save_position_state(
        &self,
        symbol: &str,
        state: &PositionState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO position_state
                (symbol, current_tp_pct, strength, evaluated_2h, evaluated_12h, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(symbol) DO UPDATE SET
                current_tp_pct = excluded.current_tp_pct,
                strength       = excluded.strength,
                evaluated_2h   = excluded.evaluated_2h,
                evaluated_12h  = excluded.evaluated_12h,
                updated_at     = excluded.updated_at
            "#,
        )
        .bind(symbol)
        .bind(state.current_tp_pct)
        .bind(state.strength.as_str())
        .bind(state.evaluated_2h)
        .bind(state.evaluated_12h)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn position_state(&self, symbol: &str) -> Result<Option<PositionState>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT current_tp_pct, strength, evaluated_2h, evaluated_12h \
             FROM position_state WHERE symbol = ?1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PositionState {
            current_tp_pct: r.get::<f64, _>(0),
            strength: Strength::from_str_lossy(&r.get::<String, _>(1)),
            evaluated_2h: r.get::<bool, _>(2),
            evaluated_12h: r.get::<bool, _>(3),
        }))
    }

    /// Remove the checkpoint when a position is fully closed.
    pub async fn delete_position_state(&self, symbol: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM position_state WHERE symbol = ?1")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_events_round_trip() {
        let store = TradeStore::open_in_memory().await.unwrap();
        let ev = SignalEvent::rejected(
            "2024-01-15T09:00:16Z".into(),
            "BTCUSDT",
            12.0,
            "50000".into(),
            "auto_trade_disabled",
        );
        store.save_signal_event(&ev).await.unwrap();
        store
            .save_signal_event(&SignalEvent::accepted(
                "2024-01-15T10:00:16Z".into(),
                "SOLUSDT",
                11.0,
                "102.5".into(),
            ))
            .await
            .unwrap();

        let events = store.signal_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
        // newest first
        assert_eq!(events[0].symbol, "SOLUSDT");
        assert!(events[0].accepted);
        assert_eq!(events[1].reject_reason, "auto_trade_disabled");
    }

    #[tokio::test]
    async fn live_trades_round_trip_and_date_filter() {
        let store = TradeStore::open_in_memory().await.unwrap();
        store
            .save_live_trade(&LiveTrade {
                symbol: "BTCUSDT".into(),
                side: "SHORT".into(),
                event: "entry".into(),
                entry_price: "49990".into(),
                quantity: "0.01".into(),
                leverage: 3,
                timestamp: "2024-01-14T09:00:20Z".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .save_live_trade(&LiveTrade {
                symbol: "BTCUSDT".into(),
                side: "SHORT".into(),
                event: "tp".into(),
                exit_price: "33493.3".into(),
                pnl_usdt: "164.9".into(),
                leverage: 3,
                timestamp: "2024-01-15T10:30:00Z".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let all = store.live_trades(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event, "tp");

        let today = store.live_trades(10, Some("2024-01-15")).await.unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].event, "tp");
    }

    #[tokio::test]
    async fn position_state_upsert_and_delete() {
        let store = TradeStore::open_in_memory().await.unwrap();
        assert!(store.position_state("BTCUSDT").await.unwrap().is_none());

        let medium = PositionState {
            current_tp_pct: 21.0,
            strength: Strength::Medium,
            evaluated_2h: true,
            evaluated_12h: false,
        };
        store.save_position_state("BTCUSDT", &medium).await.unwrap();
        assert_eq!(store.position_state("BTCUSDT").await.unwrap(), Some(medium));

        // Upsert against the same key — the only mutable row the engine keeps.
        let weak = PositionState {
            current_tp_pct: 10.0,
            strength: Strength::Weak,
            evaluated_2h: true,
            evaluated_12h: true,
        };
        store.save_position_state("BTCUSDT", &weak).await.unwrap();
        assert_eq!(
            store.position_state("BTCUSDT").await.unwrap().unwrap(),
            weak
        );

        store.delete_position_state("BTCUSDT").await.unwrap();
        assert!(store.position_state("BTCUSDT").await.unwrap().is_none());
    }
}
