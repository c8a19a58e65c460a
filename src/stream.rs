// =============================================================================
// User-data stream — real-time fills as a fast path over REST polling
// =============================================================================
//
// One WebSocket session against wss://fstream.binance.com/ws/<listenKey>.
// Neither channel is authoritative alone: the poll loop is correctness, this
// stream is latency. Losing the stream therefore only costs reaction time.
//
// Listen-key lifecycle per Binance spec: valid 60 min, keepalive every
// 30 min, connection hard-capped at 24 h — we reconnect proactively at 23 h.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::binance::FuturesClient;
use crate::monitor::PositionMonitor;

const WS_BASE: &str = "wss://fstream.binance.com/ws/";

/// Reconnect before the exchange's 24 h connection cap.
const MAX_CONNECTION_SECS: u64 = 23 * 3600;

/// Keepalive cadence (listen key expires at 60 min).
const KEEPALIVE_SECS: u64 = 30 * 60;

/// Backoff after an expected disconnect (closed / IO / timeout).
const RECONNECT_SECS: u64 = 5;
/// Backoff after an unexpected error.
const RECONNECT_SLOW_SECS: u64 = 10;

/// Events the dispatcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    OrderTradeUpdate,
    AccountUpdate,
    ListenKeyExpired,
    Other,
}

/// Classify a raw user-data message by its `e` field.
pub fn classify_event(data: &serde_json::Value) -> StreamEvent {
    match data["e"].as_str() {
        Some("ORDER_TRADE_UPDATE") => StreamEvent::OrderTradeUpdate,
        Some("ACCOUNT_UPDATE") => StreamEvent::AccountUpdate,
        Some("listenKeyExpired") => StreamEvent::ListenKeyExpired,
        _ => StreamEvent::Other,
    }
}

pub struct UserStream {
    client: FuturesClient,
    monitor: Arc<PositionMonitor>,
}

impl UserStream {
    pub fn new(client: FuturesClient, monitor: Arc<PositionMonitor>) -> Self {
        Self { client, monitor }
    }

    /// Connect-and-listen loop with automatic reconnection.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            let wait_secs = match self.run_session().await {
                Ok(()) => RECONNECT_SECS,
                Err(e) => {
                    warn!(error = %e, "user stream error");
                    RECONNECT_SLOW_SECS
                }
            };
            warn!(wait_secs, "user stream disconnected — reconnecting");
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }
    }

    /// One session: fresh listen key, connect, keepalive child task, read
    /// until disconnect / expiry / the 23 h refresh point.
    async fn run_session(&self) -> anyhow::Result<()> {
        let listen_key = self.client.create_listen_key().await?;
        let url = format!("{WS_BASE}{listen_key}");
        info!("user stream connecting");

        let (ws, _response) = connect_async(&url).await?;
        info!("user stream connected");
        let (mut write, mut read) = ws.split();

        // Keepalive child — cancelled whenever this session ends.
        let keepalive_client = self.client.clone();
        let keepalive = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(KEEPALIVE_SECS)).await;
                match keepalive_client.keepalive_listen_key().await {
                    Ok(()) => debug!("listen key keepalive sent"),
                    Err(e) => warn!(error = %e, "listen key keepalive failed"),
                }
            }
        });

        let connected_at = Instant::now();
        let result: anyhow::Result<()> = async {
            while let Some(msg) = read.next().await {
                if connected_at.elapsed().as_secs() > MAX_CONNECTION_SECS {
                    info!("23h connection limit — proactive reconnect");
                    break;
                }

                match msg? {
                    Message::Text(text) => {
                        let data: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => {
                                warn!(raw = %text.get(..200).unwrap_or(&text), "unparseable stream message");
                                continue;
                            }
                        };
                        match classify_event(&data) {
                            StreamEvent::OrderTradeUpdate => {
                                self.monitor.handle_order_update(&data).await;
                            }
                            StreamEvent::AccountUpdate => {
                                self.monitor.handle_account_update(&data).await;
                            }
                            StreamEvent::ListenKeyExpired => {
                                warn!("listen key expired — tearing down session");
                                break;
                            }
                            StreamEvent::Other => {}
                        }
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(frame) => {
                        info!(?frame, "user stream closed by server");
                        break;
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        .await;

        keepalive.abort();
        result
    }

    /// Best-effort listen-key close on shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.client.close_listen_key().await {
            debug!(error = %e, "listen key close failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_order_trade_update() {
        let event = json!({"e": "ORDER_TRADE_UPDATE", "o": {"s": "BTCUSDT"}});
        assert_eq!(classify_event(&event), StreamEvent::OrderTradeUpdate);
    }

    #[test]
    fn classifies_account_update_and_expiry() {
        assert_eq!(
            classify_event(&json!({"e": "ACCOUNT_UPDATE"})),
            StreamEvent::AccountUpdate
        );
        assert_eq!(
            classify_event(&json!({"e": "listenKeyExpired"})),
            StreamEvent::ListenKeyExpired
        );
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(classify_event(&json!({"e": "MARGIN_CALL"})), StreamEvent::Other);
        assert_eq!(classify_event(&json!({})), StreamEvent::Other);
    }
}
