// =============================================================================
// Binance USDS-Margined Futures Module
// =============================================================================
//
// Signed REST client, typed wire models, and the tick/step rounding helpers
// every outbound price and quantity must pass through.

pub mod client;
pub mod error;
pub mod models;
pub mod rounding;

// Re-export the types the rest of the engine touches constantly.
pub use client::FuturesClient;
pub use error::BinanceError;
pub use models::{AlgoOrder, Kline, OrderUpdate, PositionRisk, SymbolRules};
