// =============================================================================
// Bot Configuration — engine settings with JSON persistence
// =============================================================================
//
// Central configuration hub for the trading engine. Defaults live here; an
// optional JSON file overrides them; API secrets come exclusively from the
// environment and never touch the file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_leverage() -> u32 {
    3
}

fn default_max_positions() -> usize {
    6
}

fn default_fixed_margin_usdt() -> Decimal {
    Decimal::from(5)
}

fn default_daily_loss_limit_usdt() -> Decimal {
    Decimal::from(50)
}

fn default_margin_mode() -> MarginMode {
    MarginMode::Fixed
}

fn default_margin_pct() -> f64 {
    2.0
}

fn default_stop_loss_pct() -> f64 {
    18.0
}

fn default_strong_tp_pct() -> f64 {
    33.0
}

fn default_medium_tp_pct() -> f64 {
    21.0
}

fn default_weak_tp_pct() -> f64 {
    10.0
}

fn default_max_hold_hours() -> f64 {
    72.0
}

fn default_eval_2h_growth() -> f64 {
    0.055
}

fn default_eval_2h_ratio() -> f64 {
    0.60
}

fn default_eval_12h_growth() -> f64 {
    0.075
}

fn default_eval_12h_ratio() -> f64 {
    0.60
}

fn default_surge_threshold() -> f64 {
    10.0
}

fn default_surge_max_multiple() -> f64 {
    14008.0
}

fn default_scan_interval_seconds() -> u64 {
    3600
}

fn default_scanner_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval_seconds() -> u64 {
    60
}

fn default_pending_pool_delay_secs() -> u64 {
    10
}

fn default_db_path() -> String {
    "data/trades.db".to_string()
}

// =============================================================================
// Margin mode
// =============================================================================

/// Per-entry sizing strategy: a fixed USDT margin, or a percentage of the
/// free balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Fixed,
    Percent,
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Capital & leverage --------------------------------------------------

    /// Leverage set per-symbol before each entry.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Cap on concurrent tracked positions (exchange + in-flight).
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Margin per entry when `margin_mode` is `fixed` (USDT).
    #[serde(default = "default_fixed_margin_usdt")]
    pub live_fixed_margin_usdt: Decimal,

    /// Stop opening new positions once today's realized PnL falls to
    /// `-daily_loss_limit_usdt`. Zero disables the check.
    #[serde(default = "default_daily_loss_limit_usdt")]
    pub daily_loss_limit_usdt: Decimal,

    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,

    /// Percent of the free balance per entry when `margin_mode` is `percent`.
    #[serde(default = "default_margin_pct")]
    pub margin_pct: f64,

    // --- Bracket & hold ------------------------------------------------------

    /// Stop-loss distance from entry, percent.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit ladder, percent: applied by the strength classifier.
    #[serde(default = "default_strong_tp_pct")]
    pub strong_tp_pct: f64,

    #[serde(default = "default_medium_tp_pct")]
    pub medium_tp_pct: f64,

    #[serde(default = "default_weak_tp_pct")]
    pub weak_tp_pct: f64,

    /// Force-close horizon in hours.
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: f64,

    // --- Strength evaluation (dynamic TP) ------------------------------------

    /// 2 h checkpoint: a 5 m bar counts as "dropped" when its close is this
    /// fraction below entry.
    #[serde(default = "default_eval_2h_growth")]
    pub strength_eval_2h_growth: f64,

    /// 2 h checkpoint: fraction of dropped bars required to call strength.
    #[serde(default = "default_eval_2h_ratio")]
    pub strength_eval_2h_ratio: f64,

    #[serde(default = "default_eval_12h_growth")]
    pub strength_eval_12h_growth: f64,

    #[serde(default = "default_eval_12h_ratio")]
    pub strength_eval_12h_ratio: f64,

    // --- Signal scanning -----------------------------------------------------

    /// Minimum hourly-sell / yesterday-average ratio to emit a signal.
    #[serde(default = "default_surge_threshold")]
    pub surge_threshold: f64,

    /// Ratios above this are treated as data glitches and skipped.
    #[serde(default = "default_surge_max_multiple")]
    pub surge_max_multiple: f64,

    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: u64,

    /// Parallel symbol scans per cycle. Kline weight is 5 per call and the
    /// budget is 2400/min, so this stays small.
    #[serde(default = "default_scanner_concurrency")]
    pub scanner_concurrency: usize,

    // --- Entry pipeline ------------------------------------------------------

    /// Master switch for the strategy's entry filter pipeline.
    #[serde(default = "default_true")]
    pub enable_risk_filters: bool,

    /// Seconds the pending pool waits after the first signal of a batch so
    /// concurrent detections can accumulate before the strongest is picked.
    #[serde(default = "default_pending_pool_delay_secs")]
    pub pending_pool_delay_secs: u64,

    /// Master gate: when false every signal is rejected with
    /// `auto_trade_disabled`. Off by default so a fresh deployment cannot
    /// trade until the operator opts in.
    #[serde(default)]
    pub auto_trade: bool,

    // --- Monitoring & persistence --------------------------------------------

    #[serde(default = "default_monitor_interval_seconds")]
    pub monitor_interval_seconds: u64,

    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            leverage = config.leverage,
            max_positions = config.max_positions,
            auto_trade = config.auto_trade,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Take-profit percentage for a strength class (unknown maps to the
    /// strong default used at entry time).
    pub fn tp_pct_for(&self, strength: crate::types::Strength) -> f64 {
        use crate::types::Strength::*;
        match strength {
            Strong | Unknown => self.strong_tp_pct,
            Medium => self.medium_tp_pct,
            Weak => self.weak_tp_pct,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.leverage, 3);
        assert_eq!(cfg.max_positions, 6);
        assert_eq!(cfg.live_fixed_margin_usdt, dec!(5));
        assert_eq!(cfg.margin_mode, MarginMode::Fixed);
        assert!((cfg.stop_loss_pct - 18.0).abs() < f64::EPSILON);
        assert!((cfg.strong_tp_pct - 33.0).abs() < f64::EPSILON);
        assert!((cfg.medium_tp_pct - 21.0).abs() < f64::EPSILON);
        assert!((cfg.weak_tp_pct - 10.0).abs() < f64::EPSILON);
        assert!((cfg.surge_threshold - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.monitor_interval_seconds, 60);
        assert_eq!(cfg.pending_pool_delay_secs, 10);
        assert!(!cfg.auto_trade);
        assert!(cfg.enable_risk_filters);
        assert_eq!(cfg.db_path, "data/trades.db");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "leverage": 5, "auto_trade": true, "margin_mode": "percent" }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.leverage, 5);
        assert!(cfg.auto_trade);
        assert_eq!(cfg.margin_mode, MarginMode::Percent);
        assert_eq!(cfg.max_positions, 6);
        assert!((cfg.strength_eval_2h_growth - 0.055).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.leverage, cfg2.leverage);
        assert_eq!(cfg.live_fixed_margin_usdt, cfg2.live_fixed_margin_usdt);
        assert_eq!(cfg.margin_mode, cfg2.margin_mode);
    }

    #[test]
    fn tp_ladder_lookup() {
        use crate::types::Strength;
        let cfg = BotConfig::default();
        assert!((cfg.tp_pct_for(Strength::Strong) - 33.0).abs() < f64::EPSILON);
        assert!((cfg.tp_pct_for(Strength::Medium) - 21.0).abs() < f64::EPSILON);
        assert!((cfg.tp_pct_for(Strength::Weak) - 10.0).abs() < f64::EPSILON);
        assert!((cfg.tp_pct_for(Strength::Unknown) - 33.0).abs() < f64::EPSILON);
    }
}
