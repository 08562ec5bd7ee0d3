//! Application Configuration
//!
//! Loaded from optional `config/*.toml` files layered under environment
//! variables (prefix `MEMEPERP__`). Every tunable carries a default so the
//! venue boots with no external configuration at all.

use serde::Deserialize;

use crate::models::units::{Amount, Bp, Usd};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Symbols the venue trades at boot.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Symbols that get the wider funding-rate clamp.
    #[serde(default)]
    pub volatile_symbols: Vec<String>,

    // ------------------------------------------------------------------
    // Cadences
    // ------------------------------------------------------------------
    #[serde(default = "default_risk_tick_ms")]
    pub risk_tick_ms: u64,

    #[serde(default = "default_batch_submit_interval_ms")]
    pub batch_submit_interval_ms: u64,

    #[serde(default = "default_funding_check_interval_ms")]
    pub funding_check_interval_ms: u64,

    #[serde(default = "default_spot_sync_interval_ms")]
    pub spot_sync_interval_ms: u64,

    #[serde(default = "default_risk_broadcast_min_interval_ms")]
    pub risk_broadcast_min_interval_ms: u64,

    // ------------------------------------------------------------------
    // Fees & margin
    // ------------------------------------------------------------------
    #[serde(default = "default_taker_fee_bp")]
    pub taker_fee_bp: Bp,

    #[serde(default = "default_maker_fee_bp")]
    pub maker_fee_bp: Bp,

    #[serde(default = "default_base_mmr_bp")]
    pub base_mmr_bp: Bp,

    #[serde(default = "default_max_leverage_bp")]
    pub max_leverage_bp: Bp,

    #[serde(default = "default_min_order_size")]
    pub min_order_size: Amount,

    /// Fraction of post-liquidation residual collateral paid to the
    /// liquidator/venue; the rest funds the symbol insurance fund.
    #[serde(default = "default_liquidation_fee_bp")]
    pub liquidation_fee_bp: Bp,

    // ------------------------------------------------------------------
    // Funding
    // ------------------------------------------------------------------
    #[serde(default = "default_max_funding_rate_bp")]
    pub max_funding_rate_bp: Bp,

    #[serde(default = "default_volatile_max_funding_rate_bp")]
    pub volatile_max_funding_rate_bp: Bp,

    #[serde(default = "default_funding_base_interval_ms")]
    pub funding_base_interval_ms: u64,

    #[serde(default = "default_funding_min_interval_ms")]
    pub funding_min_interval_ms: u64,

    // ------------------------------------------------------------------
    // Queues & backpressure
    // ------------------------------------------------------------------
    #[serde(default = "default_liquidation_high_water")]
    pub liquidation_high_water: usize,

    #[serde(default = "default_pending_match_high_water")]
    pub pending_match_high_water: usize,

    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    // ------------------------------------------------------------------
    // Insurance fund
    // ------------------------------------------------------------------
    #[serde(default = "default_insurance_fund_initial_balance")]
    pub insurance_fund_initial_balance_per_symbol: Usd,

    // ------------------------------------------------------------------
    // Ledger submission
    // ------------------------------------------------------------------
    #[serde(default = "default_submit_timeout_ms")]
    pub ledger_submit_timeout_ms: u64,

    #[serde(default = "default_submit_backoff_base_ms")]
    pub ledger_backoff_base_ms: u64,

    #[serde(default = "default_submit_backoff_cap_ms")]
    pub ledger_backoff_cap_ms: u64,

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,

    /// Spot index feed endpoint; `{symbol}` is substituted per request.
    /// When unset, funding falls back to order-book imbalance.
    #[serde(default)]
    pub spot_feed_url: Option<String>,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Rolling reference-price window used for funding volatility.
    #[serde(default = "default_price_sample_window")]
    pub price_sample_window: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("MEMEPERP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;
        cfg.try_deserialize()
    }

    pub fn max_funding_rate_for(&self, symbol: &str) -> Bp {
        if self.volatile_symbols.iter().any(|s| s == symbol) {
            self.volatile_max_funding_rate_bp
        } else {
            self.max_funding_rate_bp
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Round-trip through the same deserialization path the loader uses
        // so every `serde(default)` applies.
        serde_json::from_value(serde_json::json!({})).expect("defaults are total")
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["DOGEUSD".to_string(), "PEPEUSD".to_string()]
}

fn default_risk_tick_ms() -> u64 {
    100
}

fn default_batch_submit_interval_ms() -> u64 {
    30_000
}

fn default_funding_check_interval_ms() -> u64 {
    10_000
}

fn default_spot_sync_interval_ms() -> u64 {
    1_000
}

fn default_risk_broadcast_min_interval_ms() -> u64 {
    500
}

fn default_taker_fee_bp() -> Bp {
    5
}

fn default_maker_fee_bp() -> Bp {
    2
}

fn default_base_mmr_bp() -> Bp {
    200
}

fn default_max_leverage_bp() -> Bp {
    1_000_000
}

fn default_min_order_size() -> Amount {
    10_000_000_000_000_000 // 0.01 token
}

fn default_liquidation_fee_bp() -> Bp {
    1_000
}

fn default_max_funding_rate_bp() -> Bp {
    75
}

fn default_volatile_max_funding_rate_bp() -> Bp {
    300
}

fn default_funding_base_interval_ms() -> u64 {
    3_600_000
}

fn default_funding_min_interval_ms() -> u64 {
    900_000
}

fn default_liquidation_high_water() -> usize {
    1_000
}

fn default_pending_match_high_water() -> usize {
    10_000
}

fn default_batch_max_size() -> usize {
    100
}

fn default_insurance_fund_initial_balance() -> Usd {
    10_000_000_000 // 10,000 USD
}

fn default_submit_timeout_ms() -> u64 {
    10_000
}

fn default_submit_backoff_base_ms() -> u64 {
    1_000
}

fn default_submit_backoff_cap_ms() -> u64 {
    60_000
}

fn default_mirror_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_metrics_port() -> u16 {
    9_100
}

fn default_price_sample_window() -> usize {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recognized_options() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.risk_tick_ms, 100);
        assert_eq!(cfg.batch_submit_interval_ms, 30_000);
        assert_eq!(cfg.funding_check_interval_ms, 10_000);
        assert_eq!(cfg.spot_sync_interval_ms, 1_000);
        assert_eq!(cfg.risk_broadcast_min_interval_ms, 500);
        assert_eq!(cfg.base_mmr_bp, 200);
        assert_eq!(cfg.max_funding_rate_bp, 75);
        assert_eq!(cfg.funding_base_interval_ms, 3_600_000);
        assert_eq!(cfg.funding_min_interval_ms, 900_000);
    }

    #[test]
    fn test_volatile_symbol_funding_clamp() {
        let mut cfg = AppConfig::default();
        cfg.volatile_symbols = vec!["PEPEUSD".to_string()];
        assert_eq!(cfg.max_funding_rate_for("DOGEUSD"), 75);
        assert_eq!(cfg.max_funding_rate_for("PEPEUSD"), 300);
    }
}
