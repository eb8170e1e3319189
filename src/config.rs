use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Every threshold the pipeline stages read. All fields carry defaults so a
/// bare config file still yields a runnable (conservative) strategy.
#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Underlying symbols considered at scan entry.
    #[serde(default)]
    pub universe: Vec<String>,

    // Stage 1: price/volume
    #[serde(default = "default_min_stock_price")]
    pub min_stock_price: Decimal,
    #[serde(default = "default_max_stock_price")]
    pub max_stock_price: Decimal,
    #[serde(default = "default_min_avg_volume")]
    pub min_avg_volume: u64,

    // Stage 2: historical gap risk
    #[serde(default = "default_max_gap_freq")]
    pub max_gap_freq: f64,
    #[serde(default = "default_max_historical_volatility")]
    pub max_historical_volatility: f64,
    #[serde(default = "default_max_overnight_gap_percent")]
    pub max_overnight_gap_percent: f64,

    // Stage 3: evaluation cap (0 or absent means pass-through)
    #[serde(default)]
    pub max_evaluated: Option<usize>,

    // Stage 4: real-time execution gap
    #[serde(default = "default_execution_gap_threshold")]
    pub execution_gap_threshold: f64,

    // Stage 7: option chain criteria
    #[serde(default = "default_target_dte")]
    pub target_dte: i64,
    #[serde(default = "default_min_premium")]
    pub min_premium: Decimal,
    #[serde(default = "default_delta_min")]
    pub delta_min: f64,
    #[serde(default = "default_delta_max")]
    pub delta_max: f64,
    #[serde(default = "default_min_open_interest")]
    pub min_open_interest: u64,

    // Stage 8: position sizing
    #[serde(default = "default_max_exposure_per_ticker")]
    pub max_exposure_per_ticker: Decimal,
    #[serde(default = "default_max_portfolio_allocation")]
    pub max_portfolio_allocation: f64,
    #[serde(default = "default_max_total_positions")]
    pub max_total_positions: usize,

    // Stage 9: cycle cap (0 or absent means no limit)
    #[serde(default)]
    pub max_new_positions_per_cycle: Option<usize>,

    // Store retrieval window
    #[serde(default = "default_opportunity_max_age_minutes")]
    pub opportunity_max_age_minutes: i64,

    // Monitor early-close threshold
    #[serde(default = "default_profit_target_percent")]
    pub profit_target_percent: f64,

    // Limit-price offset from mid
    #[serde(default = "default_slippage_factor")]
    pub slippage_factor: f64,
}

impl StrategyConfig {
    /// Stage 3 cap, with zero treated as unset.
    pub fn evaluation_cap(&self) -> Option<usize> {
        self.max_evaluated.filter(|n| *n > 0)
    }

    /// Stage 9 cap, with zero treated as unset.
    pub fn cycle_cap(&self) -> Option<usize> {
        self.max_new_positions_per_cycle.filter(|n| *n > 0)
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("StrategyConfig defaults")
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BrokerConfig {
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    /// Paper-trading endpoint unless explicitly disabled.
    #[serde(default = "default_true")]
    pub paper: bool,
    /// Data feed tier: "sip" or "iex".
    #[serde(default = "default_feed")]
    pub feed: String,
}

impl BrokerConfig {
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env::var("APCA_API_KEY_ID").ok())
    }

    pub fn get_secret_key(&self) -> Option<String> {
        self.secret_key
            .clone()
            .or_else(|| env::var("APCA_API_SECRET_KEY").ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overall budget for one scan/run/monitor cycle, seconds.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.wheel/config.json
            .add_source(File::with_name(&format!("{}/.wheel/config", home)).required(false))
            // 2. Project config from config/config.json
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides, e.g. WHEEL_STRATEGY__TARGET_DTE=7
            .add_source(Environment::with_prefix("WHEEL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

fn default_true() -> bool {
    true
}
fn default_feed() -> String {
    "iex".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_cycle_timeout_secs() -> u64 {
    300
}
fn default_min_stock_price() -> Decimal {
    Decimal::from(20)
}
fn default_max_stock_price() -> Decimal {
    Decimal::from(400)
}
fn default_min_avg_volume() -> u64 {
    1_000_000
}
fn default_max_gap_freq() -> f64 {
    0.10
}
fn default_max_historical_volatility() -> f64 {
    0.50
}
fn default_max_overnight_gap_percent() -> f64 {
    0.05
}
fn default_execution_gap_threshold() -> f64 {
    0.02
}
fn default_target_dte() -> i64 {
    7
}
fn default_min_premium() -> Decimal {
    Decimal::new(50, 2) // 0.50
}
fn default_delta_min() -> f64 {
    0.10
}
fn default_delta_max() -> f64 {
    0.20
}
fn default_min_open_interest() -> u64 {
    10
}
fn default_max_exposure_per_ticker() -> Decimal {
    Decimal::from(25_000)
}
fn default_max_portfolio_allocation() -> f64 {
    0.80
}
fn default_max_total_positions() -> usize {
    10
}
fn default_opportunity_max_age_minutes() -> i64 {
    30
}
fn default_profit_target_percent() -> f64 {
    0.50
}
fn default_slippage_factor() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_strategy_defaults() {
        let cfg = StrategyConfig::default();
        assert_eq!(cfg.target_dte, 7);
        assert_eq!(cfg.min_premium, dec!(0.50));
        assert_eq!(cfg.delta_min, 0.10);
        assert_eq!(cfg.delta_max, 0.20);
        assert_eq!(cfg.opportunity_max_age_minutes, 30);
        assert!(cfg.universe.is_empty());
    }

    #[test]
    fn test_zero_caps_mean_pass_through() {
        let mut cfg = StrategyConfig::default();
        assert_eq!(cfg.evaluation_cap(), None);
        assert_eq!(cfg.cycle_cap(), None);

        cfg.max_evaluated = Some(0);
        cfg.max_new_positions_per_cycle = Some(0);
        assert_eq!(cfg.evaluation_cap(), None);
        assert_eq!(cfg.cycle_cap(), None);

        cfg.max_evaluated = Some(15);
        cfg.max_new_positions_per_cycle = Some(3);
        assert_eq!(cfg.evaluation_cap(), Some(15));
        assert_eq!(cfg.cycle_cap(), Some(3));
    }

    #[test]
    fn test_strategy_from_json() {
        let json = r#"{
            "universe": ["AMD", "VZ"],
            "target_dte": 10,
            "min_premium": 0.35,
            "max_evaluated": 20
        }"#;
        let cfg: StrategyConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(cfg.universe, vec!["AMD", "VZ"]);
        assert_eq!(cfg.target_dte, 10);
        assert_eq!(cfg.min_premium, dec!(0.35));
        assert_eq!(cfg.evaluation_cap(), Some(20));
        // Untouched fields keep their defaults
        assert_eq!(cfg.max_total_positions, 10);
    }
}
