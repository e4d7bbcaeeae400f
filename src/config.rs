//! Configuration: per-pair options, caller settings and the paper exchange.
//!
//! Loaded from a JSON file with `.env` / environment overrides. Every section
//! has defaults so a partial file is enough.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{MarginType, ProfitLadder};

/// Which caller variant drives the pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CallerMode {
    /// Open/close checks on a fixed tick
    Interval,
    /// Open on completed candles, close on every candle
    #[default]
    Candle,
    /// Open only on 5-minute aligned boundaries
    Scoop,
    /// Simultaneous long and short legs
    Dual,
    /// Price-ladder entries and add-ons
    Grid,
    /// Mirror a followed account
    Watchdog,
}

impl CallerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerMode::Interval => "interval",
            CallerMode::Candle => "candle",
            CallerMode::Scoop => "scoop",
            CallerMode::Dual => "dual",
            CallerMode::Grid => "grid",
            CallerMode::Watchdog => "watchdog",
        }
    }
}

impl FromStr for CallerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "interval" => Ok(Self::Interval),
            "candle" | "common" => Ok(Self::Candle),
            "scoop" => Ok(Self::Scoop),
            "dual" => Ok(Self::Dual),
            "grid" => Ok(Self::Grid),
            "watchdog" => Ok(Self::Watchdog),
            other => bail!("unknown caller mode: {}", other),
        }
    }
}

/// Per-instrument configuration. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairOption {
    pub pair: String,

    /// Pair may open new positions
    pub enabled: bool,

    pub leverage: u32,

    pub margin_type: MarginType,

    /// Fraction of free quote committed as margin per entry
    pub max_margin_ratio: Decimal,

    /// Loss (as fraction of margin) that forces a close; zero disables it
    /// and falls back to the static stop-loss price
    pub max_margin_loss_ratio: Decimal,

    /// Maximum number of add-ons per position
    pub max_add_position: u32,

    /// Fraction of the current quantity added when scaling into profit
    pub profitable_scale: Decimal,

    /// Profit ratio that allows a scale-in
    pub profitable_trigger: Decimal,

    /// Decimal places kept on order quantities
    pub quantity_precision: u32,

    /// Stop-loss exits rest as stop-limit orders this fraction past the
    /// stop price; zero places stop-market exits
    pub stop_limit_offset: Decimal,
}

impl Default for PairOption {
    fn default() -> Self {
        Self {
            pair: "BTCUSDT".to_string(),
            enabled: true,
            leverage: 10,
            margin_type: MarginType::Isolated,
            max_margin_ratio: dec!(0.1),      // 10% of free quote per entry
            max_margin_loss_ratio: dec!(0.5), // close at -50% of margin
            max_add_position: 3,
            profitable_scale: dec!(0.5),
            profitable_trigger: dec!(0.3),
            quantity_precision: 3,
            stop_limit_offset: Decimal::ZERO,
        }
    }
}

impl PairOption {
    pub fn new(pair: &str) -> Self {
        Self {
            pair: pair.to_string(),
            ..Default::default()
        }
    }

    pub fn leverage_decimal(&self) -> Decimal {
        Decimal::from(self.leverage.max(1))
    }
}

/// Dual-leg hedge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DualSetting {
    /// Loss ratio on the main leg that triggers a hedge add on the sub leg
    pub hedge_trigger_ratio: Decimal,

    /// Fraction of the main/sub quantity gap added per hedge
    pub hedge_scale: Decimal,
}

impl Default for DualSetting {
    fn default() -> Self {
        Self {
            hedge_trigger_ratio: dec!(0.3),
            hedge_scale: dec!(0.5),
        }
    }
}

/// Grid ladder and volatility detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSetting {
    /// Levels on each side of the base price
    pub levels: u32,

    /// Distance between levels as a fraction of the base price
    pub step_ratio: Decimal,

    /// Candles in the rolling volatility window
    pub window: usize,

    /// Price change over the window that counts as a spike
    pub spike_price_ratio: Decimal,

    /// Last volume over window mean that counts as a spike
    pub spike_volume_ratio: Decimal,
}

impl Default for GridSetting {
    fn default() -> Self {
        Self {
            levels: 5,
            step_ratio: dec!(0.005),
            window: 20,
            spike_price_ratio: dec!(0.03),
            spike_volume_ratio: dec!(3),
        }
    }
}

/// Copy-trading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSetting {
    /// Target local / guider quantity ratio
    pub follow_ratio: Decimal,

    /// Relative drift tolerated before an adjusting order
    pub tolerance: Decimal,

    /// JSON file with the guider's positions
    pub guider_file: Option<String>,
}

impl Default for WatchdogSetting {
    fn default() -> Self {
        Self {
            follow_ratio: dec!(0.1),
            tolerance: dec!(0.02),
            guider_file: None,
        }
    }
}

/// Caller cadence, deadlines and mode-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerSetting {
    pub mode: CallerMode,

    /// Candle timeframe fed to the strategies
    pub timeframe: String,

    /// Candles handed to the strategy aggregator per evaluation
    pub candle_limit: usize,

    pub open_interval_secs: u64,
    pub close_interval_secs: u64,
    pub timeout_check_secs: u64,

    /// Scoop mode boundary in minutes
    pub scoop_boundary_mins: u32,

    /// Hold time before a position is force-closed
    pub position_timeout_mins: i64,

    /// Deadline extension granted whenever the profit lock ratchets
    pub timeout_extension_mins: i64,

    /// Unfilled entry orders older than this are cancelled
    pub order_timeout_secs: i64,

    pub profit_ladder: ProfitLadder,

    pub dual: DualSetting,
    pub grid: GridSetting,
    pub watchdog: WatchdogSetting,
}

impl Default for CallerSetting {
    fn default() -> Self {
        Self {
            mode: CallerMode::Candle,
            timeframe: "1m".to_string(),
            candle_limit: 100,
            open_interval_secs: 60,
            close_interval_secs: 5,
            timeout_check_secs: 30,
            scoop_boundary_mins: 5,
            position_timeout_mins: 240,   // 4 hours
            timeout_extension_mins: 60,
            order_timeout_secs: 300,      // 5 minutes
            profit_ladder: ProfitLadder::default(),
            dual: DualSetting::default(),
            grid: GridSetting::default(),
            watchdog: WatchdogSetting::default(),
        }
    }
}

/// Reference signal sources wired by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySetting {
    pub sma_fast: usize,
    pub sma_slow: usize,
    pub sma_score: f64,

    /// Lookback of the breakout channel
    pub donchian_period: usize,
    pub donchian_score: f64,

    pub atr_period: usize,
}

impl Default for StrategySetting {
    fn default() -> Self {
        Self {
            sma_fast: 9,
            sma_slow: 21,
            sma_score: 1.0,
            donchian_period: 20,
            donchian_score: 1.5,
            atr_period: 14,
        }
    }
}

/// Paper exchange settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSetting {
    pub initial_balance: Decimal,
    pub quote_asset: String,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
}

impl Default for ExchangeSetting {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            quote_asset: "USDT".to_string(),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0004),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub caller: CallerSetting,
    pub exchange: ExchangeSetting,
    pub strategy: StrategySetting,
    pub pairs: Vec<PairOption>,
    pub database_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            caller: CallerSetting::default(),
            exchange: ExchangeSetting::default(),
            strategy: StrategySetting::default(),
            pairs: vec![PairOption::new("BTCUSDT")],
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional JSON file, then apply environment
    /// overrides (`.env` is read if present).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config: AppConfig = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!(path = %path.display(), pairs = config.pairs.len(), "Loaded configuration");
                config
            }
            None => {
                debug!("No config file given, using defaults");
                AppConfig::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("CALLER_MODE") {
            self.caller.mode = mode.parse()?;
        }
        if let Ok(balance) = std::env::var("CALLER_BALANCE") {
            self.exchange.initial_balance = Decimal::from_str(&balance)
                .with_context(|| format!("Invalid CALLER_BALANCE: {}", balance))?;
        }
        if let Ok(url) = std::env::var("CALLER_DATABASE") {
            self.database_url = url;
        }
        Ok(())
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            bail!("at least one pair must be configured");
        }
        for option in &self.pairs {
            if option.pair.is_empty() {
                bail!("pair symbol must not be empty");
            }
            if option.leverage == 0 {
                bail!("{}: leverage must be at least 1", option.pair);
            }
            if option.max_margin_ratio <= Decimal::ZERO || option.max_margin_ratio > Decimal::ONE {
                bail!("{}: max_margin_ratio must be in (0, 1]", option.pair);
            }
            if option.max_margin_loss_ratio < Decimal::ZERO {
                bail!("{}: max_margin_loss_ratio must not be negative", option.pair);
            }
            if option.stop_limit_offset < Decimal::ZERO || option.stop_limit_offset >= Decimal::ONE {
                bail!("{}: stop_limit_offset must be in [0, 1)", option.pair);
            }
        }
        if self.caller.profit_ladder.levels().is_empty() {
            bail!("profit ladder must have at least one level");
        }
        if self.caller.grid.levels == 0 || self.caller.grid.step_ratio <= Decimal::ZERO {
            bail!("grid levels and step ratio must be positive");
        }
        if self.strategy.sma_fast == 0 || self.strategy.sma_fast >= self.strategy.sma_slow {
            bail!("sma_fast must be positive and below sma_slow");
        }
        if self.caller.watchdog.follow_ratio <= Decimal::ZERO {
            bail!("watchdog follow_ratio must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.caller.mode, CallerMode::Candle);
        assert_eq!(config.pairs[0].pair, "BTCUSDT");
        assert_eq!(config.pairs[0].stop_limit_offset, Decimal::ZERO);
    }

    #[test]
    fn test_partial_json() {
        let raw = r#"{
            "caller": { "mode": "grid", "grid": { "levels": 3 } },
            "pairs": [ { "pair": "ETHUSDT", "leverage": 5 } ]
        }"#;
        let config: AppConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.caller.mode, CallerMode::Grid);
        assert_eq!(config.caller.grid.levels, 3);
        assert_eq!(config.caller.grid.step_ratio, dec!(0.005));
        assert_eq!(config.pairs[0].leverage, 5);
        assert_eq!(config.pairs[0].max_add_position, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_leverage() {
        let config = AppConfig {
            pairs: vec![PairOption {
                leverage: 0,
                ..PairOption::new("BTCUSDT")
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_stop_limit_offset() {
        let config = AppConfig {
            pairs: vec![PairOption {
                stop_limit_offset: dec!(-0.01),
                ..PairOption::new("BTCUSDT")
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("common".parse::<CallerMode>().unwrap(), CallerMode::Candle);
        assert_eq!("Watchdog".parse::<CallerMode>().unwrap(), CallerMode::Watchdog);
        assert!("martingale".parse::<CallerMode>().is_err());
    }
}
