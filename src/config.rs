use eyre::{bail, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::RiskLevel;

/// Process-wide configuration. Loaded once at startup and shared as `Arc<Config>`;
/// nothing mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub strategies: StrategiesConfig,
    pub ai: AiConfig,
    pub engine: EngineConfig,
    pub chain: ChainConfig,
    pub feed: FeedConfig,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub ws_port: u16,
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            ws_port: 3002,
            environment: "development".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub max_trades_per_second: u32,
    pub min_profit_threshold_usd: f64,
    pub max_gas_price_gwei: f64,
    pub enable_flash_loans: bool,
    pub flash_loan_amount_eth: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_trades_per_second: 5,
            min_profit_threshold_usd: 10.0,
            max_gas_price_gwei: 100.0,
            enable_flash_loans: true,
            flash_loan_amount_eth: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_position_size_eth: f64,
    pub max_daily_loss_eth: f64,
    pub stop_loss_percent: f64,
    pub enable_risk_limits: bool,
    /// Opening balance of the paper wallet.
    pub starting_balance_eth: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_eth: 10.0,
            max_daily_loss_eth: 5.0,
            stop_loss_percent: 10.0,
            enable_risk_limits: true,
            starting_balance_eth: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    pub enable_low_risk: bool,
    pub enable_medium_risk: bool,
    pub enable_high_risk: bool,
    pub max_active_strategies: usize,
    pub rotation_interval_ms: u64,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            enable_low_risk: true,
            enable_medium_risk: true,
            enable_high_risk: false,
            max_active_strategies: 5,
            rotation_interval_ms: 3_600_000,
        }
    }
}

impl StrategiesConfig {
    /// Whether strategies of `level` may be enabled. `Extreme` rides on the high-risk switch.
    pub fn allows(&self, level: RiskLevel) -> bool {
        match level {
            RiskLevel::Low => self.enable_low_risk,
            RiskLevel::Medium => self.enable_medium_risk,
            RiskLevel::High | RiskLevel::Extreme => self.enable_high_risk,
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub confidence_threshold: f64,
    pub enable_optimization: bool,
    pub retraining_interval_hours: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            enable_optimization: true,
            retraining_interval_hours: 24,
        }
    }
}

/// How finely resource locks partition the market.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockGranularity {
    /// One key per (chain, token, dex).
    #[default]
    TokenDex,
    /// One key per (chain, token); any two trades touching a token conflict.
    Token,
    /// One key per (chain, dex).
    Dex,
}

impl std::str::FromStr for LockGranularity {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_dex" => Ok(Self::TokenDex),
            "token" => Ok(Self::Token),
            "dex" => Ok(Self::Dex),
            other => bail!("unknown lock granularity '{}'", other),
        }
    }
}

/// Scheduler tunables that are not part of the public option groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cycle_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub max_concurrent_executions: usize,
    pub execution_timeout_ms: u64,
    pub lock_wait_ms: u64,
    pub lock_retry_ms: u64,
    pub lock_granularity: LockGranularity,
    pub daily_reset_hour_utc: u32,
    pub rotation_min_sample: u64,
    pub rotation_grace_ms: u64,
    pub rotation_window: usize,
    /// Consumed opportunity ids remembered for the at-most-once check, oldest evicted first.
    pub consumed_capacity: usize,
    /// Trade results kept in memory for `recent` queries and rotation scoring.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 500,
            scan_timeout_ms: 250,
            max_concurrent_executions: 4,
            execution_timeout_ms: 30_000,
            lock_wait_ms: 2_000,
            lock_retry_ms: 50,
            lock_granularity: LockGranularity::TokenDex,
            daily_reset_hour_utc: 0,
            rotation_min_sample: 20,
            rotation_grace_ms: 6 * 3_600_000,
            rotation_window: 50,
            consumed_capacity: 100_000,
            history_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }
}

/// On-chain market data. Without an RPC URL the engine sees reference prices only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: Option<String>,
    /// `dex:TOKEN:0xpool:decimals0:decimals1:side` entries.
    pub pools: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            pools: Vec::new(),
            poll_interval_ms: 2_000,
        }
    }
}

/// Reference-price stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Binance streams used as USD reference prices, e.g. `ethusdt`.
    pub symbols: Vec<String>,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// Ticker frames received within one window are published as a single batch.
    pub batch_window_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["ethusdt".into()],
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
            batch_window_ms: 250,
        }
    }
}

impl FeedConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            strategies: StrategiesConfig::default(),
            ai: AiConfig::default(),
            engine: EngineConfig::default(),
            chain: ChainConfig::default(),
            feed: FeedConfig::default(),
            db_path: "engine.db".into(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Config::default();

        let server = ServerConfig {
            port: env_parse("SERVER_PORT", d.server.port)?,
            ws_port: env_parse("SERVER_WS_PORT", d.server.ws_port)?,
            environment: std::env::var("ENVIRONMENT").unwrap_or(d.server.environment),
        };

        let trading = TradingConfig {
            max_trades_per_second: env_parse(
                "MAX_TRADES_PER_SECOND",
                d.trading.max_trades_per_second,
            )?,
            min_profit_threshold_usd: env_parse(
                "MIN_PROFIT_THRESHOLD_USD",
                d.trading.min_profit_threshold_usd,
            )?,
            max_gas_price_gwei: env_parse("MAX_GAS_PRICE_GWEI", d.trading.max_gas_price_gwei)?,
            enable_flash_loans: env_bool("ENABLE_FLASH_LOANS", d.trading.enable_flash_loans)?,
            flash_loan_amount_eth: env_parse(
                "FLASH_LOAN_AMOUNT_ETH",
                d.trading.flash_loan_amount_eth,
            )?,
        };

        let risk = RiskConfig {
            max_position_size_eth: env_parse("MAX_POSITION_SIZE_ETH", d.risk.max_position_size_eth)?,
            max_daily_loss_eth: env_parse("MAX_DAILY_LOSS_ETH", d.risk.max_daily_loss_eth)?,
            stop_loss_percent: env_parse("STOP_LOSS_PERCENT", d.risk.stop_loss_percent)?,
            enable_risk_limits: env_bool("ENABLE_RISK_LIMITS", d.risk.enable_risk_limits)?,
            starting_balance_eth: env_parse("STARTING_BALANCE_ETH", d.risk.starting_balance_eth)?,
        };

        let strategies = StrategiesConfig {
            enable_low_risk: env_bool("ENABLE_LOW_RISK", d.strategies.enable_low_risk)?,
            enable_medium_risk: env_bool("ENABLE_MEDIUM_RISK", d.strategies.enable_medium_risk)?,
            enable_high_risk: env_bool("ENABLE_HIGH_RISK", d.strategies.enable_high_risk)?,
            max_active_strategies: env_parse(
                "MAX_ACTIVE_STRATEGIES",
                d.strategies.max_active_strategies,
            )?,
            rotation_interval_ms: env_parse(
                "ROTATION_INTERVAL_MS",
                d.strategies.rotation_interval_ms,
            )?,
        };

        let ai = AiConfig {
            confidence_threshold: env_parse("AI_CONFIDENCE_THRESHOLD", d.ai.confidence_threshold)?,
            enable_optimization: env_bool("AI_ENABLE_OPTIMIZATION", d.ai.enable_optimization)?,
            retraining_interval_hours: env_parse(
                "AI_RETRAINING_INTERVAL_HOURS",
                d.ai.retraining_interval_hours,
            )?,
        };

        let engine = EngineConfig {
            cycle_interval_ms: env_parse("CYCLE_INTERVAL_MS", d.engine.cycle_interval_ms)?,
            scan_timeout_ms: env_parse("SCAN_TIMEOUT_MS", d.engine.scan_timeout_ms)?,
            max_concurrent_executions: env_parse(
                "MAX_CONCURRENT_EXECUTIONS",
                d.engine.max_concurrent_executions,
            )?,
            execution_timeout_ms: env_parse("EXECUTION_TIMEOUT_MS", d.engine.execution_timeout_ms)?,
            lock_wait_ms: env_parse("LOCK_WAIT_MS", d.engine.lock_wait_ms)?,
            lock_retry_ms: env_parse("LOCK_RETRY_MS", d.engine.lock_retry_ms)?,
            lock_granularity: env_parse("LOCK_GRANULARITY", d.engine.lock_granularity)?,
            daily_reset_hour_utc: env_parse("DAILY_RESET_HOUR_UTC", d.engine.daily_reset_hour_utc)?,
            rotation_min_sample: env_parse("ROTATION_MIN_SAMPLE", d.engine.rotation_min_sample)?,
            rotation_grace_ms: env_parse("ROTATION_GRACE_MS", d.engine.rotation_grace_ms)?,
            rotation_window: env_parse("ROTATION_WINDOW", d.engine.rotation_window)?,
            consumed_capacity: env_parse("CONSUMED_CAPACITY", d.engine.consumed_capacity)?,
            history_capacity: env_parse("HISTORY_CAPACITY", d.engine.history_capacity)?,
        };

        let chain = ChainConfig {
            rpc_url: std::env::var("RPC_URL").ok().filter(|u| !u.trim().is_empty()),
            pools: env_list("DEX_POOLS").unwrap_or(d.chain.pools),
            poll_interval_ms: env_parse("CHAIN_POLL_INTERVAL_MS", d.chain.poll_interval_ms)?,
        };

        let feed = FeedConfig {
            symbols: env_list("FEED_SYMBOLS")
                .map(|symbols| symbols.into_iter().map(|s| s.to_lowercase()).collect())
                .unwrap_or(d.feed.symbols),
            reconnect_min_ms: env_parse("FEED_RECONNECT_MIN_MS", d.feed.reconnect_min_ms)?,
            reconnect_max_ms: env_parse("FEED_RECONNECT_MAX_MS", d.feed.reconnect_max_ms)?,
            batch_window_ms: env_parse("FEED_BATCH_WINDOW_MS", d.feed.batch_window_ms)?,
        };

        let db_path = std::env::var("DB_PATH").unwrap_or(d.db_path);

        let config = Config {
            server,
            trading,
            risk,
            strategies,
            ai,
            engine,
            chain,
            feed,
            db_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Range checks. A config that fails here never reaches the engine.
    pub fn validate(&self) -> Result<()> {
        if self.trading.max_trades_per_second == 0 {
            bail!("MAX_TRADES_PER_SECOND must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.ai.confidence_threshold) {
            bail!(
                "AI_CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.ai.confidence_threshold
            );
        }
        if self.strategies.max_active_strategies == 0 {
            bail!("MAX_ACTIVE_STRATEGIES must be at least 1");
        }
        if self.strategies.rotation_interval_ms == 0 {
            bail!("ROTATION_INTERVAL_MS must be positive");
        }
        if self.risk.max_daily_loss_eth < 0.0 || self.risk.max_position_size_eth < 0.0 {
            bail!("risk limits must be non-negative");
        }
        if !(0.0..=100.0).contains(&self.risk.stop_loss_percent) {
            bail!("STOP_LOSS_PERCENT must be within [0, 100]");
        }
        if self.engine.max_concurrent_executions == 0 {
            bail!("MAX_CONCURRENT_EXECUTIONS must be at least 1");
        }
        if self.engine.daily_reset_hour_utc > 23 {
            bail!("DAILY_RESET_HOUR_UTC must be within 0..=23");
        }
        if self.engine.lock_retry_ms == 0 || self.engine.execution_timeout_ms == 0 {
            bail!("LOCK_RETRY_MS and EXECUTION_TIMEOUT_MS must be positive");
        }
        if self.engine.consumed_capacity == 0 || self.engine.history_capacity == 0 {
            bail!("CONSUMED_CAPACITY and HISTORY_CAPACITY must be at least 1");
        }
        if self.feed.reconnect_min_ms == 0 || self.feed.reconnect_max_ms < self.feed.reconnect_min_ms {
            bail!(
                "FEED_RECONNECT_MIN_MS must be positive and at most FEED_RECONNECT_MAX_MS ({} > {})",
                self.feed.reconnect_min_ms,
                self.feed.reconnect_max_ms
            );
        }
        if self.feed.batch_window_ms == 0 {
            bail!("FEED_BATCH_WINDOW_MS must be positive");
        }
        if self.chain.poll_interval_ms == 0 {
            bail!("CHAIN_POLL_INTERVAL_MS must be positive");
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| eyre::eyre!("{}", e))
            .wrap_err_with(|| format!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Comma-separated list; `None` when the variable is unset.
fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("{} must be a boolean, got '{}'", key, raw),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_confidence_threshold_out_of_range_rejected() {
        let mut config = Config::default();
        config.ai.confidence_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AI_CONFIDENCE_THRESHOLD"));
    }

    #[test]
    fn test_extreme_risk_follows_high_risk_switch() {
        let mut strategies = StrategiesConfig::default();
        strategies.enable_high_risk = false;
        assert!(!strategies.allows(RiskLevel::Extreme));
        strategies.enable_high_risk = true;
        assert!(strategies.allows(RiskLevel::Extreme));
        assert!(strategies.allows(RiskLevel::Low));
    }

    #[test]
    fn test_reconnect_bounds_must_be_ordered() {
        let mut config = Config::default();
        config.feed.reconnect_min_ms = 5_000;
        config.feed.reconnect_max_ms = 1_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FEED_RECONNECT_MIN_MS"));

        config.feed.reconnect_max_ms = 5_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lock_granularity_parses() {
        assert_eq!("token".parse::<LockGranularity>().unwrap(), LockGranularity::Token);
        assert_eq!(
            "TOKEN_DEX".parse::<LockGranularity>().unwrap(),
            LockGranularity::TokenDex
        );
        assert!("pool".parse::<LockGranularity>().is_err());
    }
}
