use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

use crate::domain::Money;

/// Engine configuration as read from YAML. Every field has a default, so an
/// empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_min_stake")]
    pub min_stake: i64,
    #[serde(default = "default_max_stake")]
    pub max_stake: i64,
    /// Share of the pot kept on a decisive settlement.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    #[serde(default = "default_starting_balance")]
    pub starting_balance: i64,
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_single_credit")]
    pub max_single_credit: i64,
    #[serde(default = "default_strict_consistency")]
    pub strict_consistency: bool,
    /// Minimum gap between two balance-deducting requests of one account.
    /// `0` turns the limit off.
    #[serde(default)]
    pub operation_interval_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: i64 },
    #[error("min_stake {min} exceeds max_stake {max}")]
    StakeRange { min: i64, max: i64 },
    #[error("fee_rate must lie in [0, 1) (got {0})")]
    FeeRate(Decimal),
    #[error("starting_balance must not be negative (got {0})")]
    StartingBalance(i64),
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub min_stake: Money,
    pub max_stake: Money,
    pub fee_rate: Decimal,
    pub starting_balance: Money,
    pub expiry_window: Duration,
    pub sweep_interval: Duration,
    pub max_single_credit: Money,
    pub strict_consistency: bool,
    pub operation_interval: Option<Duration>,
    pub log_level: Level,
    pub log_json: bool,
}

fn default_min_stake() -> i64 {
    1
}

fn default_max_stake() -> i64 {
    100
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 1)
}

fn default_starting_balance() -> i64 {
    1000
}

fn default_expiry_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_single_credit() -> i64 {
    100_000
}

fn default_strict_consistency() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_stake: default_min_stake(),
            max_stake: default_max_stake(),
            fee_rate: default_fee_rate(),
            starting_balance: default_starting_balance(),
            expiry_secs: default_expiry_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_single_credit: default_max_single_credit(),
            strict_consistency: default_strict_consistency(),
            operation_interval_ms: 0,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn non_zero(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        non_zero("min_stake", self.min_stake)?;
        non_zero("max_stake", self.max_stake)?;
        if self.min_stake > self.max_stake {
            return Err(ConfigError::StakeRange {
                min: self.min_stake,
                max: self.max_stake,
            });
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(ConfigError::FeeRate(self.fee_rate));
        }
        if self.starting_balance < 0 {
            return Err(ConfigError::StartingBalance(self.starting_balance));
        }
        non_zero("expiry_secs", self.expiry_secs as i64)?;
        non_zero("sweep_interval_secs", self.sweep_interval_secs as i64)?;
        non_zero("max_single_credit", self.max_single_credit)?;
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;

        Ok(ValidatedConfig {
            min_stake: Money(self.min_stake),
            max_stake: Money(self.max_stake),
            fee_rate: self.fee_rate,
            starting_balance: Money(self.starting_balance),
            expiry_window: Duration::from_secs(self.expiry_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_single_credit: Money(self.max_single_credit),
            strict_consistency: self.strict_consistency,
            operation_interval: (self.operation_interval_ms > 0)
                .then(|| Duration::from_millis(self.operation_interval_ms)),
            log_level,
            log_json: self.log_json,
        })
    }
}

impl Default for ValidatedConfig {
    fn default() -> Self {
        Self {
            min_stake: Money(default_min_stake()),
            max_stake: Money(default_max_stake()),
            fee_rate: default_fee_rate(),
            starting_balance: Money(default_starting_balance()),
            expiry_window: Duration::from_secs(default_expiry_secs()),
            sweep_interval: Duration::from_secs(default_sweep_interval_secs()),
            max_single_credit: Money(default_max_single_credit()),
            strict_consistency: default_strict_consistency(),
            operation_interval: None,
            log_level: Level::INFO,
            log_json: false,
        }
    }
}
