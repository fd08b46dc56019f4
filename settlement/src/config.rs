//! Configuration for the account service

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Account and transaction storage
    pub store: ledger_core::Config,

    /// Broker connection
    pub nats: message_bus::NatsConfig,

    /// Approval round trip
    pub approval: ApprovalConfig,

    /// Currency conversion
    pub currency: CurrencyConfig,

    /// Startup recovery of stranded transactions
    pub recovery: RecoveryConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "account-service".to_string(),
            store: ledger_core::Config::default(),
            nats: message_bus::NatsConfig::default(),
            approval: ApprovalConfig::default(),
            currency: CurrencyConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Approval request configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Subject the approval worker listens on
    pub request_subject: String,

    /// Deadline for a reply (milliseconds)
    ///
    /// The approval worker takes about ten seconds per request and handles
    /// one at a time, so the default leaves room for that plus queueing.
    pub timeout_ms: u64,

    /// Settlement flows allowed to run at once
    pub max_concurrent_settlements: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            request_subject: "process_transaction".to_string(),
            timeout_ms: 30_000,
            max_concurrent_settlements: 100,
        }
    }
}

impl ApprovalConfig {
    /// Reply deadline as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Currency conversion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    /// Settlement currency; amounts in it are taken as-is
    pub base: String,

    /// Base-currency units per one unit of each foreign currency
    pub rates: BTreeMap<String, Decimal>,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert("USD".to_string(), Decimal::new(9250, 2));
        rates.insert("EUR".to_string(), Decimal::new(10050, 2));
        rates.insert("CNY".to_string(), Decimal::new(1270, 2));

        Self {
            base: "RUB".to_string(),
            rates,
        }
    }
}

/// Recovery of transactions left in `Created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run recovery at startup
    pub enabled: bool,

    /// Age after which a `Created` transaction counts as stranded (seconds)
    pub stranded_after_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stranded_after_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (`RUST_LOG` takes precedence)
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(crate::Error::Config(format!("unknown log format: {}", other))),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables (after reading `.env` if present)
    pub fn from_env() -> crate::Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Config {
            store: ledger_core::Config::from_env()?,
            ..Config::default()
        };

        if let Ok(url) = std::env::var("NATS_URL") {
            config.nats.url = url;
        }

        if let Ok(subject) = std::env::var("APPROVAL_SUBJECT") {
            config.approval.request_subject = subject;
        }

        if let Ok(timeout) = std::env::var("APPROVAL_TIMEOUT_MS") {
            config.approval.timeout_ms = timeout.parse().map_err(|_| {
                crate::Error::Config(format!("invalid APPROVAL_TIMEOUT_MS: {}", timeout))
            })?;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level.to_ascii_lowercase();
        }

        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }

        if let Ok(base) = std::env::var("BASE_CURRENCY") {
            config.currency.base = base.to_ascii_uppercase();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the service misbehave
    pub fn validate(&self) -> crate::Result<()> {
        if self.approval.timeout_ms == 0 {
            return Err(crate::Error::Config(
                "approval.timeout_ms must be positive".to_string(),
            ));
        }
        if self.approval.max_concurrent_settlements == 0 {
            return Err(crate::Error::Config(
                "approval.max_concurrent_settlements must be positive".to_string(),
            ));
        }
        if let Some((code, rate)) = self
            .currency
            .rates
            .iter()
            .find(|(_, rate)| **rate <= Decimal::ZERO)
        {
            return Err(crate::Error::Config(format!(
                "currency rate for {} must be positive, got {}",
                code, rate
            )));
        }
        Ok(())
    }
}
